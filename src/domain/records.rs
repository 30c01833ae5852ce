//! Bulk-import records and the per-run report
//!
//! - `RawRecord` - one input row as `(column, value)` pairs in file order
//! - `CanonicalRecord` - the row after header aliasing
//! - `ImportReport` - accumulated outcomes plus the exportable error table

use crate::domain::error::ErrorKind;
use crate::domain::types::GuardianId;
use serde::Serialize;

/// Minimum digits a phone number must keep after normalization
pub const MIN_PHONE_DIGITS: usize = 10;

/// Header of the reason column appended to error reports
pub const ERROR_COLUMN: &str = "Error";

/// Simple header + rows table used for CSV import/export
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self { headers, rows: Vec::new() }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value at `row` under `header`, if both exist
    pub fn cell(&self, row: usize, header: &str) -> Option<&str> {
        let col = self.headers.iter().position(|h| h == header)?;
        self.rows.get(row)?.get(col).map(String::as_str)
    }
}

/// One untyped input row
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawRecord {
    columns: Vec<(String, String)>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append, keeping column order
    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.columns.push((column.into(), value.into()));
        self
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self { columns: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }

    pub fn columns(&self) -> &[(String, String)] {
        &self.columns
    }

    /// Exact column lookup
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns.iter().find(|(c, _)| c == column).map(|(_, v)| v.as_str())
    }

    /// First non-empty value among `aliases`, matching headers loosely
    pub fn aliased(&self, aliases: &[&str]) -> String {
        for alias in aliases {
            let wanted = header_key(alias);
            let hit = self
                .columns
                .iter()
                .filter(|(c, _)| header_key(c) == wanted)
                .map(|(_, v)| v.trim())
                .find(|v| !v.is_empty());
            if let Some(v) = hit {
                return v.to_string();
            }
        }
        String::new()
    }

    pub fn canonical(&self) -> CanonicalRecord {
        CanonicalRecord {
            student_name: self.aliased(STUDENT_NAME_ALIASES),
            guardian_name: self.aliased(GUARDIAN_NAME_ALIASES),
            phone: self.aliased(PHONE_ALIASES),
            student_class: self.aliased(CLASS_ALIASES),
            vehicle_ref: self.aliased(VEHICLE_ALIASES),
            stop_ref: self.aliased(STOP_ALIASES),
        }
    }
}

pub const STUDENT_NAME_ALIASES: &[&str] = &["StudentName", "Student"];
pub const GUARDIAN_NAME_ALIASES: &[&str] =
    &["ParentName", "Parent", "GuardianName", "Guardian", "Name"];
pub const PHONE_ALIASES: &[&str] = &["Phone", "ParentPhone", "GuardianPhone"];
pub const CLASS_ALIASES: &[&str] = &["Class", "StudentStd", "Std", "ClassName"];
pub const VEHICLE_ALIASES: &[&str] = &["BusNumber", "BusNo", "Bus", "VehicleNumber", "Vehicle"];
pub const STOP_ALIASES: &[&str] = &["BusStop", "Stop", "StopName"];

/// Lowercase with everything but ASCII letters and digits removed
/// (`Bus_Stop`, `bus stop` and `BUSSTOP` all compare equal)
fn header_key(header: &str) -> String {
    header.chars().filter(|c| c.is_ascii_alphanumeric()).map(|c| c.to_ascii_lowercase()).collect()
}

/// Row fields after alias resolution, all trimmed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalRecord {
    pub student_name: String,
    pub guardian_name: String,
    pub phone: String,
    pub student_class: String,
    pub vehicle_ref: String,
    pub stop_ref: String,
}

/// Strip non-digits, then one leading `91` or `0` when more than ten digits remain
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() > MIN_PHONE_DIGITS {
        if let Some(rest) = digits.strip_prefix("91") {
            return rest.to_string();
        }
        if let Some(rest) = digits.strip_prefix('0') {
            return rest.to_string();
        }
    }
    digits
}

/// A row that did not commit
#[derive(Debug, Clone, PartialEq)]
pub struct ImportFailure {
    /// 1-based position in the input
    pub row: usize,
    pub kind: ErrorKind,
    pub reason: String,
    pub record: RawRecord,
}

impl ImportFailure {
    /// Text written to the error column
    pub fn describe(&self) -> String {
        format!("{}: {}", self.kind, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    Committed(GuardianId),
    Failed(ImportFailure),
}

impl ImportOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, ImportOutcome::Committed(_))
    }
}

/// Accumulated result of one pipeline run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub committed: Vec<GuardianId>,
    pub failures: Vec<ImportFailure>,
    pub cancelled: bool,
}

impl ImportReport {
    pub fn record(&mut self, outcome: ImportOutcome) {
        self.processed += 1;
        match outcome {
            ImportOutcome::Committed(id) => {
                self.succeeded += 1;
                self.committed.push(id);
            }
            ImportOutcome::Failed(failure) => {
                self.failed += 1;
                self.failures.push(failure);
            }
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Failed rows verbatim plus an `Error` column; `None` when nothing failed
    ///
    /// Headers are the union of the failed rows' columns in first-seen order.
    pub fn error_report(&self) -> Option<Table> {
        if self.failures.is_empty() {
            return None;
        }

        let mut headers: Vec<String> = Vec::new();
        for failure in &self.failures {
            for (column, _) in failure.record.columns() {
                if column != ERROR_COLUMN && !headers.iter().any(|h| h == column) {
                    headers.push(column.clone());
                }
            }
        }

        let mut table = Table::new(headers.clone());
        table.headers.push(ERROR_COLUMN.to_string());
        for failure in &self.failures {
            let mut row: Vec<String> = headers
                .iter()
                .map(|h| failure.record.get(h).unwrap_or_default().to_string())
                .collect();
            row.push(failure.describe());
            table.push_row(row);
        }
        Some(table)
    }

    pub fn summary_line(&self) -> String {
        let mut line = if self.failed == 0 {
            format!("Imported {} guardians", self.succeeded)
        } else {
            format!("Imported {} guardians, {} failed", self.succeeded, self.failed)
        };
        if self.cancelled {
            line.push_str(" (cancelled)");
        }
        line
    }
}
