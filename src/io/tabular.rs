//! CSV tables: bulk-import input, error reports, templates, reference sheets

use crate::domain::records::{RawRecord, Table};
use anyhow::{Context, Result};
use csv::{ReaderBuilder, Trim};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use tracing::info;

/// Read every data row of a headered CSV file as raw records
///
/// Rows that are entirely blank are skipped. Short rows are padded with
/// empty values so each record carries every header.
pub fn read_records<P: AsRef<Path>>(path: P) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let file = fs::File::open(path)
        .with_context(|| format!("unable to open input csv {}", path.display()))?;
    let records = read_records_from_reader(file)
        .with_context(|| format!("invalid input csv {}", path.display()))?;
    info!(file = %path.display(), rows = %records.len(), "input_records_read");
    Ok(records)
}

pub fn read_records_from_reader<R: Read>(reader: R) -> Result<Vec<RawRecord>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::Headers)
        .from_reader(reader);
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut records = Vec::new();
    for (i, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("invalid row {}", i + 1))?;
        if row.iter().all(|v| v.trim().is_empty()) {
            continue;
        }
        let pairs = headers
            .iter()
            .enumerate()
            .map(|(col, h)| (h.clone(), row.get(col).unwrap_or_default().to_string()));
        records.push(RawRecord::from_pairs(pairs));
    }
    Ok(records)
}

/// Write a table as CSV, creating parent directories as needed
pub fn write_table<P: AsRef<Path>>(path: P, table: &Table) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    let file = fs::File::create(path)
        .with_context(|| format!("failed to create output file {}", path.display()))?;
    write_table_to(file, table)?;
    info!(file = %path.display(), rows = %table.len(), "table_written");
    Ok(())
}

pub fn write_table_to<W: Write>(writer: W, table: &Table) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(writer);
    writer.write_record(&table.headers)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_records_keeps_column_order() {
        let input = "Student,Parent,Phone\nA,P,98765 43210\n,,\nB,Q\n";
        let records = read_records_from_reader(input.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        let cols: Vec<&str> = records[0].columns().iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(cols, vec!["Student", "Parent", "Phone"]);
        assert_eq!(records[0].get("Phone"), Some("98765 43210"));
        assert_eq!(records[1].get("Phone"), Some(""));
    }

    #[test]
    fn test_write_then_read_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("report.csv");
        let mut table = Table::new(vec!["BusNumber".into(), "Error".into()]);
        table.push_row(vec!["ZZ".into(), "ResolutionError: unknown vehicle \"ZZ\"".into()]);

        write_table(&path, &table).unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("Error"), Some("ResolutionError: unknown vehicle \"ZZ\""));
    }
}
