//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section and key is optional; missing values take the defaults below.

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Deployment identifier used as the metrics `site` label
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "fleet".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON file the CLI loads the store from and saves it back to
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { snapshot_file: default_snapshot_file() }
    }
}

fn default_snapshot_file() -> String {
    "data/store.json".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Suffix appended to phone numbers to form login keys
    #[serde(default = "default_identity_domain")]
    pub domain: String,
    /// Initial credential for bulk-provisioned guardians
    #[serde(default = "default_guardian_credential")]
    pub guardian_credential: String,
    /// Initial credential for operators created from the directory
    #[serde(default = "default_operator_credential")]
    pub operator_credential: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            domain: default_identity_domain(),
            guardian_credential: default_guardian_credential(),
            operator_credential: default_operator_credential(),
        }
    }
}

fn default_identity_domain() -> String {
    "traqerr.com".to_string()
}

fn default_guardian_credential() -> String {
    "Traqer@321".to_string()
}

fn default_operator_credential() -> String {
    "Driver@321".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    /// Pause after every record to throttle identity provisioning
    #[serde(default = "default_row_delay_ms")]
    pub row_delay_ms: u64,
    /// Bound on each identity or persist call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// How long an import waits for the first vehicle snapshot
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            row_delay_ms: default_row_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
        }
    }
}

fn default_row_delay_ms() -> u64 {
    120
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_sync_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MutationsConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Retry n waits `retry_backoff_ms * n`
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Bound on each store call inside a transaction
    #[serde(default = "default_txn_timeout_ms")]
    pub txn_timeout_ms: u64,
}

impl Default for MutationsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            txn_timeout_ms: default_txn_timeout_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    25
}

fn default_txn_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Wait before reopening a failed change feed
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { reconnect_delay_ms: default_reconnect_delay_ms() }
    }
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// JSONL audit file; empty logs through tracing only
    #[serde(default = "default_audit_file")]
    pub file: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { file: default_audit_file() }
    }
}

fn default_audit_file() -> String {
    "logs/audit.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: 0 }
    }
}

fn default_metrics_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    /// Fixes older than this are hidden from the board (0 keeps everything)
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self { stale_after_secs: default_stale_after_secs() }
    }
}

fn default_stale_after_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub mutations: MutationsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub live: LiveConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    store_snapshot_file: String,
    identity_domain: String,
    guardian_credential: String,
    operator_credential: String,
    import_row_delay_ms: u64,
    import_call_timeout_ms: u64,
    import_sync_timeout_ms: u64,
    mutation_max_attempts: u32,
    mutation_retry_backoff_ms: u64,
    mutation_txn_timeout_ms: u64,
    cache_reconnect_delay_ms: u64,
    audit_file: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    live_stale_after_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, origin: &str) -> Self {
        Self {
            site_id: toml_config.site.id,
            store_snapshot_file: toml_config.store.snapshot_file,
            identity_domain: toml_config.identity.domain,
            guardian_credential: toml_config.identity.guardian_credential,
            operator_credential: toml_config.identity.operator_credential,
            import_row_delay_ms: toml_config.import.row_delay_ms,
            import_call_timeout_ms: toml_config.import.call_timeout_ms,
            import_sync_timeout_ms: toml_config.import.sync_timeout_ms,
            // A transaction always gets at least one attempt
            mutation_max_attempts: toml_config.mutations.max_attempts.max(1),
            mutation_retry_backoff_ms: toml_config.mutations.retry_backoff_ms,
            mutation_txn_timeout_ms: toml_config.mutations.txn_timeout_ms,
            cache_reconnect_delay_ms: toml_config.cache.reconnect_delay_ms,
            audit_file: toml_config.audit.file,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            prometheus_port: toml_config.metrics.prometheus_port,
            live_stale_after_secs: toml_config.live.stale_after_secs,
            config_file: origin.to_string(),
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" || arg == "-c" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, origin: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)
            .with_context(|| format!("Failed to parse config {}", origin))?;
        Ok(Self::from_toml(toml_config, origin))
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Load configuration from `path`, falling back to defaults with a warning
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Load configuration - resolves the path from args/env, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn store_snapshot_file(&self) -> &str {
        &self.store_snapshot_file
    }

    pub fn identity_domain(&self) -> &str {
        &self.identity_domain
    }

    pub fn guardian_credential(&self) -> &str {
        &self.guardian_credential
    }

    pub fn operator_credential(&self) -> &str {
        &self.operator_credential
    }

    pub fn import_row_delay(&self) -> Duration {
        Duration::from_millis(self.import_row_delay_ms)
    }

    pub fn import_call_timeout(&self) -> Duration {
        Duration::from_millis(self.import_call_timeout_ms)
    }

    pub fn import_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.import_sync_timeout_ms)
    }

    pub fn mutation_max_attempts(&self) -> u32 {
        self.mutation_max_attempts
    }

    pub fn mutation_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.mutation_retry_backoff_ms)
    }

    pub fn mutation_txn_timeout(&self) -> Duration {
        Duration::from_millis(self.mutation_txn_timeout_ms)
    }

    pub fn cache_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.cache_reconnect_delay_ms)
    }

    /// Audit file path, `None` when auditing goes to tracing only
    pub fn audit_file(&self) -> Option<&str> {
        if self.audit_file.trim().is_empty() {
            None
        } else {
            Some(&self.audit_file)
        }
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    /// Age after which a live fix is hidden, `None` when disabled
    pub fn live_stale_after(&self) -> Option<Duration> {
        match self.live_stale_after_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the import row delay
    #[cfg(test)]
    pub fn with_import_row_delay_ms(mut self, ms: u64) -> Self {
        self.import_row_delay_ms = ms;
        self
    }

    /// Builder method for tests to set the mutation attempt limit
    #[cfg(test)]
    pub fn with_mutation_max_attempts(mut self, attempts: u32) -> Self {
        self.mutation_max_attempts = attempts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "fleet");
        assert_eq!(config.identity_domain(), "traqerr.com");
        assert_eq!(config.import_row_delay(), Duration::from_millis(120));
        assert_eq!(config.mutation_max_attempts(), 5);
        assert_eq!(config.prometheus_port(), 0);
        assert_eq!(config.audit_file(), Some("logs/audit.jsonl"));
        assert_eq!(config.live_stale_after(), Some(Duration::from_secs(300)));
        assert_eq!(config.config_file(), "default");
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = Config::from_toml_str(
            "[mutations]\nmax_attempts = 0\n\n[live]\nstale_after_secs = 0\n\n[audit]\nfile = \"\"\n",
            "inline",
        )
        .unwrap();
        assert_eq!(config.mutation_max_attempts(), 1);
        assert_eq!(config.mutation_txn_timeout(), Duration::from_millis(5_000));
        assert_eq!(config.live_stale_after(), None);
        assert_eq!(config.audit_file(), None);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(Config::from_toml_str("[import\nrow_delay_ms = 1", "inline").is_err());
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["fleet-admin".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "fleet-admin".to_string(),
            "--config".to_string(),
            "config/school.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/school.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["fleet-admin".to_string(), "--config=config/depot.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/depot.toml");
    }

    #[test]
    fn test_builders() {
        let config = Config::default().with_import_row_delay_ms(0).with_mutation_max_attempts(2);
        assert_eq!(config.import_row_delay(), Duration::ZERO);
        assert_eq!(config.mutation_max_attempts(), 2);
    }
}
