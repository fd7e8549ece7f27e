//! Configuration loading for the pipeline.
//!
//! Handles paths and settings for:
//! - the collector endpoint and credentials
//! - debounce, queue and dispatch tuning
//! - language label merging and activity summaries
//!
//! A missing config file yields defaults. `DEVINSIGHT_API_KEY` overrides the
//! file's `api.api_key`; `DEVINSIGHT_MERGE_LANGUAGES` (`from:to,from:to`) adds
//! language merges on top of `language.aliases`.
//!
//! Accessors bound out-of-range values: durations to a year, clock skew to a
//! day and history retention to 3650 days.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{InsightError, Result};
use crate::language::parse_alias_pairs;

pub const CONFIG_ENV: &str = "DEVINSIGHT_CONFIG";
pub const API_KEY_ENV: &str = "DEVINSIGHT_API_KEY";
pub const MERGE_LANGUAGES_ENV: &str = "DEVINSIGHT_MERGE_LANGUAGES";
const DATA_DIR_NAME: &str = ".devinsight";
const CONFIG_FILE_NAME: &str = "config.toml";
const QUEUE_FILE_NAME: &str = "queue.db";

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8787/api/v1/heartbeats";

/// Returns the DevInsight data directory (~/.devinsight).
pub fn data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(DATA_DIR_NAME))
}

/// Returns the config path, honoring `DEVINSIGHT_CONFIG`.
pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    data_dir()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .ok_or(InsightError::HomeDirNotFound)
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct InsightConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub language: LanguageConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
}

impl InsightConfig {
    /// Resolves the queue database location, falling back to ~/.devinsight/queue.db.
    pub fn queue_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.queue.path {
            return Ok(path.clone());
        }
        data_dir()
            .map(|dir| dir.join(QUEUE_FILE_NAME))
            .ok_or(InsightError::HomeDirNotFound)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Identity label attached to every record (the collector keys by it).
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(bounded_secs(self.timeout_secs).max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(bounded_secs(self.connect_timeout_secs).max(1))
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            user_id: None,
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebounceConfig {
    #[serde(default = "default_debounce_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_debounce_interval_secs(),
            clock_skew_secs: default_clock_skew_secs(),
        }
    }
}

impl DebounceConfig {
    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(clamp_secs(self.interval_secs))
    }

    pub fn clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(clamp_secs(self.clock_skew_secs.min(MAX_CLOCK_SKEW_SECS)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_dispatch_interval_secs(),
            batch_size: default_batch_size(),
            flush_threshold: default_flush_threshold(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(bounded_secs(self.interval_secs).max(1))
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(bounded_secs(self.backoff_base_secs).max(1))
    }

    pub fn backoff_max(&self) -> Duration {
        let base = bounded_secs(self.backoff_base_secs).max(1);
        Duration::from_secs(bounded_secs(self.backoff_max_secs).max(base))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(bounded_secs(self.shutdown_grace_secs))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LanguageConfig {
    /// Label merges, e.g. `typescriptreact = "typescript"`.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummaryConfig {
    #[serde(default = "default_session_gap_secs")]
    pub session_gap_secs: u64,
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u32,
    /// Languages left out of the per-language breakdown (e.g. `json`).
    #[serde(default)]
    pub excluded_languages: Vec<String>,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            session_gap_secs: default_session_gap_secs(),
            history_retention_days: default_history_retention_days(),
            excluded_languages: Vec::new(),
        }
    }
}

impl SummaryConfig {
    pub fn session_gap(&self) -> chrono::Duration {
        chrono::Duration::seconds(clamp_secs(self.session_gap_secs))
    }

    pub fn history_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(
            self.history_retention_days.clamp(1, MAX_RETENTION_DAYS),
        ))
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_debounce_interval_secs() -> u64 {
    120
}

fn default_clock_skew_secs() -> u64 {
    5
}

fn default_max_entries() -> usize {
    10_000
}

fn default_dispatch_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    50
}

fn default_flush_threshold() -> usize {
    50
}

fn default_backoff_base_secs() -> u64 {
    5
}

fn default_backoff_max_secs() -> u64 {
    15 * 60
}

fn default_shutdown_grace_secs() -> u64 {
    3
}

fn default_session_gap_secs() -> u64 {
    5 * 60
}

fn default_history_retention_days() -> u32 {
    7
}

/// Every configured duration is cut to one year.
const MAX_DURATION_SECS: u64 = 366 * 24 * 60 * 60;
const MAX_CLOCK_SKEW_SECS: u64 = 24 * 60 * 60;
const MAX_RETENTION_DAYS: u32 = 3650;

fn bounded_secs(secs: u64) -> u64 {
    secs.min(MAX_DURATION_SECS)
}

fn clamp_secs(secs: u64) -> i64 {
    i64::try_from(bounded_secs(secs)).unwrap_or(0)
}

/// Loads config from `path` (or the default location), returning defaults
/// when the file does not exist.
pub fn load_config(path: Option<PathBuf>) -> Result<InsightConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    let mut config = read_config_file(&config_path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<InsightConfig> {
    if !path.exists() {
        return Ok(InsightConfig::default());
    }

    let content = fs_err::read_to_string(path).map_err(|source| InsightError::Io {
        context: format!("Failed to read config {}", path.display()),
        source,
    })?;
    toml::from_str::<InsightConfig>(&content).map_err(|err| InsightError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

fn apply_env_overrides(config: &mut InsightConfig) {
    if let Ok(key) = env::var(API_KEY_ENV) {
        let key = key.trim();
        if !key.is_empty() {
            config.api.api_key = Some(key.to_string());
        }
    }
    if let Ok(raw) = env::var(MERGE_LANGUAGES_ENV) {
        config.language.aliases.extend(parse_alias_pairs(&raw));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = read_config_file(&temp_dir.path().join("missing.toml")).expect("config");
        assert_eq!(config.debounce.interval_secs, 120);
        assert_eq!(config.queue.max_entries, 10_000);
        assert_eq!(config.dispatch.batch_size, 50);
        assert_eq!(config.dispatch.backoff_max(), Duration::from_secs(900));
        assert_eq!(config.api.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn load_config_parses_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
[api]
endpoint = "https://collector.example/v1/heartbeats"
user_id = "1276135174853099622"

[debounce]
interval_secs = 30

[queue]
path = "/tmp/devinsight-queue.db"
max_entries = 500

[dispatch]
interval_secs = 15
batch_size = 25
backoff_base_secs = 2
backoff_max_secs = 60

[language.aliases]
typescriptreact = "typescript"
javascriptreact = "javascript"

[summary]
session_gap_secs = 600
"#,
        )
        .expect("write config");

        let config = read_config_file(&path).expect("config");
        assert_eq!(config.api.endpoint, "https://collector.example/v1/heartbeats");
        assert_eq!(config.api.user_id.as_deref(), Some("1276135174853099622"));
        assert_eq!(config.debounce.interval(), chrono::Duration::seconds(30));
        assert_eq!(config.queue_path().unwrap(), PathBuf::from("/tmp/devinsight-queue.db"));
        assert_eq!(config.queue.max_entries, 500);
        assert_eq!(config.dispatch.batch_size, 25);
        assert_eq!(config.dispatch.flush_threshold, 50);
        assert_eq!(
            config.language.aliases.get("typescriptreact").map(String::as_str),
            Some("typescript")
        );
        assert_eq!(config.summary.session_gap(), chrono::Duration::seconds(600));
        assert_eq!(config.summary.history_retention_days, 7);
    }

    #[test]
    fn load_config_reports_malformed_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[dispatch]\nbatch_size = \"lots\"\n").expect("write config");

        let err = read_config_file(&path).unwrap_err();
        assert!(matches!(err, InsightError::ConfigMalformed { .. }));
    }

    #[test]
    fn backoff_max_never_below_base() {
        let config = DispatchConfig {
            backoff_base_secs: 30,
            backoff_max_secs: 10,
            ..DispatchConfig::default()
        };
        assert_eq!(config.backoff_max(), Duration::from_secs(30));
    }

    #[test]
    fn out_of_range_values_are_bounded() {
        let config: InsightConfig = toml::from_str(
            r#"
[api]
timeout_secs = 9223372036854775807

[debounce]
interval_secs = 9223372036854775807
clock_skew_secs = 9000000000000

[dispatch]
interval_secs = 9223372036854775807
backoff_base_secs = 9223372036854775807
backoff_max_secs = 9223372036854775807
shutdown_grace_secs = 9223372036854775807

[summary]
session_gap_secs = 9223372036854775807
history_retention_days = 4294967295
"#,
        )
        .expect("config");

        let year = Duration::from_secs(MAX_DURATION_SECS);
        assert_eq!(config.api.timeout(), year);
        assert_eq!(config.debounce.interval().num_seconds(), MAX_DURATION_SECS as i64);
        assert_eq!(config.debounce.clock_skew(), chrono::Duration::days(1));
        assert_eq!(config.dispatch.interval(), year);
        assert_eq!(config.dispatch.backoff_max(), year);
        assert_eq!(config.dispatch.shutdown_grace(), year);
        assert_eq!(config.summary.session_gap().num_seconds(), MAX_DURATION_SECS as i64);
        assert_eq!(config.summary.history_retention(), chrono::Duration::days(3650));

        let now = chrono::Utc::now();
        assert!(now.checked_sub_signed(config.summary.history_retention()).is_some());
        assert!(now.checked_add_signed(config.debounce.clock_skew()).is_some());
    }

    #[test]
    fn merge_languages_env_extends_aliases() {
        let mut config = InsightConfig::default();
        config
            .language
            .aliases
            .insert("vue".to_string(), "javascript".to_string());

        env::set_var(MERGE_LANGUAGES_ENV, "typescriptreact:typescript");
        apply_env_overrides(&mut config);
        env::remove_var(MERGE_LANGUAGES_ENV);

        assert_eq!(config.language.aliases.len(), 2);
        assert_eq!(
            config.language.aliases.get("typescriptreact").map(String::as_str),
            Some("typescript")
        );
    }
}
