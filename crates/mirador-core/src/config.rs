//! Configuration types for Mirador components.
//!
//! Every section deserializes from TOML with per-field defaults, so a config
//! file only needs the values it overrides:
//!
//! ```toml
//! [upstream]
//! base_url = "https://api.example.com/v1"
//! api_key = "..."
//!
//! [schedule]
//! interval_secs = 3600
//!
//! [sync]
//! batch_size = 20
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub upstream: UpstreamConfig,
    pub http: HttpConfig,
    pub sync: SyncConfig,
    pub schedule: ScheduleConfig,
    pub cleanup: CleanupConfig,
    pub signals: SignalRules,
}

/// Where the upstream listings API lives and how to authenticate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(skip_serializing)]
    pub api_secret: Option<String>,
}

impl UpstreamConfig {
    /// Checks that a base URL and API key are present.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigurationError` naming the first missing value.
    pub fn validate(&self) -> Result<(), AppError> {
        if is_blank(&self.base_url) {
            return Err(AppError::ConfigurationError(
                "upstream base URL is not set".to_string(),
            ));
        }
        if is_blank(&self.api_key) {
            return Err(AppError::ConfigurationError(
                "upstream API key is not set".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or_default().is_empty()
}

/// HTTP client configuration for upstream calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    /// Total attempts per request, including the first one.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub max_backoff_ms: u64,
    /// Extra backoff factor applied when upstream answers 429.
    pub rate_limit_multiplier: u32,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            max_backoff_ms: 30_000,
            rate_limit_multiplier: 2,
        }
    }
}

/// Pagination and batching behaviour of a sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub page_size: u32,
    /// Hard stop for the pagination walk. Hitting it marks the walk incomplete.
    pub max_pages: u32,
    pub batch_size: usize,
    /// Delay after every page fetch and between batches.
    pub delay_between_requests_ms: u64,
    /// Shorter delay between items inside a batch.
    pub item_delay_ms: u64,
    /// Records reconciled concurrently inside one batch.
    pub batch_concurrency: usize,
    pub cache_ttl_secs: u64,
}

impl SyncConfig {
    pub fn delay_between_requests(&self) -> Duration {
        Duration::from_millis(self.delay_between_requests_ms)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_ttl_secs.max(1) as i64)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_pages: 1000,
            batch_size: 10,
            delay_between_requests_ms: 1000,
            item_delay_ms: 250,
            batch_concurrency: 1,
            cache_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// When cycles run on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Evaluate the gate immediately when the timer starts.
    pub run_on_start: bool,
    pub min_interval_secs: u64,
    pub skip_if_recent: bool,
    pub recent_window_secs: u64,
    /// Fraction of active records that must be fresh to skip a cycle.
    pub recent_threshold: f64,
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn min_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_interval_secs as i64)
    }

    pub fn recent_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.recent_window_secs as i64)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 6 * 60 * 60,
            run_on_start: true,
            min_interval_secs: 24 * 60 * 60,
            skip_if_recent: true,
            recent_window_secs: 24 * 60 * 60,
            recent_threshold: 0.8,
        }
    }
}

/// Grace periods for the cleanup operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// How long past `expires_at` before a record is flagged for review.
    pub expired_grace_secs: u64,
    /// How long a disabled, absent record is kept before hard deletion.
    pub hard_delete_grace_secs: u64,
}

impl CleanupConfig {
    pub fn expired_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expired_grace_secs as i64)
    }

    pub fn hard_delete_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.hard_delete_grace_secs as i64)
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            expired_grace_secs: 7 * 24 * 60 * 60,
            hard_delete_grace_secs: 30 * 24 * 60 * 60,
        }
    }
}

/// Thresholds for feature-signal rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalRules {
    pub min_facilities: usize,
    pub min_images: usize,
    /// Matched case-insensitively against the listing location.
    pub premium_locations: Vec<String>,
}

impl Default for SignalRules {
    fn default() -> Self {
        Self {
            min_facilities: 5,
            min_images: 10,
            premium_locations: vec![
                "Downtown Dubai".to_string(),
                "Palm Jumeirah".to_string(),
                "Dubai Marina".to_string(),
                "Business Bay".to_string(),
            ],
        }
    }
}

/// Partial configuration update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub delay_between_requests_ms: Option<u64>,
    pub min_interval_secs: Option<u64>,
    pub skip_if_recent: Option<bool>,
    pub expired_grace_secs: Option<u64>,
    pub hard_delete_grace_secs: Option<u64>,
}

impl EngineConfig {
    /// Applies a partial update. Returns true if the schedule interval changed.
    pub fn apply(&mut self, update: &ConfigUpdate) -> bool {
        let previous_interval = self.schedule.interval_secs;

        if let Some(v) = update.enabled {
            self.schedule.enabled = v;
        }
        if let Some(v) = update.interval_secs {
            self.schedule.interval_secs = v.max(1);
        }
        if let Some(v) = update.max_retries {
            self.http.max_retries = v.max(1);
        }
        if let Some(v) = update.timeout_secs {
            self.http.timeout_secs = v;
        }
        if let Some(v) = update.batch_size {
            self.sync.batch_size = v.max(1);
        }
        if let Some(v) = update.delay_between_requests_ms {
            self.sync.delay_between_requests_ms = v;
        }
        if let Some(v) = update.min_interval_secs {
            self.schedule.min_interval_secs = v;
        }
        if let Some(v) = update.skip_if_recent {
            self.schedule.skip_if_recent = v;
        }
        if let Some(v) = update.expired_grace_secs {
            self.cleanup.expired_grace_secs = v;
        }
        if let Some(v) = update.hard_delete_grace_secs {
            self.cleanup.hard_delete_grace_secs = v;
        }

        self.schedule.interval_secs != previous_interval
    }

    /// Returns a copy with credentials blanked, for status output.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.upstream.api_key.is_some() {
            copy.upstream.api_key = Some("********".to_string());
        }
        copy.upstream.api_secret = None;
        copy
    }
}

/// Default location of the config file: `<config_dir>/mirador/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("mirador").join("config.toml"))
}

/// Loads engine configuration from a TOML file.
///
/// With `path = None` the default location is used, and a missing file there
/// yields the defaults. An explicitly given path must exist.
///
/// # Errors
///
/// Returns `AppError::ConfigFile` if the file cannot be read or parsed.
pub fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig, AppError> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => match default_config_path() {
            Some(p) => (p, false),
            None => return Ok(EngineConfig::default()),
        },
    };

    if !explicit && !path.exists() {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        return Ok(EngineConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .map_err(|e| AppError::ConfigFile(format!("{}: {}", path.display(), e)))?;

    toml::from_str(&content)
        .map_err(|e| AppError::ConfigFile(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.cache_ttl(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_schedule_and_cleanup_defaults() {
        let schedule = ScheduleConfig::default();
        assert!(schedule.enabled);
        assert_eq!(schedule.min_interval(), chrono::Duration::hours(24));
        assert_eq!(schedule.recent_threshold, 0.8);

        let cleanup = CleanupConfig::default();
        assert_eq!(cleanup.hard_delete_grace(), chrono::Duration::days(30));
    }

    #[test]
    fn test_upstream_validate() {
        let mut upstream = UpstreamConfig::default();
        assert!(matches!(
            upstream.validate(),
            Err(AppError::ConfigurationError(msg)) if msg.contains("base URL")
        ));

        upstream.base_url = Some("https://api.example.com".to_string());
        upstream.api_key = Some("   ".to_string());
        assert!(matches!(
            upstream.validate(),
            Err(AppError::ConfigurationError(msg)) if msg.contains("API key")
        ));

        upstream.api_key = Some("key".to_string());
        assert!(upstream.validate().is_ok());
    }

    #[test]
    fn test_apply_update_reports_interval_change() {
        let mut config = EngineConfig::default();

        let changed = config.apply(&ConfigUpdate {
            batch_size: Some(25),
            skip_if_recent: Some(false),
            ..Default::default()
        });
        assert!(!changed);
        assert_eq!(config.sync.batch_size, 25);
        assert!(!config.schedule.skip_if_recent);

        let changed = config.apply(&ConfigUpdate {
            interval_secs: Some(60),
            ..Default::default()
        });
        assert!(changed);
        assert_eq!(config.schedule.interval_secs, 60);
    }

    #[test]
    fn test_redacted_hides_credentials() {
        let mut config = EngineConfig::default();
        config.upstream.api_key = Some("real-key".to_string());
        config.upstream.api_secret = Some("real-secret".to_string());

        let redacted = config.redacted();
        assert_eq!(redacted.upstream.api_key.as_deref(), Some("********"));
        assert!(redacted.upstream.api_secret.is_none());

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("real-secret"));
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[upstream]
base_url = "https://api.example.com/v1"

[sync]
batch_size = 20

[signals]
premium_locations = ["Old Town"]
"#
        )
        .unwrap();

        let config = load_engine_config(Some(file.path())).unwrap();
        assert_eq!(
            config.upstream.base_url.as_deref(),
            Some("https://api.example.com/v1")
        );
        assert_eq!(config.sync.batch_size, 20);
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.signals.premium_locations, vec!["Old Town"]);
        assert_eq!(config.signals.min_images, 10);
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_engine_config(Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(AppError::ConfigFile(_))));
    }

    #[test]
    fn test_load_invalid_toml_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync\nbatch_size = ").unwrap();
        assert!(matches!(
            load_engine_config(Some(file.path())),
            Err(AppError::ConfigFile(_))
        ));
    }
}
