//! Configuration system for Delve.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/delve/config.toml` and/or `.delve/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level configuration for Delve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DelveConfig {
    pub store: StoreConfig,
    pub research: ResearchConfig,
    pub stall: StallConfig,
    pub progress: ProgressCurveConfig,
    pub pricing: PricingConfig,
    pub remote: RemoteConfig,
    pub notifications: NotificationConfig,
    pub export: ExportConfig,
}

/// Durable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file. Defaults to the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// SQLite busy handler timeout applied to the connection.
    pub busy_timeout_ms: u64,
    /// First backoff delay for busy/locked retries.
    pub retry_base_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub retry_factor: u32,
    /// Upper bound for a single backoff delay.
    pub retry_cap_ms: u64,
    /// Total attempts, including the first one.
    pub retry_max_attempts: u32,
    /// Snapshots kept per task; older rows are pruned on append.
    pub snapshot_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 0,
            retry_base_ms: 100,
            retry_factor: 2,
            retry_cap_ms: 2_000,
            retry_max_attempts: 6,
            snapshot_limit: 100,
        }
    }
}

impl StoreConfig {
    /// Backoff delay before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.retry_factor.max(1));
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self
            .retry_base_ms
            .saturating_mul(factor.saturating_pow(exp))
            .min(self.retry_cap_ms);
        Duration::from_millis(delay)
    }

    /// Resolve the database path, falling back to the platform data dir.
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(ref path) = self.path {
            return path.clone();
        }
        directories::ProjectDirs::from("dev", "delve", "delve")
            .map(|d| d.data_dir().join("research.db"))
            .unwrap_or_else(|| PathBuf::from(".delve").join("research.db"))
    }
}

/// Longest wall-clock ceiling a task may request (30 days).
pub const MAX_WAIT_LIMIT_SECS: u64 = 30 * 24 * 60 * 60;

/// Timing budget for research tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    /// How long `start_research` waits before handing the task to the background.
    pub sync_timeout_ms: u64,
    /// Poll interval once the task runs in the background.
    pub poll_interval_ms: u64,
    /// Faster poll interval used while the caller is still waiting.
    pub sync_poll_interval_ms: u64,
    /// Hard wall-clock ceiling per task, measured from creation.
    pub max_wait_secs: u64,
    /// Longest accepted query, in characters.
    pub max_query_chars: usize,
    /// Model requested when the caller does not name one.
    pub default_model: String,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 30_000,
            poll_interval_ms: 10_000,
            sync_poll_interval_ms: 2_000,
            max_wait_secs: 8 * 60 * 60,
            max_query_chars: 10_000,
            default_model: "deep-research-pro".to_string(),
        }
    }
}

impl ResearchConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }
}

/// Thresholds for the stall detector, in minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StallConfig {
    /// Status unchanged for longer than this is treated as a hang.
    pub stall_threshold_minutes: f64,
    /// Typical duration of a research task.
    pub expected_minutes: f64,
    /// Elapsed time after which slow progress becomes a concern.
    pub concern_minutes: f64,
    /// Elapsed time after which the task is considered hung outright.
    pub excessive_minutes: f64,
    /// Status stall tolerated once progress has reached the finalization band.
    pub finalization_stall_minutes: f64,
    /// Progress at which the finalization rule applies.
    pub finalization_progress: f64,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            stall_threshold_minutes: 15.0,
            expected_minutes: 25.0,
            concern_minutes: 30.0,
            excessive_minutes: 60.0,
            finalization_stall_minutes: 10.0,
            finalization_progress: 90.0,
        }
    }
}

/// Shape of the synthetic progress curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressCurveConfig {
    /// Asymptote the curve approaches while the remote is still working.
    pub ceiling: f64,
    /// Time constant in seconds; progress reaches ~63% of the ceiling after this long.
    pub time_constant_secs: f64,
}

impl Default for ProgressCurveConfig {
    fn default() -> Self {
        Self {
            ceiling: 95.0,
            time_constant_secs: 600.0,
        }
    }
}

/// Token pricing used for cost estimates, USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_million: 1.0,
            output_per_million: 4.0,
        }
    }
}

impl PricingConfig {
    /// Cost in USD for the given token counts.
    pub fn cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 / 1_000_000.0) * self.input_per_million
            + (tokens_out as f64 / 1_000_000.0) * self.output_per_million
    }
}

/// Remote research API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.delve.dev".to_string(),
            api_key_env: "DELVE_API_KEY".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl RemoteConfig {
    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.api_key_env).map_err(|_| ConfigError::EnvVarMissing {
            var: self.api_key_env.clone(),
        })
    }
}

/// Desktop notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    /// Default for tasks that do not say otherwise.
    pub notify_by_default: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            notify_by_default: true,
        }
    }
}

/// Markdown export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    pub file_prefix: String,
    pub include_sources: bool,
    pub include_metadata: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            file_prefix: "research".to_string(),
            include_sources: true,
            include_metadata: true,
        }
    }
}

impl ExportConfig {
    pub fn resolved_output_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.output_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("dev", "delve", "delve")
            .map(|d| d.data_dir().join("reports"))
            .unwrap_or_else(|| PathBuf::from("reports"))
    }
}

impl DelveConfig {
    /// Reject combinations that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.research.poll_interval_ms == 0 || self.research.sync_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                message: "poll intervals must be greater than zero".into(),
            });
        }
        if self.research.max_wait_secs == 0 || self.research.max_wait_secs > MAX_WAIT_LIMIT_SECS {
            return Err(ConfigError::Invalid {
                message: format!(
                    "research.max_wait_secs must be in 1..={MAX_WAIT_LIMIT_SECS}, got {}",
                    self.research.max_wait_secs
                ),
            });
        }
        if self.store.retry_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "store.retry_max_attempts must be at least 1".into(),
            });
        }
        if !(0.0..100.0).contains(&self.progress.ceiling) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "progress.ceiling must be in [0, 100), got {}",
                    self.progress.ceiling
                ),
            });
        }
        if self.progress.time_constant_secs <= 0.0 {
            return Err(ConfigError::Invalid {
                message: "progress.time_constant_secs must be positive".into(),
            });
        }
        if self.stall.excessive_minutes <= 0.0 {
            return Err(ConfigError::Invalid {
                message: "stall.excessive_minutes must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DELVE_`)
/// 3. Workspace-local config (`.delve/config.toml`)
/// 4. User config (`~/.config/delve/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&DelveConfig>,
) -> Result<DelveConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(DelveConfig::default()));

    // User-level config
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "delve", "delve") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".delve").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (DELVE_RESEARCH__SYNC_TIMEOUT_MS, DELVE_STALL__EXCESSIVE_MINUTES, etc.)
    // DELVE_API_KEY is a secret, not a config key, so it is skipped here.
    figment = figment.merge(
        Env::prefixed("DELVE_")
            .ignore(&["API_KEY"])
            .split("__"),
    );

    // Explicit overrides
    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DelveConfig::default();
        assert_eq!(config.research.sync_timeout_ms, 30_000);
        assert_eq!(config.research.poll_interval_ms, 10_000);
        assert_eq!(config.research.max_wait_secs, 28_800);
        assert_eq!(config.stall.stall_threshold_minutes, 15.0);
        assert_eq!(config.stall.excessive_minutes, 60.0);
        assert_eq!(config.store.snapshot_limit, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let store = StoreConfig::default();
        assert_eq!(store.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(store.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(store.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(store.backoff_delay(5), Duration::from_millis(1_600));
        assert_eq!(store.backoff_delay(6), Duration::from_millis(2_000));
        assert_eq!(store.backoff_delay(40), Duration::from_millis(2_000));
    }

    #[test]
    fn test_pricing_cost() {
        let pricing = PricingConfig::default();
        let cost = pricing.cost(1_000_000, 500_000);
        assert!((cost - 3.0).abs() < 1e-9);
        assert_eq!(pricing.cost(0, 0), 0.0);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = DelveConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: DelveConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.stall, config.stall);
        assert_eq!(parsed.progress, config.progress);
        assert_eq!(parsed.research.default_model, config.research.default_model);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let parsed: DelveConfig = toml::from_str(
            r#"
            [research]
            sync_timeout_ms = 500

            [stall]
            stall_threshold_minutes = 5.0
            "#,
        )
        .unwrap();
        assert_eq!(parsed.research.sync_timeout_ms, 500);
        assert_eq!(parsed.research.poll_interval_ms, 10_000);
        assert_eq!(parsed.stall.stall_threshold_minutes, 5.0);
        assert_eq!(parsed.stall.excessive_minutes, 60.0);
    }

    #[test]
    fn test_validate_rejects_bad_curve() {
        let mut config = DelveConfig::default();
        config.progress.ceiling = 100.0;
        assert!(config.validate().is_err());

        let mut config = DelveConfig::default();
        config.research.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_max_wait() {
        let mut config = DelveConfig::default();
        config.research.max_wait_secs = u64::MAX;
        assert!(config.validate().is_err());

        config.research.max_wait_secs = 0;
        assert!(config.validate().is_err());

        config.research.max_wait_secs = MAX_WAIT_LIMIT_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".delve");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "[research]\nsync_poll_interval_ms = 250\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.research.sync_poll_interval_ms, 250);
    }

    #[test]
    fn test_load_config_overrides_win() {
        let mut overrides = DelveConfig::default();
        overrides.research.max_wait_secs = 42;
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.research.max_wait_secs, 42);
    }
}
