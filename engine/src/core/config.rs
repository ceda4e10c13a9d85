use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::data::types::{QueryFilters, TimeRange};
use crate::domain::comparison::ComparisonPolicy;
use crate::domain::liveness::LivenessPolicy;
use crate::engine::EngineConfig;
use crate::engine::ingest::ReconnectPolicy;
use crate::utils::file::expand_path;
use crate::utils::time::chrono_duration;

use super::cli::CliConfig;
use super::constants::{
    APP_DOT_FOLDER, CONFIG_FILE_NAME, DEFAULT_ARRIVAL_GRACE_MS, DEFAULT_COMPARISON_CACHE_TTL_SECS,
    DEFAULT_COMPARISON_WINDOW_HOURS, DEFAULT_RECONNECT_BASE_DELAY_MS,
    DEFAULT_RECONNECT_MAX_DELAY_MS, DEFAULT_SESSION_LIVE_SECS, DEFAULT_SLOW_PERCENTILE,
    DEFAULT_TIMEOUT_SECS, DEFAULT_TRACE_LIVE_SECS, DEFAULT_URL, ENGINE_COMMAND_BUFFER,
};

// =============================================================================
// File Config Sections
// =============================================================================

/// Backend connection section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct BackendFileConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Default filters section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FiltersFileConfig {
    pub time_range: Option<TimeRange>,
    pub source: Option<String>,
    pub agent: Option<String>,
    pub only_errors: Option<bool>,
}

/// Liveness thresholds section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct LivenessFileConfig {
    pub session_secs: Option<u64>,
    pub trace_secs: Option<u64>,
    pub arrival_grace_ms: Option<u64>,
}

/// Span comparison section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ComparisonFileConfig {
    pub window_hours: Option<u64>,
    pub slow_percentile: Option<f64>,
    pub cache_ttl_secs: Option<u64>,
}

/// Realtime feed section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RealtimeFileConfig {
    pub reconnect_base_delay_ms: Option<u64>,
    pub reconnect_max_delay_ms: Option<u64>,
}

/// File-based configuration (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub backend: Option<BackendFileConfig>,
    pub scope: Option<String>,
    pub filters: Option<FiltersFileConfig>,
    pub liveness: Option<LivenessFileConfig>,
    pub comparison: Option<ComparisonFileConfig>,
    pub realtime: Option<RealtimeFileConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

/// Overwrite `$dst` with `$src` when the latter is set
macro_rules! merge_opt {
    ($dst:expr, $src:expr, $name:literal) => {
        if $src.is_some() {
            tracing::trace!(field = $name, value = ?$src, "Merging config value");
            $dst = $src;
        }
    };
}

impl FileConfig {
    /// Load configuration from a JSON file
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Warn about unknown fields in the config
    fn warn_unknown_fields(&self) {
        if let serde_json::Value::Object(map) = &self.extra
            && !map.is_empty()
        {
            let keys_str: String = map
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                fields = %keys_str,
                "Unknown fields in config file (possible typos)"
            );
        }
    }

    /// Merge another FileConfig into this one (other takes precedence)
    fn merge(&mut self, other: FileConfig) {
        if let Some(backend) = other.backend {
            let current = self.backend.get_or_insert_with(BackendFileConfig::default);
            merge_opt!(current.url, backend.url, "backend.url");
            if backend.api_key.is_some() {
                tracing::trace!("Merging backend.api_key");
                current.api_key = backend.api_key;
            }
            merge_opt!(current.timeout_secs, backend.timeout_secs, "backend.timeout_secs");
        }

        merge_opt!(self.scope, other.scope, "scope");

        if let Some(filters) = other.filters {
            let current = self.filters.get_or_insert_with(FiltersFileConfig::default);
            merge_opt!(current.time_range, filters.time_range, "filters.time_range");
            merge_opt!(current.source, filters.source, "filters.source");
            merge_opt!(current.agent, filters.agent, "filters.agent");
            merge_opt!(current.only_errors, filters.only_errors, "filters.only_errors");
        }

        if let Some(liveness) = other.liveness {
            let current = self.liveness.get_or_insert_with(LivenessFileConfig::default);
            merge_opt!(current.session_secs, liveness.session_secs, "liveness.session_secs");
            merge_opt!(current.trace_secs, liveness.trace_secs, "liveness.trace_secs");
            merge_opt!(
                current.arrival_grace_ms,
                liveness.arrival_grace_ms,
                "liveness.arrival_grace_ms"
            );
        }

        if let Some(comparison) = other.comparison {
            let current = self.comparison.get_or_insert_with(ComparisonFileConfig::default);
            merge_opt!(current.window_hours, comparison.window_hours, "comparison.window_hours");
            merge_opt!(
                current.slow_percentile,
                comparison.slow_percentile,
                "comparison.slow_percentile"
            );
            merge_opt!(
                current.cache_ttl_secs,
                comparison.cache_ttl_secs,
                "comparison.cache_ttl_secs"
            );
        }

        if let Some(realtime) = other.realtime {
            let current = self.realtime.get_or_insert_with(RealtimeFileConfig::default);
            merge_opt!(
                current.reconnect_base_delay_ms,
                realtime.reconnect_base_delay_ms,
                "realtime.reconnect_base_delay_ms"
            );
            merge_opt!(
                current.reconnect_max_delay_ms,
                realtime.reconnect_max_delay_ms,
                "realtime.reconnect_max_delay_ms"
            );
        }
    }
}

// =============================================================================
// Resolved Config
// =============================================================================

#[derive(Clone)]
pub struct BackendConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub session_secs: u64,
    pub trace_secs: u64,
    pub arrival_grace_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComparisonConfig {
    pub window_hours: u64,
    pub slow_percentile: f64,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

/// Final merged application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub scope: Option<String>,
    pub filters: QueryFilters,
    pub liveness: LivenessConfig,
    pub comparison: ComparisonConfig,
    pub realtime: RealtimeConfig,
}

impl AppConfig {
    /// Load configuration from all sources
    ///
    /// Priority (lowest to highest):
    /// 1. Defaults
    /// 2. Profile directory config (~/.storewatch/storewatch.json)
    /// 3. Local directory config OR CLI-specified config path
    /// 4. CLI arguments (which include env var fallbacks via clap)
    pub fn load(cli: &CliConfig) -> Result<Self> {
        Self::load_with_profile(cli, get_profile_config_path())
    }

    fn load_with_profile(cli: &CliConfig, profile_path: Option<PathBuf>) -> Result<Self> {
        tracing::debug!("Loading application configuration");

        let mut file_config = FileConfig::default();
        let mut found_configs: Vec<String> = Vec::new();

        if let Some(profile_path) = profile_path
            && profile_path.exists()
        {
            let profile_config = FileConfig::load_from_file(&profile_path)?;
            profile_config.warn_unknown_fields();
            file_config.merge(profile_config);
            found_configs.push(profile_path.display().to_string());
        }

        let overlay_path = if let Some(ref path) = cli.config {
            let expanded = expand_path(&path.to_string_lossy());
            if !expanded.exists() {
                anyhow::bail!("Config file not found: {}", expanded.display());
            }
            Some(expanded)
        } else {
            let local = PathBuf::from(CONFIG_FILE_NAME);
            if local.exists() { Some(local) } else { None }
        };

        if let Some(path) = overlay_path {
            let overlay_config = FileConfig::load_from_file(&path)?;
            overlay_config.warn_unknown_fields();
            file_config.merge(overlay_config);
            found_configs.push(path.display().to_string());
        }

        tracing::debug!(configs = ?found_configs, "Config files loaded");

        let file_backend = file_config.backend.unwrap_or_default();
        let file_filters = file_config.filters.unwrap_or_default();
        let file_liveness = file_config.liveness.unwrap_or_default();
        let file_comparison = file_config.comparison.unwrap_or_default();
        let file_realtime = file_config.realtime.unwrap_or_default();

        let backend = BackendConfig {
            url: cli
                .url
                .clone()
                .or(file_backend.url)
                .unwrap_or_else(|| DEFAULT_URL.to_string()),
            api_key: cli
                .api_key
                .clone()
                .or(file_backend.api_key)
                .filter(|k| !k.trim().is_empty()),
            timeout_secs: cli
                .timeout_secs
                .or(file_backend.timeout_secs)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        };

        let filters = QueryFilters {
            time_range: cli.range.or(file_filters.time_range).unwrap_or_default(),
            source: QueryFilters::normalize(cli.source.clone().or(file_filters.source)),
            agent: QueryFilters::normalize(cli.agent.clone().or(file_filters.agent)),
            only_errors: cli.only_errors.or(file_filters.only_errors).unwrap_or(false),
        };

        let config = Self {
            backend,
            scope: QueryFilters::normalize(cli.scope.clone().or(file_config.scope)),
            filters,
            liveness: LivenessConfig {
                session_secs: file_liveness
                    .session_secs
                    .unwrap_or(DEFAULT_SESSION_LIVE_SECS),
                trace_secs: file_liveness.trace_secs.unwrap_or(DEFAULT_TRACE_LIVE_SECS),
                arrival_grace_ms: file_liveness
                    .arrival_grace_ms
                    .unwrap_or(DEFAULT_ARRIVAL_GRACE_MS),
            },
            comparison: ComparisonConfig {
                window_hours: file_comparison
                    .window_hours
                    .unwrap_or(DEFAULT_COMPARISON_WINDOW_HOURS),
                slow_percentile: file_comparison
                    .slow_percentile
                    .unwrap_or(DEFAULT_SLOW_PERCENTILE),
                cache_ttl_secs: file_comparison
                    .cache_ttl_secs
                    .unwrap_or(DEFAULT_COMPARISON_CACHE_TTL_SECS),
            },
            realtime: RealtimeConfig {
                reconnect_base_delay_ms: file_realtime
                    .reconnect_base_delay_ms
                    .unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS),
                reconnect_max_delay_ms: file_realtime
                    .reconnect_max_delay_ms
                    .unwrap_or(DEFAULT_RECONNECT_MAX_DELAY_MS),
            },
        };

        config.validate()?;
        tracing::debug!(config = ?config, "Configuration loaded");
        Ok(config)
    }

    /// Validate the configuration for consistency and correctness
    fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.backend.url).with_context(|| {
            format!("Configuration error: backend.url '{}' is not a valid URL", self.backend.url)
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!(
                "Configuration error: backend.url must use http or https, got '{}'",
                url.scheme()
            );
        }
        if self.backend.timeout_secs == 0 {
            anyhow::bail!("Configuration error: backend.timeout_secs must be greater than 0");
        }
        if self.liveness.session_secs == 0 || self.liveness.trace_secs == 0 {
            anyhow::bail!("Configuration error: liveness windows must be greater than 0");
        }
        if self.comparison.window_hours == 0 {
            anyhow::bail!("Configuration error: comparison.window_hours must be greater than 0");
        }
        let pct = self.comparison.slow_percentile;
        if !(pct > 0.0 && pct <= 100.0) {
            anyhow::bail!(
                "Configuration error: comparison.slow_percentile must be in (0, 100], got {}",
                pct
            );
        }
        if self.realtime.reconnect_base_delay_ms == 0 {
            anyhow::bail!(
                "Configuration error: realtime.reconnect_base_delay_ms must be greater than 0"
            );
        }
        if self.realtime.reconnect_base_delay_ms > self.realtime.reconnect_max_delay_ms {
            anyhow::bail!(
                "Configuration error: realtime.reconnect_base_delay_ms ({}) exceeds reconnect_max_delay_ms ({})",
                self.realtime.reconnect_base_delay_ms,
                self.realtime.reconnect_max_delay_ms
            );
        }
        if self.liveness.trace_secs > self.liveness.session_secs {
            tracing::warn!(
                trace_secs = self.liveness.trace_secs,
                session_secs = self.liveness.session_secs,
                "Trace liveness window exceeds session window; traces are capped by their session"
            );
        }
        if url.scheme() == "http" && self.backend.api_key.is_some() {
            tracing::warn!("API key will be sent over plain http");
        }
        Ok(())
    }

    /// Engine settings derived from this config
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            fetch_timeout: Duration::from_secs(self.backend.timeout_secs),
            liveness: LivenessPolicy {
                session_window: chrono_duration(Duration::from_secs(self.liveness.session_secs)),
                trace_window: chrono_duration(Duration::from_secs(self.liveness.trace_secs)),
                arrival_grace: chrono_duration(Duration::from_millis(
                    self.liveness.arrival_grace_ms,
                )),
            },
            comparison: ComparisonPolicy {
                window: chrono_duration(Duration::from_secs(
                    self.comparison.window_hours.saturating_mul(3_600),
                )),
                slow_percentile: self.comparison.slow_percentile,
            },
            comparison_cache_ttl: Duration::from_secs(self.comparison.cache_ttl_secs),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.realtime.reconnect_base_delay_ms),
                max_delay: Duration::from_millis(self.realtime.reconnect_max_delay_ms),
            },
            command_buffer: ENGINE_COMMAND_BUFFER,
            initial_filters: self.filters.clone(),
        }
    }
}

/// Get the profile config path (~/.storewatch/storewatch.json)
fn get_profile_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(APP_DOT_FOLDER).join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, name: &str, json: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(json.as_bytes()).unwrap();
        path
    }

    fn load(cli: &CliConfig) -> Result<AppConfig> {
        AppConfig::load_with_profile(cli, None)
    }

    #[test]
    fn test_file_config_parse_full() {
        let json = r#"{
            "backend": { "url": "https://telemetry.example.com", "timeout_secs": 5 },
            "scope": "store-1",
            "filters": { "time_range": "7d", "source": "pos", "only_errors": true },
            "liveness": { "session_secs": 60 },
            "comparison": { "slow_percentile": 95.0 },
            "realtime": { "reconnect_max_delay_ms": 5000 }
        }"#;
        let config: FileConfig = serde_json::from_str(json).unwrap();

        let backend = config.backend.as_ref().unwrap();
        assert_eq!(backend.url.as_deref(), Some("https://telemetry.example.com"));
        assert_eq!(backend.timeout_secs, Some(5));
        let filters = config.filters.as_ref().unwrap();
        assert_eq!(filters.time_range, Some(TimeRange::Last7Days));
        assert_eq!(filters.only_errors, Some(true));
        assert_eq!(config.liveness.as_ref().unwrap().session_secs, Some(60));
        assert_eq!(config.comparison.as_ref().unwrap().slow_percentile, Some(95.0));
    }

    #[test]
    fn test_file_config_parse_extra_fields() {
        let json = r#"{ "scope": "store-1", "scop": "typo" }"#;
        let config: FileConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.scope.as_deref(), Some("store-1"));
        assert_eq!(config.extra["scop"], "typo");
    }

    #[test]
    fn test_file_config_rejects_bad_time_range() {
        let json = r#"{ "filters": { "time_range": "3w" } }"#;
        assert!(serde_json::from_str::<FileConfig>(json).is_err());
    }

    #[test]
    fn test_file_config_merge() {
        let mut base: FileConfig = serde_json::from_str(
            r#"{
                "backend": { "url": "http://a", "timeout_secs": 5 },
                "filters": { "source": "pos" },
                "liveness": { "session_secs": 45, "trace_secs": 15 }
            }"#,
        )
        .unwrap();
        let overlay: FileConfig = serde_json::from_str(
            r#"{
                "backend": { "url": "http://b" },
                "filters": { "agent": "planner" },
                "liveness": { "trace_secs": 5 }
            }"#,
        )
        .unwrap();
        base.merge(overlay);

        let backend = base.backend.unwrap();
        assert_eq!(backend.url.as_deref(), Some("http://b"));
        assert_eq!(backend.timeout_secs, Some(5));
        let filters = base.filters.unwrap();
        assert_eq!(filters.source.as_deref(), Some("pos"));
        assert_eq!(filters.agent.as_deref(), Some("planner"));
        let liveness = base.liveness.unwrap();
        assert_eq!(liveness.session_secs, Some(45));
        assert_eq!(liveness.trace_secs, Some(5));
    }

    #[test]
    fn test_app_config_defaults() {
        let config = load(&CliConfig::default()).unwrap();

        assert_eq!(config.backend.url, DEFAULT_URL);
        assert_eq!(config.backend.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert!(config.scope.is_none());
        assert_eq!(config.filters, QueryFilters::default());
        assert_eq!(config.liveness.session_secs, DEFAULT_SESSION_LIVE_SECS);
        assert_eq!(config.comparison.slow_percentile, DEFAULT_SLOW_PERCENTILE);

        let engine = config.engine_config();
        assert_eq!(engine.liveness, LivenessPolicy::default());
        assert_eq!(engine.comparison, ComparisonPolicy::default());
    }

    #[test]
    fn test_app_config_file_then_cli() {
        let dir = tempfile::tempdir().unwrap();
        let profile = write_config(
            &dir,
            "profile.json",
            r#"{ "backend": { "url": "http://profile:1" }, "scope": "store-p" }"#,
        );
        let local = write_config(
            &dir,
            "local.json",
            r#"{ "scope": "store-l", "filters": { "source": "web", "time_range": "1h" } }"#,
        );

        let cli = CliConfig {
            config: Some(local),
            source: Some("pos".into()),
            ..Default::default()
        };
        let config = AppConfig::load_with_profile(&cli, Some(profile)).unwrap();

        assert_eq!(config.backend.url, "http://profile:1");
        assert_eq!(config.scope.as_deref(), Some("store-l"));
        assert_eq!(config.filters.source.as_deref(), Some("pos"));
        assert_eq!(config.filters.time_range, TimeRange::LastHour);
    }

    #[test]
    fn test_app_config_missing_explicit_file() {
        let cli = CliConfig {
            config: Some(PathBuf::from("/nonexistent/storewatch.json")),
            ..Default::default()
        };
        let err = load(&cli).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_app_config_validation_url_scheme() {
        let cli = CliConfig {
            url: Some("ftp://telemetry".into()),
            ..Default::default()
        };
        assert!(load(&cli).is_err());

        let cli = CliConfig {
            url: Some("not a url".into()),
            ..Default::default()
        };
        assert!(load(&cli).is_err());
    }

    #[test]
    fn test_app_config_validation_zero_timeout() {
        let cli = CliConfig {
            timeout_secs: Some(0),
            ..Default::default()
        };
        let err = load(&cli).unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn test_app_config_validation_percentile_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "c.json", r#"{ "comparison": { "slow_percentile": 0 } }"#);
        let cli = CliConfig {
            config: Some(path),
            ..Default::default()
        };
        assert!(load(&cli).is_err());
    }

    #[test]
    fn test_app_config_validation_reconnect_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "c.json",
            r#"{ "realtime": { "reconnect_base_delay_ms": 9000, "reconnect_max_delay_ms": 100 } }"#,
        );
        let cli = CliConfig {
            config: Some(path),
            ..Default::default()
        };
        assert!(load(&cli).is_err());
    }

    #[test]
    fn test_blank_api_key_is_ignored() {
        let cli = CliConfig {
            api_key: Some("  ".into()),
            ..Default::default()
        };
        assert!(load(&cli).unwrap().backend.api_key.is_none());
    }

    #[test]
    fn test_api_key_redacted_in_debug() {
        let cli = CliConfig {
            api_key: Some("sk-secret".into()),
            ..Default::default()
        };
        let config = load(&cli).unwrap();
        assert!(!format!("{:?}", config).contains("sk-secret"));
    }
}
