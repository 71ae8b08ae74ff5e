//! Configuration management for the sync engine.

use std::env;
use std::path::PathBuf;

use tillsync_engine::Backoff;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Whether realtime sync is enabled at all
    pub realtime_enabled: bool,
    /// Directory for durable state (mirror, queue, derived keys)
    pub data_dir: PathBuf,
    /// Reconnect backoff policy
    pub backoff: Backoff,
    /// Tables to watch; `None` watches the whole catalog
    pub tables: Option<Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            realtime_enabled: true,
            data_dir: PathBuf::from("./.tillsync"),
            backoff: Backoff::default(),
            tables: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, reading `.env` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through a variable lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let realtime_enabled = match lookup("TILLSYNC_REALTIME_ENABLED") {
            Some(raw) => parse_bool(&raw).ok_or(ConfigError::InvalidBool {
                var: "TILLSYNC_REALTIME_ENABLED",
                value: raw,
            })?,
            None => defaults.realtime_enabled,
        };

        let data_dir = lookup("TILLSYNC_DATA_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let base_ms = parse_millis(&lookup, "TILLSYNC_RECONNECT_BASE_MS", defaults.backoff.base_ms)?;
        let max_ms = parse_millis(&lookup, "TILLSYNC_RECONNECT_MAX_MS", defaults.backoff.max_ms)?;
        if base_ms == 0 {
            return Err(ConfigError::ZeroBackoff);
        }
        if max_ms < base_ms {
            return Err(ConfigError::BackoffRange { base_ms, max_ms });
        }

        let tables = lookup("TILLSYNC_TABLES").and_then(|raw| {
            let names: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            (!names.is_empty()).then_some(names)
        });

        Ok(Self {
            realtime_enabled,
            data_dir,
            backoff: Backoff::new(base_ms, max_ms),
            tables,
        })
    }

    /// Builder-style method to enable or disable realtime.
    pub fn with_realtime(mut self, enabled: bool) -> Self {
        self.realtime_enabled = enabled;
        self
    }

    /// Builder-style method to set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Builder-style method to set the backoff policy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Builder-style method to restrict the watched tables.
    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = Some(tables.into_iter().map(Into::into).collect());
        self
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_millis<F>(lookup: &F, var: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a boolean, got '{value}'")]
    InvalidBool { var: &'static str, value: String },

    #[error("{var} must be a number of milliseconds, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },

    #[error("TILLSYNC_RECONNECT_BASE_MS must be greater than zero")]
    ZeroBackoff,

    #[error("TILLSYNC_RECONNECT_MAX_MS ({max_ms}) is below TILLSYNC_RECONNECT_BASE_MS ({base_ms})")]
    BackoffRange { base_ms: u64, max_ms: u64 },

    #[error("unknown tables in TILLSYNC_TABLES: {0:?}")]
    UnknownTables(Vec<String>),
}
