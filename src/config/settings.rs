//! TOML-based configuration for Augur.
//!
//! Reads an augur.toml config file; the `ALLOWED_SCHEMAS` environment
//! variable overrides the policy allow-list at runtime.
//!
//! Example configuration:
//! ```toml
//! [model]
//! dir = "./model"
//!
//! [policy]
//! allowed_schemas = ["analytics", "crm", "main"]
//!
//! [guard]
//! statement_timeout_secs = 20
//! max_attempts = 3
//!
//! [agent]
//! max_steps = 100
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Semantic model location.
    pub model: ModelSettings,

    /// Execution policy.
    pub policy: PolicySettings,

    /// Execution guard tunables.
    pub guard: GuardSettings,

    /// Agent loop tunables.
    pub agent: AgentSettings,
}

/// Semantic model settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Directory of entity descriptors (one JSON file per entity).
    pub dir: PathBuf,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./model"),
        }
    }
}

/// Execution policy settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Schemas that generated SQL may read from.
    pub allowed_schemas: Vec<String>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            allowed_schemas: vec![
                "analytics".to_string(),
                "crm".to_string(),
                "main".to_string(),
            ],
        }
    }
}

impl PolicySettings {
    /// Effective allow-list, honoring the `ALLOWED_SCHEMAS` environment
    /// variable (comma-separated) when set.
    pub fn effective_schemas(&self) -> Vec<String> {
        if let Ok(raw) = env::var("ALLOWED_SCHEMAS") {
            let parsed: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                return parsed;
            }
        }
        self.allowed_schemas
            .iter()
            .map(|s| s.to_lowercase())
            .collect()
    }
}

/// Execution guard settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardSettings {
    /// Per-statement timeout in seconds.
    pub statement_timeout_secs: u64,

    /// Timeout for EXPLAIN calls in seconds.
    pub explain_timeout_secs: u64,

    /// Maximum execution attempts per statement (hard cap 5).
    pub max_attempts: u32,

    /// Consecutive failures before the circuit breaker opens.
    pub breaker_threshold: u32,

    /// Breaker cool-down in seconds once open.
    pub breaker_cooldown_secs: u64,

    /// Maximum entries in the result cache.
    pub cache_capacity: usize,

    /// Result cache entry lifetime in seconds.
    pub cache_ttl_secs: u64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            statement_timeout_secs: 20,
            explain_timeout_secs: 10,
            max_attempts: 3,
            breaker_threshold: 3,
            breaker_cooldown_secs: 60,
            cache_capacity: 100,
            cache_ttl_secs: 300,
        }
    }
}

impl GuardSettings {
    /// Statement timeout as a `Duration`.
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }

    /// Explain timeout as a `Duration`.
    pub fn explain_timeout(&self) -> Duration {
        Duration::from_secs(self.explain_timeout_secs)
    }

    /// Breaker cool-down as a `Duration`.
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }

    /// Cache entry lifetime as a `Duration`.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Attempts clamped to the hard cap.
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.clamp(1, 5)
    }
}

/// Agent loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Hard step ceiling for the tool loop.
    pub max_steps: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self { max_steps: 100 }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `AUGUR_CONFIG`
    /// 2. `./augur.toml`
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("AUGUR_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("augur.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        Ok(Settings::default())
    }
}
