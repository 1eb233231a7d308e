//! Configuration for parley.
//!
//! Loaded from TOML; every section has defaults so an empty file is valid.
//!
//! ```toml
//! allow_unsafe_caching = false
//!
//! [host]
//! include_exception_detail_in_faults = false
//! require_no_persist_guard = true
//! scope_name = "parley"
//!
//! [factory_cache]
//! idle_timeout = 120000
//! lease_timeout = "infinite"
//! max_items_in_cache = 16
//!
//! [channel_cache]
//! idle_timeout = 120000
//! lease_timeout = 600000
//! max_items_in_cache = 16
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use crate::cache_settings::ChannelCacheSettings;
use crate::error::{ConfigError, Result};
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// Behavior switches the host applies to every messaging activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Attach fault detail to faults sent back to callers
    pub include_exception_detail_in_faults: bool,
    /// Refuse to hold transport contexts when no no-persist guard is available
    pub require_no_persist_guard: bool,
    /// Scope name used when deriving instance keys
    pub scope_name: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            include_exception_detail_in_faults: false,
            require_no_persist_guard: true,
            scope_name: "parley".to_string(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    /// Share cached factories even for endpoints whose settings are not cache-safe
    pub allow_unsafe_caching: bool,
    pub host: HostSettings,
    pub factory_cache: ChannelCacheSettings,
    pub channel_cache: ChannelCacheSettings,
    pub logging: LogConfig,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            allow_unsafe_caching: false,
            host: HostSettings::default(),
            factory_cache: ChannelCacheSettings::factory_defaults(),
            channel_cache: ChannelCacheSettings::channel_defaults(),
            logging: LogConfig::default(),
        }
    }
}

impl ParleyConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Load from a file when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.factory_cache
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("factory_cache: {e}")))?;
        self.channel_cache
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("channel_cache: {e}")))?;
        if self.host.scope_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "host.scope_name must not be empty".to_string(),
            ));
        }
        self.logging
            .level()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(())
    }
}
