//! Structured logging for parley
//!
//! Uses `tracing` with a pretty or JSON formatter on stderr. Hosts that install their own subscriber can skip [`init_logging`];
//! the library only emits events.
//!
//! # Correlation Fields
//!
//! Use these field names consistently in spans and events:
//! - `instance_id`: Workflow instance identifier
//! - `operation`: Operation name of the messaging activity
//! - `handle`: Correlation handle id
//! - `key`: Instance key value
//! - `cache`: Object cache name
//!
//! # Usage
//!
//! ```ignore
//! use parley_core::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::default())?;
//! let span = parley_core::parley_span!("send", operation = "SubmitOrder");
//! let _guard = span.enter();
//! ```
//!
//! Message bodies are never logged; only identifiers and operation names.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// trace, debug, info, warn or error; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    /// The configured level, parsed.
    pub fn level(&self) -> Result<Level, LogError> {
        self.level
            .parse()
            .map_err(|_| LogError::InvalidLevel(self.level.clone()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level '{0}', expected trace, debug, info, warn or error")]
    InvalidLevel(String),

    #[error("failed to install subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global subscriber, writing to stderr.
///
/// Later calls return [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if is_logging_initialized() {
        return Err(LogError::AlreadyInitialized);
    }
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level()?).into())
        .from_env_lossy();

    let output = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    };
    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()?;

    let _ = LOGGING_INITIALIZED.set(());
    tracing::info!(level = %config.level, format = %config.format, "logging initialized");
    Ok(())
}

#[must_use]
pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.get().is_some()
}

/// Create a span carrying parley's correlation fields
///
/// ```ignore
/// let span = parley_core::parley_span!("receive", operation = "SubmitOrder", handle = 7);
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! parley_span {
    ($name:expr $(, $field:ident = $value:expr)* $(,)?) => {
        tracing::info_span!($name $(, $field = $value)*)
    };
}
