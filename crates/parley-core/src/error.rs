//! Error types for parley-core

use std::fmt::{self, Write};
use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for parley-core
#[derive(Error, Debug)]
pub enum Error {
    /// Correlation protocol errors
    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    /// Object and channel cache errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Activity definition validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A fault delivered in place of a reply
    #[error("Remote fault: {0}")]
    Fault(#[from] ReplyFault),

    /// Operation was cancelled before it completed
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Correlation(err) => Some(err.remediation()),
            Self::Cache(err) => Some(err.remediation()),
            Self::Validation(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Fault(_) => Some(
                Remediation::new("The remote side faulted the request; inspect the fault detail.")
                    .alternative("Enable include_exception_detail_in_faults for richer faults."),
            ),
            Self::Cancelled(_) => Some(
                Remediation::new(
                    "Operation was cancelled. Retry if the cancellation was unexpected.",
                )
                .alternative("Check whether the owning activity was cancelled."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the config path exists and is readable."),
            ),
        }
    }
}

// =============================================================================
// Correlation errors
// =============================================================================

/// Errors raised by correlation handles and the initialization algorithm
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// A handle or scope is already bound to a different instance key
    #[error("Correlation already bound to {existing}; cannot rebind to {offered}")]
    Conflict { existing: String, offered: String },

    /// A query key had neither an explicit handle nor an unconsumed ambient handle
    #[error("Ambiguous correlation: no explicit or ambient handle available for query key {key}")]
    Ambiguous { key: String },

    /// A handle was asked to do something its state does not support
    #[error("Unsupported correlation mode: {0}")]
    UnsupportedMode(String),

    /// An instance key with a nil value was offered for binding
    #[error("Instance key is not valid")]
    InvalidInstanceKey,

    /// `correlates_with` was supplied but is not yet initialized
    #[error("Operation '{operation}' correlates with an uninitialized handle")]
    UninitializedCorrelatesWith { operation: String },

    /// A one-way send found a request-reply handle
    #[error("Request-reply handle used on one-way operation '{operation}'")]
    RequestReplyOnOneWay { operation: String },

    /// A two-way send or a send-reply has no handle to pair with
    #[error("Operation '{operation}' has no request-reply handle to pair with")]
    MissingRequestReplyPairing { operation: String },

    /// A send completion arrived that does not fit the send's state
    #[error("Invalid send state: {0}")]
    InvalidSendState(String),

    /// The reply message version is unavailable under a durable host
    #[error("Reply message version unavailable for operation '{operation}'")]
    MissingReplyVersion { operation: String },
}

impl CorrelationError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Conflict { .. } => Remediation::new(
                "A correlation handle was reused for a different conversation.",
            )
            .alternative("Use a fresh handle per conversation.")
            .alternative("Check that correlation queries yield the same key for every message."),
            Self::Ambiguous { .. } => Remediation::new(
                "Bind an explicit handle to each query initializer.",
            )
            .alternative("Only one query initializer per activity may rely on the ambient handle."),
            Self::UnsupportedMode(_) => Remediation::new(
                "Attach a no-persist guard to the execution context or disable require_no_persist_guard.",
            ),
            Self::InvalidInstanceKey => Remediation::new(
                "Correlation queries produced an empty key; verify the message carries the queried values.",
            ),
            Self::UninitializedCorrelatesWith { operation } => Remediation::new(format!(
                "Initialize the handle used by '{operation}' before sending on it."
            ))
            .alternative("Remove correlates_with to fall back to the ambient handle."),
            Self::RequestReplyOnOneWay { operation } => Remediation::new(format!(
                "Remove the request-reply initializer from one-way operation '{operation}'."
            )),
            Self::MissingRequestReplyPairing { operation } => Remediation::new(format!(
                "Add a request-reply initializer or an ambient handle for '{operation}'."
            )),
            Self::InvalidSendState(_) => Remediation::new(
                "The send completed in a state the activity did not expect; check host wiring.",
            ),
            Self::MissingReplyVersion { operation } => Remediation::new(format!(
                "The response context for '{operation}' lost its message version; the durable host must supply it."
            )),
        }
    }
}

// =============================================================================
// Cache errors
// =============================================================================

/// Errors raised by the leased object cache and the channel cache
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Settings were changed after the cache served its first request
    #[error("Cache settings are locked after first use")]
    SettingsLocked,

    /// The cache was disposed
    #[error("Cache '{0}' has been disposed")]
    Disposed(String),

    /// Every cached entry is referenced and the cache is full
    #[error("Cache is full ({capacity} entries, all referenced)")]
    CapacityExhausted { capacity: usize },

    /// A setting value is out of range
    #[error("Invalid cache setting {name}: {value}")]
    InvalidSetting { name: String, value: String },

    /// The constructor for a cache miss failed
    #[error("Failed to construct cached resource: {0}")]
    Construction(String),
}

impl CacheError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::SettingsLocked => Remediation::new(
                "Apply cache settings before the first get_or_create call.",
            ),
            Self::Disposed(_) => Remediation::new(
                "The cache was disposed; create a new cache for further work.",
            ),
            Self::CapacityExhausted { capacity } => Remediation::new(format!(
                "All {capacity} cached entries are in use; release leases sooner."
            ))
            .alternative("Raise max_items_in_cache."),
            Self::InvalidSetting { name, .. } => Remediation::new(format!(
                "Use a value for {name} between 0 and {} ms, or \"infinite\".",
                i32::MAX
            )),
            Self::Construction(_) => Remediation::new(
                "The resource factory failed; inspect the endpoint configuration.",
            ),
        }
    }
}

// =============================================================================
// Validation errors
// =============================================================================

/// Category of a definition problem found during validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    /// The activity has no operation name
    MissingOperationName,
    /// A query initializer carries no queries
    EmptyQuerySet,
    /// More than one query initializer lacks an explicit handle
    MultipleAmbientQueries,
    /// A one-way send carries a request-reply initializer
    RequestReplyOnOneWay,
    /// A send-reply has no request to pair with
    MissingRequest,
    /// A client send has no endpoint to target
    MissingEndpoint,
}

/// A single definition problem
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValidationIssue {
    pub code: ValidationCode,
    pub message: String,
}

impl ValidationIssue {
    #[must_use]
    pub fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// All problems found while validating a definition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.issues.iter().map(|i| i.message.as_str()).collect();
        write!(f, "{} issue(s): {}", self.issues.len(), messages.join("; "))
    }
}

impl ValidationError {
    /// Wrap issues; returns `Ok` when there are none.
    pub fn check(issues: Vec<ValidationIssue>) -> std::result::Result<(), Self> {
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Self { issues })
        }
    }

    #[must_use]
    pub fn has(&self, code: ValidationCode) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        let mut remediation =
            Remediation::new("Fix the activity definition before running it.");
        for issue in &self.issues {
            remediation = remediation.alternative(issue.message.clone());
        }
        remediation
    }
}

// =============================================================================
// Faults
// =============================================================================

/// Fault carried by a rendezvous in place of a reply
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[error("{message}")]
pub struct ReplyFault {
    pub message: String,
    /// Extra detail, present only when exception detail is allowed in faults
    pub detail: Option<String>,
}

impl ReplyFault {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// =============================================================================
// Config errors
// =============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .alternative("Run without a config file to use defaults."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Check that {path} is readable by the current user."
            )),
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax and retry.")
                .alternative("Compare against the defaults from ParleyConfig::default()."),
            Self::SerializeFailed(_) => {
                Remediation::new("Config could not be serialized; report this as a bug.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Correct the reported value in the config file.")
            }
        }
    }
}
