//! parley-core: message correlation for suspendable workflows
//!
//! This crate decides which suspended conversation an inbound or outbound
//! message belongs to, hands replies between threads, and caches outbound
//! channel factories and channels. Transport, dispatch and persistence stay
//! with the host.
//!
//! # Architecture
//!
//! ```text
//! Send / Receive ──▶ KeyCalculator ──▶ correlation ──▶ CorrelationHandle
//!       │                                                   │
//!       ▼                                                   ▼
//! SendChannelCache ──▶ ObjectCache            request / response rendezvous
//! ```
//!
//! # Modules
//!
//! - `instance_key`: Instance keys and their metadata
//! - `bookmark`: Bookmark scopes and bookmarks
//! - `no_persist`: No-persist guard and scoped zones
//! - `context`: Execution context passed to every operation
//! - `handle`: Correlation handle state machine
//! - `initializer`: Correlation initializers and message queries
//! - `correlation`: Binding computed keys to handles
//! - `rendezvous`: Request/reply hand-off and the send-completion race
//! - `object_cache`: Leased object cache with idle and lease expiry
//! - `cache_settings`: Cache limits and timeouts
//! - `channel_cache`: Factory and channel caching for sends
//! - `host`: Host extension and key calculator seams
//! - `binding`: Handle bindings and the handle environment
//! - `operation`: Operation descriptions and message formatting
//! - `send`: Send and send-reply operations
//! - `receive`: Receive and receive-reply operations
//! - `instancing`: Metadata for the durable persistence layer
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod binding;
pub mod bookmark;
pub mod cache_settings;
pub mod channel_cache;
pub mod config;
pub mod context;
pub mod correlation;
pub mod error;
pub mod handle;
pub mod host;
pub mod initializer;
pub mod instance_key;
pub mod instancing;
pub mod logging;
pub mod no_persist;
pub mod object_cache;
pub mod operation;
pub mod receive;
pub mod rendezvous;
pub mod send;

pub use context::ExecutionContext;
pub use error::{CacheError, CorrelationError, Error, Result, ValidationError};
pub use handle::CorrelationHandle;
pub use instance_key::InstanceKey;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
