//! Bookmarks and bookmark scopes.
//!
//! A [`BookmarkScope`] is a shared, mutable namespace that is bound to an
//! instance identifier at most once. Clones share the same scope; equality
//! is identity, not id.

use crate::error::CorrelationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

static NEXT_SCOPE_TOKEN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct ScopeInner {
    token: u64,
    is_default: bool,
    id: Mutex<Option<Uuid>>,
}

/// Namespace for bookmarks, bound to one instance id on first initialization
#[derive(Debug, Clone)]
pub struct BookmarkScope {
    inner: Arc<ScopeInner>,
}

impl BookmarkScope {
    /// New uninitialized scope.
    #[must_use]
    pub fn new() -> Self {
        Self::build(false, None)
    }

    /// The per-instance default scope.
    #[must_use]
    pub fn default_scope() -> Self {
        Self::build(true, None)
    }

    /// Scope already bound to `id`.
    #[must_use]
    pub fn with_id(id: Uuid) -> Self {
        Self::build(false, Some(id))
    }

    fn build(is_default: bool, id: Option<Uuid>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token: NEXT_SCOPE_TOKEN.fetch_add(1, Ordering::Relaxed),
                is_default,
                id: Mutex::new(id),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<Uuid> {
        *self.inner.id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.id().is_some()
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.inner.is_default
    }

    /// Bind the scope to `id`.
    ///
    /// Re-initializing with the same id is a no-op; a different id is a
    /// conflict.
    pub fn initialize(&self, id: Uuid) -> Result<(), CorrelationError> {
        if id.is_nil() {
            return Err(CorrelationError::InvalidInstanceKey);
        }
        let mut guard = self.inner.id.lock().unwrap_or_else(PoisonError::into_inner);
        match *guard {
            Some(existing) if existing == id => Ok(()),
            Some(existing) => Err(CorrelationError::Conflict {
                existing: existing.to_string(),
                offered: id.to_string(),
            }),
            None => {
                *guard = Some(id);
                tracing::trace!(scope = self.inner.token, %id, "bookmark scope initialized");
                Ok(())
            }
        }
    }

    /// True when both values refer to the same scope.
    #[must_use]
    pub fn same_scope(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Serializable snapshot of the scope.
    #[must_use]
    pub fn info(&self) -> BookmarkScopeInfo {
        BookmarkScopeInfo {
            id: self.id(),
            is_default: self.inner.is_default,
        }
    }
}

impl Default for BookmarkScope {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for BookmarkScope {
    fn eq(&self, other: &Self) -> bool {
        self.same_scope(other)
    }
}

impl Eq for BookmarkScope {}

impl fmt::Display for BookmarkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.id(), self.inner.is_default) {
            (Some(id), _) => write!(f, "scope:{id}"),
            (None, true) => write!(f, "scope:default"),
            (None, false) => write!(f, "scope:#{}", self.inner.token),
        }
    }
}

/// Point-in-time view of a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkScopeInfo {
    pub id: Option<Uuid>,
    pub is_default: bool,
}

/// Named resumption point that a host resumes when a message or completion arrives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bookmark {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope_id: Option<Uuid>,
}

impl Bookmark {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope_id: None,
        }
    }

    /// Bookmark resolved inside `scope`. An uninitialized scope leaves the
    /// bookmark unscoped.
    #[must_use]
    pub fn in_scope(name: impl Into<String>, scope: &BookmarkScope) -> Self {
        Self {
            name: name.into(),
            scope_id: scope.id(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn scope_id(&self) -> Option<Uuid> {
        self.scope_id
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope_id {
            Some(id) => write!(f, "{}@{id}", self.name),
            None => f.write_str(&self.name),
        }
    }
}
