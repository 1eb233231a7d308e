//! Correlation handles.
//!
//! A [`CorrelationHandle`] ties one conversation to an instance key and a
//! bookmark scope, and parks at most one request context and one response
//! context while an in-process exchange is in flight. Handles are shared as
//! `Arc<CorrelationHandle>`; identity is pointer identity.

use crate::bookmark::BookmarkScope;
use crate::context::ExecutionContext;
use crate::error::CorrelationError;
use crate::host::SendReceiveExtension;
use crate::instance_key::InstanceKey;
use crate::no_persist::NoPersistZone;
use crate::rendezvous::{CorrelationRequestContext, CorrelationResponseContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle id, used for logging and snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(u64);

impl HandleId {
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// What a handle was created to correlate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationKind {
    RequestReply,
    Query,
    Callback,
    Context,
}

impl fmt::Display for CorrelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RequestReply => "request_reply",
            Self::Query => "query",
            Self::Callback => "callback",
            Self::Context => "context",
        };
        f.write_str(name)
    }
}

/// Address and context a peer should use to call this instance back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackContext {
    pub listen_address: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

/// Protocol-level context exchanged with a peer (instance id plus headers)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextCorrelation {
    pub instance_id: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Held<T> {
    context: Arc<T>,
    _zone: Option<NoPersistZone>,
}

#[derive(Debug, Default)]
struct HandleState {
    instance_key: Option<InstanceKey>,
    transient_instance_key: Option<InstanceKey>,
    scope: Option<BookmarkScope>,
    request: Option<Held<CorrelationRequestContext>>,
    response: Option<Held<CorrelationResponseContext>>,
    callback_context: Option<CallbackContext>,
    context: Option<ContextCorrelation>,
    kind: Option<CorrelationKind>,
}

/// Serializable view of a handle's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleSnapshot {
    pub id: HandleId,
    pub kind: Option<CorrelationKind>,
    pub instance_key: Option<Uuid>,
    pub transient_instance_key: Option<Uuid>,
    pub scope_id: Option<Uuid>,
    pub has_scope: bool,
    pub pending_request: bool,
    pub pending_response: bool,
    pub initialized: bool,
}

/// Per-conversation correlation state
pub struct CorrelationHandle {
    id: HandleId,
    state: Mutex<HandleState>,
}

impl CorrelationHandle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)),
            state: Mutex::new(HandleState::default()),
        }
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Shared handle already claimed for `kind`.
    #[must_use]
    pub fn with_kind(kind: CorrelationKind) -> Arc<Self> {
        let handle = Self::new();
        handle.lock().kind = Some(kind);
        Arc::new(handle)
    }

    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn instance_key(&self) -> Option<InstanceKey> {
        self.lock().instance_key.clone()
    }

    #[must_use]
    pub fn transient_instance_key(&self) -> Option<InstanceKey> {
        self.lock().transient_instance_key.clone()
    }

    pub fn set_transient_instance_key(&self, key: InstanceKey) {
        tracing::debug!(handle = %self.id, key = %key, "transient instance key set");
        self.lock().transient_instance_key = Some(key);
    }

    #[must_use]
    pub fn scope(&self) -> Option<BookmarkScope> {
        self.lock().scope.clone()
    }

    /// Use `scope` for this handle's bookmarks.
    pub fn set_scope(&self, scope: BookmarkScope) {
        self.lock().scope = Some(scope);
    }

    #[must_use]
    pub fn kind(&self) -> Option<CorrelationKind> {
        self.lock().kind
    }

    /// Record the kind this handle serves; a different kind is a conflict.
    pub fn claim_kind(&self, kind: CorrelationKind) -> Result<(), CorrelationError> {
        let mut state = self.lock();
        match state.kind {
            Some(existing) if existing != kind => Err(CorrelationError::Conflict {
                existing: format!("{} ({existing})", self.id),
                offered: format!("{} ({kind})", self.id),
            }),
            _ => {
                state.kind = Some(kind);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn callback_context(&self) -> Option<CallbackContext> {
        self.lock().callback_context.clone()
    }

    pub fn set_callback_context(&self, callback: CallbackContext) {
        self.lock().callback_context = Some(callback);
    }

    #[must_use]
    pub fn context_correlation(&self) -> Option<ContextCorrelation> {
        self.lock().context.clone()
    }

    pub fn set_context_correlation(&self, context: ContextCorrelation) {
        self.lock().context = Some(context);
    }

    /// True while the handle carries any live correlation state.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        let state = self.lock();
        state.scope.is_some()
            || state.callback_context.is_some()
            || state.context.is_some()
            || state.request.is_some()
            || state.response.is_some()
            || state.instance_key.as_ref().is_some_and(InstanceKey::is_valid)
    }

    // -------------------------------------------------------------------------
    // Bookmark scope
    // -------------------------------------------------------------------------

    /// The handle's scope, defaulting to the context's default scope.
    pub fn ensure_bookmark_scope(&self, ctx: &ExecutionContext) -> BookmarkScope {
        let mut state = self.lock();
        state
            .scope
            .get_or_insert_with(|| ctx.default_scope().clone())
            .clone()
    }

    /// Bind `key` to this handle.
    ///
    /// Under a durable host the key itself is stored; otherwise the handle's
    /// bookmark scope (created on demand) is initialized with the key value.
    /// Either way a previously bound different identity is a conflict and
    /// leaves the handle unchanged.
    pub fn initialize_bookmark_scope(
        &self,
        ctx: &ExecutionContext,
        key: &InstanceKey,
    ) -> Result<(), CorrelationError> {
        if !key.is_valid() {
            return Err(CorrelationError::InvalidInstanceKey);
        }

        let mut state = self.lock();
        if let Some(existing) = &state.instance_key {
            if existing.value() != key.value() {
                tracing::warn!(handle = %self.id, existing = %existing, offered = %key, "instance key conflict");
                return Err(CorrelationError::Conflict {
                    existing: existing.to_string(),
                    offered: key.to_string(),
                });
            }
        }

        if ctx.is_durable() {
            if let Some(scope_id) = state.scope.as_ref().and_then(BookmarkScope::id) {
                if scope_id != key.value() {
                    return Err(CorrelationError::Conflict {
                        existing: scope_id.to_string(),
                        offered: key.to_string(),
                    });
                }
            }
        } else {
            state
                .scope
                .get_or_insert_with(BookmarkScope::new)
                .initialize(key.value())?;
        }

        if state.instance_key.is_none() {
            tracing::debug!(handle = %self.id, key = %key, durable = ctx.is_durable(), "handle bound");
            state.instance_key = Some(key.clone());
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Request / response slots
    // -------------------------------------------------------------------------

    fn guard_unavailable(ctx: &ExecutionContext) -> bool {
        ctx.no_persist_guard().is_none() && ctx.settings().require_no_persist_guard
    }

    fn enter_zone(ctx: &ExecutionContext) -> Option<NoPersistZone> {
        ctx.no_persist_guard().map(|guard| guard.zone())
    }

    /// Park `request` on this handle.
    ///
    /// Returns false when no no-persist guard is available, or when a
    /// different request is already parked. Re-registering the same request
    /// is a no-op.
    pub fn try_register_request_context(
        &self,
        ctx: &ExecutionContext,
        request: &Arc<CorrelationRequestContext>,
    ) -> bool {
        if Self::guard_unavailable(ctx) {
            return false;
        }
        let mut state = self.lock();
        match &state.request {
            Some(held) => Arc::ptr_eq(&held.context, request),
            None => {
                state.request = Some(Held {
                    context: Arc::clone(request),
                    _zone: Self::enter_zone(ctx),
                });
                tracing::trace!(handle = %self.id, "request context registered");
                true
            }
        }
    }

    /// Park `response` on this handle. Same rules as requests.
    pub fn try_register_response_context(
        &self,
        ctx: &ExecutionContext,
        response: &Arc<CorrelationResponseContext>,
    ) -> bool {
        if Self::guard_unavailable(ctx) {
            return false;
        }
        let mut state = self.lock();
        match &state.response {
            Some(held) => Arc::ptr_eq(&held.context, response),
            None => {
                state.response = Some(Held {
                    context: Arc::clone(response),
                    _zone: Self::enter_zone(ctx),
                });
                tracing::trace!(handle = %self.id, "response context registered");
                true
            }
        }
    }

    /// Take the parked request, releasing its no-persist zone.
    pub fn try_acquire_request_context(&self) -> Option<Arc<CorrelationRequestContext>> {
        let held = self.lock().request.take()?;
        Some(Arc::clone(&held.context))
    }

    /// Take `request` back off the handle if it is still the one parked.
    pub fn release_request_context(&self, request: &Arc<CorrelationRequestContext>) -> bool {
        let mut state = self.lock();
        if state
            .request
            .as_ref()
            .is_some_and(|held| Arc::ptr_eq(&held.context, request))
        {
            state.request = None;
            true
        } else {
            false
        }
    }

    /// Take the parked response, releasing its no-persist zone.
    pub fn try_acquire_response_context(&self) -> Option<Arc<CorrelationResponseContext>> {
        let held = self.lock().response.take()?;
        Some(Arc::clone(&held.context))
    }

    #[must_use]
    pub fn has_pending_request(&self) -> bool {
        self.lock().request.is_some()
    }

    #[must_use]
    pub fn has_pending_response(&self) -> bool {
        self.lock().response.is_some()
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Clear the handle and tell the host to drop a durable key.
    ///
    /// Does nothing when the handle carries no live state. Parked contexts
    /// are dropped, which releases their no-persist zones.
    pub fn uninitialize(&self, ext: &dyn SendReceiveExtension) {
        if !self.is_initialized() {
            return;
        }
        let cleared = std::mem::take(&mut *self.lock());
        if let Some(key) = cleared.instance_key.as_ref().filter(|k| k.is_valid()) {
            tracing::debug!(handle = %self.id, key = %key, "uninitializing correlation");
            ext.on_uninitialize_correlation(key);
        }
        let mut state = self.lock();
        state.kind = cleared.kind;
    }

    #[must_use]
    pub fn snapshot(&self) -> HandleSnapshot {
        let initialized = self.is_initialized();
        let state = self.lock();
        HandleSnapshot {
            id: self.id,
            kind: state.kind,
            instance_key: state.instance_key.as_ref().map(InstanceKey::value),
            transient_instance_key: state.transient_instance_key.as_ref().map(InstanceKey::value),
            scope_id: state.scope.as_ref().and_then(BookmarkScope::id),
            has_scope: state.scope.is_some(),
            pending_request: state.request.is_some(),
            pending_response: state.response.is_some(),
            initialized,
        }
    }
}

impl Default for CorrelationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CorrelationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CorrelationHandle")
            .field("id", &self.id)
            .field("kind", &state.kind)
            .field("instance_key", &state.instance_key)
            .field("scope", &state.scope)
            .field("pending_request", &state.request.is_some())
            .field("pending_response", &state.response.is_some())
            .finish()
    }
}
