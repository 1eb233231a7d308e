//! No-persist guard: a nesting counter that forbids persisting the workflow
//! instance while any live transport context is held by a correlation handle.
//!
//! Handles take a [`NoPersistZone`] when they store a request or response
//! context and drop it when the context is acquired, so the depth always
//! returns to its prior level on every exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Nesting counter shared by everything that may block persistence
#[derive(Debug, Default)]
pub struct NoPersistGuard {
    depth: AtomicUsize,
}

impl NoPersistGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared guard, the form handles hold.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn enter(&self) {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(depth, "no-persist zone entered");
    }

    pub fn exit(&self) {
        let result = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1));
        match result {
            Ok(prev) => tracing::trace!(depth = prev - 1, "no-persist zone exited"),
            Err(_) => tracing::warn!("no-persist guard exit without matching enter"),
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// True while persistence is blocked.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }

    /// Enter the guard and return a zone that exits it on drop.
    #[must_use]
    pub fn zone(self: &Arc<Self>) -> NoPersistZone {
        self.enter();
        NoPersistZone {
            guard: Arc::clone(self),
        }
    }
}

/// RAII entry into a [`NoPersistGuard`]
#[derive(Debug)]
pub struct NoPersistZone {
    guard: Arc<NoPersistGuard>,
}

impl NoPersistZone {
    #[must_use]
    pub fn guard(&self) -> &Arc<NoPersistGuard> {
        &self.guard
    }
}

impl Drop for NoPersistZone {
    fn drop(&mut self) {
        self.guard.exit();
    }
}
