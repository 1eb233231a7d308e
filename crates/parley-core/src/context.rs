//! Execution context handed to every correlation operation.
//!
//! Carries what the enclosing workflow runtime provides: the instance id,
//! the default bookmark scope, the ambient correlation handle, the
//! no-persist guard and whether a durable host extension is present.

use crate::binding::HandleEnvironment;
use crate::bookmark::BookmarkScope;
use crate::config::HostSettings;
use crate::handle::CorrelationHandle;
use crate::no_persist::NoPersistGuard;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    instance_id: Uuid,
    default_scope: BookmarkScope,
    ambient: Option<Arc<CorrelationHandle>>,
    no_persist: Option<Arc<NoPersistGuard>>,
    durable: bool,
    settings: HostSettings,
    variables: HandleEnvironment,
}

impl ExecutionContext {
    /// Context for a non-durable host with a fresh default scope and no-persist guard.
    #[must_use]
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            default_scope: BookmarkScope::default_scope(),
            ambient: None,
            no_persist: Some(NoPersistGuard::shared()),
            durable: false,
            settings: HostSettings::default(),
            variables: HandleEnvironment::new(),
        }
    }

    #[must_use]
    pub fn with_ambient(mut self, handle: Arc<CorrelationHandle>) -> Self {
        self.ambient = Some(handle);
        self
    }

    #[must_use]
    pub fn with_no_persist_guard(mut self, guard: Option<Arc<NoPersistGuard>>) -> Self {
        self.no_persist = guard;
        self
    }

    #[must_use]
    pub fn with_durable_host(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: HostSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_variables(mut self, variables: HandleEnvironment) -> Self {
        self.variables = variables;
        self
    }

    /// Same instance, scope and guard, with a different ambient handle.
    #[must_use]
    pub fn nested(&self, ambient: Option<Arc<CorrelationHandle>>) -> Self {
        let mut child = self.clone();
        child.ambient = ambient;
        child
    }

    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    #[must_use]
    pub fn default_scope(&self) -> &BookmarkScope {
        &self.default_scope
    }

    #[must_use]
    pub fn ambient(&self) -> Option<&Arc<CorrelationHandle>> {
        self.ambient.as_ref()
    }

    #[must_use]
    pub fn no_persist_guard(&self) -> Option<&Arc<NoPersistGuard>> {
        self.no_persist.as_ref()
    }

    /// True when a durable instance store extension is installed.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    #[must_use]
    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    #[must_use]
    pub fn variables(&self) -> &HandleEnvironment {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut HandleEnvironment {
        &mut self.variables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_context_shares_scope_and_guard() {
        let ctx = ExecutionContext::new(Uuid::new_v4());
        let ambient = CorrelationHandle::shared();
        let child = ctx.nested(Some(Arc::clone(&ambient)));

        assert_eq!(child.default_scope(), ctx.default_scope());
        assert!(Arc::ptr_eq(
            child.no_persist_guard().unwrap(),
            ctx.no_persist_guard().unwrap()
        ));
        assert!(ctx.ambient().is_none());
        assert!(Arc::ptr_eq(child.ambient().unwrap(), &ambient));
        assert_eq!(child.instance_id(), ctx.instance_id());
    }

    #[test]
    fn defaults_are_in_memory_host() {
        let ctx = ExecutionContext::new(Uuid::new_v4());
        assert!(!ctx.is_durable());
        assert!(ctx.no_persist_guard().is_some());
        assert!(ctx.default_scope().is_default());
        assert!(ctx.settings().require_no_persist_guard);
    }
}
