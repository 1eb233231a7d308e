//! Handle bindings: how an activity names the correlation handle it uses.
//!
//! A binding is an expression over the enclosing variable environment.
//! A reply activity gets a structural copy of its request's binding so both
//! resolve the same handle without sharing expression nodes.

use crate::handle::CorrelationHandle;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Expression resolving to a correlation handle
#[derive(Debug, Clone)]
pub enum HandleBinding {
    /// Named variable
    Variable(String),
    /// A handle supplied directly
    Literal(Arc<CorrelationHandle>),
    /// Member of a composite variable, e.g. `order.reply`
    Member {
        target: Box<HandleBinding>,
        member: String,
    },
}

impl HandleBinding {
    #[must_use]
    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable(name.into())
    }

    #[must_use]
    pub fn literal(handle: Arc<CorrelationHandle>) -> Self {
        Self::Literal(handle)
    }

    #[must_use]
    pub fn member(self, member: impl Into<String>) -> Self {
        Self::Member {
            target: Box::new(self),
            member: member.into(),
        }
    }

    /// Dotted path of the expression.
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::Variable(name) => name.clone(),
            Self::Literal(handle) => handle.id().to_string(),
            Self::Member { target, member } => format!("{}.{member}", target.path()),
        }
    }

    /// Independent copy of the expression tree. Literals keep pointing at
    /// the same handle.
    #[must_use]
    pub fn structural_clone(&self) -> Self {
        match self {
            Self::Variable(name) => Self::Variable(name.clone()),
            Self::Literal(handle) => Self::Literal(Arc::clone(handle)),
            Self::Member { target, member } => Self::Member {
                target: Box::new(target.structural_clone()),
                member: member.clone(),
            },
        }
    }

    #[must_use]
    pub fn resolve(&self, env: &HandleEnvironment) -> Option<Arc<CorrelationHandle>> {
        match self {
            Self::Literal(handle) => Some(Arc::clone(handle)),
            _ => env.get(&self.path()),
        }
    }
}

impl PartialEq for HandleBinding {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Variable(a), Self::Variable(b)) => a == b,
            (Self::Literal(a), Self::Literal(b)) => Arc::ptr_eq(a, b),
            (
                Self::Member {
                    target: a,
                    member: m,
                },
                Self::Member {
                    target: b,
                    member: n,
                },
            ) => m == n && a == b,
            _ => false,
        }
    }
}

impl Eq for HandleBinding {}

impl From<Arc<CorrelationHandle>> for HandleBinding {
    fn from(handle: Arc<CorrelationHandle>) -> Self {
        Self::Literal(handle)
    }
}

impl fmt::Display for HandleBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Variables visible to an activity, keyed by dotted path
#[derive(Debug, Default, Clone)]
pub struct HandleEnvironment {
    handles: HashMap<String, Arc<CorrelationHandle>>,
}

impl HandleEnvironment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `path` to `handle`, replacing any previous binding.
    pub fn declare(&mut self, path: impl Into<String>, handle: Arc<CorrelationHandle>) {
        self.handles.insert(path.into(), handle);
    }

    /// Bind `path` to a fresh handle and return it.
    pub fn declare_new(&mut self, path: impl Into<String>) -> Arc<CorrelationHandle> {
        let handle = CorrelationHandle::shared();
        self.declare(path, Arc::clone(&handle));
        handle
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<Arc<CorrelationHandle>> {
        self.handles.get(path).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
