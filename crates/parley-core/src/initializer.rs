//! Correlation initializers attached to messaging activities.

use crate::error::{CorrelationError, ValidationCode, ValidationIssue};
use crate::handle::{CorrelationHandle, CorrelationKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Named expression the host evaluates against message content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageQuery {
    pub name: String,
    pub expression: String,
}

impl MessageQuery {
    #[must_use]
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
        }
    }
}

/// Ordered set of message queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySet {
    queries: Vec<MessageQuery>,
}

impl QuerySet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.queries.push(MessageQuery::new(name, expression));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageQuery> {
        self.queries.iter()
    }
}

impl FromIterator<MessageQuery> for QuerySet {
    fn from_iter<I: IntoIterator<Item = MessageQuery>>(iter: I) -> Self {
        Self {
            queries: iter.into_iter().collect(),
        }
    }
}

/// How an activity initializes correlation, optionally bound to a handle
#[derive(Debug, Clone)]
pub enum CorrelationInitializer {
    RequestReply {
        handle: Option<Arc<CorrelationHandle>>,
    },
    Callback {
        handle: Option<Arc<CorrelationHandle>>,
    },
    Context {
        handle: Option<Arc<CorrelationHandle>>,
    },
    Query {
        handle: Option<Arc<CorrelationHandle>>,
        queries: QuerySet,
    },
}

impl CorrelationInitializer {
    #[must_use]
    pub fn request_reply(handle: Option<Arc<CorrelationHandle>>) -> Self {
        Self::RequestReply { handle }
    }

    #[must_use]
    pub fn callback(handle: Option<Arc<CorrelationHandle>>) -> Self {
        Self::Callback { handle }
    }

    #[must_use]
    pub fn context(handle: Option<Arc<CorrelationHandle>>) -> Self {
        Self::Context { handle }
    }

    #[must_use]
    pub fn query(queries: QuerySet, handle: Option<Arc<CorrelationHandle>>) -> Self {
        Self::Query { handle, queries }
    }

    #[must_use]
    pub fn kind(&self) -> CorrelationKind {
        match self {
            Self::RequestReply { .. } => CorrelationKind::RequestReply,
            Self::Callback { .. } => CorrelationKind::Callback,
            Self::Context { .. } => CorrelationKind::Context,
            Self::Query { .. } => CorrelationKind::Query,
        }
    }

    #[must_use]
    pub fn handle(&self) -> Option<&Arc<CorrelationHandle>> {
        match self {
            Self::RequestReply { handle }
            | Self::Callback { handle }
            | Self::Context { handle }
            | Self::Query { handle, .. } => handle.as_ref(),
        }
    }

    #[must_use]
    pub fn query_set(&self) -> Option<&QuerySet> {
        match self {
            Self::Query { queries, .. } => Some(queries),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_query(&self) -> bool {
        matches!(self, Self::Query { .. })
    }
}

/// Handle of the first initializer of `kind`.
///
/// Later initializers of the same kind are ignored, even when the first one
/// has no handle.
#[must_use]
pub fn find_handle(
    initializers: &[CorrelationInitializer],
    kind: CorrelationKind,
) -> Option<Arc<CorrelationHandle>> {
    initializers
        .iter()
        .find(|init| init.kind() == kind)
        .and_then(|init| init.handle().cloned())
}

#[must_use]
pub fn request_reply_handle(initializers: &[CorrelationInitializer]) -> Option<Arc<CorrelationHandle>> {
    find_handle(initializers, CorrelationKind::RequestReply)
}

#[must_use]
pub fn callback_handle(initializers: &[CorrelationInitializer]) -> Option<Arc<CorrelationHandle>> {
    find_handle(initializers, CorrelationKind::Callback)
}

#[must_use]
pub fn context_handle(initializers: &[CorrelationInitializer]) -> Option<Arc<CorrelationHandle>> {
    find_handle(initializers, CorrelationKind::Context)
}

/// Handle of the first `kind` initializer, claimed for that kind.
///
/// A handle already serving a different kind is a conflict.
pub fn claim_handle(
    initializers: &[CorrelationInitializer],
    kind: CorrelationKind,
) -> Result<Option<Arc<CorrelationHandle>>, CorrelationError> {
    let Some(handle) = find_handle(initializers, kind) else {
        return Ok(None);
    };
    handle.claim_kind(kind)?;
    Ok(Some(handle))
}

/// Definition problems in an initializer list, all of them.
#[must_use]
pub fn validate_initializers(initializers: &[CorrelationInitializer]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut ambient_queries = 0usize;

    for (index, init) in initializers.iter().enumerate() {
        if let CorrelationInitializer::Query { handle, queries } = init {
            if queries.is_empty() {
                issues.push(ValidationIssue::new(
                    ValidationCode::EmptyQuerySet,
                    format!("query initializer #{index} has an empty query set"),
                ));
            }
            if handle.is_none() {
                ambient_queries += 1;
            }
        }
    }

    if ambient_queries > 1 {
        issues.push(ValidationIssue::new(
            ValidationCode::MultipleAmbientQueries,
            format!(
                "{ambient_queries} query initializers have no handle; at most one may use the ambient handle"
            ),
        ));
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queries() -> QuerySet {
        QuerySet::new().with("customer", "sm:body()/Order/CustomerId")
    }

    #[test]
    fn first_match_wins_per_kind() {
        let first = CorrelationHandle::shared();
        let second = CorrelationHandle::shared();
        let inits = vec![
            CorrelationInitializer::query(queries(), None),
            CorrelationInitializer::request_reply(Some(Arc::clone(&first))),
            CorrelationInitializer::request_reply(Some(second)),
        ];
        let found = request_reply_handle(&inits).unwrap();
        assert!(Arc::ptr_eq(&found, &first));
        assert!(callback_handle(&inits).is_none());
    }

    #[test]
    fn first_match_without_handle_shadows_later_ones() {
        let inits = vec![
            CorrelationInitializer::context(None),
            CorrelationInitializer::context(Some(CorrelationHandle::shared())),
        ];
        assert!(context_handle(&inits).is_none());
    }

    #[test]
    fn claimed_handle_keeps_its_kind() {
        let handle = CorrelationHandle::shared();
        let inits = vec![
            CorrelationInitializer::callback(Some(Arc::clone(&handle))),
            CorrelationInitializer::context(Some(Arc::clone(&handle))),
        ];
        let claimed = claim_handle(&inits, CorrelationKind::Callback).unwrap().unwrap();
        assert!(Arc::ptr_eq(&claimed, &handle));
        assert_eq!(handle.kind(), Some(CorrelationKind::Callback));
        assert!(claim_handle(&inits, CorrelationKind::Callback).is_ok());

        let err = claim_handle(&inits, CorrelationKind::Context).unwrap_err();
        assert!(matches!(err, CorrelationError::Conflict { .. }));
        assert_eq!(handle.kind(), Some(CorrelationKind::Callback));
        assert!(claim_handle(&inits, CorrelationKind::Query).unwrap().is_none());
    }

    #[test]
    fn kinds_and_payloads() {
        let init = CorrelationInitializer::query(queries(), None);
        assert_eq!(init.kind(), CorrelationKind::Query);
        assert!(init.is_query());
        assert_eq!(init.query_set().unwrap().len(), 1);
        assert!(CorrelationInitializer::callback(None).query_set().is_none());
    }

    #[test]
    fn validation_reports_every_problem() {
        let inits = vec![
            CorrelationInitializer::query(QuerySet::new(), None),
            CorrelationInitializer::query(queries(), None),
            CorrelationInitializer::query(QuerySet::new(), Some(CorrelationHandle::shared())),
        ];
        let issues = validate_initializers(&inits);
        let codes: Vec<ValidationCode> = issues.iter().map(|i| i.code).collect();
        assert_eq!(
            codes,
            vec![
                ValidationCode::EmptyQuerySet,
                ValidationCode::EmptyQuerySet,
                ValidationCode::MultipleAmbientQueries,
            ]
        );
    }

    #[test]
    fn single_ambient_query_is_valid() {
        let inits = vec![
            CorrelationInitializer::query(queries(), None),
            CorrelationInitializer::query(queries(), Some(CorrelationHandle::shared())),
            CorrelationInitializer::request_reply(None),
        ];
        assert!(validate_initializers(&inits).is_empty());
    }

    #[test]
    fn query_set_from_iterator() {
        let set: QuerySet = vec![MessageQuery::new("a", "x"), MessageQuery::new("b", "y")]
            .into_iter()
            .collect();
        assert_eq!(set.iter().map(|q| q.name.as_str()).collect::<Vec<_>>(), ["a", "b"]);
    }
}
