//! Correlation initialization: writing computed keys into handles.
//!
//! The primary key goes to the explicit (select) handle, else the ambient
//! handle, else the context's default bookmark scope. Auxiliary keys are
//! paired positionally with Query initializers, skipping initializers of
//! other kinds. An initializer without a handle borrows the ambient handle,
//! which can serve at most one binding per call. Pairing stops when either
//! list runs out.

use crate::context::ExecutionContext;
use crate::error::CorrelationError;
use crate::handle::{CorrelationHandle, CorrelationKind, HandleId};
use crate::host::CalculatedKeys;
use crate::initializer::CorrelationInitializer;
use crate::instance_key::InstanceKey;
use serde::Serialize;
use std::sync::Arc;

/// Where the primary key went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "target", content = "handle")]
pub enum PrimaryBinding {
    Select(HandleId),
    Ambient(HandleId),
    DefaultScope,
    /// The primary key was invalid
    Skipped,
}

/// One auxiliary key paired with a Query initializer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuxiliaryBinding {
    pub key_index: usize,
    pub initializer_index: usize,
    /// None when the key was invalid and nothing was bound
    pub handle: Option<HandleId>,
    pub via_ambient: bool,
}

/// Record of what one initialization pass bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrelationOutcome {
    pub primary: PrimaryBinding,
    pub auxiliary: Vec<AuxiliaryBinding>,
    pub ambient_consumed: bool,
}

/// Bind `primary` and `additional` keys to handles.
///
/// Errors stop the pass; bindings made before the error stay in place.
pub fn initialize_correlation_handles(
    ctx: &ExecutionContext,
    select: Option<&Arc<CorrelationHandle>>,
    ambient: Option<&Arc<CorrelationHandle>>,
    initializers: &[CorrelationInitializer],
    primary: &InstanceKey,
    additional: &[InstanceKey],
) -> Result<CorrelationOutcome, CorrelationError> {
    let mut ambient_consumed = false;

    let primary_binding = if primary.is_valid() {
        if let Some(handle) = select {
            handle.initialize_bookmark_scope(ctx, primary)?;
            PrimaryBinding::Select(handle.id())
        } else if let Some(handle) = ambient {
            handle.initialize_bookmark_scope(ctx, primary)?;
            ambient_consumed = true;
            tracing::debug!(handle = %handle.id(), key = %primary, "primary key bound to ambient handle");
            PrimaryBinding::Ambient(handle.id())
        } else {
            ctx.default_scope().initialize(primary.value())?;
            PrimaryBinding::DefaultScope
        }
    } else {
        PrimaryBinding::Skipped
    };

    let mut auxiliary = Vec::with_capacity(additional.len());
    let mut queries = initializers
        .iter()
        .enumerate()
        .filter(|(_, init)| init.is_query());

    for (key_index, key) in additional.iter().enumerate() {
        let Some((initializer_index, init)) = queries.next() else {
            break;
        };

        let (target, via_ambient) = match init.handle() {
            Some(handle) => {
                handle.claim_kind(CorrelationKind::Query)?;
                (handle, false)
            }
            None => match ambient {
                Some(handle) if !ambient_consumed => {
                    ambient_consumed = true;
                    (handle, true)
                }
                _ => {
                    tracing::warn!(key = %key, initializer_index, "no handle available for query key");
                    return Err(CorrelationError::Ambiguous {
                        key: key.to_string(),
                    });
                }
            },
        };

        let handle = if key.is_valid() {
            target.initialize_bookmark_scope(ctx, key)?;
            Some(target.id())
        } else {
            None
        };

        auxiliary.push(AuxiliaryBinding {
            key_index,
            initializer_index,
            handle,
            via_ambient,
        });
    }

    if auxiliary.len() < additional.len() {
        tracing::debug!(
            unmatched = additional.len() - auxiliary.len(),
            "keys without a query initializer dropped"
        );
    }

    Ok(CorrelationOutcome {
        primary: primary_binding,
        auxiliary,
        ambient_consumed,
    })
}

/// Same as [`initialize_correlation_handles`], with the ambient handle
/// taken from the context.
pub fn initialize_from_keys(
    ctx: &ExecutionContext,
    select: Option<&Arc<CorrelationHandle>>,
    initializers: &[CorrelationInitializer],
    keys: &CalculatedKeys,
) -> Result<CorrelationOutcome, CorrelationError> {
    initialize_correlation_handles(
        ctx,
        select,
        ctx.ambient(),
        initializers,
        &keys.primary_or_invalid(),
        &keys.additional,
    )
}
