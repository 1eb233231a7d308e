//! Receive operations.
//!
//! [`ReceiveMessage`] is the server side: it registers a bookmark with the
//! host, correlates the message that resumes it, and parks the inbound
//! response context for the paired send-reply. [`ReceiveReply`] is the
//! client side: it waits on the request context a two-way send parked.

use crate::binding::HandleBinding;
use crate::bookmark::Bookmark;
use crate::context::ExecutionContext;
use crate::correlation::{CorrelationOutcome, initialize_correlation_handles};
use crate::error::{
    CorrelationError, Error, Result, ValidationCode, ValidationError, ValidationIssue,
};
use crate::handle::{CorrelationHandle, CorrelationKind};
use crate::host::{CorrelationKeyCalculator, Message, ReceiveSettings, SendReceiveExtension};
use crate::initializer::{
    CorrelationInitializer, claim_handle, request_reply_handle, validate_initializers,
};
use crate::operation::{OperationDescription, default_formatter};
use crate::rendezvous::{CorrelationRequestContext, CorrelationResponseContext, ReplyOutcome};
use std::sync::Arc;

/// Message delivered to a registered receive
#[derive(Debug)]
pub struct InboundMessage {
    pub message: Message,
    /// Present for two-way operations; the dispatcher waits on it
    pub response: Option<Arc<CorrelationResponseContext>>,
}

impl InboundMessage {
    #[must_use]
    pub fn one_way(message: Message) -> Self {
        Self {
            message,
            response: None,
        }
    }

    #[must_use]
    pub fn two_way(message: Message, response: Arc<CorrelationResponseContext>) -> Self {
        Self {
            message,
            response: Some(response),
        }
    }
}

/// Result of correlating an inbound message
#[derive(Debug)]
pub struct ReceivedMessage {
    pub message: Message,
    pub correlation: CorrelationOutcome,
    /// Handle the response context was parked on
    pub response_handle: Option<Arc<CorrelationHandle>>,
}

// =============================================================================
// ReceiveMessage
// =============================================================================

/// Inbound messaging activity
#[derive(Debug, Clone)]
pub struct ReceiveMessage {
    operation: OperationDescription,
    correlates_with: Option<HandleBinding>,
    initializers: Vec<CorrelationInitializer>,
    can_create_instance: bool,
}

impl ReceiveMessage {
    #[must_use]
    pub fn new(operation: OperationDescription) -> Self {
        Self {
            operation,
            correlates_with: None,
            initializers: Vec::new(),
            can_create_instance: false,
        }
    }

    #[must_use]
    pub fn correlates_with(mut self, binding: HandleBinding) -> Self {
        self.correlates_with = Some(binding);
        self
    }

    #[must_use]
    pub fn with_initializer(mut self, initializer: CorrelationInitializer) -> Self {
        self.initializers.push(initializer);
        self
    }

    #[must_use]
    pub fn can_create_instance(mut self, can_create: bool) -> Self {
        self.can_create_instance = can_create;
        self
    }

    #[must_use]
    pub fn operation(&self) -> &OperationDescription {
        &self.operation
    }

    #[must_use]
    pub fn initializers(&self) -> &[CorrelationInitializer] {
        &self.initializers
    }

    /// Binding for the send-reply that answers this receive.
    ///
    /// Names the handle [`ReceiveMessage::on_message`] parks the response
    /// on: the RequestReply initializer's handle. None means the ambient
    /// handle.
    #[must_use]
    pub fn reply_binding(&self) -> Option<HandleBinding> {
        request_reply_handle(&self.initializers).map(HandleBinding::literal)
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut issues = Vec::new();
        if self.operation.name.trim().is_empty() {
            issues.push(ValidationIssue::new(
                ValidationCode::MissingOperationName,
                "receive has no operation name",
            ));
        }
        issues.extend(validate_initializers(&self.initializers));
        if self.operation.is_one_way && request_reply_handle(&self.initializers).is_some() {
            issues.push(ValidationIssue::new(
                ValidationCode::RequestReplyOnOneWay,
                format!(
                    "one-way receive '{}' has a request-reply initializer",
                    self.operation.name
                ),
            ));
        }
        ValidationError::check(issues)
    }

    fn resolve_correlates_with(&self, ctx: &ExecutionContext) -> Option<Arc<CorrelationHandle>> {
        self.correlates_with
            .as_ref()
            .and_then(|binding| binding.resolve(ctx.variables()))
    }

    #[must_use]
    pub fn receive_settings(&self, ctx: &ExecutionContext) -> ReceiveSettings {
        ReceiveSettings {
            operation_name: self.operation.name.clone(),
            action: self.operation.resolved_action(),
            can_create_instance: self.can_create_instance,
            scope_name: ctx.settings().scope_name.clone(),
        }
    }

    /// Suspend on a bookmark the host resumes when a matching message
    /// arrives.
    ///
    /// The bookmark lives in the correlates-with handle's scope, else the
    /// ambient handle's, else the context's default scope.
    pub fn register(&self, ctx: &ExecutionContext, ext: &dyn SendReceiveExtension) -> Result<Bookmark> {
        let span = crate::parley_span!("receive", operation = self.operation.name.as_str());
        let _enter = span.enter();

        let handle = self
            .resolve_correlates_with(ctx)
            .or_else(|| ctx.ambient().cloned());
        let scope = match &handle {
            Some(handle) => handle.ensure_bookmark_scope(ctx),
            None => ctx.default_scope().clone(),
        };
        let bookmark = Bookmark::in_scope(self.operation.resolved_action(), &scope);

        ext.register_receive(&self.receive_settings(ctx), handle.as_ref(), &bookmark)?;
        tracing::debug!(bookmark = %bookmark, scope = %scope, "receive registered");
        Ok(bookmark)
    }

    /// Correlate a message the host delivered to this receive.
    ///
    /// The computed primary key goes to the correlates-with handle when one
    /// is set. A two-way message parks its response context on the
    /// RequestReply initializer's handle, else the ambient handle; when the
    /// context cannot be parked the response is abandoned.
    pub fn on_message(
        &self,
        ctx: &ExecutionContext,
        inbound: InboundMessage,
        calculator: &dyn CorrelationKeyCalculator,
    ) -> Result<ReceivedMessage> {
        let span = crate::parley_span!("on_message", operation = self.operation.name.as_str());
        let _enter = span.enter();

        let InboundMessage { message, response } = inbound;
        match self.correlate(ctx, &message, response.as_ref(), calculator) {
            Ok((correlation, response_handle)) => Ok(ReceivedMessage {
                message,
                correlation,
                response_handle,
            }),
            Err(err) => {
                if let Some(response) = &response {
                    response.abandon();
                }
                tracing::warn!(error = %err, "inbound message not correlated");
                Err(err)
            }
        }
    }

    fn correlate(
        &self,
        ctx: &ExecutionContext,
        message: &Message,
        response: Option<&Arc<CorrelationResponseContext>>,
        calculator: &dyn CorrelationKeyCalculator,
    ) -> Result<(CorrelationOutcome, Option<Arc<CorrelationHandle>>)> {
        let keys = calculator.calculate(message)?;
        let correlation = initialize_correlation_handles(
            ctx,
            self.resolve_correlates_with(ctx).as_ref(),
            ctx.ambient(),
            &self.initializers,
            &keys.primary_or_invalid(),
            &keys.additional,
        )?;

        let Some(response) = response else {
            return Ok((correlation, None));
        };
        let handle = claim_handle(&self.initializers, CorrelationKind::RequestReply)?
            .or_else(|| ctx.ambient().cloned())
            .ok_or_else(|| CorrelationError::MissingRequestReplyPairing {
                operation: self.operation.name.clone(),
            })?;
        if !handle.try_register_response_context(ctx, response) {
            return Err(CorrelationError::UnsupportedMode(format!(
                "handle {} cannot hold the response for '{}'",
                handle.id(),
                self.operation.name
            ))
            .into());
        }
        Ok((correlation, Some(handle)))
    }
}

// =============================================================================
// ReceiveReply
// =============================================================================

/// A request taken off its handle; cancelled on drop unless settled
struct AwaitedRequest {
    request: Arc<CorrelationRequestContext>,
    settled: bool,
}

impl Drop for AwaitedRequest {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(request = %self.request.id(), "reply wait dropped");
            self.request.cancel();
        }
    }
}

/// Client-side wait for the reply to a two-way send
#[derive(Debug, Clone)]
pub struct ReceiveReply {
    operation: OperationDescription,
    correlates_with: Option<HandleBinding>,
    initializers: Vec<CorrelationInitializer>,
}

impl ReceiveReply {
    #[must_use]
    pub fn new(operation: OperationDescription) -> Self {
        Self {
            operation,
            correlates_with: None,
            initializers: Vec::new(),
        }
    }

    #[must_use]
    pub fn correlates_with(mut self, binding: HandleBinding) -> Self {
        self.correlates_with = Some(binding);
        self
    }

    #[must_use]
    pub fn with_initializer(mut self, initializer: CorrelationInitializer) -> Self {
        self.initializers.push(initializer);
        self
    }

    fn request_handle(&self, ctx: &ExecutionContext) -> Option<Arc<CorrelationHandle>> {
        request_reply_handle(&self.initializers)
            .or_else(|| {
                self.correlates_with
                    .as_ref()
                    .and_then(|binding| binding.resolve(ctx.variables()))
            })
            .or_else(|| ctx.ambient().cloned())
    }

    /// Wait for the reply message.
    ///
    /// A cancelled request, or one whose reply another consumer already
    /// took, surfaces as [`Error::Cancelled`]; a fault as [`Error::Fault`].
    /// Dropping the future before it resolves cancels the request.
    pub async fn receive(&self, ctx: &ExecutionContext) -> Result<Message> {
        let request = self
            .request_handle(ctx)
            .and_then(|handle| handle.try_acquire_request_context())
            .ok_or_else(|| {
                CorrelationError::InvalidSendState(format!(
                    "no request is waiting for reply '{}'",
                    self.operation.name
                ))
            })?;
        let mut awaited = AwaitedRequest {
            request,
            settled: false,
        };
        let outcome = awaited.request.wait_for_reply_async().await;
        awaited.settled = true;

        match outcome {
            Ok(ReplyOutcome::Reply(reply)) => Ok(reply),
            Ok(ReplyOutcome::Cancelled) => Err(Error::Cancelled(format!(
                "request '{}' was cancelled",
                self.operation.name
            ))),
            Ok(ReplyOutcome::Consumed) => Err(Error::Cancelled(format!(
                "reply to '{}' was already consumed",
                self.operation.name
            ))),
            Err(fault) => Err(Error::Fault(fault)),
        }
    }

    /// Wait for the reply and unpack its body.
    pub async fn receive_value(&self, ctx: &ExecutionContext) -> Result<serde_json::Value> {
        let reply = self.receive(ctx).await?;
        default_formatter(&self.operation).deserialize_reply(&reply)
    }
}
