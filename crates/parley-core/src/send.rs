//! Send operation.
//!
//! A [`SendMessage`] goes out one of three ways:
//!
//! - through the host's [`SendReceiveExtension`], resuming later with a
//!   [`SendCompletion`] ([`SendMessage::execute_with_extension`]);
//! - directly over a cached channel ([`SendMessage::send_via_cache`]),
//!   parking a request context on a handle for the reply;
//! - as the reply to a received request, through the response context the
//!   receive parked ([`SendMessage::send_reply_via_context`]).

use crate::binding::HandleBinding;
use crate::bookmark::Bookmark;
use crate::channel_cache::{
    ChannelFactory, ChannelLease, EndpointIdentity, FactoryCacheKey, FactoryLease,
    LastUsedFactory, SendChannelCache,
};
use crate::context::ExecutionContext;
use crate::correlation::{CorrelationOutcome, initialize_correlation_handles};
use crate::error::{
    CorrelationError, ReplyFault, Result, ValidationCode, ValidationError, ValidationIssue,
};
use crate::handle::{CorrelationHandle, CorrelationKind};
use crate::host::{
    CorrelationKeyCalculator, CorrelationMessageProperty, Message, SendReceiveExtension,
    SendSettings,
};
use crate::initializer::{
    CorrelationInitializer, claim_handle, request_reply_handle, validate_initializers,
};
use crate::instance_key::InstanceKey;
use crate::operation::{MessageFormatter, OperationDescription, default_formatter};
use crate::receive::ReceiveMessage;
use crate::rendezvous::{CorrelationRequestContext, CorrelationResponseContext};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// How the host resumed a send-complete bookmark
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendCompletion {
    /// Sent; nothing to correlate
    Sent,
    /// Sent, with keys computed from the outgoing message
    Correlated(CorrelationMessageProperty),
    /// The send failed
    Fault(ReplyFault),
}

/// A send handed to the host and waiting for its completion bookmark
#[derive(Debug, PartialEq, Eq)]
pub struct PendingSend {
    bookmark: Bookmark,
    operation: String,
}

impl PendingSend {
    #[must_use]
    pub fn bookmark(&self) -> &Bookmark {
        &self.bookmark
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }
}

/// A request parked on a handle; taken back and cancelled on drop unless kept
struct RequestRegistration {
    handle: Arc<CorrelationHandle>,
    request: Arc<CorrelationRequestContext>,
    armed: bool,
}

impl RequestRegistration {
    fn keep(mut self) -> Arc<CorrelationHandle> {
        self.armed = false;
        Arc::clone(&self.handle)
    }
}

impl Drop for RequestRegistration {
    fn drop(&mut self) {
        if self.armed {
            self.handle.release_request_context(&self.request);
            self.request.cancel();
        }
    }
}

/// A request sent over a cached channel
///
/// Holds the channel and factory leases until dropped.
#[derive(Debug)]
pub struct ClientSend {
    request: Option<Arc<CorrelationRequestContext>>,
    handle: Option<Arc<CorrelationHandle>>,
    correlation: Option<CorrelationOutcome>,
    channel: ChannelLease,
    factory: FactoryLease,
}

impl ClientSend {
    /// None for one-way sends.
    #[must_use]
    pub fn request_context(&self) -> Option<&Arc<CorrelationRequestContext>> {
        self.request.as_ref()
    }

    /// Handle the request context is parked on.
    #[must_use]
    pub fn handle(&self) -> Option<&Arc<CorrelationHandle>> {
        self.handle.as_ref()
    }

    #[must_use]
    pub fn correlation(&self) -> Option<&CorrelationOutcome> {
        self.correlation.as_ref()
    }

    #[must_use]
    pub fn is_factory_shared(&self) -> bool {
        self.factory.is_shared()
    }

    #[must_use]
    pub fn channel(&self) -> &ChannelLease {
        &self.channel
    }

    /// Abandon the exchange: cancel the request and take it back off its
    /// handle if nobody has picked it up yet.
    pub fn cancel(self) {
        if let (Some(request), Some(handle)) = (&self.request, &self.handle) {
            handle.release_request_context(request);
            request.cancel();
        }
    }
}

/// Outbound messaging activity
#[derive(Debug)]
pub struct SendMessage {
    operation: OperationDescription,
    is_send_reply: bool,
    correlates_with: Option<HandleBinding>,
    initializers: Vec<CorrelationInitializer>,
    endpoint: Option<EndpointIdentity>,
    request_paired: bool,
    last_used: Mutex<LastUsedFactory>,
}

impl SendMessage {
    /// Client-side send of `operation`.
    #[must_use]
    pub fn request(operation: OperationDescription) -> Self {
        Self {
            operation,
            is_send_reply: false,
            correlates_with: None,
            initializers: Vec::new(),
            endpoint: None,
            request_paired: false,
            last_used: Mutex::new(LastUsedFactory::new()),
        }
    }

    /// Reply to the request received through `request`.
    #[must_use]
    pub fn reply(operation: OperationDescription, request: HandleBinding) -> Self {
        Self {
            is_send_reply: true,
            correlates_with: Some(request),
            request_paired: true,
            ..Self::request(operation)
        }
    }

    /// Reply to `receive`, answering through the handle it parks its
    /// response on; the ambient handle when it names none.
    #[must_use]
    pub fn reply_to(receive: &ReceiveMessage) -> Self {
        Self {
            is_send_reply: true,
            correlates_with: receive.reply_binding(),
            request_paired: true,
            ..Self::request(receive.operation().clone())
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
    pub fn with_endpoint(mut self, endpoint: EndpointIdentity) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    #[must_use]
    pub fn operation(&self) -> &OperationDescription {
        &self.operation
    }

    #[must_use]
    pub fn operation_name(&self) -> &str {
        &self.operation.name
    }

    #[must_use]
    pub fn is_one_way(&self) -> bool {
        self.operation.is_one_way
    }

    #[must_use]
    pub fn is_send_reply(&self) -> bool {
        self.is_send_reply
    }

    #[must_use]
    pub fn initializers(&self) -> &[CorrelationInitializer] {
        &self.initializers
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&EndpointIdentity> {
        self.endpoint.as_ref()
    }

    #[must_use]
    pub fn formatter(&self) -> MessageFormatter {
        default_formatter(&self.operation)
    }

    /// Every definition problem, reported together.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut issues = Vec::new();
        if self.operation.name.trim().is_empty() {
            issues.push(ValidationIssue::new(
                ValidationCode::MissingOperationName,
                "send has no operation name",
            ));
        }
        issues.extend(validate_initializers(&self.initializers));
        if self.operation.is_one_way && request_reply_handle(&self.initializers).is_some() {
            issues.push(ValidationIssue::new(
                ValidationCode::RequestReplyOnOneWay,
                format!(
                    "one-way send '{}' has a request-reply initializer",
                    self.operation.name
                ),
            ));
        }
        if self.is_send_reply && !self.request_paired {
            issues.push(ValidationIssue::new(
                ValidationCode::MissingRequest,
                format!("send-reply '{}' is not paired with a receive", self.operation.name),
            ));
        }
        ValidationError::check(issues)
    }

    fn resolve_correlates_with(&self, ctx: &ExecutionContext) -> Option<Arc<CorrelationHandle>> {
        self.correlates_with
            .as_ref()
            .and_then(|binding| binding.resolve(ctx.variables()))
    }

    fn uninitialized(&self) -> CorrelationError {
        CorrelationError::UninitializedCorrelatesWith {
            operation: self.operation.name.clone(),
        }
    }

    fn check_pairing(&self, ctx: &ExecutionContext) -> std::result::Result<(), CorrelationError> {
        let request_reply = request_reply_handle(&self.initializers);
        if self.operation.is_one_way {
            if request_reply.is_some() {
                return Err(CorrelationError::RequestReplyOnOneWay {
                    operation: self.operation.name.clone(),
                });
            }
        } else if request_reply.is_none() && ctx.ambient().is_none() {
            return Err(CorrelationError::MissingRequestReplyPairing {
                operation: self.operation.name.clone(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn send_settings(&self, ctx: &ExecutionContext) -> SendSettings {
        SendSettings {
            operation_name: self.operation.name.clone(),
            action: self.operation.resolved_action(),
            is_one_way: self.operation.is_one_way,
            is_send_reply: self.is_send_reply,
            include_exception_detail_in_faults: ctx.settings().include_exception_detail_in_faults,
            endpoint_address: self.endpoint.as_ref().map(|e| e.address.clone()),
        }
    }

    // =========================================================================
    // Host extension path
    // =========================================================================

    /// Hand `message` to the host and return the pending completion.
    ///
    /// A two-way request gets a request/reply transient key added to its
    /// correlation property if it does not carry one.
    pub fn execute_with_extension(
        &self,
        ctx: &ExecutionContext,
        ext: &dyn SendReceiveExtension,
        mut message: Message,
    ) -> Result<PendingSend> {
        let span = crate::parley_span!("send", operation = self.operation.name.as_str());
        let _enter = span.enter();

        let explicit = self.resolve_correlates_with(ctx);
        if explicit.as_ref().is_some_and(|h| !h.is_initialized()) {
            return Err(self.uninitialized().into());
        }
        let correlates_with = explicit.or_else(|| ctx.ambient().cloned());

        if self.is_send_reply {
            if !correlates_with.as_ref().is_some_and(|h| h.is_initialized()) {
                return Err(self.uninitialized().into());
            }
        } else {
            self.check_pairing(ctx)?;
            if !self.operation.is_one_way {
                let key = message.ensure_request_reply_key();
                tracing::trace!(key = %key, "request/reply key attached");
            }
        }

        let bookmark = Bookmark::new(format!(
            "{}/send-complete/{}",
            self.operation.name,
            Uuid::new_v4()
        ));
        let settings = self.send_settings(ctx);
        ext.send(message, &settings, correlates_with.as_ref(), &bookmark)?;
        tracing::debug!(bookmark = %bookmark, "send handed to host");

        Ok(PendingSend {
            bookmark,
            operation: self.operation.name.clone(),
        })
    }

    /// Finish a send the host resumed through `resumed`.
    ///
    /// Keys in a correlated completion are bound with the Context
    /// initializer's handle as select handle for a reply, the Callback
    /// initializer's for a request.
    pub fn on_send_complete(
        &self,
        ctx: &ExecutionContext,
        pending: PendingSend,
        resumed: &Bookmark,
        completion: SendCompletion,
    ) -> Result<Option<CorrelationOutcome>> {
        if resumed != &pending.bookmark {
            return Err(CorrelationError::InvalidSendState(format!(
                "bookmark {resumed} resumed for send waiting on {}",
                pending.bookmark
            ))
            .into());
        }
        match completion {
            SendCompletion::Sent => Ok(None),
            SendCompletion::Fault(fault) => {
                tracing::warn!(operation = %self.operation.name, fault = %fault, "send faulted");
                Err(fault.into())
            }
            SendCompletion::Correlated(property) => {
                Ok(Some(self.correlate_completion(ctx, &property)?))
            }
        }
    }

    fn correlate_completion(
        &self,
        ctx: &ExecutionContext,
        property: &CorrelationMessageProperty,
    ) -> std::result::Result<CorrelationOutcome, CorrelationError> {
        let ambient = ctx.ambient();
        let select = if self.is_send_reply {
            claim_handle(&self.initializers, CorrelationKind::Context)?
        } else {
            claim_handle(&self.initializers, CorrelationKind::Callback)?
        };
        let primary = property
            .correlation_key
            .clone()
            .unwrap_or_else(InstanceKey::invalid);
        let outcome = initialize_correlation_handles(
            ctx,
            select.as_ref(),
            ambient,
            &self.initializers,
            &primary,
            &property.additional_keys,
        )?;

        if !self.is_send_reply {
            if let Some(key) = property.request_reply_key() {
                let target = claim_handle(&self.initializers, CorrelationKind::RequestReply)?
                    .or_else(|| ambient.cloned());
                if let Some(handle) = target {
                    handle.set_transient_instance_key(key.clone());
                }
            }
        }
        Ok(outcome)
    }

    /// Ask the host to abandon `pending`.
    pub fn cancel(&self, pending: PendingSend, ext: &dyn SendReceiveExtension) {
        tracing::debug!(operation = %self.operation.name, bookmark = %pending.bookmark, "send cancelled");
        ext.cancel(&pending.bookmark);
    }

    // =========================================================================
    // Cached channel path
    // =========================================================================

    /// Send `message` over a channel from `cache`.
    ///
    /// Keys from `calculator` are bound before the message leaves. A two-way
    /// send carries a request/reply transient key and parks a fresh request
    /// context on the RequestReply initializer's handle, else on the ambient
    /// handle; it is taken back if the send fails.
    pub fn send_via_cache(
        &self,
        ctx: &ExecutionContext,
        cache: &SendChannelCache,
        calculator: Option<&dyn CorrelationKeyCalculator>,
        mut message: Message,
        create_factory: impl FnOnce(&FactoryCacheKey) -> Result<Box<dyn ChannelFactory>>,
    ) -> Result<ClientSend> {
        let span = crate::parley_span!("send_via_cache", operation = self.operation.name.as_str());
        let _enter = span.enter();

        if self.is_send_reply {
            return Err(CorrelationError::InvalidSendState(format!(
                "send-reply '{}' answers through its response context",
                self.operation.name
            ))
            .into());
        }
        let endpoint = self.endpoint.as_ref().ok_or_else(|| ValidationError {
            issues: vec![ValidationIssue::new(
                ValidationCode::MissingEndpoint,
                format!("send '{}' has no endpoint", self.operation.name),
            )],
        })?;
        self.check_pairing(ctx)?;
        if !self.operation.is_one_way {
            let key = message.ensure_request_reply_key();
            tracing::trace!(key = %key, "request/reply key attached");
        }

        let key = FactoryCacheKey::new(
            endpoint,
            self.initializers
                .iter()
                .filter_map(CorrelationInitializer::query_set),
        );
        let factory = {
            let mut last_used = self.last_used.lock().unwrap_or_else(PoisonError::into_inner);
            cache.acquire_factory(endpoint, &key, &mut last_used, create_factory)?
        };
        let channel = factory.take_channel(&endpoint.address)?;

        let correlation = match calculator {
            Some(calculator) => {
                let keys = calculator.calculate(&message)?;
                let select = claim_handle(&self.initializers, CorrelationKind::Callback)?;
                Some(initialize_correlation_handles(
                    ctx,
                    select.as_ref(),
                    ctx.ambient(),
                    &self.initializers,
                    &keys.primary_or_invalid(),
                    &keys.additional,
                )?)
            }
            None => None,
        };

        let (request, registration) = if self.operation.is_one_way {
            (None, None)
        } else {
            let request = CorrelationRequestContext::shared(self.operation.name.clone());
            let target = claim_handle(&self.initializers, CorrelationKind::RequestReply)?
                .or_else(|| ctx.ambient().cloned())
                .ok_or_else(|| CorrelationError::MissingRequestReplyPairing {
                    operation: self.operation.name.clone(),
                })?;
            if !target.try_register_request_context(ctx, &request) {
                let err = if target.has_pending_request() {
                    CorrelationError::InvalidSendState(format!(
                        "handle {} already has a pending request",
                        target.id()
                    ))
                } else {
                    CorrelationError::UnsupportedMode(format!(
                        "operation '{}' needs a no-persist guard to park its request",
                        self.operation.name
                    ))
                };
                return Err(err.into());
            }
            let registration = RequestRegistration {
                handle: target,
                request: Arc::clone(&request),
                armed: true,
            };
            (Some(request), Some(registration))
        };

        channel.send(message)?;
        tracing::debug!(
            address = %endpoint.address,
            shared_factory = factory.is_shared(),
            two_way = request.is_some(),
            "request sent"
        );

        Ok(ClientSend {
            request,
            handle: registration.map(RequestRegistration::keep),
            correlation,
            channel,
            factory,
        })
    }

    // =========================================================================
    // Reply path
    // =========================================================================

    fn take_response(
        &self,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Arc<CorrelationResponseContext>, CorrelationError> {
        if !self.is_send_reply {
            return Err(CorrelationError::InvalidSendState(format!(
                "'{}' is not a send-reply",
                self.operation.name
            )));
        }
        let handle = self
            .resolve_correlates_with(ctx)
            .or_else(|| ctx.ambient().cloned())
            .ok_or_else(|| CorrelationError::MissingRequestReplyPairing {
                operation: self.operation.name.clone(),
            })?;
        handle.try_acquire_response_context().ok_or_else(|| {
            CorrelationError::InvalidSendState(format!(
                "no request is waiting for reply '{}'",
                self.operation.name
            ))
        })
    }

    /// Answer the request parked on the correlates-with handle.
    ///
    /// Keys from `calculator` are bound with the Context initializer's
    /// handle as select handle. Any failure after the response context is
    /// taken abandons it so the dispatcher is not left waiting.
    pub fn send_reply_via_context(
        &self,
        ctx: &ExecutionContext,
        calculator: Option<&dyn CorrelationKeyCalculator>,
        mut reply: Message,
    ) -> Result<Option<CorrelationOutcome>> {
        let response = self.take_response(ctx)?;
        match self.prepare_reply(ctx, calculator, &response, &mut reply) {
            Ok(outcome) => {
                response.send_reply(reply);
                tracing::debug!(operation = %self.operation.name, "reply sent");
                Ok(outcome)
            }
            Err(err) => {
                response.abandon();
                Err(err)
            }
        }
    }

    fn prepare_reply(
        &self,
        ctx: &ExecutionContext,
        calculator: Option<&dyn CorrelationKeyCalculator>,
        response: &CorrelationResponseContext,
        reply: &mut Message,
    ) -> Result<Option<CorrelationOutcome>> {
        reply.version = response.reply_version(ctx)?;
        let Some(calculator) = calculator else {
            return Ok(None);
        };
        let keys = calculator.calculate(reply)?;
        let select = claim_handle(&self.initializers, CorrelationKind::Context)?;
        let outcome = initialize_correlation_handles(
            ctx,
            select.as_ref(),
            ctx.ambient(),
            &self.initializers,
            &keys.primary_or_invalid(),
            &keys.additional,
        )?;
        Ok(Some(outcome))
    }

    /// Answer the parked request with a fault. The detail is kept only when
    /// the host allows exception detail in faults.
    pub fn send_fault_via_context(&self, ctx: &ExecutionContext, fault: ReplyFault) -> Result<()> {
        let response = self.take_response(ctx)?;
        let fault = if ctx.settings().include_exception_detail_in_faults {
            fault
        } else {
            ReplyFault {
                detail: None,
                ..fault
            }
        };
        response.send_fault(fault);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_settings::ChannelCacheSettings;
    use crate::channel_cache::tests_support::FakeFactory;
    use crate::config::HostSettings;
    use crate::host::CalculatedKeys;
    use crate::host::tests_support::{FixedKeys, RecordingExtension};
    use crate::initializer::QuerySet;
    use crate::no_persist::NoPersistGuard;
    use crate::rendezvous::ReplyOutcome;

    const ADDRESS: &str = "net.tcp://quotes.example/svc";

    fn op() -> OperationDescription {
        OperationDescription::new("GetQuote", "IQuotes")
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4())
    }

    fn cache() -> SendChannelCache {
        SendChannelCache::new(
            ChannelCacheSettings::factory_defaults(),
            ChannelCacheSettings::channel_defaults(),
            false,
        )
    }

    fn factory_fn(
        factory: &FakeFactory,
    ) -> impl FnOnce(&FactoryCacheKey) -> Result<Box<dyn ChannelFactory>> {
        let factory = factory.clone();
        move |_| Ok(Box::new(factory) as Box<dyn ChannelFactory>)
    }

    #[test]
    fn validation_collects_every_problem() {
        let send = SendMessage::request(OperationDescription::new(" ", "IQuotes").one_way())
            .with_initializer(CorrelationInitializer::query(QuerySet::new(), None))
            .with_initializer(CorrelationInitializer::query(QuerySet::new(), None))
            .with_initializer(CorrelationInitializer::request_reply(Some(
                CorrelationHandle::shared(),
            )));
        let err = send.validate().unwrap_err();
        assert!(err.has(ValidationCode::MissingOperationName));
        assert!(err.has(ValidationCode::EmptyQuerySet));
        assert!(err.has(ValidationCode::MultipleAmbientQueries));
        assert!(err.has(ValidationCode::RequestReplyOnOneWay));
        assert_eq!(err.issues.len(), 5);
    }

    #[test]
    fn send_reply_without_request_is_invalid() {
        let mut send = SendMessage::reply(op(), HandleBinding::variable("order"));
        assert!(send.validate().is_ok());
        send.request_paired = false;
        assert!(send.validate().unwrap_err().has(ValidationCode::MissingRequest));
    }

    #[test]
    fn two_way_send_needs_a_pairing_handle() {
        let ext = RecordingExtension::default();
        let err = SendMessage::request(op())
            .execute_with_extension(&ctx(), &ext, Message::new("q"))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Correlation(CorrelationError::MissingRequestReplyPairing { .. })
        ));
        assert_eq!(ext.send_count(), 0);
    }

    #[test]
    fn one_way_send_rejects_request_reply_handle() {
        let ext = RecordingExtension::default();
        let err = SendMessage::request(op().one_way())
            .with_initializer(CorrelationInitializer::request_reply(Some(CorrelationHandle::shared())))
            .execute_with_extension(&ctx(), &ext, Message::new("q"))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Correlation(CorrelationError::RequestReplyOnOneWay { .. })
        ));
    }

    #[test]
    fn uninitialized_correlates_with_is_rejected() {
        let ext = RecordingExtension::default();
        let mut ctx = ctx();
        ctx.variables_mut().declare_new("order");
        let err = SendMessage::request(op().one_way())
            .correlates_with(HandleBinding::variable("order"))
            .execute_with_extension(&ctx, &ext, Message::new("q"))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Correlation(CorrelationError::UninitializedCorrelatesWith { .. })
        ));
    }

    #[test]
    fn two_way_send_attaches_request_reply_key() {
        let ext = RecordingExtension::default();
        let ctx = ctx().with_ambient(CorrelationHandle::shared());
        let pending = SendMessage::request(op())
            .execute_with_extension(&ctx, &ext, Message::new("q"))
            .unwrap();

        let sends = ext.sends.lock().unwrap();
        let (message, settings, bookmark) = &sends[0];
        assert_eq!(bookmark, pending.bookmark());
        assert!(!settings.is_one_way);
        assert!(
            message
                .correlation
                .as_ref()
                .and_then(CorrelationMessageProperty::request_reply_key)
                .is_some()
        );
    }

    #[test]
    fn completion_binds_keys_and_transient_key() {
        let ext = RecordingExtension::default();
        let callback = CorrelationHandle::shared();
        let request_reply = CorrelationHandle::shared();
        let query = CorrelationHandle::shared();
        let send = SendMessage::request(op())
            .with_initializer(CorrelationInitializer::callback(Some(Arc::clone(&callback))))
            .with_initializer(CorrelationInitializer::request_reply(Some(Arc::clone(
                &request_reply,
            ))))
            .with_initializer(CorrelationInitializer::query(
                QuerySet::new().with("quote", "body/quoteId"),
                Some(Arc::clone(&query)),
            ));
        let ctx = ctx();
        let pending = send
            .execute_with_extension(&ctx, &ext, Message::new("q"))
            .unwrap();
        let resumed = pending.bookmark().clone();

        let primary = InstanceKey::generate();
        let aux = InstanceKey::generate();
        let transient = InstanceKey::request_reply(Uuid::new_v4());
        let property = CorrelationMessageProperty {
            correlation_key: Some(primary.clone()),
            additional_keys: vec![aux.clone()],
            transient_correlations: vec![transient.clone()],
        };

        let outcome = send
            .on_send_complete(&ctx, pending, &resumed, SendCompletion::Correlated(property))
            .unwrap()
            .unwrap();
        assert_eq!(outcome.auxiliary.len(), 1);
        assert_eq!(callback.instance_key(), Some(primary));
        assert_eq!(query.instance_key(), Some(aux));
        assert_eq!(request_reply.transient_instance_key(), Some(transient));
        assert_eq!(callback.kind(), Some(CorrelationKind::Callback));
        assert_eq!(query.kind(), Some(CorrelationKind::Query));
        assert_eq!(request_reply.kind(), Some(CorrelationKind::RequestReply));
    }

    #[test]
    fn completion_rejects_handle_of_another_kind() {
        let ext = RecordingExtension::default();
        let callback = CorrelationHandle::with_kind(CorrelationKind::Query);
        let send = SendMessage::request(op().one_way())
            .with_initializer(CorrelationInitializer::callback(Some(Arc::clone(&callback))));
        let ctx = ctx();
        let pending = send.execute_with_extension(&ctx, &ext, Message::new("q")).unwrap();
        let resumed = pending.bookmark().clone();

        let property = CorrelationMessageProperty {
            correlation_key: Some(InstanceKey::generate()),
            ..CorrelationMessageProperty::default()
        };
        let err = send
            .on_send_complete(&ctx, pending, &resumed, SendCompletion::Correlated(property))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Correlation(CorrelationError::Conflict { .. })
        ));
        assert!(callback.instance_key().is_none());
    }

    #[test]
    fn completion_fault_and_wrong_bookmark() {
        let ext = RecordingExtension::default();
        let ctx = ctx().with_ambient(CorrelationHandle::shared());
        let send = SendMessage::request(op());

        let pending = send.execute_with_extension(&ctx, &ext, Message::new("q")).unwrap();
        let stray = Bookmark::new("elsewhere");
        let err = send
            .on_send_complete(&ctx, pending, &stray, SendCompletion::Sent)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Correlation(CorrelationError::InvalidSendState(_))
        ));

        let pending = send.execute_with_extension(&ctx, &ext, Message::new("q")).unwrap();
        let resumed = pending.bookmark().clone();
        let err = send
            .on_send_complete(
                &ctx,
                pending,
                &resumed,
                SendCompletion::Fault(ReplyFault::new("endpoint unreachable")),
            )
            .unwrap_err();
        assert!(matches!(err, crate::Error::Fault(_)));
    }

    #[test]
    fn cancel_reaches_host_once() {
        let ext = RecordingExtension::default();
        let send = SendMessage::request(op().one_way());
        let pending = send.execute_with_extension(&ctx(), &ext, Message::new("q")).unwrap();
        let bookmark = pending.bookmark().clone();
        send.cancel(pending, &ext);
        assert_eq!(ext.cancels(), vec![bookmark]);
    }

    #[test]
    fn cached_send_parks_request_on_ambient() {
        let guard = NoPersistGuard::shared();
        let ambient = CorrelationHandle::shared();
        let ctx = ctx()
            .with_ambient(Arc::clone(&ambient))
            .with_no_persist_guard(Some(Arc::clone(&guard)));
        let factory = FakeFactory::default();
        let send = SendMessage::request(op())
            .with_endpoint(EndpointIdentity::inline(ADDRESS, "netTcp", "IQuotes"));

        let client = send
            .send_via_cache(&ctx, &cache(), None, Message::new("q"), factory_fn(&factory))
            .unwrap();
        assert!(client.is_factory_shared());
        assert_eq!(guard.depth(), 1);
        assert!(Arc::ptr_eq(client.handle().unwrap(), &ambient));
        assert_eq!(factory.sent.lock().unwrap().len(), 1);

        let parked = ambient.try_acquire_request_context().unwrap();
        assert!(Arc::ptr_eq(&parked, client.request_context().unwrap()));
        assert_eq!(guard.depth(), 0);
        assert_eq!(ambient.kind(), None);

        parked.receive_reply(Message::new("quoted"));
        match client.request_context().unwrap().wait_for_reply() {
            Ok(ReplyOutcome::Reply(reply)) => assert_eq!(reply.action, "quoted"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn cached_two_way_send_carries_request_reply_key() {
        let request_reply = CorrelationHandle::shared();
        let ctx = ctx();
        let factory = FakeFactory::default();
        let send = SendMessage::request(op())
            .with_endpoint(EndpointIdentity::inline(ADDRESS, "netTcp", "IQuotes"))
            .with_initializer(CorrelationInitializer::request_reply(Some(Arc::clone(&request_reply))));

        let _client = send
            .send_via_cache(&ctx, &cache(), None, Message::new("q"), factory_fn(&factory))
            .unwrap();
        let sent = factory.sent.lock().unwrap();
        let key = sent[0]
            .correlation
            .as_ref()
            .and_then(CorrelationMessageProperty::request_reply_key);
        assert!(key.is_some_and(InstanceKey::is_request_reply));
        assert_eq!(request_reply.kind(), Some(CorrelationKind::RequestReply));
    }

    #[test]
    fn cached_one_way_send_has_no_request_reply_key() {
        let factory = FakeFactory::default();
        let send = SendMessage::request(op().one_way())
            .with_endpoint(EndpointIdentity::inline(ADDRESS, "netTcp", "IQuotes"));
        let _client = send
            .send_via_cache(&ctx(), &cache(), None, Message::new("q"), factory_fn(&factory))
            .unwrap();
        assert!(factory.sent.lock().unwrap()[0].correlation.is_none());
    }

    #[test]
    fn cached_send_refuses_request_reply_handle_of_another_kind() {
        let handle = CorrelationHandle::with_kind(CorrelationKind::Query);
        let factory = FakeFactory::default();
        let send = SendMessage::request(op())
            .with_endpoint(EndpointIdentity::inline(ADDRESS, "netTcp", "IQuotes"))
            .with_initializer(CorrelationInitializer::request_reply(Some(Arc::clone(&handle))));
        let err = send
            .send_via_cache(&ctx(), &cache(), None, Message::new("q"), factory_fn(&factory))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Correlation(CorrelationError::Conflict { .. })
        ));
        assert!(!handle.has_pending_request());
        assert!(factory.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn cached_send_reuses_factory_across_calls() {
        let ctx = ctx();
        let cache = cache();
        let factory = FakeFactory::default();
        let send = SendMessage::request(op().one_way())
            .with_endpoint(EndpointIdentity::inline(ADDRESS, "netTcp", "IQuotes"));

        for _ in 0..3 {
            let client = send
                .send_via_cache(&ctx, &cache, None, Message::new("q"), factory_fn(&factory))
                .unwrap();
            assert!(client.request_context().is_none());
        }
        assert_eq!(factory.created(), 1, "one channel, pooled");
        assert_eq!(cache.factory_cache().len(), 1);
    }

    #[test]
    fn cached_send_without_guard_is_unsupported() {
        let ambient = CorrelationHandle::shared();
        let ctx = ctx()
            .with_ambient(Arc::clone(&ambient))
            .with_no_persist_guard(None);
        let send = SendMessage::request(op())
            .with_endpoint(EndpointIdentity::inline(ADDRESS, "netTcp", "IQuotes"));
        let err = send
            .send_via_cache(&ctx, &cache(), None, Message::new("q"), factory_fn(&FakeFactory::default()))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Correlation(CorrelationError::UnsupportedMode(_))
        ));
        assert!(!ambient.has_pending_request());
    }

    #[test]
    fn cached_send_requires_endpoint() {
        let err = SendMessage::request(op().one_way())
            .send_via_cache(&ctx(), &cache(), None, Message::new("q"), factory_fn(&FakeFactory::default()))
            .unwrap_err();
        match err {
            crate::Error::Validation(v) => assert!(v.has(ValidationCode::MissingEndpoint)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn cached_send_binds_calculated_keys() {
        let query = CorrelationHandle::shared();
        let ctx = ctx();
        let key = InstanceKey::generate();
        let calculator = FixedKeys(CalculatedKeys {
            primary: None,
            additional: vec![key.clone()],
        });
        let send = SendMessage::request(op().one_way())
            .with_endpoint(EndpointIdentity::inline(ADDRESS, "netTcp", "IQuotes"))
            .with_initializer(CorrelationInitializer::query(
                QuerySet::new().with("quote", "body/quoteId"),
                Some(Arc::clone(&query)),
            ));
        let client = send
            .send_via_cache(&ctx, &cache(), Some(&calculator), Message::new("q"), factory_fn(&FakeFactory::default()))
            .unwrap();
        assert_eq!(client.correlation().unwrap().auxiliary.len(), 1);
        assert_eq!(query.instance_key(), Some(key));
    }

    #[test]
    fn cancelled_client_send_releases_guard() {
        let guard = NoPersistGuard::shared();
        let handle = CorrelationHandle::shared();
        let ctx = ctx().with_no_persist_guard(Some(Arc::clone(&guard)));
        let send = SendMessage::request(op())
            .with_endpoint(EndpointIdentity::inline(ADDRESS, "netTcp", "IQuotes"))
            .with_initializer(CorrelationInitializer::request_reply(Some(Arc::clone(&handle))));
        let client = send
            .send_via_cache(&ctx, &cache(), None, Message::new("q"), factory_fn(&FakeFactory::default()))
            .unwrap();
        let request = Arc::clone(client.request_context().unwrap());
        assert_eq!(guard.depth(), 1);

        client.cancel();
        assert_eq!(guard.depth(), 0);
        assert!(matches!(request.wait_for_reply(), Ok(ReplyOutcome::Cancelled)));
    }

    fn reply_ctx(settings: HostSettings) -> (ExecutionContext, Arc<CorrelationResponseContext>) {
        let mut ctx = ctx().with_settings(settings);
        let handle = ctx.variables_mut().declare_new("order");
        let response = CorrelationResponseContext::shared("GetQuote");
        assert!(handle.try_register_response_context(&ctx, &response));
        (ctx, response)
    }

    #[test]
    fn reply_goes_through_parked_response() {
        let (ctx, response) = reply_ctx(HostSettings::default());
        let send = SendMessage::reply(op(), HandleBinding::variable("order"));
        send.send_reply_via_context(&ctx, None, Message::new("quoted")).unwrap();
        match response.responder().wait() {
            Ok(ReplyOutcome::Reply(reply)) => assert_eq!(reply.action, "quoted"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(ctx.no_persist_guard().unwrap().depth(), 0);

        let err = send
            .send_reply_via_context(&ctx, None, Message::new("again"))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Correlation(CorrelationError::InvalidSendState(_))
        ));
    }

    #[test]
    fn durable_reply_without_version_abandons_response() {
        let (ctx, response) = reply_ctx(HostSettings::default());
        let ctx = ctx.with_durable_host(true);
        let send = SendMessage::reply(op(), HandleBinding::variable("order"));
        let err = send
            .send_reply_via_context(&ctx, None, Message::new("quoted"))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Correlation(CorrelationError::MissingReplyVersion { .. })
        ));
        assert!(matches!(response.responder().wait(), Ok(ReplyOutcome::Cancelled)));
    }

    #[test]
    fn fault_detail_stripped_unless_allowed() {
        let fault = ReplyFault::new("no stock").with_detail("warehouse offline");
        let send = SendMessage::reply(op(), HandleBinding::variable("order"));

        let (ctx, response) = reply_ctx(HostSettings::default());
        send.send_fault_via_context(&ctx, fault.clone()).unwrap();
        assert_eq!(response.responder().wait().unwrap_err().detail, None);

        let settings = HostSettings {
            include_exception_detail_in_faults: true,
            ..HostSettings::default()
        };
        let (ctx, response) = reply_ctx(settings);
        send.send_fault_via_context(&ctx, fault).unwrap();
        assert_eq!(
            response.responder().wait().unwrap_err().detail.as_deref(),
            Some("warehouse offline")
        );
    }
}
