//! Request/reply rendezvous.
//!
//! [`ReplyRendezvous`] is a one-shot, thread-safe signal: it is completed at
//! most once (reply, fault or cancellation; first writer wins) and observed
//! by one logical consumer through a blocking wait, a future, or a callback.
//! A consumer that arrives after completion never blocks.
//!
//! [`CorrelationRequestContext`] and [`CorrelationResponseContext`] wrap a
//! rendezvous with the operation they belong to and are what correlation
//! handles park between a send and its reply (or a receive and its reply).
//! [`CorrelationSynchronizer`] decides which of the channel and the workflow
//! finishes a send when both race to complete it.

use crate::context::ExecutionContext;
use crate::error::{CorrelationError, ReplyFault};
use crate::host::{Message, MessageVersion};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use uuid::Uuid;

// =============================================================================
// ReplyRendezvous
// =============================================================================

/// Observable state of a rendezvous
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RendezvousState {
    Pending,
    Fulfilled,
    Failed,
    Cancelled,
}

impl RendezvousState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// What a consumer observes once the rendezvous completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome<T> {
    /// The reply value
    Reply(T),
    /// Completed by cancellation; neither success nor failure
    Cancelled,
    /// Fulfilled, but another consumer already took the value
    Consumed,
}

pub type ReplyResult<T> = Result<ReplyOutcome<T>, ReplyFault>;

type Callback<T> = Box<dyn FnOnce(ReplyResult<T>) + Send>;

enum Slot<T> {
    Pending,
    Fulfilled(Option<T>),
    Failed(ReplyFault),
    Cancelled,
}

struct Core<T> {
    slot: Slot<T>,
    waker: Option<Waker>,
    callbacks: Vec<Callback<T>>,
}

impl<T> Core<T> {
    fn state(&self) -> RendezvousState {
        match self.slot {
            Slot::Pending => RendezvousState::Pending,
            Slot::Fulfilled(_) => RendezvousState::Fulfilled,
            Slot::Failed(_) => RendezvousState::Failed,
            Slot::Cancelled => RendezvousState::Cancelled,
        }
    }

    fn take_outcome(&mut self) -> Option<ReplyResult<T>> {
        match &mut self.slot {
            Slot::Pending => None,
            Slot::Fulfilled(value) => Some(Ok(value
                .take()
                .map_or(ReplyOutcome::Consumed, ReplyOutcome::Reply))),
            Slot::Failed(fault) => Some(Err(fault.clone())),
            Slot::Cancelled => Some(Ok(ReplyOutcome::Cancelled)),
        }
    }
}

/// One-shot reply signal
pub struct ReplyRendezvous<T> {
    core: Mutex<Core<T>>,
    signal: Condvar,
}

impl<T> ReplyRendezvous<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Mutex::new(Core {
                slot: Slot::Pending,
                waker: None,
                callbacks: Vec::new(),
            }),
            signal: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core<T>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> RendezvousState {
        self.lock().state()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state().is_terminal()
    }

    /// Complete with a reply. Returns false if already completed.
    pub fn set_reply(&self, value: T) -> bool {
        self.complete(Slot::Fulfilled(Some(value)))
    }

    /// Complete with a fault. Returns false if already completed.
    pub fn set_fault(&self, fault: ReplyFault) -> bool {
        self.complete(Slot::Failed(fault))
    }

    /// Complete without a payload. Returns false if already completed.
    pub fn cancel(&self) -> bool {
        self.complete(Slot::Cancelled)
    }

    fn complete(&self, slot: Slot<T>) -> bool {
        let (waker, ready) = {
            let mut core = self.lock();
            if core.state().is_terminal() {
                return false;
            }
            core.slot = slot;
            let callbacks = std::mem::take(&mut core.callbacks);
            let ready: Vec<(Callback<T>, ReplyResult<T>)> = callbacks
                .into_iter()
                .filter_map(|callback| core.take_outcome().map(|outcome| (callback, outcome)))
                .collect();
            (core.waker.take(), ready)
        };
        self.signal.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        for (callback, outcome) in ready {
            callback(outcome);
        }
        true
    }

    /// Non-blocking poll: the stored fault, or whether a reply is waiting.
    pub fn try_get_reply(&self) -> Result<bool, ReplyFault> {
        match &self.lock().slot {
            Slot::Failed(fault) => Err(fault.clone()),
            Slot::Fulfilled(value) => Ok(value.is_some()),
            Slot::Pending | Slot::Cancelled => Ok(false),
        }
    }

    /// Take the reply value if one is waiting.
    pub fn take_reply(&self) -> Option<T> {
        match &mut self.lock().slot {
            Slot::Fulfilled(value) => value.take(),
            _ => None,
        }
    }

    /// Block until completion. There is no timeout.
    pub fn wait(&self) -> ReplyResult<T> {
        let mut core = self.lock();
        loop {
            if let Some(outcome) = core.take_outcome() {
                return outcome;
            }
            core = self
                .signal
                .wait(core)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until completion or until `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ReplyResult<T>> {
        let deadline = Instant::now() + timeout;
        let mut core = self.lock();
        loop {
            if let Some(outcome) = core.take_outcome() {
                return Some(outcome);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            core = self
                .signal
                .wait_timeout(core, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Run `callback` on completion, or immediately on the calling thread
    /// when already complete.
    pub fn on_complete(&self, callback: impl FnOnce(ReplyResult<T>) + Send + 'static) {
        let outcome = {
            let mut core = self.lock();
            match core.take_outcome() {
                Some(outcome) => outcome,
                None => {
                    core.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(outcome);
    }

    /// Future resolving on completion.
    #[must_use]
    pub fn wait_async(self: &Arc<Self>) -> ReplyFuture<T> {
        ReplyFuture {
            rendezvous: Arc::clone(self),
        }
    }
}

impl<T> Default for ReplyRendezvous<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ReplyRendezvous<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyRendezvous")
            .field("state", &self.state())
            .finish()
    }
}

/// Future returned by [`ReplyRendezvous::wait_async`]
#[derive(Debug)]
pub struct ReplyFuture<T> {
    rendezvous: Arc<ReplyRendezvous<T>>,
}

impl<T> Future for ReplyFuture<T> {
    type Output = ReplyResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut core = self.rendezvous.lock();
        if let Some(outcome) = core.take_outcome() {
            Poll::Ready(outcome)
        } else {
            core.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

// =============================================================================
// Request / response contexts
// =============================================================================

/// A sent request awaiting its reply in process
#[derive(Debug)]
pub struct CorrelationRequestContext {
    id: Uuid,
    operation: String,
    reply: Arc<ReplyRendezvous<Message>>,
}

impl CorrelationRequestContext {
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            reply: Arc::new(ReplyRendezvous::new()),
        }
    }

    #[must_use]
    pub fn shared(operation: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(operation))
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    #[must_use]
    pub fn state(&self) -> RendezvousState {
        self.reply.state()
    }

    /// Deliver the reply. Returns false if the exchange already completed.
    pub fn receive_reply(&self, reply: Message) -> bool {
        let won = self.reply.set_reply(reply);
        tracing::debug!(request = %self.id, operation = %self.operation, won, "reply received");
        won
    }

    /// Deliver a fault instead of a reply.
    pub fn fail(&self, fault: ReplyFault) -> bool {
        let won = self.reply.set_fault(fault);
        tracing::debug!(request = %self.id, operation = %self.operation, won, "request faulted");
        won
    }

    /// Unblock any waiter without success or failure.
    pub fn cancel(&self) -> bool {
        let won = self.reply.cancel();
        tracing::debug!(request = %self.id, operation = %self.operation, won, "request cancelled");
        won
    }

    pub fn try_get_reply(&self) -> Result<bool, ReplyFault> {
        self.reply.try_get_reply()
    }

    pub fn take_reply(&self) -> Option<Message> {
        self.reply.take_reply()
    }

    pub fn wait_for_reply(&self) -> ReplyResult<Message> {
        self.reply.wait()
    }

    #[must_use]
    pub fn wait_for_reply_async(&self) -> ReplyFuture<Message> {
        self.reply.wait_async()
    }

    pub fn on_reply(&self, callback: impl FnOnce(ReplyResult<Message>) + Send + 'static) {
        self.reply.on_complete(callback);
    }
}

/// A received request whose reply the workflow has yet to send
#[derive(Debug)]
pub struct CorrelationResponseContext {
    id: Uuid,
    operation: String,
    message_version: Option<MessageVersion>,
    responder: Arc<ReplyRendezvous<Message>>,
}

impl CorrelationResponseContext {
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            message_version: None,
            responder: Arc::new(ReplyRendezvous::new()),
        }
    }

    #[must_use]
    pub fn shared(operation: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(operation))
    }

    #[must_use]
    pub fn with_message_version(mut self, version: MessageVersion) -> Self {
        self.message_version = Some(version);
        self
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Version the reply must be written in.
    ///
    /// A missing version is an error under a durable host and falls back to
    /// the default version otherwise.
    pub fn reply_version(&self, ctx: &ExecutionContext) -> Result<MessageVersion, CorrelationError> {
        match self.message_version {
            Some(version) => Ok(version),
            None if ctx.is_durable() => Err(CorrelationError::MissingReplyVersion {
                operation: self.operation.clone(),
            }),
            None => Ok(MessageVersion::default()),
        }
    }

    /// Hand the reply to the waiting dispatcher.
    pub fn send_reply(&self, reply: Message) -> bool {
        self.responder.set_reply(reply)
    }

    pub fn send_fault(&self, fault: ReplyFault) -> bool {
        self.responder.set_fault(fault)
    }

    /// Abandon the exchange; the dispatcher sees a cancellation.
    pub fn abandon(&self) -> bool {
        self.responder.cancel()
    }

    /// Dispatcher side: the signal the reply arrives on.
    #[must_use]
    pub fn responder(&self) -> &Arc<ReplyRendezvous<Message>> {
        &self.responder
    }
}

// =============================================================================
// CorrelationSynchronizer
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Completion {
    #[default]
    None,
    SendComplete,
    CorrelationComplete,
}

type ProcessingCallback = Box<dyn FnOnce(Option<Message>) + Send>;
type NotificationCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SyncState {
    completion: Completion,
    channel_work_complete: bool,
    updated_message: Option<Message>,
    on_processing_complete: Option<ProcessingCallback>,
    on_request_set: Option<NotificationCallback>,
}

/// Two-party completion race between the channel and the workflow
///
/// The channel signals when the request is on the wire; the workflow signals
/// when correlation processing for it is done. Whichever signals second is
/// told to finalize the send.
#[derive(Default)]
pub struct CorrelationSynchronizer {
    state: Mutex<SyncState>,
}

impl CorrelationSynchronizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Channel side: the request is set. `on_processing_complete` runs when
    /// the workflow finishes correlation and receives any updated message.
    pub fn notify_request_set_by_channel(
        &self,
        on_processing_complete: impl FnOnce(Option<Message>) + Send + 'static,
    ) {
        let notify = {
            let mut state = self.lock();
            state.channel_work_complete = true;
            state.on_processing_complete = Some(Box::new(on_processing_complete));
            state.on_request_set.take()
        };
        if let Some(notify) = notify {
            notify();
        }
    }

    /// Workflow side: register interest in the channel signal.
    ///
    /// Returns true when the channel already signaled; the callback is then
    /// dropped without being called.
    pub fn set_workflow_notification_callback(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> bool {
        let mut state = self.lock();
        if state.channel_work_complete {
            return true;
        }
        state.on_request_set = Some(Box::new(callback));
        false
    }

    /// Workflow side: replace the outgoing message after correlation.
    pub fn notify_message_updated_by_workflow(&self, message: Message) {
        self.lock().updated_message = Some(message);
    }

    /// Workflow side: correlation processing is done.
    ///
    /// Returns true when the channel already completed the send, meaning the
    /// workflow must finalize it.
    pub fn notify_workflow_correlation_processing_complete(&self) -> bool {
        let (second, callback, message) = {
            let mut state = self.lock();
            let second = state.completion == Completion::SendComplete;
            if !second {
                state.completion = Completion::CorrelationComplete;
            }
            let message = state.updated_message.take();
            (second, state.on_processing_complete.take(), message)
        };
        match callback {
            Some(callback) => callback(message),
            None => tracing::warn!("correlation processing finished before the channel set the request"),
        }
        second
    }

    /// Channel side: the send finished.
    ///
    /// Returns true when the workflow already finished correlation, meaning
    /// the channel must finalize the send.
    pub fn notify_send_complete(&self) -> bool {
        let mut state = self.lock();
        let second = state.completion == Completion::CorrelationComplete;
        if !second {
            state.completion = Completion::SendComplete;
        }
        second
    }

    #[must_use]
    pub fn is_channel_work_complete(&self) -> bool {
        self.lock().channel_work_complete
    }
}

impl fmt::Debug for CorrelationSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CorrelationSynchronizer")
            .field("completion", &state.completion)
            .field("channel_work_complete", &state.channel_work_complete)
            .finish()
    }
}
