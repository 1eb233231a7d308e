//! Shared fakes for the integration tests.

#![allow(dead_code)]

use parley_core::Result;
use parley_core::bookmark::Bookmark;
use parley_core::channel_cache::{ChannelFactory, OutboundChannel};
use parley_core::handle::CorrelationHandle;
use parley_core::host::{
    CalculatedKeys, CorrelationKeyCalculator, Message, ReceiveSettings, SendReceiveExtension,
    SendSettings,
};
use parley_core::instance_key::InstanceKey;
use parley_core::object_cache::CacheResource;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Everything a wire would have carried, in send order
pub type Wire = Arc<Mutex<Vec<Message>>>;

pub struct LoopbackChannel {
    address: String,
    wire: Wire,
    open: AtomicBool,
}

impl OutboundChannel for LoopbackChannel {
    fn address(&self) -> &str {
        &self.address
    }

    fn send(&self, message: Message) -> Result<()> {
        self.wire.lock().unwrap().push(message);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Factory whose channels all write to one wire
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    pub wire: Wire,
    pub channels: Arc<AtomicUsize>,
    pub closed: Arc<AtomicBool>,
}

impl LoopbackFactory {
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.wire.lock().unwrap())
    }
}

impl ChannelFactory for LoopbackFactory {
    fn create_channel(&self, address: &str) -> Result<Box<dyn OutboundChannel>> {
        self.channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackChannel {
            address: address.to_string(),
            wire: Arc::clone(&self.wire),
            open: AtomicBool::new(true),
        }))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Derives one auxiliary key from each named header that is present
pub struct HeaderKeys {
    pub scope: String,
    pub headers: Vec<String>,
}

impl HeaderKeys {
    pub fn new(scope: &str, headers: &[&str]) -> Self {
        Self {
            scope: scope.to_string(),
            headers: headers.iter().map(ToString::to_string).collect(),
        }
    }
}

impl CorrelationKeyCalculator for HeaderKeys {
    fn calculate(&self, message: &Message) -> Result<CalculatedKeys> {
        let additional = self
            .headers
            .iter()
            .map(|name| match message.header(name) {
                Some(value) => InstanceKey::derive(&self.scope, value),
                None => InstanceKey::invalid(),
            })
            .collect();
        Ok(CalculatedKeys {
            primary: None,
            additional,
        })
    }
}

/// Host extension that records sends and registrations
#[derive(Default)]
pub struct RecordingHost {
    pub sends: Mutex<Vec<(Message, SendSettings, Bookmark)>>,
    pub receives: Mutex<Vec<(ReceiveSettings, Bookmark)>>,
    pub cancels: Mutex<Vec<Bookmark>>,
    pub uninitialized: Mutex<Vec<InstanceKey>>,
}

impl SendReceiveExtension for RecordingHost {
    fn send(
        &self,
        message: Message,
        settings: &SendSettings,
        _correlates_with: Option<&Arc<CorrelationHandle>>,
        on_send_complete: &Bookmark,
    ) -> Result<()> {
        self.sends
            .lock()
            .unwrap()
            .push((message, settings.clone(), on_send_complete.clone()));
        Ok(())
    }

    fn cancel(&self, bookmark: &Bookmark) {
        self.cancels.lock().unwrap().push(bookmark.clone());
    }

    fn register_receive(
        &self,
        settings: &ReceiveSettings,
        _correlates_with: Option<&Arc<CorrelationHandle>>,
        on_receive: &Bookmark,
    ) -> Result<()> {
        self.receives
            .lock()
            .unwrap()
            .push((settings.clone(), on_receive.clone()));
        Ok(())
    }

    fn on_uninitialize_correlation(&self, key: &InstanceKey) {
        self.uninitialized.lock().unwrap().push(key.clone());
    }
}

/// Cache resource that counts how often it was closed
#[derive(Debug, Default)]
pub struct Tracked {
    pub id: usize,
    pub closes: AtomicUsize,
}

impl Tracked {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            closes: AtomicUsize::new(0),
        }
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl CacheResource for Tracked {
    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
