//! Two-pool outbound channel cache.
//!
//! Factories are cached per [`FactoryCacheKey`] in one [`ObjectCache`]; each
//! [`ChannelFactoryReference`] owns a second cache of idle channel pools
//! keyed by target address. Sends whose endpoint is not safe to share (and
//! unsafe caching is off) get a private factory with caching disabled.

use crate::cache_settings::ChannelCacheSettings;
use crate::config::ParleyConfig;
use crate::error::Result;
use crate::host::Message;
use crate::initializer::{MessageQuery, QuerySet};
use crate::object_cache::{CacheEntryRef, CacheLease, CacheResource, CacheStats, ObjectCache};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

// =============================================================================
// Endpoint identity and keys
// =============================================================================

/// Where an endpoint's binding comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EndpointSource {
    /// Binding declared on the send itself
    Inline { binding: String },
    /// Binding looked up by configuration name at run time
    Configuration { name: String },
}

/// Outbound endpoint a send targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointIdentity {
    pub address: String,
    pub source: EndpointSource,
    pub contract: String,
    #[serde(default)]
    pub is_one_way: bool,
}

impl EndpointIdentity {
    #[must_use]
    pub fn inline(
        address: impl Into<String>,
        binding: impl Into<String>,
        contract: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            source: EndpointSource::Inline {
                binding: binding.into(),
            },
            contract: contract.into(),
            is_one_way: false,
        }
    }

    #[must_use]
    pub fn from_configuration(
        address: impl Into<String>,
        name: impl Into<String>,
        contract: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            source: EndpointSource::Configuration { name: name.into() },
            contract: contract.into(),
            is_one_way: false,
        }
    }

    #[must_use]
    pub fn one_way(mut self, is_one_way: bool) -> Self {
        self.is_one_way = is_one_way;
        self
    }

    /// Configuration-named endpoints can resolve differently per host and
    /// are never shared.
    #[must_use]
    pub fn is_safe_for_cache(&self) -> bool {
        matches!(self.source, EndpointSource::Inline { .. })
    }
}

/// Identity of a cached channel factory
///
/// The target address is not part of the key; channels for different
/// addresses share one factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactoryCacheKey {
    pub source: EndpointSource,
    pub contract: String,
    pub is_one_way: bool,
    pub correlation_queries: Vec<MessageQuery>,
}

impl FactoryCacheKey {
    #[must_use]
    pub fn new<'a>(
        endpoint: &EndpointIdentity,
        queries: impl IntoIterator<Item = &'a QuerySet>,
    ) -> Self {
        Self {
            source: endpoint.source.clone(),
            contract: endpoint.contract.clone(),
            is_one_way: endpoint.is_one_way,
            correlation_queries: queries
                .into_iter()
                .flat_map(|set| set.iter().cloned())
                .collect(),
        }
    }
}

// =============================================================================
// Host-supplied transport
// =============================================================================

/// A channel to one remote address
pub trait OutboundChannel: Send + Sync {
    fn address(&self) -> &str;

    /// Hand `message` to the transport.
    fn send(&self, message: Message) -> Result<()>;

    fn is_open(&self) -> bool {
        true
    }

    fn close(&self);
}

/// Creates channels for one factory key
pub trait ChannelFactory: Send + Sync {
    fn create_channel(&self, address: &str) -> Result<Box<dyn OutboundChannel>>;

    fn close(&self);
}

// =============================================================================
// Channel pools
// =============================================================================

/// Idle channels to one address
pub struct ChannelPool {
    idle: Mutex<Vec<Box<dyn OutboundChannel>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl ChannelPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    fn take(&self) -> Option<Box<dyn OutboundChannel>> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    /// Park `channel`; hands it back when the pool is full or closed.
    fn put(&self, channel: Box<dyn OutboundChannel>) -> std::result::Result<(), Box<dyn OutboundChannel>> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) || idle.len() >= self.capacity {
            return Err(channel);
        }
        idle.push(channel);
        Ok(())
    }

    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl CacheResource for ChannelPool {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained = std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner));
        for channel in drained {
            channel.close();
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// A channel checked out of a pool; returned to it on drop
pub struct ChannelLease {
    channel: Option<Box<dyn OutboundChannel>>,
    pool: CacheLease<String, ChannelPool>,
}

impl ChannelLease {
    #[must_use]
    pub fn channel(&self) -> Option<&dyn OutboundChannel> {
        self.channel.as_deref()
    }

    pub fn send(&self, message: Message) -> Result<()> {
        match &self.channel {
            Some(channel) => channel.send(message),
            None => Err(crate::error::CacheError::Disposed(self.pool.key().clone()).into()),
        }
    }

    /// Close the channel instead of returning it to the pool.
    pub fn discard(mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if !channel.is_open() {
            channel.close();
            return;
        }
        if let Err(channel) = self.pool.put(channel) {
            channel.close();
        }
    }
}

impl fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLease")
            .field("address", self.pool.key())
            .field("has_channel", &self.channel.is_some())
            .finish()
    }
}

// =============================================================================
// Factory references
// =============================================================================

/// A channel factory plus its own cache of channel pools
pub struct ChannelFactoryReference {
    key: FactoryCacheKey,
    factory: Box<dyn ChannelFactory>,
    channels: ObjectCache<String, ChannelPool>,
}

impl ChannelFactoryReference {
    #[must_use]
    pub fn new(
        key: FactoryCacheKey,
        factory: Box<dyn ChannelFactory>,
        channel_settings: ChannelCacheSettings,
    ) -> Self {
        Self {
            key,
            factory,
            channels: ObjectCache::new("channels", channel_settings),
        }
    }

    #[must_use]
    pub fn key(&self) -> &FactoryCacheKey {
        &self.key
    }

    #[must_use]
    pub fn channel_cache(&self) -> &ObjectCache<String, ChannelPool> {
        &self.channels
    }

    /// A pooled channel to `address`, or a new one from the factory.
    ///
    /// Pooled channels that are no longer open are closed and replaced.
    pub fn take_channel(&self, address: &str) -> Result<ChannelLease> {
        let capacity = self.channels.settings().max_items_in_cache();
        let pool = self
            .channels
            .get_or_create(address.to_string(), || Ok(ChannelPool::new(capacity)))?;

        let pooled = pool.take().and_then(|channel| {
            if channel.is_open() {
                Some(channel)
            } else {
                channel.close();
                None
            }
        });

        let channel = match pooled {
            Some(channel) => channel,
            None => {
                tracing::debug!(address, contract = %self.key.contract, "creating channel");
                self.factory.create_channel(address)?
            }
        };

        Ok(ChannelLease {
            channel: Some(channel),
            pool,
        })
    }
}

impl CacheResource for ChannelFactoryReference {
    fn close(&self) {
        self.channels.dispose();
        self.factory.close();
    }

    fn is_open(&self) -> bool {
        !self.channels.is_disposed()
    }
}

impl fmt::Debug for ChannelFactoryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFactoryReference")
            .field("key", &self.key)
            .field("channels", &self.channels)
            .finish()
    }
}

/// Factory checked out for one send
pub enum FactoryLease {
    Shared(CacheLease<FactoryCacheKey, ChannelFactoryReference>),
    /// Private factory, closed when the lease drops
    Unshared(Box<ChannelFactoryReference>),
}

impl FactoryLease {
    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }
}

impl Deref for FactoryLease {
    type Target = ChannelFactoryReference;

    fn deref(&self) -> &ChannelFactoryReference {
        match self {
            Self::Shared(lease) => lease,
            Self::Unshared(reference) => reference,
        }
    }
}

impl Drop for FactoryLease {
    fn drop(&mut self) {
        if let Self::Unshared(reference) = self {
            reference.close();
        }
    }
}

impl fmt::Debug for FactoryLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryLease")
            .field("shared", &self.is_shared())
            .field("key", self.key())
            .finish()
    }
}

/// The factory entry a send operation used last
#[derive(Debug, Default)]
pub struct LastUsedFactory {
    entry: Option<CacheEntryRef<FactoryCacheKey, ChannelFactoryReference>>,
}

impl LastUsedFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.entry.is_some()
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}

// =============================================================================
// SendChannelCache
// =============================================================================

/// Host-wide cache of outbound channel factories and channels
#[derive(Debug, Clone)]
pub struct SendChannelCache {
    factories: ObjectCache<FactoryCacheKey, ChannelFactoryReference>,
    channel_settings: ChannelCacheSettings,
    allow_unsafe_caching: bool,
}

impl SendChannelCache {
    #[must_use]
    pub fn new(
        factory_settings: ChannelCacheSettings,
        channel_settings: ChannelCacheSettings,
        allow_unsafe_caching: bool,
    ) -> Self {
        Self {
            factories: ObjectCache::new("factories", factory_settings),
            channel_settings,
            allow_unsafe_caching,
        }
    }

    #[must_use]
    pub fn from_config(config: &ParleyConfig) -> Self {
        Self::new(
            config.factory_cache.clone(),
            config.channel_cache.clone(),
            config.allow_unsafe_caching,
        )
    }

    #[must_use]
    pub fn factory_cache(&self) -> &ObjectCache<FactoryCacheKey, ChannelFactoryReference> {
        &self.factories
    }

    #[must_use]
    pub fn channel_settings(&self) -> &ChannelCacheSettings {
        &self.channel_settings
    }

    #[must_use]
    pub fn allow_unsafe_caching(&self) -> bool {
        self.allow_unsafe_caching
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.factories.stats()
    }

    /// Factory for `key`: the operation's last-used entry if it is still
    /// live in this cache, else a cached or newly built shared factory.
    /// Unshareable endpoints get a private factory without channel caching.
    pub fn acquire_factory(
        &self,
        endpoint: &EndpointIdentity,
        key: &FactoryCacheKey,
        last_used: &mut LastUsedFactory,
        create: impl FnOnce(&FactoryCacheKey) -> Result<Box<dyn ChannelFactory>>,
    ) -> Result<FactoryLease> {
        if !(self.allow_unsafe_caching || endpoint.is_safe_for_cache()) {
            tracing::debug!(address = %endpoint.address, "endpoint not shareable, using private factory");
            let factory = create(key)?;
            return Ok(FactoryLease::Unshared(Box::new(ChannelFactoryReference::new(
                key.clone(),
                factory,
                ChannelCacheSettings::empty(),
            ))));
        }

        if let Some(entry) = last_used.entry.as_ref().filter(|e| self.factories.owns(e)) {
            match entry.try_add_reference() {
                Some(lease) if lease.key() == key => return Ok(FactoryLease::Shared(lease)),
                _ => last_used.clear(),
            }
        }

        let channel_settings = self.channel_settings.clone();
        let lease = self.factories.get_or_create(key.clone(), || {
            let factory = create(key)?;
            Ok(ChannelFactoryReference::new(key.clone(), factory, channel_settings))
        })?;
        last_used.entry = lease.entry_ref();
        Ok(FactoryLease::Shared(lease))
    }

    /// Close every cached factory and channel. Safe to call repeatedly.
    pub fn dispose(&self) {
        self.factories.dispose();
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    /// Channel that records what it sends
    pub struct FakeChannel {
        address: String,
        pub sent: Arc<Mutex<Vec<Message>>>,
        pub open: Arc<AtomicBool>,
        closes: Arc<AtomicUsize>,
    }

    impl OutboundChannel for FakeChannel {
        fn address(&self) -> &str {
            &self.address
        }

        fn send(&self, message: Message) -> Result<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Factory counting the channels it builds and closes
    #[derive(Clone, Default)]
    pub struct FakeFactory {
        pub created: Arc<AtomicUsize>,
        pub channel_closes: Arc<AtomicUsize>,
        pub closed: Arc<AtomicBool>,
        pub sent: Arc<Mutex<Vec<Message>>>,
        pub channel_open: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
    }

    impl FakeFactory {
        pub fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        pub fn channel_closes(&self) -> usize {
            self.channel_closes.load(Ordering::SeqCst)
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl ChannelFactory for FakeFactory {
        fn create_channel(&self, address: &str) -> Result<Box<dyn OutboundChannel>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let open = Arc::new(AtomicBool::new(true));
            self.channel_open.lock().unwrap().push(Arc::clone(&open));
            Ok(Box::new(FakeChannel {
                address: address.to_string(),
                sent: Arc::clone(&self.sent),
                open,
                closes: Arc::clone(&self.channel_closes),
            }))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
