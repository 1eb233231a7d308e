//! Leased object cache with idle, lease and capacity eviction.
//!
//! Entries are reference counted through [`CacheLease`] guards. An entry is
//! evicted when it has been unreferenced for the idle timeout, when it is
//! older than the lease timeout (a referenced entry is retired instead and
//! closed on its last release), or to make room for a new key. Settings
//! freeze on the first [`ObjectCache::get_or_create`].
//!
//! # Example
//! ```
//! use parley_core::cache_settings::ChannelCacheSettings;
//! use parley_core::object_cache::{CacheResource, ObjectCache};
//!
//! struct Conn;
//! impl CacheResource for Conn {
//!     fn close(&self) {}
//! }
//!
//! let cache: ObjectCache<&str, Conn> =
//!     ObjectCache::new("conns", ChannelCacheSettings::default());
//! let lease = cache.get_or_create("net.tcp://orders", || Ok(Conn)).unwrap();
//! assert_eq!(cache.ref_count(&"net.tcp://orders"), Some(1));
//! drop(lease);
//! assert_eq!(cache.ref_count(&"net.tcp://orders"), Some(0));
//! ```

use crate::cache_settings::ChannelCacheSettings;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

/// A resource the cache can close when it evicts or disposes it
pub trait CacheResource: Send + Sync {
    fn close(&self);

    /// False once the resource can no longer be handed out.
    fn is_open(&self) -> bool {
        true
    }
}

/// Bounds every cache key satisfies
pub trait CacheKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static> CacheKey for T {}

/// Cache hit/miss/eviction statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub constructions: u64,
    pub evictions: u64,
    pub capacity_rejections: u64,
}

impl CacheStats {
    /// Hit rate as a fraction [0.0, 1.0]. Returns 0.0 if no lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<V> {
    id: u64,
    resource: Arc<V>,
    ref_count: usize,
    created_at: Instant,
    last_used_at: Instant,
}

impl<V: CacheResource> Entry<V> {
    fn lease_expired(&self, settings: &ChannelCacheSettings, now: Instant) -> bool {
        settings
            .lease_timeout()
            .is_expired(now.saturating_duration_since(self.created_at))
    }

    fn idle_expired(&self, settings: &ChannelCacheSettings, now: Instant) -> bool {
        self.ref_count == 0
            && settings
                .idle_timeout()
                .is_expired(now.saturating_duration_since(self.last_used_at))
    }

    /// Unreferenced and due for eviction.
    fn evictable(&self, settings: &ChannelCacheSettings, now: Instant) -> bool {
        self.ref_count == 0
            && (self.idle_expired(settings, now)
                || self.lease_expired(settings, now)
                || !self.resource.is_open())
    }
}

struct CacheState<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Lease-expired entries still referenced, keyed by entry id
    retired: HashMap<u64, Entry<V>>,
    next_id: u64,
    disposed: bool,
    stats: CacheStats,
}

struct Shared<K, V> {
    name: String,
    pending_settings: Mutex<ChannelCacheSettings>,
    frozen: OnceLock<ChannelCacheSettings>,
    state: Mutex<CacheState<K, V>>,
    construction: Mutex<()>,
}

impl<K: CacheKey, V: CacheResource> Shared<K, V> {
    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings(&self) -> ChannelCacheSettings {
        match self.frozen.get() {
            Some(settings) => settings.clone(),
            None => self
                .pending_settings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    fn release(&self, key: &K, entry_id: u64, now: Instant) {
        let settings = self.settings();
        let closing = {
            let mut state = self.lock();
            let state = &mut *state;
            match state.entries.get_mut(key) {
                Some(entry) if entry.id == entry_id => {
                    entry.ref_count = entry.ref_count.saturating_sub(1);
                    entry.last_used_at = now;
                    if entry.ref_count == 0
                        && (entry.lease_expired(&settings, now) || !entry.resource.is_open())
                    {
                        state.stats.evictions += 1;
                        state.entries.remove(key).map(|e| e.resource)
                    } else {
                        None
                    }
                }
                _ => match state.retired.get_mut(&entry_id) {
                    Some(entry) => {
                        entry.ref_count = entry.ref_count.saturating_sub(1);
                        if entry.ref_count == 0 {
                            state.stats.evictions += 1;
                            state.retired.remove(&entry_id).map(|e| e.resource)
                        } else {
                            None
                        }
                    }
                    None => None,
                },
            }
        };
        if let Some(resource) = closing {
            tracing::debug!(cache = %self.name, key = ?key, "closing resource on release");
            resource.close();
        }
    }
}

/// Keyed cache of shared, reference-counted resources
pub struct ObjectCache<K: CacheKey, V: CacheResource> {
    shared: Arc<Shared<K, V>>,
}

impl<K: CacheKey, V: CacheResource> Clone for ObjectCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: CacheKey, V: CacheResource> ObjectCache<K, V> {
    pub fn new(name: impl Into<String>, settings: ChannelCacheSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                pending_settings: Mutex::new(settings),
                frozen: OnceLock::new(),
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    retired: HashMap::new(),
                    next_id: 1,
                    disposed: false,
                    stats: CacheStats::default(),
                }),
                construction: Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current settings (frozen once the cache has been used).
    #[must_use]
    pub fn settings(&self) -> ChannelCacheSettings {
        self.shared.settings()
    }

    #[must_use]
    pub fn is_settings_locked(&self) -> bool {
        self.shared.frozen.get().is_some()
    }

    /// Change settings; fails once the cache has served a request.
    pub fn update_settings(
        &self,
        update: impl FnOnce(&mut ChannelCacheSettings) -> std::result::Result<(), CacheError>,
    ) -> std::result::Result<(), CacheError> {
        let mut pending = self
            .shared
            .pending_settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.shared.frozen.get().is_some() {
            return Err(CacheError::SettingsLocked);
        }
        let mut candidate = pending.clone();
        update(&mut candidate)?;
        candidate.validate()?;
        *pending = candidate;
        Ok(())
    }

    fn freeze(&self) -> &ChannelCacheSettings {
        if let Some(settings) = self.shared.frozen.get() {
            return settings;
        }
        let pending = self
            .shared
            .pending_settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.shared.frozen.get_or_init(|| pending.clone())
    }

    /// Lease the entry for `key`, constructing it with `factory` on a miss.
    pub fn get_or_create(
        &self,
        key: K,
        factory: impl FnOnce() -> Result<V>,
    ) -> Result<CacheLease<K, V>> {
        self.get_or_create_at(key, Instant::now(), factory)
    }

    /// [`Self::get_or_create`] with an explicit clock reading.
    pub fn get_or_create_at(
        &self,
        key: K,
        now: Instant,
        factory: impl FnOnce() -> Result<V>,
    ) -> Result<CacheLease<K, V>> {
        let settings = self.freeze().clone();

        if settings.caching_disabled() {
            self.ensure_live()?;
            let resource = Arc::new(factory()?);
            let mut state = self.shared.lock();
            state.stats.misses += 1;
            state.stats.constructions += 1;
            return Ok(CacheLease {
                key,
                resource,
                owner: LeaseOwner::Detached,
                released: false,
            });
        }

        if let Some(lease) = self.try_hit(&key, &settings, now)? {
            return Ok(lease);
        }

        let _construction = self
            .shared
            .construction
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(lease) = self.try_hit(&key, &settings, now)? {
            return Ok(lease);
        }

        let mut closing = Vec::new();
        let room = {
            let mut state = self.shared.lock();
            if state.disposed {
                return Err(CacheError::Disposed(self.shared.name.clone()).into());
            }
            state.stats.misses += 1;
            Self::make_room(&mut state, &settings, now, &mut closing)
        };
        Self::close_all(&self.shared.name, closing);
        room?;

        let resource = Arc::new(factory()?);

        let mut state = self.shared.lock();
        if state.disposed {
            drop(state);
            resource.close();
            return Err(CacheError::Disposed(self.shared.name.clone()).into());
        }
        let id = state.next_id;
        state.next_id += 1;
        state.stats.constructions += 1;
        state.entries.insert(
            key.clone(),
            Entry {
                id,
                resource: Arc::clone(&resource),
                ref_count: 1,
                created_at: now,
                last_used_at: now,
            },
        );
        tracing::debug!(cache = %self.shared.name, key = ?key, entries = state.entries.len(), "cache entry created");

        Ok(CacheLease {
            key,
            resource,
            owner: LeaseOwner::Cached {
                shared: Arc::clone(&self.shared),
                entry_id: id,
            },
            released: false,
        })
    }

    fn ensure_live(&self) -> std::result::Result<(), CacheError> {
        if self.shared.lock().disposed {
            Err(CacheError::Disposed(self.shared.name.clone()))
        } else {
            Ok(())
        }
    }

    fn try_hit(
        &self,
        key: &K,
        settings: &ChannelCacheSettings,
        now: Instant,
    ) -> Result<Option<CacheLease<K, V>>> {
        let mut closing = None;
        let hit = {
            let mut state = self.shared.lock();
            let state = &mut *state;
            if state.disposed {
                return Err(CacheError::Disposed(self.shared.name.clone()).into());
            }
            match state.entries.get_mut(key) {
                None => None,
                Some(entry)
                    if entry.evictable(settings, now) || entry.lease_expired(settings, now) =>
                {
                    if let Some(stale) = state.entries.remove(key) {
                        if stale.ref_count == 0 {
                            state.stats.evictions += 1;
                            closing = Some(stale.resource);
                        } else {
                            state.retired.insert(stale.id, stale);
                        }
                    }
                    None
                }
                Some(entry) => {
                    entry.ref_count += 1;
                    entry.last_used_at = now;
                    state.stats.hits += 1;
                    Some((Arc::clone(&entry.resource), entry.id))
                }
            }
        };
        if let Some(resource) = closing {
            tracing::debug!(cache = %self.shared.name, key = ?key, "stale entry evicted on access");
            resource.close();
        }
        Ok(hit.map(|(resource, entry_id)| CacheLease {
            key: key.clone(),
            resource,
            owner: LeaseOwner::Cached {
                shared: Arc::clone(&self.shared),
                entry_id,
            },
            released: false,
        }))
    }

    /// Free a slot for one more entry: expired entries first, then the
    /// least recently used unreferenced entry.
    fn make_room(
        state: &mut CacheState<K, V>,
        settings: &ChannelCacheSettings,
        now: Instant,
        closing: &mut Vec<Arc<V>>,
    ) -> std::result::Result<(), CacheError> {
        let capacity = settings.max_items_in_cache();
        if state.entries.len() < capacity {
            return Ok(());
        }

        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.evictable(settings, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(entry) = state.entries.remove(&key) {
                state.stats.evictions += 1;
                closing.push(entry.resource);
            }
        }

        while state.entries.len() >= capacity {
            let victim = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.ref_count == 0)
                .min_by_key(|(_, entry)| entry.last_used_at)
                .map(|(key, _)| key.clone());
            match victim.and_then(|key| state.entries.remove(&key)) {
                Some(entry) => {
                    state.stats.evictions += 1;
                    closing.push(entry.resource);
                }
                None => {
                    state.stats.capacity_rejections += 1;
                    return Err(CacheError::CapacityExhausted { capacity });
                }
            }
        }
        Ok(())
    }

    fn close_all(name: &str, resources: Vec<Arc<V>>) {
        if !resources.is_empty() {
            tracing::debug!(cache = %name, count = resources.len(), "closing evicted resources");
        }
        for resource in resources {
            resource.close();
        }
    }

    /// Evict idle and lease-expired entries. Returns how many were closed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`Self::sweep`] with an explicit clock reading.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let settings = self.settings();
        let closing = {
            let mut state = self.shared.lock();
            if state.disposed {
                return 0;
            }
            let stale: Vec<K> = state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry.evictable(&settings, now) || entry.lease_expired(&settings, now)
                })
                .map(|(key, _)| key.clone())
                .collect();

            let mut closing = Vec::new();
            for key in stale {
                if let Some(entry) = state.entries.remove(&key) {
                    if entry.ref_count == 0 {
                        state.stats.evictions += 1;
                        closing.push(entry.resource);
                    } else {
                        state.retired.insert(entry.id, entry);
                    }
                }
            }
            closing
        };
        let evicted = closing.len();
        Self::close_all(&self.shared.name, closing);
        evicted
    }

    /// Close every resource and refuse further use. Safe to call repeatedly.
    pub fn dispose(&self) {
        let closing: Vec<Arc<V>> = {
            let mut state = self.shared.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let entries = std::mem::take(&mut state.entries);
            let retired = std::mem::take(&mut state.retired);
            entries
                .into_values()
                .chain(retired.into_values())
                .map(|entry| entry.resource)
                .collect()
        };
        tracing::info!(cache = %self.shared.name, closed = closing.len(), "cache disposed");
        for resource in closing {
            resource.close();
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }

    /// Live (non-retired) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.shared.lock().entries.contains_key(key)
    }

    #[must_use]
    pub fn ref_count(&self, key: &K) -> Option<usize> {
        self.shared.lock().entries.get(key).map(|e| e.ref_count)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.shared.lock().stats.clone()
    }

    /// True when `entry` was handed out by this cache.
    #[must_use]
    pub fn owns(&self, entry: &CacheEntryRef<K, V>) -> bool {
        std::ptr::eq(entry.shared.as_ptr(), Arc::as_ptr(&self.shared))
    }

    /// Sweep on `interval` until `shutdown` is set or the cache is disposed.
    pub async fn run_sweeper(&self, interval: Duration, shutdown: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));

        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::SeqCst) || self.is_disposed() {
                break;
            }

            let evicted = self.sweep();
            if evicted > 0 {
                tracing::debug!(cache = %self.shared.name, evicted, "sweeper evicted entries");
            }
        }
    }
}

impl<K: CacheKey, V: CacheResource> fmt::Debug for ObjectCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ObjectCache")
            .field("name", &self.shared.name)
            .field("entries", &state.entries.len())
            .field("retired", &state.retired.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

// =============================================================================
// Leases
// =============================================================================

enum LeaseOwner<K: CacheKey, V: CacheResource> {
    Cached {
        shared: Arc<Shared<K, V>>,
        entry_id: u64,
    },
    /// Caching disabled; the lease owns its resource outright
    Detached,
}

/// A reference to a cached resource; released on drop
pub struct CacheLease<K: CacheKey, V: CacheResource> {
    key: K,
    resource: Arc<V>,
    owner: LeaseOwner<K, V>,
    released: bool,
}

impl<K: CacheKey, V: CacheResource> CacheLease<K, V> {
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    #[must_use]
    pub fn resource(&self) -> &Arc<V> {
        &self.resource
    }

    /// False when caching was disabled and this lease owns its resource.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self.owner, LeaseOwner::Cached { .. })
    }

    /// Handle to the entry that does not hold a reference.
    #[must_use]
    pub fn entry_ref(&self) -> Option<CacheEntryRef<K, V>> {
        match &self.owner {
            LeaseOwner::Cached { shared, entry_id } => Some(CacheEntryRef {
                shared: Arc::downgrade(shared),
                key: self.key.clone(),
                entry_id: *entry_id,
            }),
            LeaseOwner::Detached => None,
        }
    }

    pub fn release(self) {
        drop(self);
    }

    /// Release with an explicit clock reading.
    pub fn release_at(mut self, now: Instant) {
        self.release_inner(now);
    }

    fn release_inner(&mut self, now: Instant) {
        if self.released {
            return;
        }
        self.released = true;
        match &self.owner {
            LeaseOwner::Cached { shared, entry_id } => shared.release(&self.key, *entry_id, now),
            LeaseOwner::Detached => self.resource.close(),
        }
    }
}

impl<K: CacheKey, V: CacheResource> Deref for CacheLease<K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.resource
    }
}

impl<K: CacheKey, V: CacheResource> Drop for CacheLease<K, V> {
    fn drop(&mut self) {
        self.release_inner(Instant::now());
    }
}

impl<K: CacheKey, V: CacheResource> fmt::Debug for CacheLease<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLease")
            .field("key", &self.key)
            .field("cached", &self.is_cached())
            .finish()
    }
}

/// Non-owning pointer to a cache entry
pub struct CacheEntryRef<K: CacheKey, V: CacheResource> {
    shared: Weak<Shared<K, V>>,
    key: K,
    entry_id: u64,
}

impl<K: CacheKey, V: CacheResource> Clone for CacheEntryRef<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
            key: self.key.clone(),
            entry_id: self.entry_id,
        }
    }
}

impl<K: CacheKey, V: CacheResource> CacheEntryRef<K, V> {
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Take a new reference if the entry is still live and usable.
    #[must_use]
    pub fn try_add_reference(&self) -> Option<CacheLease<K, V>> {
        self.try_add_reference_at(Instant::now())
    }

    #[must_use]
    pub fn try_add_reference_at(&self, now: Instant) -> Option<CacheLease<K, V>> {
        let shared = self.shared.upgrade()?;
        let settings = shared.settings();
        let resource = {
            let mut state = shared.lock();
            let state = &mut *state;
            if state.disposed {
                return None;
            }
            let entry = state.entries.get_mut(&self.key)?;
            if entry.id != self.entry_id
                || !entry.resource.is_open()
                || entry.lease_expired(&settings, now)
            {
                return None;
            }
            entry.ref_count += 1;
            entry.last_used_at = now;
            state.stats.hits += 1;
            Arc::clone(&entry.resource)
        };
        Some(CacheLease {
            key: self.key.clone(),
            resource,
            owner: LeaseOwner::Cached {
                shared,
                entry_id: self.entry_id,
            },
            released: false,
        })
    }
}

impl<K: CacheKey, V: CacheResource> fmt::Debug for CacheEntryRef<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntryRef")
            .field("key", &self.key)
            .field("entry_id", &self.entry_id)
            .finish()
    }
}
