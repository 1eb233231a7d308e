//! Property-based tests for the leased object cache.
//!
//! Verifies cache invariants under arbitrary get/release/advance/sweep
//! sequences driven by an explicit clock:
//! - live entries never exceed max_items_in_cache
//! - a resource with an outstanding lease is never closed
//! - no resource is closed twice
//! - every get counts exactly one hit or one miss
//! - once every lease is released and the idle timeout has passed, a sweep
//!   leaves the cache empty with every resource closed exactly once
//! - dispose closes every resource exactly once, leased or not

mod common;

use common::Tracked;
use parley_core::cache_settings::{CacheTimeout, ChannelCacheSettings};
use parley_core::object_cache::{CacheLease, ObjectCache};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Get(u8),
    Release(usize),
    Advance(u64),
    Sweep,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..6).prop_map(Op::Get),
        3 => (0usize..16).prop_map(Op::Release),
        2 => (1u64..40).prop_map(Op::Advance),
        1 => Just(Op::Sweep),
    ]
}

fn arb_settings() -> impl Strategy<Value = ChannelCacheSettings> {
    (
        5u64..60,
        prop_oneof![
            Just(CacheTimeout::Infinite),
            (10u64..120).prop_map(CacheTimeout::from_millis),
        ],
        1usize..5,
    )
        .prop_map(|(idle, lease, max)| {
            ChannelCacheSettings::new(CacheTimeout::from_millis(idle), lease, max).unwrap()
        })
}

struct Harness {
    cache: ObjectCache<u8, Tracked>,
    created: Vec<Arc<Tracked>>,
    leases: Vec<CacheLease<u8, Tracked>>,
    now: Instant,
    gets: u64,
}

impl Harness {
    fn new(settings: ChannelCacheSettings) -> Self {
        Self {
            cache: ObjectCache::new("prop", settings),
            created: Vec::new(),
            leases: Vec::new(),
            now: Instant::now(),
            gets: 0,
        }
    }

    fn apply(&mut self, op: &Op) {
        match op {
            Op::Get(key) => {
                self.gets += 1;
                let id = self.created.len();
                let mut built = None;
                let result = self.cache.get_or_create_at(*key, self.now, || {
                    let resource = Tracked::new(id);
                    built = Some(());
                    Ok(resource)
                });
                if let Ok(lease) = result {
                    if built.is_some() {
                        self.created.push(Arc::clone(lease.resource()));
                    }
                    self.leases.push(lease);
                }
            }
            Op::Release(index) => {
                if !self.leases.is_empty() {
                    let lease = self.leases.remove(index % self.leases.len());
                    lease.release_at(self.now);
                }
            }
            Op::Advance(ms) => self.now += Duration::from_millis(*ms),
            Op::Sweep => {
                self.cache.sweep_at(self.now);
            }
        }
    }

    fn release_all(&mut self) {
        for lease in self.leases.drain(..) {
            lease.release_at(self.now);
        }
    }
}

// ────────────────────────────────────────────────────────────────────
// Invariants during a run
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Capacity holds and leased resources stay open after every step.
    #[test]
    fn prop_capacity_and_leases_respected(
        settings in arb_settings(),
        ops in prop::collection::vec(arb_op(), 1..80),
    ) {
        let capacity = settings.max_items_in_cache();
        let mut h = Harness::new(settings);
        for op in &ops {
            h.apply(op);
            prop_assert!(h.cache.len() <= capacity);
            for lease in &h.leases {
                prop_assert_eq!(lease.resource().close_count(), 0, "leased resource closed");
            }
            for resource in &h.created {
                prop_assert!(resource.close_count() <= 1, "resource {} closed twice", resource.id);
            }
        }
    }

    /// Every get is one hit or one miss, and constructions match creations.
    #[test]
    fn prop_stats_account_for_every_get(
        settings in arb_settings(),
        ops in prop::collection::vec(arb_op(), 1..80),
    ) {
        let mut h = Harness::new(settings);
        for op in &ops {
            h.apply(op);
        }
        let stats = h.cache.stats();
        prop_assert_eq!(stats.hits + stats.misses, h.gets);
        prop_assert_eq!(stats.constructions, h.created.len() as u64);
    }

    /// Releasing everything and sweeping past the idle timeout drains the cache.
    #[test]
    fn prop_quiescent_sweep_closes_everything_once(
        settings in arb_settings(),
        ops in prop::collection::vec(arb_op(), 1..80),
    ) {
        let mut h = Harness::new(settings);
        for op in &ops {
            h.apply(op);
        }
        h.release_all();
        h.now += Duration::from_secs(1);
        h.cache.sweep_at(h.now);

        prop_assert!(h.cache.is_empty());
        for resource in &h.created {
            prop_assert_eq!(resource.close_count(), 1, "resource {}", resource.id);
        }
    }

    /// Dispose closes leased and idle resources alike, exactly once.
    #[test]
    fn prop_dispose_closes_everything_once(
        settings in arb_settings(),
        ops in prop::collection::vec(arb_op(), 1..80),
    ) {
        let mut h = Harness::new(settings);
        for op in &ops {
            h.apply(op);
        }
        h.cache.dispose();
        h.cache.dispose();
        h.release_all();

        prop_assert!(h.cache.is_disposed());
        prop_assert!(h.cache.get_or_create(0, || Ok(Tracked::new(usize::MAX))).is_err());
        for resource in &h.created {
            prop_assert_eq!(resource.close_count(), 1, "resource {}", resource.id);
        }
    }
}
