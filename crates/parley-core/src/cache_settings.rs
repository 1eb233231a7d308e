//! Pool settings shared by the factory and channel caches.

use crate::error::CacheError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Largest finite timeout a pool accepts.
pub const MAX_TIMEOUT_MS: u64 = i32::MAX as u64;

/// Largest item count a pool accepts.
pub const MAX_ITEMS: usize = i32::MAX as usize;

/// Pool timeout: a finite duration or infinite.
///
/// Serialized as a millisecond count or the string `"infinite"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTimeout {
    Infinite,
    After(Duration),
}

impl CacheTimeout {
    #[must_use]
    pub fn from_millis(ms: u64) -> Self {
        Self::After(Duration::from_millis(ms))
    }

    #[must_use]
    pub fn is_infinite(self) -> bool {
        matches!(self, Self::Infinite)
    }

    /// True once `elapsed` reaches the timeout.
    #[must_use]
    pub fn is_expired(self, elapsed: Duration) -> bool {
        match self {
            Self::Infinite => false,
            Self::After(limit) => elapsed >= limit,
        }
    }

    fn check(self, name: &str) -> Result<Self, CacheError> {
        match self {
            Self::After(d) if d.as_millis() > u128::from(MAX_TIMEOUT_MS) => {
                Err(CacheError::InvalidSetting {
                    name: name.to_string(),
                    value: format!("{}ms", d.as_millis()),
                })
            }
            other => Ok(other),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TimeoutRepr {
    Millis(u64),
    Keyword(String),
}

impl Serialize for CacheTimeout {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Infinite => TimeoutRepr::Keyword("infinite".to_string()),
            Self::After(d) => TimeoutRepr::Millis(d.as_millis() as u64),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CacheTimeout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match TimeoutRepr::deserialize(deserializer)? {
            TimeoutRepr::Millis(ms) => Ok(Self::from_millis(ms)),
            TimeoutRepr::Keyword(word) if word.eq_ignore_ascii_case("infinite") => {
                Ok(Self::Infinite)
            }
            TimeoutRepr::Keyword(word) => Err(serde::de::Error::custom(format!(
                "expected milliseconds or \"infinite\", got \"{word}\""
            ))),
        }
    }
}

/// Pool settings: idle timeout, lease timeout and capacity.
///
/// A capacity of zero disables caching; every lease then owns a private
/// resource that is closed on release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelCacheSettings {
    idle_timeout: CacheTimeout,
    lease_timeout: CacheTimeout,
    max_items_in_cache: usize,
}

impl ChannelCacheSettings {
    /// Defaults for the channel factory pool: idle 2 min, no lease limit.
    #[must_use]
    pub fn factory_defaults() -> Self {
        Self {
            idle_timeout: CacheTimeout::After(Duration::from_secs(120)),
            lease_timeout: CacheTimeout::Infinite,
            max_items_in_cache: 16,
        }
    }

    /// Defaults for per-factory channel pools: idle 2 min, lease 10 min.
    #[must_use]
    pub fn channel_defaults() -> Self {
        Self {
            idle_timeout: CacheTimeout::After(Duration::from_secs(120)),
            lease_timeout: CacheTimeout::After(Duration::from_secs(600)),
            max_items_in_cache: 16,
        }
    }

    /// Settings that disable caching entirely.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            idle_timeout: CacheTimeout::After(Duration::ZERO),
            lease_timeout: CacheTimeout::After(Duration::ZERO),
            max_items_in_cache: 0,
        }
    }

    pub fn new(
        idle_timeout: CacheTimeout,
        lease_timeout: CacheTimeout,
        max_items_in_cache: usize,
    ) -> Result<Self, CacheError> {
        let mut settings = Self::channel_defaults();
        settings.set_idle_timeout(idle_timeout)?;
        settings.set_lease_timeout(lease_timeout)?;
        settings.set_max_items_in_cache(max_items_in_cache)?;
        Ok(settings)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> CacheTimeout {
        self.idle_timeout
    }

    #[must_use]
    pub fn lease_timeout(&self) -> CacheTimeout {
        self.lease_timeout
    }

    #[must_use]
    pub fn max_items_in_cache(&self) -> usize {
        self.max_items_in_cache
    }

    #[must_use]
    pub fn caching_disabled(&self) -> bool {
        self.max_items_in_cache == 0
    }

    pub fn set_idle_timeout(&mut self, timeout: CacheTimeout) -> Result<(), CacheError> {
        self.idle_timeout = timeout.check("idle_timeout")?;
        Ok(())
    }

    pub fn set_lease_timeout(&mut self, timeout: CacheTimeout) -> Result<(), CacheError> {
        self.lease_timeout = timeout.check("lease_timeout")?;
        Ok(())
    }

    pub fn set_max_items_in_cache(&mut self, max: usize) -> Result<(), CacheError> {
        if max > MAX_ITEMS {
            return Err(CacheError::InvalidSetting {
                name: "max_items_in_cache".to_string(),
                value: max.to_string(),
            });
        }
        self.max_items_in_cache = max;
        Ok(())
    }

    /// Re-check values that bypassed the setters (deserialization).
    pub fn validate(&self) -> Result<(), CacheError> {
        self.idle_timeout.check("idle_timeout")?;
        self.lease_timeout.check("lease_timeout")?;
        if self.max_items_in_cache > MAX_ITEMS {
            return Err(CacheError::InvalidSetting {
                name: "max_items_in_cache".to_string(),
                value: self.max_items_in_cache.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ChannelCacheSettings {
    fn default() -> Self {
        Self::channel_defaults()
    }
}
