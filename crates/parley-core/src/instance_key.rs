//! Instance keys: the identity a message is correlated under.
//!
//! A key is a UUID value plus an optional metadata bag. Equality and hashing
//! use the value only, so two keys computed from the same message content
//! compare equal even when one carries extra metadata.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Metadata name marking a transient key produced for request/reply pairing.
pub const REQUEST_REPLY_CORRELATION: &str = "parley.request_reply_correlation";

/// Namespace used when deriving a key value from a scope name and key data.
const KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1f_5a4e_2c1b_4d7e_9a3c_8b2e_0f4d_7c61);

/// A single metadata value attached to an instance key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum InstanceValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Id(Uuid),
}

impl From<&str> for InstanceValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<bool> for InstanceValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Identity under which a message is correlated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceKey {
    value: Uuid,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, InstanceValue>,
}

impl InstanceKey {
    #[must_use]
    pub fn new(value: Uuid) -> Self {
        Self {
            value,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(value: Uuid, metadata: BTreeMap<String, InstanceValue>) -> Self {
        Self { value, metadata }
    }

    /// The invalid (nil) key. Binding operations skip it.
    #[must_use]
    pub fn invalid() -> Self {
        Self::new(Uuid::nil())
    }

    /// Fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// Deterministic key for the given scope name and key data.
    ///
    /// Two messages carrying the same correlation values under the same
    /// scope produce the same key.
    #[must_use]
    pub fn derive(scope_name: &str, key_data: &str) -> Self {
        let mut name = String::with_capacity(scope_name.len() + key_data.len() + 1);
        name.push_str(scope_name);
        name.push('\n');
        name.push_str(key_data);
        Self::new(Uuid::new_v5(&KEY_NAMESPACE, name.as_bytes()))
    }

    /// Transient key marked for request/reply pairing.
    #[must_use]
    pub fn request_reply(value: Uuid) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            REQUEST_REPLY_CORRELATION.to_string(),
            InstanceValue::Bool(true),
        );
        Self { value, metadata }
    }

    #[must_use]
    pub fn value(&self) -> Uuid {
        self.value
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, InstanceValue> {
        &self.metadata
    }

    #[must_use]
    pub fn metadata_value(&self, name: &str) -> Option<&InstanceValue> {
        self.metadata.get(name)
    }

    pub fn insert_metadata(&mut self, name: impl Into<String>, value: InstanceValue) {
        self.metadata.insert(name.into(), value);
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.value.is_nil()
    }

    /// True when the metadata carries the request/reply marker.
    #[must_use]
    pub fn is_request_reply(&self) -> bool {
        self.metadata.contains_key(REQUEST_REPLY_CORRELATION)
    }
}

impl PartialEq for InstanceKey {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for InstanceKey {}

impl Hash for InstanceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value.hyphenated())
    }
}

impl From<Uuid> for InstanceKey {
    fn from(value: Uuid) -> Self {
        Self::new(value)
    }
}
