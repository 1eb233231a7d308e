//! Metadata handed to the durable persistence layer.
//!
//! The persistence layer is outside this crate. It receives an
//! [`InstancingOptions`] describing what to store for the instance owner and
//! for the initial instance, and the instance keys to associate, in a form
//! it can write with serde.

use crate::instance_key::{InstanceKey, InstanceValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Metadata name recording which host type owns persisted instances.
pub const HOST_TYPE: &str = "parley.host_type";

/// Metadata name for the workflow definition identity.
pub const DEFINITION_IDENTITY: &str = "parley.definition_identity";

/// How a stored value may be used once written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataAccess {
    /// Loaded back with the instance
    ReadWrite,
    /// Stored for queries and tooling, never loaded back
    WriteOnly,
}

/// One stored metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataValue {
    pub value: InstanceValue,
    pub access: MetadataAccess,
    /// The store may drop the value instead of failing the write
    #[serde(default)]
    pub optional: bool,
}

/// Named metadata values for one persisted record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataBag {
    values: BTreeMap<String, MetadataValue>,
}

impl MetadataBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name`. A later write of the same name replaces the earlier one.
    pub fn insert(&mut self, name: impl Into<String>, value: InstanceValue, access: MetadataAccess) {
        self.values.insert(
            name.into(),
            MetadataValue {
                value,
                access,
                optional: false,
            },
        );
    }

    /// Set `name` as an optional value.
    pub fn insert_optional(
        &mut self,
        name: impl Into<String>,
        value: InstanceValue,
        access: MetadataAccess,
    ) {
        self.values.insert(
            name.into(),
            MetadataValue {
                value,
                access,
                optional: true,
            },
        );
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MetadataValue> {
        self.values.get(name)
    }

    /// Values that are loaded back with the instance.
    pub fn read_write(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.filtered(MetadataAccess::ReadWrite)
    }

    /// Values that are stored but never loaded back.
    pub fn write_only(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.filtered(MetadataAccess::WriteOnly)
    }

    fn filtered(&self, access: MetadataAccess) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.values
            .iter()
            .filter(move |(_, v)| v.access == access)
            .map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Instance key in the shape the store writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableInstanceKey {
    pub value: Uuid,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, InstanceValue>,
}

impl From<&InstanceKey> for SerializableInstanceKey {
    fn from(key: &InstanceKey) -> Self {
        Self {
            value: key.value(),
            metadata: key.metadata().clone(),
        }
    }
}

impl From<SerializableInstanceKey> for InstanceKey {
    fn from(key: SerializableInstanceKey) -> Self {
        InstanceKey::with_metadata(key.value, key.metadata)
    }
}

/// Everything the persistence layer stores for a host and its first instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstancingOptions {
    pub owner: MetadataBag,
    pub instance: MetadataBag,
    /// Keys to associate with the instance when it is first persisted
    #[serde(default)]
    pub keys: Vec<SerializableInstanceKey>,
}

impl InstancingOptions {
    /// Options for a host of type `host_type`.
    #[must_use]
    pub fn for_host(host_type: &str) -> Self {
        let mut options = Self::default();
        options
            .owner
            .insert(HOST_TYPE, InstanceValue::from(host_type), MetadataAccess::ReadWrite);
        options
            .instance
            .insert(HOST_TYPE, InstanceValue::from(host_type), MetadataAccess::ReadWrite);
        options
    }

    /// Record the definition identity on the instance; optional so stores
    /// that do not track identities accept it.
    #[must_use]
    pub fn with_definition_identity(mut self, identity: &str) -> Self {
        self.instance.insert_optional(
            DEFINITION_IDENTITY,
            InstanceValue::from(identity),
            MetadataAccess::ReadWrite,
        );
        self
    }

    /// Add caller-supplied values to the initial instance as optional,
    /// write-only metadata.
    pub fn add_initial_instance_values(
        &mut self,
        values: impl IntoIterator<Item = (String, InstanceValue)>,
    ) {
        for (name, value) in values {
            self.instance
                .insert_optional(name, value, MetadataAccess::WriteOnly);
        }
    }

    /// Associate `key` with the instance. Invalid keys and repeats are skipped.
    pub fn associate_key(&mut self, key: &InstanceKey) {
        if !key.is_valid() || self.keys.iter().any(|k| k.value == key.value()) {
            return;
        }
        self.keys.push(SerializableInstanceKey::from(key));
    }

    /// Keys to associate, back in their in-memory form.
    #[must_use]
    pub fn instance_keys(&self) -> Vec<InstanceKey> {
        self.keys.iter().cloned().map(InstanceKey::from).collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_type_on_owner_and_instance() {
        let options = InstancingOptions::for_host("parley");
        assert_eq!(
            options.owner.get(HOST_TYPE).map(|v| &v.value),
            Some(&InstanceValue::Text("parley".into()))
        );
        assert_eq!(options.instance.read_write().count(), 1);
        assert_eq!(options.instance.write_only().count(), 0);
    }

    #[test]
    fn initial_values_are_write_only_and_optional() {
        let mut options = InstancingOptions::for_host("parley");
        options.add_initial_instance_values([
            ("customer".to_string(), InstanceValue::from("c-42")),
            ("priority".to_string(), InstanceValue::Int(3)),
        ]);
        let written: Vec<_> = options.instance.write_only().map(|(k, _)| k).collect();
        assert_eq!(written, vec!["customer", "priority"]);
        assert!(options.instance.write_only().all(|(_, v)| v.optional));
    }

    #[test]
    fn keys_keep_metadata_and_skip_repeats() {
        let mut options = InstancingOptions::default();
        let key = InstanceKey::request_reply(Uuid::new_v4());
        options.associate_key(&key);
        options.associate_key(&key);
        options.associate_key(&InstanceKey::invalid());

        let keys = options.instance_keys();
        assert_eq!(keys, vec![key]);
        assert!(keys[0].is_request_reply());
    }

    #[test]
    fn json_shape_is_stable() {
        let mut options = InstancingOptions::for_host("parley").with_definition_identity("orders v2");
        options.associate_key(&InstanceKey::generate());

        let json = options.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["owner"][HOST_TYPE]["access"], "read_write");
        assert_eq!(value["instance"][DEFINITION_IDENTITY]["optional"], true);
        assert!(value["keys"][0].get("metadata").is_none());

        assert_eq!(InstancingOptions::from_json(&json).unwrap(), options);
    }
}
