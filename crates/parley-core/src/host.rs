//! Seams to the hosting layer.
//!
//! The host owns transport, dispatch and persistence. parley-core calls it
//! through [`SendReceiveExtension`] once correlation is resolved, and asks a
//! [`CorrelationKeyCalculator`] to turn message content into instance keys.

use crate::bookmark::Bookmark;
use crate::error::Result;
use crate::handle::CorrelationHandle;
use crate::instance_key::InstanceKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Envelope version a message is written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageVersion {
    Soap11,
    #[default]
    Soap12,
    None,
}

/// Buffered message as seen by correlation. The body is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub action: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub version: MessageVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<CorrelationMessageProperty>,
}

impl Message {
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            headers: BTreeMap::new(),
            body: serde_json::Value::Null,
            version: MessageVersion::default(),
            correlation: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Make sure the message carries a request/reply transient key and
    /// return it.
    pub fn ensure_request_reply_key(&mut self) -> InstanceKey {
        let property = self.correlation.get_or_insert_with(CorrelationMessageProperty::default);
        if let Some(key) = property.request_reply_key() {
            return key.clone();
        }
        let key = InstanceKey::request_reply(Uuid::new_v4());
        property.transient_correlations.push(key.clone());
        key
    }
}

/// Per-send settings handed to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSettings {
    pub operation_name: String,
    pub action: String,
    pub is_one_way: bool,
    pub is_send_reply: bool,
    pub include_exception_detail_in_faults: bool,
    #[serde(default)]
    pub endpoint_address: Option<String>,
}

/// Per-receive settings handed to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveSettings {
    pub operation_name: String,
    pub action: String,
    pub can_create_instance: bool,
    pub scope_name: String,
}

/// Keys computed from a message: one primary key plus ordered auxiliary keys
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalculatedKeys {
    pub primary: Option<InstanceKey>,
    #[serde(default)]
    pub additional: Vec<InstanceKey>,
}

impl CalculatedKeys {
    #[must_use]
    pub fn primary_or_invalid(&self) -> InstanceKey {
        self.primary.clone().unwrap_or_else(InstanceKey::invalid)
    }
}

/// Correlation data the host attaches to a completed send
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CorrelationMessageProperty {
    pub correlation_key: Option<InstanceKey>,
    #[serde(default)]
    pub additional_keys: Vec<InstanceKey>,
    #[serde(default)]
    pub transient_correlations: Vec<InstanceKey>,
}

impl CorrelationMessageProperty {
    /// First transient key carrying the request/reply marker.
    #[must_use]
    pub fn request_reply_key(&self) -> Option<&InstanceKey> {
        self.transient_correlations
            .iter()
            .find(|key| key.is_request_reply())
    }
}

/// Computes instance keys from a buffered message
pub trait CorrelationKeyCalculator: Send + Sync {
    fn calculate(&self, message: &Message) -> Result<CalculatedKeys>;
}

/// Host-side delegate for transmission and receive registration
pub trait SendReceiveExtension: Send + Sync {
    /// Transmit `message`; the host resumes `on_send_complete` when done.
    fn send(
        &self,
        message: Message,
        settings: &SendSettings,
        correlates_with: Option<&Arc<CorrelationHandle>>,
        on_send_complete: &Bookmark,
    ) -> Result<()>;

    /// Abandon the operation waiting on `bookmark`.
    fn cancel(&self, bookmark: &Bookmark);

    /// Arrange for matching messages to resume `on_receive`.
    fn register_receive(
        &self,
        settings: &ReceiveSettings,
        correlates_with: Option<&Arc<CorrelationHandle>>,
        on_receive: &Bookmark,
    ) -> Result<()>;

    /// The conversation under `key` is over.
    fn on_uninitialize_correlation(&self, key: &InstanceKey);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_reply_key_picks_first_marked() {
        let marked_a = InstanceKey::request_reply(Uuid::new_v4());
        let marked_b = InstanceKey::request_reply(Uuid::new_v4());
        let property = CorrelationMessageProperty {
            correlation_key: None,
            additional_keys: Vec::new(),
            transient_correlations: vec![InstanceKey::generate(), marked_a.clone(), marked_b],
        };
        assert_eq!(property.request_reply_key(), Some(&marked_a));
        assert!(CorrelationMessageProperty::default().request_reply_key().is_none());
    }

    #[test]
    fn message_builder_and_serde() {
        let message = Message::new("SubmitOrder")
            .with_header("customer", "42")
            .with_body(serde_json::json!({ "total": 10 }));
        assert_eq!(message.header("customer"), Some("42"));

        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
        assert_eq!(back.version, MessageVersion::Soap12);
    }

    #[test]
    fn request_reply_key_added_once() {
        let mut message = Message::new("Quote");
        let first = message.ensure_request_reply_key();
        let second = message.ensure_request_reply_key();
        assert_eq!(first, second);
        assert!(first.is_request_reply());
        assert_eq!(message.correlation.unwrap().transient_correlations.len(), 1);
    }

    #[test]
    fn existing_transient_keys_are_kept() {
        let mut message = Message::new("Quote");
        message.correlation = Some(CorrelationMessageProperty {
            correlation_key: None,
            additional_keys: Vec::new(),
            transient_correlations: vec![InstanceKey::generate()],
        });
        message.ensure_request_reply_key();
        assert_eq!(message.correlation.unwrap().transient_correlations.len(), 2);
    }

    #[test]
    fn missing_primary_is_invalid_key() {
        let keys = CalculatedKeys::default();
        assert!(!keys.primary_or_invalid().is_valid());
    }
}
