//! Operation descriptions and their default message formatter.
//!
//! [`default_formatter`] is a pure function of the description: two calls
//! with equal descriptions produce equal formatters.

use crate::error::{Error, ReplyFault, Result};
use crate::host::{Message, MessageVersion};
use serde::{Deserialize, Serialize};

/// Action carried by fault messages.
pub const FAULT_ACTION: &str = "http://www.w3.org/2005/08/addressing/soap/fault";

/// Default contract namespace.
pub const DEFAULT_NAMESPACE: &str = "http://tempuri.org/";

/// Contract-level description of one operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationDescription {
    pub name: String,
    pub contract: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub reply_action: Option<String>,
    #[serde(default)]
    pub is_one_way: bool,
    #[serde(default)]
    pub version: MessageVersion,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl OperationDescription {
    #[must_use]
    pub fn new(name: impl Into<String>, contract: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contract: contract.into(),
            namespace: default_namespace(),
            action: None,
            reply_action: None,
            is_one_way: false,
            version: MessageVersion::default(),
        }
    }

    #[must_use]
    pub fn one_way(mut self) -> Self {
        self.is_one_way = true;
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    #[must_use]
    pub fn with_reply_action(mut self, action: impl Into<String>) -> Self {
        self.reply_action = Some(action.into());
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: MessageVersion) -> Self {
        self.version = version;
        self
    }

    /// Explicit action, else `{namespace}{contract}/{name}`.
    #[must_use]
    pub fn resolved_action(&self) -> String {
        self.action.clone().unwrap_or_else(|| {
            let separator = if self.namespace.ends_with('/') { "" } else { "/" };
            format!("{}{separator}{}/{}", self.namespace, self.contract, self.name)
        })
    }

    /// Explicit reply action, else the request action plus `Response`.
    #[must_use]
    pub fn resolved_reply_action(&self) -> String {
        self.reply_action
            .clone()
            .unwrap_or_else(|| format!("{}Response", self.resolved_action()))
    }
}

/// Turns operation parameters into messages and back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFormatter {
    action: String,
    reply_action: String,
    version: MessageVersion,
    is_one_way: bool,
}

/// Formatter for `operation` with the operation's own actions and version.
#[must_use]
pub fn default_formatter(operation: &OperationDescription) -> MessageFormatter {
    MessageFormatter {
        action: operation.resolved_action(),
        reply_action: operation.resolved_reply_action(),
        version: operation.version,
        is_one_way: operation.is_one_way,
    }
}

impl MessageFormatter {
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    #[must_use]
    pub fn reply_action(&self) -> &str {
        &self.reply_action
    }

    #[must_use]
    pub fn serialize_request(&self, parameters: serde_json::Value) -> Message {
        let mut message = Message::new(self.action.clone()).with_body(parameters);
        message.version = self.version;
        message
    }

    /// Reply message in `version`, which comes from the request being answered.
    pub fn serialize_reply(&self, result: serde_json::Value, version: MessageVersion) -> Result<Message> {
        if self.is_one_way {
            return Err(crate::error::CorrelationError::InvalidSendState(format!(
                "one-way operation '{}' has no reply",
                self.action
            ))
            .into());
        }
        let mut message = Message::new(self.reply_action.clone()).with_body(result);
        message.version = version;
        Ok(message)
    }

    /// Fault message; the detail is dropped unless `include_detail` is set.
    #[must_use]
    pub fn serialize_fault(&self, fault: &ReplyFault, include_detail: bool, version: MessageVersion) -> Message {
        let detail = fault.detail.as_ref().filter(|_| include_detail);
        let mut message = Message::new(FAULT_ACTION).with_body(serde_json::json!({
            "message": fault.message,
            "detail": detail,
        }));
        message.version = version;
        message
    }

    /// Reply body, or the fault a fault message carries.
    pub fn deserialize_reply(&self, reply: &Message) -> Result<serde_json::Value> {
        if reply.action == FAULT_ACTION {
            let message = reply
                .body
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("remote fault");
            let mut fault = ReplyFault::new(message);
            if let Some(detail) = reply.body.get("detail").and_then(serde_json::Value::as_str) {
                fault = fault.with_detail(detail);
            }
            return Err(Error::Fault(fault));
        }
        Ok(reply.body.clone())
    }
}
