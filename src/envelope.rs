// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Envelope Types
//!
//! JSON shapes carried inside decrypted frames.
//!
//! - The first envelope from a gateway is an [`AuthRequest`].
//! - Every later envelope, in both directions, is an [`Envelope`].
//!
//! Topics follow prefix conventions: gateways publish under `fd/` (from
//! device) and receive commands under `td/` (to device). The second topic
//! segment names the device.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix for topics published by gateways.
pub const FROM_DEVICE_PREFIX: &str = "fd";
/// Prefix for command topics sent to gateways.
pub const TO_DEVICE_PREFIX: &str = "td";

/// One-time authorization envelope, `{"uniqueId": ..., "token": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(rename = "uniqueId")]
    pub unique_id: String,
    pub token: String,
}

/// Envelope action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Publish,
    Subscribe,
}

/// Topic envelope exchanged after authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

impl Envelope {
    /// Builds a publish envelope.
    pub fn publish(topic: impl Into<String>, message: Value) -> Self {
        Envelope {
            action: Action::Publish,
            topic: topic.into(),
            message: Some(message),
        }
    }

    /// Builds a subscribe envelope (no message body).
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Envelope {
            action: Action::Subscribe,
            topic: topic.into(),
            message: None,
        }
    }

    /// Classifies the topic into a known family.
    pub fn kind(&self) -> TopicKind {
        TopicKind::classify(&self.topic)
    }
}

/// Known topic families. The message body is left as raw JSON for the
/// consuming layer to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    /// `fd/<device>/list`
    DeviceList { device: String },
    /// `fd/<device>/exposes`
    DeviceExposes { device: String },
    /// `fd/<device>/status`
    DeviceStatus { device: String },
    /// Any other `fd/<device>/...` topic.
    DeviceState { device: String },
    /// `td/...`
    Command,
    /// Unrecognized, kept for forward compatibility.
    Opaque,
}

impl TopicKind {
    pub fn classify(topic: &str) -> Self {
        let mut segments = topic.split('/');
        let prefix = segments.next().unwrap_or_default();
        if prefix == TO_DEVICE_PREFIX {
            return TopicKind::Command;
        }
        if prefix != FROM_DEVICE_PREFIX {
            return TopicKind::Opaque;
        }

        let device = match segments.next() {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => return TopicKind::Opaque,
        };
        let rest: Vec<&str> = segments.collect();
        match rest.as_slice() {
            [] => TopicKind::DeviceState { device },
            ["list"] => TopicKind::DeviceList { device },
            ["exposes"] => TopicKind::DeviceExposes { device },
            ["status"] => TopicKind::DeviceStatus { device },
            _ => TopicKind::DeviceState { device },
        }
    }

    /// Device key for device-scoped families.
    pub fn device(&self) -> Option<&str> {
        match self {
            TopicKind::DeviceList { device }
            | TopicKind::DeviceExposes { device }
            | TopicKind::DeviceStatus { device }
            | TopicKind::DeviceState { device } => Some(device),
            TopicKind::Command | TopicKind::Opaque => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auth_request_field_names() {
        let auth: AuthRequest =
            serde_json::from_str(r#"{"uniqueId":"dev-1","token":"abc"}"#).unwrap();
        assert_eq!(auth.unique_id, "dev-1");
        assert_eq!(auth.token, "abc");
    }

    #[test]
    fn test_auth_request_missing_token() {
        assert!(serde_json::from_str::<AuthRequest>(r#"{"uniqueId":"dev-1"}"#).is_err());
    }

    #[test]
    fn test_publish_serialization_order() {
        let env = Envelope::publish("td/dev-1/switch", json!({"on": 0}));
        assert_eq!(
            serde_json::to_string(&env).unwrap(),
            r#"{"action":"publish","topic":"td/dev-1/switch","message":{"on":0}}"#
        );
    }

    #[test]
    fn test_subscribe_omits_message() {
        let env = Envelope::subscribe("fd/#");
        assert_eq!(
            serde_json::to_string(&env).unwrap(),
            r#"{"action":"subscribe","topic":"fd/#"}"#
        );
    }

    #[test]
    fn test_unknown_action_rejected() {
        assert!(
            serde_json::from_str::<Envelope>(r#"{"action":"delete","topic":"fd/x"}"#).is_err()
        );
    }

    #[test]
    fn test_topic_classification() {
        let device = || "dev-1".to_string();
        assert_eq!(
            TopicKind::classify("fd/dev-1/list"),
            TopicKind::DeviceList { device: device() }
        );
        assert_eq!(
            TopicKind::classify("fd/dev-1/exposes"),
            TopicKind::DeviceExposes { device: device() }
        );
        assert_eq!(
            TopicKind::classify("fd/dev-1/status"),
            TopicKind::DeviceStatus { device: device() }
        );
        assert_eq!(
            TopicKind::classify("fd/dev-1/1"),
            TopicKind::DeviceState { device: device() }
        );
        assert_eq!(
            TopicKind::classify("fd/dev-1/1/brightness"),
            TopicKind::DeviceState { device: device() }
        );
        assert_eq!(TopicKind::classify("td/dev-1/switch"), TopicKind::Command);
        assert_eq!(TopicKind::classify("fd"), TopicKind::Opaque);
        assert_eq!(TopicKind::classify("fd//list"), TopicKind::Opaque);
        assert_eq!(TopicKind::classify("zigbee/bridge"), TopicKind::Opaque);
    }
}
