//! Reverse tunnel between cluster agents and the dashboard.
//!
//! - **Client** (agent side): dials out to the dashboard, registers once, then
//!   streams requests, heartbeats and watch traffic over one WebSocket.
//! - **Relay** (dashboard side): accepts agent registrations and streams,
//!   correlates proxied requests with responses and feeds watch events into
//!   the subscriber hub.
//!
//! Every frame is a JSON text message tagged by `"type"`. Request and response
//! bodies are carried as base64 strings.

pub mod client;
pub mod credentials;
pub mod relay;
pub mod transport;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An API request tunnelled from the dashboard to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Correlation id, echoed on the matching [`ApiResponse`].
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

/// The agent's answer to an [`ApiRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Plain-text error response for a request that could not be served.
    pub fn error(id: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        Self {
            id: id.into(),
            status,
            headers,
            body: message.into().into_bytes(),
        }
    }
}

/// Summary of the agent's cluster, sent once per stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub platform: String,
    pub version: String,
    pub node_count: usize,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub crds: Vec<String>,
}

/// Kind of change carried by a [`WatchEventMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    /// Synthetic: the watch could not be opened. `object` holds the reason.
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Error => "ERROR",
        }
    }
}

/// One resource change for an active watch subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEventMessage {
    pub subscription_id: String,
    pub event_type: EventType,
    pub object: Value,
}

/// Frames the dashboard sends to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardMessage {
    Request(ApiRequest),
    Ping,
    WatchSubscribe {
        subscription_id: String,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource_version: Option<String>,
    },
    WatchUnsubscribe {
        subscription_id: String,
    },
}

/// Frames an agent sends to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Response(ApiResponse),
    Pong {
        /// Agent wall clock, unix milliseconds.
        timestamp: i64,
    },
    ClusterInfo(ClusterInfo),
    WatchEvent(WatchEventMessage),
}

/// Out-of-band registration request (`POST /api/agent/register`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// One-time bootstrap token.
    pub token: String,
    pub cluster_name: String,
}

/// Registration result: the permanent identity of the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub cluster_id: String,
    /// Permanent credential presented on every stream open.
    pub token: String,
}

/// Serde adapter storing bodies as standard base64 strings.
mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_shape() {
        let frame: DashboardMessage = serde_json::from_value(json!({
            "type": "request",
            "id": "r1",
            "method": "GET",
            "path": "/api/v1/namespaces",
            "body": "aGk=",
        }))
        .unwrap();
        let DashboardMessage::Request(req) = frame else {
            panic!("expected request");
        };
        assert_eq!(req.body, b"hi");
        assert!(req.headers.is_empty());
    }

    #[test]
    fn test_ping_and_unsubscribe_frames() {
        let ping: DashboardMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, DashboardMessage::Ping);

        let unsub: DashboardMessage =
            serde_json::from_str(r#"{"type":"watch_unsubscribe","subscription_id":"s1"}"#)
                .unwrap();
        assert_eq!(
            unsub,
            DashboardMessage::WatchUnsubscribe {
                subscription_id: "s1".into()
            }
        );
    }

    #[test]
    fn test_watch_event_uses_uppercase_types() {
        let msg = AgentMessage::WatchEvent(WatchEventMessage {
            subscription_id: "s1".into(),
            event_type: EventType::Deleted,
            object: json!({"metadata": {"name": "web"}}),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "watch_event");
        assert_eq!(value["event_type"], "DELETED");
        assert_eq!(value["object"]["metadata"]["name"], "web");
    }

    #[test]
    fn test_invalid_base64_body_is_rejected() {
        let res = serde_json::from_value::<DashboardMessage>(json!({
            "type": "request",
            "id": "r1",
            "method": "GET",
            "path": "/",
            "body": "%%%",
        }));
        assert!(res.is_err());
    }
}
