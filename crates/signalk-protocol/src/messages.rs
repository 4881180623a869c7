//! Protocol message types for WebSocket and discovery.
//!
//! - Server → Client: Hello, Delta
//! - Client → Server: Subscribe, Unsubscribe
//!
//! Messages are serialized as JSON over WebSocket text frames.

use serde::{Deserialize, Serialize};
use signalk_core::Delta;

/// Subscription request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub context: String,
    pub subscribe: Vec<Subscription>,
}

/// A single subscription specification.
///
/// Only `path` drives filtering; `period` and `minPeriod` are kept for
/// logging, anything else a client sends is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    #[serde(rename = "minPeriod", skip_serializing_if = "Option::is_none")]
    pub min_period: Option<u64>,
}

impl Subscription {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            period: None,
            min_period: None,
        }
    }
}

/// Unsubscribe request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub context: String,
    pub unsubscribe: Vec<UnsubscribeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeSpec {
    pub path: String,
}

/// Auto-subscription requested on the upgrade URL (`?subscribe=`).
///
/// Any value other than `none` or `all` selects the self context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum SubscribeMode {
    /// No subscriptions until the client sends one.
    None,
    /// Every context, every path.
    All,
    /// The self context, every path.
    #[default]
    SelfOnly,
}

impl SubscribeMode {
    pub fn from_query(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Self::None,
            "all" => Self::All,
            _ => Self::SelfOnly,
        }
    }
}

impl From<String> for SubscribeMode {
    fn from(value: String) -> Self {
        Self::from_query(&value)
    }
}

// ============================================================================
// Hello Message (Server → Client on connect)
// ============================================================================

/// Hello message sent by server immediately on WebSocket connection.
///
/// # Example
/// ```json
/// {
///   "name": "signalk-pipeline",
///   "version": "1.7.0",
///   "self": "vessels.urn:mrn:signalk:uuid:c0d79334-4e25-4245-8892-54e8ccc8021d",
///   "roles": ["main", "master"],
///   "timestamp": "2024-01-17T10:30:00.000Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Server name identifier.
    pub name: String,

    /// SignalK protocol version supported.
    pub version: String,

    /// The "self" context identifier for this vessel.
    #[serde(rename = "self")]
    pub self_urn: String,

    pub roles: Vec<String>,

    /// Current server timestamp in ISO 8601 format.
    pub timestamp: String,
}

impl HelloMessage {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        self_urn: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            self_urn: self_urn.into(),
            roles: vec!["main".to_string(), "master".to_string()],
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

// ============================================================================
// Unified Message Enums
// ============================================================================

/// Messages that can be sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Hello(HelloMessage),
    Delta(Delta),
}

/// Messages that can be received from client.
///
/// Untagged: the variant is chosen by which list field is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
}

// ============================================================================
// Discovery Endpoint
// ============================================================================

/// Discovery response for `/signalk` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub endpoints: DiscoveryEndpoints,
    pub server: ServerInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryEndpoints {
    pub v1: DiscoveryV1,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryV1 {
    pub version: String,
    #[serde(rename = "signalk-http")]
    pub signalk_http: String,
    #[serde(rename = "signalk-ws")]
    pub signalk_ws: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub version: String,
}

impl DiscoveryResponse {
    /// Create a discovery response for the given `host:port` authority.
    pub fn new(authority: &str, server_id: &str, version: &str) -> Self {
        Self {
            endpoints: DiscoveryEndpoints {
                v1: DiscoveryV1 {
                    version: version.to_string(),
                    signalk_http: format!("http://{}/signalk/v3/api/", authority),
                    signalk_ws: format!("ws://{}/signalk/v1/stream", authority),
                },
            },
            server: ServerInfo {
                id: server_id.to_string(),
                version: version.to_string(),
            },
        }
    }
}
