//! WebSocket connect protocol spoken by nodes and operators.
//!
//! After the upgrade the client sends one connect frame declaring its role
//! and surfaces; the gateway answers with an acceptance frame or a close
//! frame carrying a rejection reason.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const GATEWAY_WS_HEARTBEAT_INTERVAL_SECONDS: u64 = 15;
pub const GATEWAY_WS_CONNECT_FRAME_TIMEOUT_SECONDS: u64 = 10;

pub const GATEWAY_WS_CLOSE_REASON_INVALID_CONNECT_FRAME: &str = "invalid_connect_frame";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// The two WebSocket client populations.
pub enum GatewayPeerRole {
    /// Device-side client exposing invokable capabilities.
    Node,
    /// Control-side client initiating runs and observing state.
    Operator,
}

impl GatewayPeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Operator => "operator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
/// First frame a client sends after the upgrade.
pub struct GatewayConnectFrame {
    pub role: GatewayPeerRole,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub client: Value,
    #[serde(default, rename = "userAgent")]
    pub user_agent: Option<String>,
    #[serde(default, rename = "orgId")]
    pub org_id: Option<String>,
    #[serde(default, rename = "projectId")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default, rename = "presenceKey")]
    pub presence_key: Option<String>,
}

/// Parses the connect frame; the error string is safe to echo in a close
/// frame.
pub fn parse_gateway_connect_frame(raw: &str) -> Result<GatewayConnectFrame, String> {
    serde_json::from_str::<GatewayConnectFrame>(raw)
        .map_err(|error| format!("invalid connect frame: {error}"))
}

/// Acceptance frame sent once a connect frame is registered.
pub fn build_gateway_accept_frame(connection_id: &str) -> Value {
    json!({
        "type": "accepted",
        "connectionId": connection_id,
        "heartbeatSeconds": GATEWAY_WS_HEARTBEAT_INTERVAL_SECONDS,
    })
}

/// Close frame carrying a rejection reason from the authorizer or the
/// connect-frame validation.
pub fn build_gateway_close_frame(reason: &str, detail: Option<&str>) -> Value {
    let mut frame = json!({
        "type": "close",
        "reason": reason,
    });
    if let Some(detail) = detail {
        frame["detail"] = Value::String(detail.to_string());
    }
    frame
}
