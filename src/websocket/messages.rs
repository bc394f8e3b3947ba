//! Wire types for the WS engine's message envelopes.
//!
//! Grounded on `wss/manager.py`'s `orjson.loads`/`dict.get("type")` handling
//! on the way in and the ad hoc response dicts (`{"type": "connected", ...}`,
//! `WSResponse`) on the way out.

use serde::Deserialize;
use serde_json::Value;

/// An inbound client frame. `data` defaults to `null` so dynamic handlers
/// can always read it without an extra `Option` check.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub data: Value,
}

pub fn error_frame(message: impl Into<String>) -> Value {
    serde_json::json!({ "type": "error", "message": message.into() })
}

pub fn welcome_frame(
    user_id: &str,
    session_id: &str,
    gateway_id: &str,
    ping_interval_secs: u64,
    inactivity_timeout_secs: u64,
) -> Value {
    serde_json::json!({
        "type": "connected",
        "message": "WebSocket connection established",
        "user_id": user_id,
        "session_id": session_id,
        "gateway_id": gateway_id,
        "ping_interval": ping_interval_secs,
        "inactivity_timeout": inactivity_timeout_secs,
    })
}

pub fn ping_frame(timestamp: i64) -> Value {
    serde_json::json!({ "type": "ping", "timestamp": timestamp })
}

pub fn pong_frame(timestamp: i64) -> Value {
    serde_json::json!({ "type": "pong", "timestamp": timestamp })
}

pub fn ack_frame(api_key: &str, session_id: &str, gateway_id: &str) -> Value {
    serde_json::json!({
        "type": "ack",
        "message": "API key update acknowledged",
        "api_key": api_key,
        "session_id": session_id,
        "gateway_id": gateway_id,
    })
}

pub fn dynamic_response_frame(name: &str, data: Value) -> Value {
    serde_json::json!({ "type": format!("{name}_response"), "data": data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frame_defaults_data_to_null() {
        let frame: InboundFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame.kind, "ping");
        assert_eq!(frame.data, serde_json::json!(null));
    }

    #[test]
    fn inbound_frame_reads_key_for_api_key_updates() {
        let frame: InboundFrame = serde_json::from_str(r#"{"type":"update_api_key","key":"sk-1"}"#).unwrap();
        assert_eq!(frame.key, Some("sk-1".to_string()));
    }

    #[test]
    fn dynamic_response_frame_suffixes_type() {
        let frame = dynamic_response_frame("widgets", serde_json::json!({"ok": true}));
        assert_eq!(frame["type"], "widgets_response");
    }
}
