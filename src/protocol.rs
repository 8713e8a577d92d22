//! Wire protocol for talking to the flight control server.
//!
//! Messages are JSON objects, one per WebSocket text frame or one per
//! newline-terminated line on plain TCP. A request is a flat object with a
//! generated `id` and a `type` tag:
//!
//! ```json
//! {"id": "550e8400-...", "type": "CONN-INF", "ids": ["gps", "radio"]}
//! ```
//!
//! A response carries the request id in `refs` and its payload in `body`:
//!
//! ```json
//! {"id": "...", "refs": "550e8400-...", "type": "CONN-INF", "body": {"status": {...}}}
//! ```
//!
//! A frame without `refs` is a server-initiated notification. Failures come
//! back as `ACK-NAK` frames with the reason in `body.error`.

use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{GroundlinkError, Result};

pub const SYS_VER: &str = "SYS-VER";
pub const SYS_PING: &str = "SYS-PING";
pub const SYS_TIME: &str = "SYS-TIME";
pub const CONN_LIST: &str = "CONN-LIST";
pub const CONN_INF: &str = "CONN-INF";
pub const CLK_LIST: &str = "CLK-LIST";
pub const CLK_INF: &str = "CLK-INF";
pub const OBJ_LIST: &str = "OBJ-LIST";
pub const DOCK_INF: &str = "DOCK-INF";
pub const BCN_INF: &str = "BCN-INF";
pub const BCN_PROPS: &str = "BCN-PROPS";
pub const EXT_INF: &str = "EXT-INF";
pub const LCN_INF: &str = "LCN-INF";
pub const SHOW_CFG: &str = "SHOW-CFG";
pub const DEV_LISTSUB: &str = "DEV-LISTSUB";
pub const ACK_ACK: &str = "ACK-ACK";
pub const ACK_NAK: &str = "ACK-NAK";

/// A request serialized for the wire, with the id that was stamped on it.
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    pub id: String,
    pub text: String,
}

/// Stamp a fresh id onto a request body and serialize it.
///
/// The message must be a JSON object with a string `type` field; everything
/// else is passed through untouched.
pub fn encode_request(mut message: Value) -> Result<EncodedRequest> {
    let obj = message
        .as_object_mut()
        .ok_or_else(|| GroundlinkError::Protocol("Request must be a JSON object".to_string()))?;
    match obj.get("type").and_then(Value::as_str) {
        Some(_) => {}
        None => {
            return Err(GroundlinkError::Protocol(
                "Request must carry a string 'type' field".to_string(),
            ))
        }
    }
    let id = Uuid::new_v4().to_string();
    obj.insert("id".to_string(), Value::String(id.clone()));
    let text = serde_json::to_string(&message)?;
    Ok(EncodedRequest { id, text })
}

/// A single parsed frame received from the server.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub id: String,
    /// Id of the request this frame answers, absent for notifications.
    pub refs: Option<String>,
    pub kind: String,
    pub body: Value,
}

/// Parse one frame of wire text.
pub fn decode_frame(text: &str) -> Result<InboundFrame> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GroundlinkError::Protocol("Frame is missing its 'type' field".to_string()))?
        .to_string();
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let refs = value
        .get("refs")
        .and_then(Value::as_str)
        .map(str::to_string);
    let body = value.get("body").cloned().unwrap_or(Value::Null);
    Ok(InboundFrame {
        id,
        refs,
        kind,
        body,
    })
}

/// Extract `body.version` from a SYS-VER response.
pub fn parse_version(body: &Value) -> Result<String> {
    body.get("version")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GroundlinkError::Protocol("Response has no 'version' field".to_string()))
}

/// Extract the `body.ids` string list from a listing response.
pub fn parse_ids(body: &Value) -> Result<Vec<String>> {
    let ids = body
        .get("ids")
        .and_then(Value::as_array)
        .ok_or_else(|| GroundlinkError::Protocol("Response has no 'ids' list".to_string()))?;
    ids.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| GroundlinkError::Protocol("Non-string id in 'ids' list".to_string()))
        })
        .collect()
}

/// Extract `body.timestamp` (milliseconds) from a SYS-TIME response.
pub fn parse_timestamp(body: &Value) -> Result<i64> {
    body.get("timestamp")
        .and_then(Value::as_i64)
        .ok_or_else(|| GroundlinkError::Protocol("Response has no 'timestamp' field".to_string()))
}

/// Deserialize the `body.status` map of a detail response into typed entries.
pub fn parse_status_map<T: serde::de::DeserializeOwned>(body: &Value) -> Result<HashMap<String, T>> {
    let status = body
        .get("status")
        .and_then(Value::as_object)
        .ok_or_else(|| GroundlinkError::Protocol("Response has no 'status' map".to_string()))?;
    status
        .iter()
        .map(|(id, entry)| {
            let parsed: T = serde_json::from_value(entry.clone())?;
            Ok((id.clone(), parsed))
        })
        .collect()
}

/// Human-readable failure reason of an ACK-NAK body.
pub fn nak_reason(body: &Value) -> String {
    match body.get("error").and_then(Value::as_str) {
        Some(reason) => reason.to_string(),
        None => body.to_string(),
    }
}

/// Build a bare request that carries only its type tag.
pub fn request(kind: &str) -> Value {
    Value::Object(Map::from_iter([(
        "type".to_string(),
        Value::String(kind.to_string()),
    )]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_request_stamps_id() {
        let encoded = encode_request(json!({"type": SYS_VER})).unwrap();
        let value: Value = serde_json::from_str(&encoded.text).unwrap();
        assert_eq!(value["type"], SYS_VER);
        assert_eq!(value["id"], encoded.id.as_str());
        assert!(!encoded.id.is_empty());
    }

    #[test]
    fn test_encode_request_rejects_bad_shapes() {
        assert!(encode_request(json!(["not", "an", "object"])).is_err());
        assert!(encode_request(json!({"ids": ["a"]})).is_err());
        assert!(encode_request(json!({"type": 42})).is_err());
    }

    #[test]
    fn test_decode_frame_response() {
        let frame = decode_frame(
            r#"{"id": "srv-1", "refs": "req-1", "type": "SYS-VER", "body": {"version": "2.0"}}"#,
        )
        .unwrap();
        assert_eq!(frame.id, "srv-1");
        assert_eq!(frame.refs.as_deref(), Some("req-1"));
        assert_eq!(frame.kind, SYS_VER);
        assert_eq!(frame.body["version"], "2.0");
    }

    #[test]
    fn test_decode_frame_notification_has_no_refs() {
        let frame = decode_frame(r#"{"id": "srv-2", "type": "CONN-INF", "body": {}}"#).unwrap();
        assert!(frame.refs.is_none());
    }

    #[test]
    fn test_decode_frame_missing_type() {
        assert!(decode_frame(r#"{"id": "x", "body": {}}"#).is_err());
        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version(&json!({"version": "2.1.0"})).unwrap(),
            "2.1.0"
        );
        assert!(parse_version(&json!({})).is_err());
    }

    #[test]
    fn test_parse_ids() {
        assert_eq!(
            parse_ids(&json!({"ids": ["a", "b"]})).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(parse_ids(&json!({"ids": ["a", 1]})).is_err());
        assert!(parse_ids(&json!({})).is_err());
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(
            parse_timestamp(&json!({"timestamp": 1700000000000i64})).unwrap(),
            1700000000000
        );
        assert!(parse_timestamp(&json!({"timestamp": "soon"})).is_err());
    }

    #[test]
    fn test_parse_status_map() {
        let body = json!({"status": {
            "gps": {"id": "gps", "purpose": "dgps"},
            "radio": {"id": "radio"}
        }});
        let parsed: HashMap<String, crate::model::ConnectionInfo> =
            parse_status_map(&body).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["gps"].purpose.as_deref(), Some("dgps"));
        assert!(parse_status_map::<crate::model::ConnectionInfo>(&json!({})).is_err());
    }

    #[test]
    fn test_nak_reason() {
        assert_eq!(
            nak_reason(&json!({"error": "no such command"})),
            "no such command"
        );
        assert_eq!(nak_reason(&json!({"code": 42})), r#"{"code":42}"#);
    }

    #[test]
    fn test_request_builder() {
        assert_eq!(request(SYS_PING), json!({"type": "SYS-PING"}));
    }
}
