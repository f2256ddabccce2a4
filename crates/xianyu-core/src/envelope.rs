//! Protocol envelope model
//!
//! Every frame exchanged with the server is a JSON object carrying a route
//! (`lwp`), a header map with at least a message id (`mid`), an optional status
//! `code` and an optional `body`. Outbound envelopes are always built whole by
//! the constructors in this module before they reach the send path.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::DecodeError;

// ----------------------------------------------------------------------------
// Route Strings
// ----------------------------------------------------------------------------

/// Route strings of the protocol. These must match the server byte-for-byte.
pub mod routes {
    /// Keep-alive
    pub const HEARTBEAT: &str = "/!";
    /// Session registration
    pub const REGISTER: &str = "/reg";
    /// Sync status acknowledgement
    pub const SYNC_ACK: &str = "/r/SyncStatus/ackDiff";
    /// Chat message send
    pub const SEND_MESSAGE: &str = "/r/MessageSend/sendByReceiverScope";
}

/// Status code marking a successful response
pub const STATUS_OK: i64 = 200;

/// Fixed mid used by the sync acknowledgement
const SYNC_ACK_MID: &str = "5701741704675979 0";

/// Headers echoed from an inbound frame into its generic ack
const ACK_PASSTHROUGH_HEADERS: [&str; 3] = ["app-key", "ua", "dt"];

/// Suffix the server appends to user and conversation ids
pub const ID_DOMAIN_SUFFIX: &str = "@goofish";

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// One protocol frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Route of the logical operation, absent on responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lwp: Option<String>,
    #[serde(default)]
    pub headers: Map<String, Value>,
    /// Status code, present on responses and acks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Envelope {
    /// Parse a text frame. The frame must be a JSON object.
    pub fn parse(frame: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(frame)?;
        if !value.is_object() {
            return Err(DecodeError::EnvelopeMismatch {
                reason: "frame is not a JSON object".into(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize to the wire representation
    pub fn to_json(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Message id, if present and a string
    pub fn mid(&self) -> Option<&str> {
        self.header(HEADER_MID)
    }

    /// Whether the frame carries a message id of any JSON type
    pub fn has_mid(&self) -> bool {
        self.headers.contains_key(HEADER_MID)
    }

    /// String header by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(Value::as_str)
    }

    /// Numeric status code, if present. Integral floats such as `200.0`
    /// count as their integer value.
    pub fn status_code(&self) -> Option<i64> {
        let code = self.code.as_ref()?;
        code.as_i64().or_else(|| {
            code.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() <= i64::MAX as f64)
                .map(|f| f as i64)
        })
    }

    /// Whether the envelope answers a request successfully
    pub fn is_success(&self) -> bool {
        self.has_mid() && self.status_code() == Some(STATUS_OK)
    }

    fn with_route(route: &str, headers: Map<String, Value>, body: Option<Value>) -> Self {
        Self {
            lwp: Some(route.to_string()),
            headers,
            code: None,
            body,
        }
    }

    // ------------------------------------------------------------------------
    // Outbound Constructors
    // ------------------------------------------------------------------------

    /// Keep-alive envelope
    pub fn heartbeat(mid: impl Into<String>) -> Self {
        let mut headers = Map::new();
        headers.insert(HEADER_MID.into(), Value::String(mid.into()));
        Self::with_route(routes::HEARTBEAT, headers, None)
    }

    /// Registration envelope sent right after the socket opens
    pub fn registration(params: &Registration<'_>, mid: impl Into<String>) -> Self {
        let headers = json!({
            "cache-header": "app-key token ua wv",
            "app-key": params.app_key,
            "token": params.token,
            "ua": params.user_agent,
            "dt": "j",
            "wv": "im:3,au:3,sy:6",
            "sync": "0,0;0;0;",
            "did": params.device_id,
            "mid": mid.into(),
        });
        Self::with_route(routes::REGISTER, as_map(headers), None)
    }

    /// Sync acknowledgement with sequence fields derived from `now_ms`
    pub fn sync_ack(now_ms: u64) -> Self {
        let mut headers = Map::new();
        headers.insert(HEADER_MID.into(), Value::String(SYNC_ACK_MID.into()));
        let body = json!([{
            "pipeline": "sync",
            "tooLong2Tag": "PNM,1",
            "channel": "sync",
            "topic": "sync",
            "highPts": 0,
            "pts": now_ms * 1000,
            "seq": 0,
            "timestamp": now_ms,
        }]);
        Self::with_route(routes::SYNC_ACK, headers, Some(body))
    }

    /// Generic acknowledgement of an inbound frame.
    ///
    /// Echoes `mid` (or uses `fallback_mid` when absent) and `sid` (or `""`),
    /// and copies `app-key`, `ua` and `dt` when the inbound frame carries them.
    pub fn ack_for(inbound: &Envelope, fallback_mid: impl Into<String>) -> Self {
        let mut headers = Map::new();
        let mid = inbound
            .headers
            .get(HEADER_MID)
            .cloned()
            .unwrap_or_else(|| Value::String(fallback_mid.into()));
        headers.insert(HEADER_MID.into(), mid);
        let sid = inbound
            .headers
            .get("sid")
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()));
        headers.insert("sid".into(), sid);
        for name in ACK_PASSTHROUGH_HEADERS {
            if let Some(value) = inbound.headers.get(name) {
                headers.insert(name.into(), value.clone());
            }
        }
        Self {
            lwp: None,
            headers,
            code: Some(Value::from(STATUS_OK)),
            body: None,
        }
    }

    /// Text chat message addressed to `receiver_id` in `conversation_id`
    pub fn chat_text(message: &OutboundText<'_>, mid: impl Into<String>) -> Self {
        let content = json!({"contentType": 1, "text": {"text": message.text}});
        let encoded = BASE64.encode(content.to_string().as_bytes());

        let mut headers = Map::new();
        headers.insert(HEADER_MID.into(), Value::String(mid.into()));
        let body = json!([
            {
                "uuid": message.uuid,
                "cid": format!("{}{}", message.conversation_id, ID_DOMAIN_SUFFIX),
                "conversationType": 1,
                "content": {
                    "contentType": 101,
                    "custom": {"type": 1, "data": encoded},
                },
                "redPointPolicy": 0,
                "extension": {"extJson": "{}"},
                "ctx": {"appVersion": "1.0", "platform": "web"},
                "mtags": {},
                "msgReadStatusSetting": 1,
            },
            {
                "actualReceivers": [format!("{}{}", message.receiver_id, ID_DOMAIN_SUFFIX)],
            },
        ]);
        Self::with_route(routes::SEND_MESSAGE, headers, Some(body))
    }
}

/// Header carrying the message id
pub const HEADER_MID: &str = "mid";

fn as_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Parameters of the registration envelope
#[derive(Debug, Clone, Copy)]
pub struct Registration<'a> {
    pub token: &'a str,
    pub device_id: &'a str,
    pub app_key: &'a str,
    pub user_agent: &'a str,
}

/// Parameters of an outbound text message
#[derive(Debug, Clone, Copy)]
pub struct OutboundText<'a> {
    pub conversation_id: &'a str,
    pub receiver_id: &'a str,
    pub text: &'a str,
    pub uuid: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(matches!(
            Envelope::parse("[1, 2]"),
            Err(DecodeError::EnvelopeMismatch { .. })
        ));
        assert!(matches!(
            Envelope::parse("{not json"),
            Err(DecodeError::MalformedJson(_))
        ));
    }

    #[test]
    fn test_parse_tolerates_missing_headers() {
        let envelope = Envelope::parse(r#"{"lwp":"/s/vulcan"}"#).unwrap();
        assert_eq!(envelope.lwp.as_deref(), Some("/s/vulcan"));
        assert!(envelope.mid().is_none());
    }

    #[test]
    fn test_success_classification() {
        let ok = Envelope::parse(r#"{"headers":{"mid":"m1"},"code":200}"#).unwrap();
        assert!(ok.is_success());

        let failed = Envelope::parse(r#"{"headers":{"mid":"m1"},"code":500}"#).unwrap();
        assert!(!failed.is_success());

        let no_mid = Envelope::parse(r#"{"headers":{},"code":200}"#).unwrap();
        assert!(!no_mid.is_success());

        let textual = Envelope::parse(r#"{"headers":{"mid":"m1"},"code":"200"}"#).unwrap();
        assert!(!textual.is_success());
    }

    #[test]
    fn test_success_accepts_any_mid_and_numeric_code() {
        let numeric_mid = Envelope::parse(r#"{"headers":{"mid":42},"code":200}"#).unwrap();
        assert!(numeric_mid.mid().is_none());
        assert!(numeric_mid.has_mid());
        assert!(numeric_mid.is_success());

        let float_code = Envelope::parse(r#"{"headers":{"mid":"m1"},"code":200.0}"#).unwrap();
        assert_eq!(float_code.status_code(), Some(200));
        assert!(float_code.is_success());

        let fractional = Envelope::parse(r#"{"headers":{"mid":"m1"},"code":200.5}"#).unwrap();
        assert_eq!(fractional.status_code(), None);
        assert!(!fractional.is_success());
    }

    #[test]
    fn test_ack_keeps_numeric_mid() {
        let inbound = Envelope::parse(r#"{"headers":{"mid":42,"sid":"s1"}}"#).unwrap();
        let ack = Envelope::ack_for(&inbound, "unused");
        assert_eq!(ack.headers.get(HEADER_MID), Some(&json!(42)));
    }

    #[test]
    fn test_heartbeat_wire_shape() {
        let value: Value = serde_json::from_str(&Envelope::heartbeat("7 0").to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"lwp": "/!", "headers": {"mid": "7 0"}}));
    }

    #[test]
    fn test_registration_headers() {
        let params = Registration {
            token: "tok",
            device_id: "DEV-1",
            app_key: "key",
            user_agent: "ua",
        };
        let envelope = Envelope::registration(&params, "m");
        assert_eq!(envelope.lwp.as_deref(), Some(routes::REGISTER));
        assert_eq!(envelope.header("token"), Some("tok"));
        assert_eq!(envelope.header("did"), Some("DEV-1"));
        assert_eq!(envelope.header("app-key"), Some("key"));
        assert_eq!(envelope.header("cache-header"), Some("app-key token ua wv"));
        assert_eq!(envelope.header("wv"), Some("im:3,au:3,sy:6"));
        assert_eq!(envelope.header("sync"), Some("0,0;0;0;"));
        assert_eq!(envelope.header("dt"), Some("j"));
        assert_eq!(envelope.mid(), Some("m"));
    }

    #[test]
    fn test_sync_ack_sequence_fields() {
        let envelope = Envelope::sync_ack(1_700_000_000_123);
        assert_eq!(envelope.lwp.as_deref(), Some(routes::SYNC_ACK));
        assert_eq!(envelope.mid(), Some(SYNC_ACK_MID));
        let body = envelope.body.unwrap();
        assert_eq!(body[0]["pts"], json!(1_700_000_000_123_000u64));
        assert_eq!(body[0]["timestamp"], json!(1_700_000_000_123u64));
        assert_eq!(body[0]["tooLong2Tag"], json!("PNM,1"));
    }

    #[test]
    fn test_ack_echoes_passthrough_headers() {
        let inbound = Envelope::parse(
            r#"{"lwp":"/s/para","headers":{"mid":"abc","sid":"s9","app-key":"k","ua":"u","dt":"j","other":"x"}}"#,
        )
        .unwrap();
        let ack = Envelope::ack_for(&inbound, "unused");
        assert_eq!(ack.status_code(), Some(200));
        assert!(ack.lwp.is_none());
        assert_eq!(ack.mid(), Some("abc"));
        assert_eq!(ack.header("sid"), Some("s9"));
        assert_eq!(ack.header("app-key"), Some("k"));
        assert_eq!(ack.header("ua"), Some("u"));
        assert_eq!(ack.header("dt"), Some("j"));
        assert!(!ack.headers.contains_key("other"));
    }

    #[test]
    fn test_ack_defaults() {
        let inbound = Envelope::parse(r#"{"headers":{}}"#).unwrap();
        let ack = Envelope::ack_for(&inbound, "fresh 0");
        assert_eq!(ack.mid(), Some("fresh 0"));
        assert_eq!(ack.header("sid"), Some(""));
        assert_eq!(ack.headers.len(), 2);
    }

    #[test]
    fn test_chat_text_encoding() {
        let outbound = OutboundText {
            conversation_id: "4711",
            receiver_id: "99",
            text: "你好",
            uuid: "-1700000000001",
        };
        let envelope = Envelope::chat_text(&outbound, "m1");
        assert_eq!(envelope.lwp.as_deref(), Some(routes::SEND_MESSAGE));
        let body = envelope.body.unwrap();
        assert_eq!(body[0]["cid"], json!("4711@goofish"));
        assert_eq!(body[0]["content"]["contentType"], json!(101));
        assert_eq!(body[1]["actualReceivers"], json!(["99@goofish"]));

        let data = body[0]["content"]["custom"]["data"].as_str().unwrap();
        let decoded: Value = serde_json::from_slice(&BASE64.decode(data).unwrap()).unwrap();
        assert_eq!(decoded, json!({"contentType": 1, "text": {"text": "你好"}}));
    }
}
