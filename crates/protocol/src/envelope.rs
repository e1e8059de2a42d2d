//! Envelope wire codec and the closed message-type registry.
//!
//! Every frame on the channel is one JSON envelope:
//!
//! ```json
//! {"type":"CLIPBOARD","data":{"content":"hi"},"id":"<uuid>","version":1,"timestamp":1700000000000}
//! ```
//!
//! The codec is forward-compatible: an unrecognized `type` or extra
//! payload keys decode successfully. Type membership is checked by the
//! dispatcher, never here. The payload stays a schema-less ordered map
//! at the wire boundary; [`TypedEnvelope`] provides the statically
//! typed view built immediately after dispatch lookup.

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Ordered string-keyed payload map, opaque to the codec.
pub type Payload = serde_json::Map<String, Value>;

/// The atomic typed message unit exchanged over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag. Not validated against the registry here.
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload map, opaque to the codec. Absent on the wire when empty.
    #[serde(rename = "data", default, skip_serializing_if = "Payload::is_empty")]
    pub payload: Payload,
    /// Globally unique per envelope instance.
    pub id: Uuid,
    /// Protocol version for compatibility checking.
    pub version: u32,
    /// Wall-clock milliseconds at creation.
    #[serde(rename = "timestamp", default)]
    pub timestamp_ms: u64,
}

impl Envelope {
    /// Creates a new envelope with a fresh id and the current timestamp.
    pub fn new(kind: MessageType, payload: Payload) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            payload,
            id: Uuid::new_v4(),
            version: PROTOCOL_VERSION,
            timestamp_ms: now_millis(),
        }
    }

    /// Creates an envelope with an empty payload.
    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, Payload::new())
    }

    /// Serializes the envelope to its wire representation.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decodes an envelope from wire text.
    ///
    /// Fails with [`ProtocolError::MalformedEnvelope`] when the text is
    /// not well-formed JSON or `type`/`id`/`version` are absent.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(ProtocolError::from)
    }

    /// The registry entry for this envelope's type, if it is a known one.
    pub fn message_type(&self) -> Option<MessageType> {
        self.kind.parse().ok()
    }

    /// Fetches a string payload field.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Closed registry of envelope types dispatched by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Heartbeat,
    PairingRequest,
    PairingResponse,
    Notification,
    NotificationAction,
    SmsList,
    SmsMessages,
    SmsSend,
    SmsReceived,
    CallState,
    CallAction,
    Clipboard,
    FileOffer,
    FileAccept,
    FileChunk,
    FileComplete,
    SimList,
    Error,
}

impl MessageType {
    /// All registry entries, in wire order.
    pub const ALL: [MessageType; 18] = [
        MessageType::Heartbeat,
        MessageType::PairingRequest,
        MessageType::PairingResponse,
        MessageType::Notification,
        MessageType::NotificationAction,
        MessageType::SmsList,
        MessageType::SmsMessages,
        MessageType::SmsSend,
        MessageType::SmsReceived,
        MessageType::CallState,
        MessageType::CallAction,
        MessageType::Clipboard,
        MessageType::FileOffer,
        MessageType::FileAccept,
        MessageType::FileChunk,
        MessageType::FileComplete,
        MessageType::SimList,
        MessageType::Error,
    ];

    /// The wire tag for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::PairingRequest => "PAIRING_REQUEST",
            MessageType::PairingResponse => "PAIRING_RESPONSE",
            MessageType::Notification => "NOTIFICATION",
            MessageType::NotificationAction => "NOTIFICATION_ACTION",
            MessageType::SmsList => "SMS_LIST",
            MessageType::SmsMessages => "SMS_MESSAGES",
            MessageType::SmsSend => "SMS_SEND",
            MessageType::SmsReceived => "SMS_RECEIVED",
            MessageType::CallState => "CALL_STATE",
            MessageType::CallAction => "CALL_ACTION",
            MessageType::Clipboard => "CLIPBOARD",
            MessageType::FileOffer => "FILE_OFFER",
            MessageType::FileAccept => "FILE_ACCEPT",
            MessageType::FileChunk => "FILE_CHUNK",
            MessageType::FileComplete => "FILE_COMPLETE",
            MessageType::SimList => "SIM_LIST",
            MessageType::Error => "ERROR",
        }
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::MalformedEnvelope(format!("unknown message type: {s}")))
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Truthiness rule for interop-sensitive flags such as
/// `PAIRING_RESPONSE.success`: boolean `true`, numeric `1`, and the
/// case-insensitive string `"true"` are all accepted.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1) || n.as_f64() == Some(1.0),
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

// ============================================================================
// Typed payload views
// ============================================================================

/// Pairing request payload, sent on transport open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequestPayload {
    /// The out-of-band pairing code entered by the user.
    pub code: String,
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub device_model: Option<String>,
    /// Base64-encoded local public key for session key agreement.
    #[serde(default)]
    pub public_key: Option<String>,
}

/// Pairing response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponsePayload {
    /// Raw success flag; see [`is_truthy`] for the accepted encodings.
    #[serde(default)]
    pub success: Option<Value>,
    #[serde(default)]
    pub device_name: Option<String>,
    /// Base64-encoded responder public key.
    #[serde(default)]
    pub public_key: Option<String>,
}

impl PairingResponsePayload {
    /// Whether the peer accepted the pairing. Absent flags are falsy.
    pub fn accepted(&self) -> bool {
        self.success.as_ref().is_some_and(is_truthy)
    }
}

/// Heartbeat reply payload carrying device power state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub battery: i32,
    pub charging: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsMessagesPayload {
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsSendPayload {
    pub address: String,
    pub body: String,
}

/// Call control request. `action` is `answer`, `reject`, or `dial`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallActionPayload {
    pub action: String,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub sim_slot: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipboardPayload {
    pub content: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

/// Inbound offer of a file from the peer; we answer with FILE_ACCEPT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOfferPayload {
    #[serde(default)]
    pub transfer_id: Option<Value>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// The peer accepted our FILE_OFFER; start the collaborator upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAcceptPayload {
    pub uri: String,
    #[serde(default = "default_file_name")]
    pub file_name: String,
}

fn default_file_name() -> String {
    "file".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationActionPayload {
    #[serde(default)]
    pub notification_id: Option<String>,
    #[serde(default)]
    pub action_id: Option<String>,
}

/// Error payload sent back to the peer when a handler fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Statically typed view of an envelope, built after dispatch lookup.
///
/// Conversion fails with [`ProtocolError::MalformedEnvelope`] when a
/// required payload field is missing; the dispatcher drops that one
/// message and keeps going.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedEnvelope {
    Heartbeat,
    PairingRequest(PairingRequestPayload),
    PairingResponse(PairingResponsePayload),
    Notification(Payload),
    NotificationAction(NotificationActionPayload),
    SmsList,
    SmsMessages(SmsMessagesPayload),
    SmsSend(SmsSendPayload),
    SmsReceived(Payload),
    CallState(Payload),
    CallAction(CallActionPayload),
    Clipboard(ClipboardPayload),
    FileOffer(FileOfferPayload),
    FileAccept(FileAcceptPayload),
    FileChunk,
    FileComplete(Payload),
    SimList,
    Error(ErrorPayload),
}

impl TypedEnvelope {
    /// Builds the typed view for a known-type envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        fn parse<T: serde::de::DeserializeOwned>(v: Value) -> Result<T> {
            serde_json::from_value(v).map_err(ProtocolError::from)
        }

        let kind: MessageType = envelope.kind.parse()?;
        let data = || Value::Object(envelope.payload.clone());

        Ok(match kind {
            MessageType::Heartbeat => TypedEnvelope::Heartbeat,
            MessageType::PairingRequest => TypedEnvelope::PairingRequest(parse(data())?),
            MessageType::PairingResponse => TypedEnvelope::PairingResponse(parse(data())?),
            MessageType::Notification => TypedEnvelope::Notification(envelope.payload.clone()),
            MessageType::NotificationAction => TypedEnvelope::NotificationAction(parse(data())?),
            MessageType::SmsList => TypedEnvelope::SmsList,
            MessageType::SmsMessages => TypedEnvelope::SmsMessages(parse(data())?),
            MessageType::SmsSend => TypedEnvelope::SmsSend(parse(data())?),
            MessageType::SmsReceived => TypedEnvelope::SmsReceived(envelope.payload.clone()),
            MessageType::CallState => TypedEnvelope::CallState(envelope.payload.clone()),
            MessageType::CallAction => TypedEnvelope::CallAction(parse(data())?),
            MessageType::Clipboard => TypedEnvelope::Clipboard(parse(data())?),
            MessageType::FileOffer => TypedEnvelope::FileOffer(parse(data())?),
            MessageType::FileAccept => TypedEnvelope::FileAccept(parse(data())?),
            MessageType::FileChunk => TypedEnvelope::FileChunk,
            MessageType::FileComplete => TypedEnvelope::FileComplete(envelope.payload.clone()),
            MessageType::SimList => TypedEnvelope::SimList,
            MessageType::Error => TypedEnvelope::Error(parse(data())?),
        })
    }
}

/// Builds a payload map from a serializable struct.
///
/// Fails if the struct serializes to a non-object, which the payload
/// types in this module never do.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Payload> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(ProtocolError::Serialization(format!(
            "payload must be a JSON object, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload_of(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let payload = payload_of(json!({"content": "hello", "contentType": "text/plain"}));
        let envelope = Envelope::new(MessageType::Clipboard, payload);

        let wire = envelope.encode().unwrap();
        let decoded = Envelope::decode(&wire).unwrap();

        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_preserves_payload_key_order() {
        let wire = r#"{"type":"NOTIFICATION","data":{"z":1,"a":2,"m":3},"id":"6ba7b810-9dad-11d1-80b4-00c04fd430c8","version":1,"timestamp":5}"#;
        let envelope = Envelope::decode(wire).unwrap();
        let keys: Vec<&String> = envelope.payload.keys().collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn test_decode_unknown_type_succeeds() {
        let wire = r#"{"type":"FUTURE_FEATURE","id":"6ba7b810-9dad-11d1-80b4-00c04fd430c8","version":3}"#;
        let envelope = Envelope::decode(wire).unwrap();
        assert_eq!(envelope.kind, "FUTURE_FEATURE");
        assert_eq!(envelope.message_type(), None);
        assert_eq!(envelope.version, 3);
    }

    #[test]
    fn test_decode_extra_payload_keys_succeed() {
        let wire = r#"{"type":"CLIPBOARD","data":{"content":"x","futureKey":42},"id":"6ba7b810-9dad-11d1-80b4-00c04fd430c8","version":1}"#;
        let envelope = Envelope::decode(wire).unwrap();
        let typed = TypedEnvelope::from_envelope(&envelope).unwrap();
        assert!(matches!(typed, TypedEnvelope::Clipboard(p) if p.content == "x"));
    }

    #[test]
    fn test_decode_missing_required_fields_fails() {
        for wire in [
            r#"{"data":{},"id":"6ba7b810-9dad-11d1-80b4-00c04fd430c8","version":1}"#,
            r#"{"type":"HEARTBEAT","version":1}"#,
            r#"{"type":"HEARTBEAT","id":"6ba7b810-9dad-11d1-80b4-00c04fd430c8"}"#,
        ] {
            let err = Envelope::decode(wire).unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedEnvelope(_)), "{wire}");
        }
    }

    #[test]
    fn test_decode_garbage_fails_malformed() {
        for wire in ["", "not json", "{\"type\":", "[1,2,3]"] {
            let err = Envelope::decode(wire).unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedEnvelope(_)), "{wire}");
        }
    }

    #[test]
    fn test_decode_truncated_wire_fails_malformed() {
        let envelope = Envelope::empty(MessageType::Heartbeat);
        let wire = envelope.encode().unwrap();
        let truncated = &wire[..wire.len() / 2];
        assert!(matches!(
            Envelope::decode(truncated),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_envelope_ids_are_unique() {
        let a = Envelope::empty(MessageType::Heartbeat);
        let b = Envelope::empty(MessageType::Heartbeat);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_message_type_round_trip() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
        assert!("SMS_EVERYTHING".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_truthy_accepted_encodings() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("true")));
        assert!(is_truthy(&json!("TRUE")));

        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(2)));
        assert!(!is_truthy(&json!("false")));
        assert!(!is_truthy(&json!("yes")));
        assert!(!is_truthy(&json!(null)));
    }

    #[test]
    fn test_pairing_response_accepted_matrix() {
        for success in [json!(true), json!(1), json!("true")] {
            let payload: PairingResponsePayload =
                serde_json::from_value(json!({"success": success})).unwrap();
            assert!(payload.accepted(), "{success}");
        }
        for success in [json!(false), json!(0), json!("false")] {
            let payload: PairingResponsePayload =
                serde_json::from_value(json!({"success": success})).unwrap();
            assert!(!payload.accepted(), "{success}");
        }
        // Absent flag is falsy.
        let payload: PairingResponsePayload = serde_json::from_value(json!({})).unwrap();
        assert!(!payload.accepted());
    }

    #[test]
    fn test_typed_envelope_missing_required_field() {
        let envelope = Envelope::new(MessageType::SmsSend, payload_of(json!({"address": "+1555"})));
        let err = TypedEnvelope::from_envelope(&envelope).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_typed_envelope_clipboard_default_content_type() {
        let envelope = Envelope::new(MessageType::Clipboard, payload_of(json!({"content": "x"})));
        match TypedEnvelope::from_envelope(&envelope).unwrap() {
            TypedEnvelope::Clipboard(p) => assert_eq!(p.content_type, "text/plain"),
            other => panic!("unexpected view: {other:?}"),
        }
    }

    #[test]
    fn test_typed_envelope_each_payload_kind() {
        let pairing = Envelope::new(
            MessageType::PairingRequest,
            payload_of(json!({"code": "654321", "deviceId": "a", "deviceName": "Phone"})),
        );
        match TypedEnvelope::from_envelope(&pairing).unwrap() {
            TypedEnvelope::PairingRequest(p) => assert_eq!(p.device_name, "Phone"),
            other => panic!("unexpected view: {other:?}"),
        }

        let sms = Envelope::new(
            MessageType::SmsSend,
            payload_of(json!({"address": "+1555", "body": "hi"})),
        );
        match TypedEnvelope::from_envelope(&sms).unwrap() {
            TypedEnvelope::SmsSend(p) => assert_eq!(p.body, "hi"),
            other => panic!("unexpected view: {other:?}"),
        }

        let call = Envelope::new(MessageType::CallAction, payload_of(json!({"action": "reject"})));
        match TypedEnvelope::from_envelope(&call).unwrap() {
            TypedEnvelope::CallAction(p) => assert_eq!(p.action, "reject"),
            other => panic!("unexpected view: {other:?}"),
        }

        let error = Envelope::new(
            MessageType::Error,
            payload_of(json!({"code": "SMS_FAILED", "message": "no store"})),
        );
        match TypedEnvelope::from_envelope(&error).unwrap() {
            TypedEnvelope::Error(p) => assert_eq!(p.code, "SMS_FAILED"),
            other => panic!("unexpected view: {other:?}"),
        }
    }

    #[test]
    fn test_to_payload_camel_case_wire_names() {
        let payload = to_payload(&SmsMessagesPayload {
            thread_id: "42".to_string(),
        })
        .unwrap();
        assert_eq!(payload.get("threadId"), Some(&json!("42")));
    }
}
