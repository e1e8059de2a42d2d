//! Message dispatcher routing envelopes to platform collaborators.
//!
//! The connection manager hands every post-handshake envelope to the
//! dispatcher. Type membership is checked here against the closed registry:
//! unknown types are logged and dropped, known types are parsed into their
//! typed view and routed. A handler failure never tears the channel down;
//! it is reported back to the peer as an ERROR envelope and the dispatcher
//! keeps going.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use tether_protocol::{
    to_payload, CallActionPayload, Envelope, ErrorPayload, MessageType, Payload, TypedEnvelope,
};

use crate::platform::{Collaborators, PlatformError};

/// Result type for individual message handlers.
type HandlerResult = Result<Option<Envelope>, DispatchError>;

/// Errors that can occur while handling a single message.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("sms error: {0}")]
    Sms(PlatformError),

    #[error("call error: {0}")]
    Call(PlatformError),

    #[error("clipboard error: {0}")]
    Clipboard(PlatformError),

    #[error("file transfer error: {0}")]
    File(PlatformError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl DispatchError {
    /// Convert the error into the payload of an outbound ERROR envelope.
    pub fn to_error_payload(&self) -> ErrorPayload {
        let code = match self {
            DispatchError::Sms(_) => "SMS_FAILED",
            DispatchError::Call(_) => "CALL_FAILED",
            DispatchError::Clipboard(_) => "CLIPBOARD_FAILED",
            DispatchError::File(_) => "FILE_FAILED",
            DispatchError::InvalidRequest(_) => "INVALID_REQUEST",
        };
        ErrorPayload {
            code: code.to_string(),
            message: self.to_string(),
        }
    }
}

/// Routes incoming envelopes to the platform collaborators.
pub struct MessageDispatcher {
    collaborators: Collaborators,
}

impl MessageDispatcher {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    /// Handles one incoming envelope, returning the reply to send, if any.
    ///
    /// Never fails: unknown types and malformed payloads are dropped with a
    /// log line, handler errors become an ERROR reply.
    pub fn dispatch(&self, envelope: &Envelope) -> Option<Envelope> {
        let Some(kind) = envelope.message_type() else {
            warn!("Dropping envelope with unknown type: {}", envelope.kind);
            return None;
        };

        let typed = match TypedEnvelope::from_envelope(envelope) {
            Ok(typed) => typed,
            Err(e) => {
                warn!("Dropping malformed {} payload: {}", kind, e);
                return None;
            }
        };

        match self.handle(typed) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Handler for {} failed: {}", kind, e);
                Some(error_envelope(&e))
            }
        }
    }

    fn handle(&self, typed: TypedEnvelope) -> HandlerResult {
        match typed {
            TypedEnvelope::SmsList => self.handle_sms_list(),
            TypedEnvelope::SmsMessages(p) => self.handle_sms_messages(&p.thread_id),
            TypedEnvelope::SmsSend(p) => self.handle_sms_send(&p.address, &p.body),
            TypedEnvelope::CallAction(p) => self.handle_call_action(&p),
            TypedEnvelope::Clipboard(p) => self.handle_clipboard(&p.content, &p.content_type),
            TypedEnvelope::FileOffer(p) => self.handle_file_offer(p.transfer_id, p.file_name),
            TypedEnvelope::FileAccept(p) => self.handle_file_accept(&p.uri, &p.file_name),
            TypedEnvelope::SimList => self.handle_sim_list(),
            TypedEnvelope::NotificationAction(p) => {
                info!(
                    "Notification action from peer (notification: {:?}, action: {:?})",
                    p.notification_id, p.action_id
                );
                Ok(None)
            }
            TypedEnvelope::FileChunk => {
                // Bulk transfer runs out of band; chunks on the control
                // channel are ignored.
                debug!("Ignoring FILE_CHUNK on control channel");
                Ok(None)
            }
            TypedEnvelope::FileComplete(p) => {
                info!("Peer reported file transfer complete: {:?}", p);
                Ok(None)
            }
            TypedEnvelope::Error(p) => {
                warn!("Peer reported error {}: {}", p.code, p.message);
                Ok(None)
            }
            // Phone-originated broadcast types; receiving one back is a
            // peer bug, not an error.
            TypedEnvelope::Notification(_)
            | TypedEnvelope::SmsReceived(_)
            | TypedEnvelope::CallState(_) => {
                debug!("Ignoring peer-bound message echoed back to us");
                Ok(None)
            }
            // Handshake and keepalive are consumed by the connection
            // manager before dispatch.
            TypedEnvelope::Heartbeat
            | TypedEnvelope::PairingRequest(_)
            | TypedEnvelope::PairingResponse(_) => {
                debug!("Ignoring handshake message outside the connection manager");
                Ok(None)
            }
        }
    }

    fn handle_sms_list(&self) -> HandlerResult {
        let conversations = self
            .collaborators
            .sms
            .list_conversations()
            .map_err(DispatchError::Sms)?;
        reply(MessageType::SmsList, json!({ "conversations": conversations }))
    }

    fn handle_sms_messages(&self, thread_id: &str) -> HandlerResult {
        let messages = self
            .collaborators
            .sms
            .list_messages(thread_id)
            .map_err(DispatchError::Sms)?;
        reply(
            MessageType::SmsMessages,
            json!({ "threadId": thread_id, "messages": messages }),
        )
    }

    fn handle_sms_send(&self, address: &str, body: &str) -> HandlerResult {
        self.collaborators
            .sms
            .send(address, body)
            .map_err(DispatchError::Sms)?;
        info!("Sent SMS to {}", address);
        Ok(None)
    }

    fn handle_call_action(&self, action: &CallActionPayload) -> HandlerResult {
        let calls = &self.collaborators.calls;
        match action.action.as_str() {
            "answer" => calls.answer().map_err(DispatchError::Call)?,
            "reject" => calls.reject().map_err(DispatchError::Call)?,
            "dial" => {
                let number = action.number.as_deref().ok_or_else(|| {
                    DispatchError::InvalidRequest("dial action without a number".to_string())
                })?;
                calls
                    .dial(number, action.sim_slot)
                    .map_err(DispatchError::Call)?;
            }
            other => {
                warn!("Ignoring unknown call action: {}", other);
            }
        }
        Ok(None)
    }

    fn handle_clipboard(&self, content: &str, content_type: &str) -> HandlerResult {
        if content_type != "text/plain" {
            debug!("Ignoring clipboard content of type {}", content_type);
            return Ok(None);
        }
        self.collaborators
            .clipboard
            .set_text(content)
            .map_err(DispatchError::Clipboard)?;
        Ok(None)
    }

    /// Inbound file offer from the peer. Acceptance is automatic; the
    /// collaborator receives the bytes out of band.
    fn handle_file_offer(
        &self,
        transfer_id: Option<Value>,
        file_name: Option<String>,
    ) -> HandlerResult {
        info!("Accepting file offer: {:?}", file_name);
        reply(
            MessageType::FileAccept,
            json!({
                "transferId": transfer_id.unwrap_or(Value::Null),
                "fileName": file_name,
                "accepted": true,
            }),
        )
    }

    /// The peer accepted a file we offered; hand the upload to the
    /// collaborator.
    fn handle_file_accept(&self, uri: &str, file_name: &str) -> HandlerResult {
        self.collaborators
            .files
            .upload(uri, file_name)
            .map_err(DispatchError::File)?;
        info!("Started upload of {}", file_name);
        Ok(None)
    }

    fn handle_sim_list(&self) -> HandlerResult {
        let slots = self
            .collaborators
            .calls
            .sim_slots()
            .map_err(DispatchError::Call)?;
        reply(MessageType::SimList, json!({ "slots": slots }))
    }
}

fn reply(kind: MessageType, payload: Value) -> HandlerResult {
    let payload = match payload {
        Value::Object(map) => map,
        other => {
            return Err(DispatchError::InvalidRequest(format!(
                "reply payload must be an object, got {other}"
            )))
        }
    };
    Ok(Some(Envelope::new(kind, payload)))
}

fn error_envelope(error: &DispatchError) -> Envelope {
    let payload = to_payload(&error.to_error_payload())
        .unwrap_or_else(|_| Payload::new());
    Envelope::new(MessageType::Error, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use tether_protocol::is_truthy;

    use crate::platform::{
        CallControl, ClipboardSink, FileTransfer, PlatformResult, PowerMonitor, SmsStore,
    };

    /// Records every collaborator call and serves canned data.
    #[derive(Default)]
    struct RecordingPlatform {
        calls: Mutex<Vec<String>>,
        fail_sms_send: bool,
    }

    impl RecordingPlatform {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn recorded(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SmsStore for RecordingPlatform {
        fn list_conversations(&self) -> PlatformResult<Value> {
            self.record("list_conversations");
            Ok(json!([{"threadId": "7", "address": "+1555"}]))
        }

        fn list_messages(&self, thread_id: &str) -> PlatformResult<Value> {
            self.record(format!("list_messages:{thread_id}"));
            Ok(json!([{"body": "hi"}]))
        }

        fn send(&self, address: &str, body: &str) -> PlatformResult<()> {
            self.record(format!("send:{address}:{body}"));
            if self.fail_sms_send {
                Err(PlatformError::new("radio off"))
            } else {
                Ok(())
            }
        }
    }

    impl CallControl for RecordingPlatform {
        fn answer(&self) -> PlatformResult<()> {
            self.record("answer");
            Ok(())
        }

        fn reject(&self) -> PlatformResult<()> {
            self.record("reject");
            Ok(())
        }

        fn dial(&self, number: &str, sim_slot: Option<u32>) -> PlatformResult<()> {
            self.record(format!("dial:{number}:{sim_slot:?}"));
            Ok(())
        }

        fn sim_slots(&self) -> PlatformResult<Value> {
            self.record("sim_slots");
            Ok(json!([{"slot": 0, "carrier": "TestNet"}]))
        }
    }

    impl ClipboardSink for RecordingPlatform {
        fn set_text(&self, text: &str) -> PlatformResult<()> {
            self.record(format!("clipboard:{text}"));
            Ok(())
        }
    }

    impl FileTransfer for RecordingPlatform {
        fn upload(&self, uri: &str, file_name: &str) -> PlatformResult<()> {
            self.record(format!("upload:{uri}:{file_name}"));
            Ok(())
        }
    }

    impl PowerMonitor for RecordingPlatform {
        fn battery_level(&self) -> i32 {
            87
        }

        fn is_charging(&self) -> bool {
            true
        }
    }

    fn dispatcher_with(platform: Arc<RecordingPlatform>) -> MessageDispatcher {
        MessageDispatcher::new(Collaborators {
            sms: platform.clone(),
            calls: platform.clone(),
            clipboard: platform.clone(),
            files: platform.clone(),
            power: platform,
        })
    }

    fn envelope(kind: MessageType, payload: Value) -> Envelope {
        match payload {
            Value::Object(map) => Envelope::new(kind, map),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_unknown_type_dropped() {
        let dispatcher = dispatcher_with(Arc::default());
        let mut unknown = Envelope::empty(MessageType::Heartbeat);
        unknown.kind = "TELEPORT".to_string();
        assert!(dispatcher.dispatch(&unknown).is_none());
    }

    #[test]
    fn test_malformed_payload_dropped_without_error_reply() {
        let dispatcher = dispatcher_with(Arc::default());
        // SMS_SEND without a body fails typed parsing
        let reply = dispatcher.dispatch(&envelope(
            MessageType::SmsSend,
            json!({"address": "+1555"}),
        ));
        assert!(reply.is_none());
    }

    #[test]
    fn test_sms_list_replies_with_conversations() {
        let platform = Arc::new(RecordingPlatform::default());
        let dispatcher = dispatcher_with(platform.clone());

        let reply = dispatcher
            .dispatch(&envelope(MessageType::SmsList, json!({})))
            .expect("reply");

        assert_eq!(reply.kind, "SMS_LIST");
        assert!(reply.payload.get("conversations").unwrap().is_array());
        assert_eq!(platform.recorded(), ["list_conversations"]);
    }

    #[test]
    fn test_sms_messages_echoes_thread_id() {
        let dispatcher = dispatcher_with(Arc::default());
        let reply = dispatcher
            .dispatch(&envelope(MessageType::SmsMessages, json!({"threadId": "7"})))
            .expect("reply");

        assert_eq!(reply.payload_str("threadId"), Some("7"));
        assert!(reply.payload.get("messages").unwrap().is_array());
    }

    #[test]
    fn test_sms_send_success_has_no_reply() {
        let platform = Arc::new(RecordingPlatform::default());
        let dispatcher = dispatcher_with(platform.clone());

        let reply = dispatcher.dispatch(&envelope(
            MessageType::SmsSend,
            json!({"address": "+1555", "body": "hello"}),
        ));

        assert!(reply.is_none());
        assert_eq!(platform.recorded(), ["send:+1555:hello"]);
    }

    #[test]
    fn test_sms_send_failure_becomes_error_envelope() {
        let platform = Arc::new(RecordingPlatform {
            fail_sms_send: true,
            ..Default::default()
        });
        let dispatcher = dispatcher_with(platform);

        let reply = dispatcher
            .dispatch(&envelope(
                MessageType::SmsSend,
                json!({"address": "+1555", "body": "hello"}),
            ))
            .expect("error reply");

        assert_eq!(reply.kind, "ERROR");
        assert_eq!(reply.payload_str("code"), Some("SMS_FAILED"));
        assert!(reply.payload_str("message").unwrap().contains("radio off"));
    }

    #[test]
    fn test_call_actions_route_to_collaborator() {
        let platform = Arc::new(RecordingPlatform::default());
        let dispatcher = dispatcher_with(platform.clone());

        for payload in [
            json!({"action": "answer"}),
            json!({"action": "reject"}),
            json!({"action": "dial", "number": "+1555", "simSlot": 1}),
        ] {
            assert!(dispatcher
                .dispatch(&envelope(MessageType::CallAction, payload))
                .is_none());
        }

        assert_eq!(
            platform.recorded(),
            ["answer", "reject", "dial:+1555:Some(1)"]
        );
    }

    #[test]
    fn test_dial_without_number_is_invalid_request() {
        let dispatcher = dispatcher_with(Arc::default());
        let reply = dispatcher
            .dispatch(&envelope(MessageType::CallAction, json!({"action": "dial"})))
            .expect("error reply");

        assert_eq!(reply.payload_str("code"), Some("INVALID_REQUEST"));
    }

    #[test]
    fn test_unknown_call_action_ignored() {
        let platform = Arc::new(RecordingPlatform::default());
        let dispatcher = dispatcher_with(platform.clone());

        let reply = dispatcher.dispatch(&envelope(
            MessageType::CallAction,
            json!({"action": "teleport"}),
        ));

        assert!(reply.is_none());
        assert!(platform.recorded().is_empty());
    }

    #[test]
    fn test_clipboard_text_reaches_sink() {
        let platform = Arc::new(RecordingPlatform::default());
        let dispatcher = dispatcher_with(platform.clone());

        dispatcher.dispatch(&envelope(MessageType::Clipboard, json!({"content": "hi"})));

        assert_eq!(platform.recorded(), ["clipboard:hi"]);
    }

    #[test]
    fn test_clipboard_non_text_ignored() {
        let platform = Arc::new(RecordingPlatform::default());
        let dispatcher = dispatcher_with(platform.clone());

        dispatcher.dispatch(&envelope(
            MessageType::Clipboard,
            json!({"content": "...", "contentType": "image/png"}),
        ));

        assert!(platform.recorded().is_empty());
    }

    #[test]
    fn test_file_offer_answered_with_accept() {
        let dispatcher = dispatcher_with(Arc::default());
        let reply = dispatcher
            .dispatch(&envelope(
                MessageType::FileOffer,
                json!({"transferId": 42, "fileName": "doc.pdf", "fileSize": 9000}),
            ))
            .expect("reply");

        assert_eq!(reply.kind, "FILE_ACCEPT");
        assert_eq!(reply.payload.get("transferId"), Some(&json!(42)));
        assert!(is_truthy(reply.payload.get("accepted").unwrap()));
    }

    #[test]
    fn test_file_accept_starts_upload() {
        let platform = Arc::new(RecordingPlatform::default());
        let dispatcher = dispatcher_with(platform.clone());

        dispatcher.dispatch(&envelope(
            MessageType::FileAccept,
            json!({"uri": "content://media/9", "fileName": "photo.jpg"}),
        ));

        assert_eq!(platform.recorded(), ["upload:content://media/9:photo.jpg"]);
    }

    #[test]
    fn test_sim_list_replies_with_slots() {
        let dispatcher = dispatcher_with(Arc::default());
        let reply = dispatcher
            .dispatch(&envelope(MessageType::SimList, json!({})))
            .expect("reply");

        assert_eq!(reply.kind, "SIM_LIST");
        assert!(reply.payload.get("slots").unwrap().is_array());
    }

    #[test]
    fn test_peer_error_logged_without_reply() {
        let dispatcher = dispatcher_with(Arc::default());
        let reply = dispatcher.dispatch(&envelope(
            MessageType::Error,
            json!({"code": "OOPS", "message": "peer side failure"}),
        ));
        assert!(reply.is_none());
    }

    #[test]
    fn test_handshake_types_ignored_by_dispatcher() {
        let dispatcher = dispatcher_with(Arc::default());
        assert!(dispatcher
            .dispatch(&Envelope::empty(MessageType::Heartbeat))
            .is_none());
        assert!(dispatcher
            .dispatch(&envelope(
                MessageType::PairingResponse,
                json!({"success": true}),
            ))
            .is_none());
    }
}
