/// Wire protocol for the realtime channel
use crate::error::{ChatError, Result};
use crate::message::{ConversationScope, Credential, Message, Participant};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Event types that carry a message record
const MESSAGE_EVENTS: &[&str] = &["message", "new_message", "chat_message", "receive_message"];

/// Keys the record may sit under inside a message event
const RECORD_KEYS: &[&str] = &["message", "data", "record", "chat"];

/// Frames the client sends over the socket
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame after the socket opens: authenticates and scopes delivery
    Subscribe {
        token: String,
        #[serde(rename = "conversationId")]
        conversation_id: String,
        participant: Participant,
        peer: Participant,
    },
}

/// Everything needed to (re)establish a channel
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub scope: ConversationScope,
    pub credential: Credential,
}

impl SubscribeRequest {
    pub fn new(scope: ConversationScope, credential: Credential) -> Self {
        Self { scope, credential }
    }

    pub fn frame(&self) -> ClientFrame {
        ClientFrame::Subscribe {
            token: self.credential.expose().to_string(),
            conversation_id: self.scope.conversation_id(),
            participant: self.scope.local.clone(),
            peer: self.scope.remote.clone(),
        }
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(Message),
    /// Any other event type (typing, presence, acks, ...)
    Ignored(String),
}

impl InboundEvent {
    /// Decode one text frame.
    ///
    /// Accepts `{"type":"message","message":<record>}` (record may itself be a
    /// JSON string), a message event carrying the record fields flat, or a
    /// bare record.
    pub fn decode(text: &str, default_conversation: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ChatError::MalformedPayload(format!("frame is not JSON: {}", e)))?;

        let event_type = value.get("type").and_then(Value::as_str);
        match event_type {
            Some(_) if is_bare_record(&value) => {
                Message::from_record(&value, default_conversation).map(InboundEvent::Message)
            }
            Some(t) if MESSAGE_EVENTS.contains(&t) => {
                let record = RECORD_KEYS
                    .iter()
                    .filter_map(|k| value.get(*k))
                    .find(|v| is_record_value(v))
                    .ok_or_else(|| {
                        ChatError::MalformedPayload(format!("'{}' event without a record", t))
                    })?;
                Message::from_record(record, default_conversation).map(InboundEvent::Message)
            }
            Some(t) => Ok(InboundEvent::Ignored(t.to_string())),
            None => Message::from_record(&value, default_conversation).map(InboundEvent::Message),
        }
    }
}

fn is_bare_record(value: &Value) -> bool {
    ["senderRole", "sender_role", "role"]
        .iter()
        .any(|k| value.get(*k).is_some())
}

/// An object, or a string holding an encoded object
fn is_record_value(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::String(s) => serde_json::from_str::<Value>(s).is_ok_and(|v| v.is_object()),
        _ => false,
    }
}

impl fmt::Display for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundEvent::Message(m) => write!(f, "Message({})", m.sender_role),
            InboundEvent::Ignored(t) => write!(f, "Ignored({})", t),
        }
    }
}
