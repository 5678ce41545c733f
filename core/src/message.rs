/// Conversation message model shared by every portal (doctor, patient, lab, pharmacy)
///
/// Backend records are loosely typed: the payload is sometimes a JSON object,
/// sometimes a JSON-encoded string, and field names vary between camelCase and
/// snake_case. Everything is normalized here into [`Message`] / [`MessageKind`].
use crate::error::{ChatError, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

const CONVERSATION_KEYS: &[&str] = &["conversationId", "conversation_id", "chatId", "chat_id"];
const ROLE_KEYS: &[&str] = &["senderRole", "sender_role", "role", "sender", "from"];
const PAYLOAD_KEYS: &[&str] = &["kind", "payload", "message", "content", "body", "text"];
const DATE_KEYS: &[&str] = &["sentAtDate", "sent_at_date", "addedDate", "added_date", "date"];
const TIME_KEYS: &[&str] = &["sentAtTime", "sent_at_time", "addedTime", "added_time", "time"];
const TIMESTAMP_KEYS: &[&str] = &["createdAt", "created_at", "timestamp"];
const ID_KEYS: &[&str] = &["sequenceHint", "sequence_hint", "messageId", "message_id", "id", "_id"];

const TEXT_KEYS: &[&str] = &["body", "text", "message", "content"];
const REPORT_ID_KEYS: &[&str] = &["reportId", "report_id"];
const CAPTION_KEYS: &[&str] = &["caption", "fileName", "file_name", "message", "text"];
const CATEGORY_KEYS: &[&str] = &["noteCategory", "note_category", "category"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%d-%m-%Y"];
const TIME_FORMATS: &[&str] = &[
    "%H:%M:%S%.f",
    "%H:%M:%S",
    "%H:%M",
    "%I:%M:%S %p",
    "%I:%M %p",
    "%I:%M%p",
];

/// Who sent a message. Drives rendering side and colour, never authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Doctor,
    Patient,
    Laboratory,
    Pharmacy,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Doctor => "doctor",
            SenderRole::Patient => "patient",
            SenderRole::Laboratory => "laboratory",
            SenderRole::Pharmacy => "pharmacy",
        }
    }
}

impl FromStr for SenderRole {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "doctor" | "dr" | "physician" => Ok(SenderRole::Doctor),
            "patient" | "user" => Ok(SenderRole::Patient),
            "laboratory" | "lab" => Ok(SenderRole::Laboratory),
            "pharmacy" | "pharmacist" => Ok(SenderRole::Pharmacy),
            other => Err(ChatError::MalformedPayload(format!(
                "unknown sender role '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub role: SenderRole,
    pub id: String,
}

impl Participant {
    pub fn new(role: SenderRole, id: impl Into<String>) -> Self {
        Self {
            role,
            id: id.into(),
        }
    }
}

impl FromStr for Participant {
    type Err = ChatError;

    /// Parses `<role>:<id>`, e.g. `doctor:42`
    fn from_str(s: &str) -> Result<Self> {
        let (role, id) = s.split_once(':').ok_or_else(|| {
            ChatError::Config(format!("participant '{}' must look like <role>:<id>", s))
        })?;
        if id.is_empty() {
            return Err(ChatError::Config(format!("participant '{}' has an empty id", s)));
        }
        let role = role
            .parse::<SenderRole>()
            .map_err(|_| ChatError::Config(format!("unknown role in '{}'", s)))?;
        Ok(Self::new(role, id))
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.id)
    }
}

/// The pairing a conversation is scoped to (patient↔doctor, doctor↔lab, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationScope {
    /// The participant using this client
    pub local: Participant,
    /// The other party
    pub remote: Participant,
}

impl ConversationScope {
    pub fn new(local: Participant, remote: Participant) -> Self {
        Self { local, remote }
    }

    /// Canonical ID: "<role>:<id>|<role>:<id>", sorted so both sides agree
    pub fn conversation_id(&self) -> String {
        let a = self.local.to_string();
        let b = self.remote.to_string();
        if a <= b {
            format!("{}|{}", a, b)
        } else {
            format!("{}|{}", b, a)
        }
    }
}

/// Opaque bearer credential handed to the backend. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// What a message carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    PlainText {
        body: String,
    },
    StructuredNote {
        body: String,
        note_category: String,
    },
    /// Points at a report held in external object storage
    ReportReference {
        report_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    PrescriptionReference {
        payload: Value,
    },
}

impl MessageKind {
    pub fn text(body: impl Into<String>) -> Self {
        MessageKind::PlainText { body: body.into() }
    }

    /// Strict parse of a backend payload
    pub fn from_payload(payload: &Value) -> Result<Self> {
        match payload {
            Value::String(s) => {
                let trimmed = s.trim_start();
                if trimmed.starts_with('{') {
                    let inner: Value = serde_json::from_str(s).map_err(|e| {
                        ChatError::MalformedPayload(format!("embedded JSON: {}", e))
                    })?;
                    Self::from_object(&inner)
                } else {
                    Ok(MessageKind::text(s.clone()))
                }
            }
            Value::Object(_) => Self::from_object(payload),
            Value::Null => Err(ChatError::MalformedPayload("empty payload".to_string())),
            other => Ok(MessageKind::text(other.to_string())),
        }
    }

    /// Parse, or fall back to the raw content as plain text. Never fails.
    pub fn coerce(payload: &Value) -> Self {
        match Self::from_payload(payload) {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Coercing payload to plain text: {}", e);
                let body = match payload {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                MessageKind::PlainText { body }
            }
        }
    }

    fn from_object(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| ChatError::MalformedPayload("payload is not an object".to_string()))?;
        let tag = scalar_field(obj, &["type", "kind"]);
        Self::from_tagged(obj, tag.as_deref(), value)
    }

    /// Dispatch on an explicit type tag; `None` infers the kind from the keys
    fn from_tagged(obj: &Map<String, Value>, tag: Option<&str>, value: &Value) -> Result<Self> {
        match tag.map(str::to_ascii_lowercase).as_deref() {
            Some("text") | Some("plain_text") | Some("message") => Self::text_from(obj),
            Some("note") | Some("structured_note") => Self::note_from(obj, true),
            Some("report") | Some("report_reference") => Self::report_from(obj),
            Some("prescription") | Some("prescription_reference") => {
                Ok(Self::prescription_from(obj, value))
            }
            Some(other) => Err(ChatError::MalformedPayload(format!(
                "unknown payload type '{}'",
                other
            ))),
            None => {
                if has_any(obj, REPORT_ID_KEYS) {
                    Self::report_from(obj)
                } else if has_any(obj, &["prescription", "medicines", "medications"]) {
                    Ok(Self::prescription_from(obj, value))
                } else if has_any(obj, CATEGORY_KEYS) {
                    Self::note_from(obj, false)
                } else {
                    Self::text_from(obj)
                }
            }
        }
    }

    fn text_from(obj: &Map<String, Value>) -> Result<Self> {
        scalar_field(obj, TEXT_KEYS)
            .map(MessageKind::text)
            .ok_or_else(|| ChatError::MalformedPayload("text payload without a body".to_string()))
    }

    fn note_from(obj: &Map<String, Value>, tagged: bool) -> Result<Self> {
        let body = scalar_field(obj, TEXT_KEYS)
            .ok_or_else(|| ChatError::MalformedPayload("note payload without a body".to_string()))?;
        let note_category = match scalar_field(obj, CATEGORY_KEYS) {
            Some(c) => c,
            None if tagged => "general".to_string(),
            None => {
                return Err(ChatError::MalformedPayload(
                    "note payload without a category".to_string(),
                ))
            }
        };
        Ok(MessageKind::StructuredNote {
            body,
            note_category,
        })
    }

    fn report_from(obj: &Map<String, Value>) -> Result<Self> {
        let report_id = scalar_field(obj, REPORT_ID_KEYS).ok_or_else(|| {
            ChatError::MalformedPayload("report payload without a reportId".to_string())
        })?;
        Ok(MessageKind::ReportReference {
            report_id,
            caption: scalar_field(obj, CAPTION_KEYS),
        })
    }

    fn prescription_from(obj: &Map<String, Value>, whole: &Value) -> Self {
        let payload = obj
            .get("prescription")
            .or_else(|| obj.get("payload"))
            .cloned()
            .unwrap_or_else(|| whole.clone());
        MessageKind::PrescriptionReference { payload }
    }

    /// One-line display text
    pub fn display_text(&self) -> String {
        match self {
            MessageKind::PlainText { body } => body.clone(),
            MessageKind::StructuredNote {
                body,
                note_category,
            } => format!("[{}] {}", note_category, body),
            MessageKind::ReportReference { report_id, caption } => match caption {
                Some(c) => format!("📄 {}", c),
                None => format!("📄 report {}", report_id),
            },
            MessageKind::PrescriptionReference { .. } => "💊 prescription".to_string(),
        }
    }
}

/// Dedup key derived from (conversation, sender, date, time, body)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// The atomic unit of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub conversation_id: String,
    pub sender_role: SenderRole,
    pub kind: MessageKind,
    pub sent_at_date: NaiveDate,
    pub sent_at_time: NaiveTime,
    /// Server-assigned id, when the backend provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_hint: Option<String>,
    /// The record carried no timestamp; `sent_at_*` is the local receipt time
    #[serde(skip)]
    pub receipt_timed: bool,
}

impl Message {
    pub fn new(
        conversation_id: impl Into<String>,
        sender_role: SenderRole,
        kind: MessageKind,
        sent_at_date: NaiveDate,
        sent_at_time: NaiveTime,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender_role,
            kind,
            sent_at_date,
            sent_at_time,
            sequence_hint: None,
            receipt_timed: false,
        }
    }

    pub fn with_sequence_hint(mut self, hint: impl Into<String>) -> Self {
        self.sequence_hint = Some(hint.into());
        self
    }

    pub fn sort_key(&self) -> (NaiveDate, NaiveTime) {
        (self.sent_at_date, self.sent_at_time)
    }

    /// Content hash for dedup. A receipt time differs per delivery, so it
    /// is left out when the record had no timestamp of its own.
    pub fn fingerprint(&self) -> Fingerprint {
        // serde_json keeps object keys sorted, so the canonical body is stable
        let body = serde_json::to_string(&self.kind).unwrap_or_else(|_| self.kind.display_text());
        let (date, time) = if self.receipt_timed {
            (String::new(), String::new())
        } else {
            (
                self.sent_at_date.to_string(),
                self.sent_at_time.format("%H:%M:%S").to_string(),
            )
        };

        let mut hasher = Sha256::new();
        for part in [
            self.conversation_id.as_str(),
            self.sender_role.as_str(),
            date.as_str(),
            time.as_str(),
            body.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Fingerprint(out)
    }

    pub fn is_report(&self) -> bool {
        matches!(self.kind, MessageKind::ReportReference { .. })
    }

    pub fn report_id(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::ReportReference { report_id, .. } => Some(report_id),
            _ => None,
        }
    }

    /// Preview text for conversation lists
    pub fn preview(&self) -> String {
        let text = self.kind.display_text();
        let mut chars = text.chars();
        let head: String = chars.by_ref().take(80).collect();
        if chars.next().is_some() {
            format!("{}…", head)
        } else {
            head
        }
    }

    /// Decode one backend record. `default_conversation` fills a missing
    /// conversation id. Fails only when no sender role can be recovered;
    /// a bad kind payload is coerced to plain text.
    pub fn from_record(record: &Value, default_conversation: &str) -> Result<Self> {
        let decoded;
        let record = match record {
            Value::String(s) => {
                decoded = serde_json::from_str::<Value>(s).map_err(|e| {
                    ChatError::MalformedPayload(format!("record is not JSON: {}", e))
                })?;
                &decoded
            }
            other => other,
        };
        let obj = record
            .as_object()
            .ok_or_else(|| ChatError::MalformedPayload("record is not an object".to_string()))?;

        let sender_role = scalar_field(obj, ROLE_KEYS)
            .ok_or_else(|| ChatError::MalformedPayload("record without sender role".to_string()))?
            .parse::<SenderRole>()?;

        let kind = record_kind(record, obj);

        let (sent_at_date, sent_at_time, receipt_timed) = sent_at(obj);
        let conversation_id =
            scalar_field(obj, CONVERSATION_KEYS).unwrap_or_else(|| default_conversation.to_string());

        Ok(Self {
            conversation_id,
            sender_role,
            kind,
            sent_at_date,
            sent_at_time,
            sequence_hint: scalar_field(obj, ID_KEYS),
            receipt_timed,
        })
    }
}

/// Kind of a record. A plain string under `kind` tags the record itself
/// (`"kind": "report"` next to `reportId`); otherwise the payload sits under
/// one of the payload keys, or the record is the payload.
fn record_kind(record: &Value, obj: &Map<String, Value>) -> MessageKind {
    let tag = match obj.get("kind") {
        Some(Value::String(t)) if !t.trim_start().starts_with('{') => Some(t.as_str()),
        _ => None,
    };
    if let Some(tag) = tag {
        match MessageKind::from_tagged(obj, Some(tag), record) {
            Ok(kind) => return kind,
            Err(e) => debug!("Record tag '{}' not usable: {}", tag, e),
        }
    }

    let payload = PAYLOAD_KEYS
        .iter()
        .filter(|k| tag.is_none() || **k != "kind")
        .find_map(|k| obj.get(*k));
    match (payload, tag) {
        (Some(payload), _) => MessageKind::coerce(payload),
        (None, Some(tag)) => MessageKind::text(tag),
        (None, None) => MessageKind::coerce(record),
    }
}

/// String or number field under the first matching key
fn scalar_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn has_any(obj: &Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter().any(|k| obj.contains_key(*k))
}

/// Send date and time of a record, and whether any part of it had to be
/// filled in from the local clock
fn sent_at(obj: &Map<String, Value>) -> (NaiveDate, NaiveTime, bool) {
    let date = scalar_field(obj, DATE_KEYS).and_then(|d| parse_date(&d));
    let time = scalar_field(obj, TIME_KEYS).and_then(|t| parse_time(&t));
    if let (Some(d), Some(t)) = (date, time) {
        return (d, t, false);
    }

    if let Some(ts) = scalar_field(obj, TIMESTAMP_KEYS) {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&ts) {
            let naive = parsed.naive_local();
            return (date.unwrap_or(naive.date()), time.unwrap_or(naive.time()), false);
        }
    }

    let now = Local::now().naive_local();
    warn!("Record has no usable timestamp, using receipt time");
    (date.unwrap_or(now.date()), time.unwrap_or(now.time()), true)
}

/// Parse a display date in any of the formats the portals emit
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let raw = raw.split('T').next().unwrap_or(raw);
    let parsed = DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(raw, f).ok());
    if parsed.is_none() {
        debug!("Unparsable date '{}'", raw);
    }
    parsed
}

/// Parse a display time (24h or 12h with AM/PM)
pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    let parsed = TIME_FORMATS
        .iter()
        .find_map(|f| NaiveTime::parse_from_str(raw, f).ok());
    if parsed.is_none() {
        debug!("Unparsable time '{}'", raw);
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_aliases() {
        assert_eq!("Lab".parse::<SenderRole>().unwrap(), SenderRole::Laboratory);
        assert_eq!("pharmacist".parse::<SenderRole>().unwrap(), SenderRole::Pharmacy);
        assert_eq!(" DOCTOR ".parse::<SenderRole>().unwrap(), SenderRole::Doctor);
        assert!("nurse".parse::<SenderRole>().is_err());
    }

    #[test]
    fn test_conversation_id_is_symmetric() {
        let doctor = Participant::new(SenderRole::Doctor, "7");
        let patient = Participant::new(SenderRole::Patient, "19");
        let a = ConversationScope::new(doctor.clone(), patient.clone());
        let b = ConversationScope::new(patient, doctor);
        assert_eq!(a.conversation_id(), b.conversation_id());
        assert_eq!(a.conversation_id(), "doctor:7|patient:19");
    }

    #[test]
    fn test_participant_parse() {
        let p: Participant = "lab:abc".parse().unwrap();
        assert_eq!(p.role, SenderRole::Laboratory);
        assert_eq!(p.id, "abc");
        assert!("lab".parse::<Participant>().is_err());
        assert!("lab:".parse::<Participant>().is_err());
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let c = Credential::new("secret-token");
        assert_eq!(format!("{:?}", c), "Credential(***)");
        assert_eq!(c.expose(), "secret-token");
    }

    #[test]
    fn test_report_reference_from_encoded_string() {
        let payload = json!("{\"reportId\": 42, \"fileName\": \"blood.pdf\"}");
        let kind = MessageKind::from_payload(&payload).unwrap();
        assert_eq!(
            kind,
            MessageKind::ReportReference {
                report_id: "42".to_string(),
                caption: Some("blood.pdf".to_string()),
            }
        );
    }

    #[test]
    fn test_tagged_note_defaults_category() {
        let kind = MessageKind::from_payload(&json!({"type": "note", "text": "rest 2 days"})).unwrap();
        assert_eq!(
            kind,
            MessageKind::StructuredNote {
                body: "rest 2 days".to_string(),
                note_category: "general".to_string(),
            }
        );
    }

    #[test]
    fn test_prescription_keeps_payload() {
        let payload = json!({"prescription": {"medicines": ["amoxicillin"]}});
        match MessageKind::from_payload(&payload).unwrap() {
            MessageKind::PrescriptionReference { payload } => {
                assert_eq!(payload["medicines"][0], "amoxicillin");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payload_is_coerced() {
        let raw = json!("{not json at all");
        assert!(MessageKind::from_payload(&raw).is_err());
        assert_eq!(MessageKind::coerce(&raw), MessageKind::text("{not json at all"));

        let missing_id = json!({"type": "report", "caption": "x"});
        match MessageKind::coerce(&missing_id) {
            MessageKind::PlainText { body } => assert!(body.contains("report")),
            other => panic!("expected plain text, got {:?}", other),
        }
    }

    #[test]
    fn test_record_with_split_timestamp() {
        let record = json!({
            "senderRole": "patient",
            "message": "hello doctor",
            "addedDate": "2024-03-05",
            "addedTime": "9:15 PM",
        });
        let msg = Message::from_record(&record, "conv-1").unwrap();
        assert_eq!(msg.conversation_id, "conv-1");
        assert_eq!(msg.sender_role, SenderRole::Patient);
        assert_eq!(msg.kind, MessageKind::text("hello doctor"));
        assert_eq!(msg.sent_at_date, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(msg.sent_at_time, NaiveTime::from_hms_opt(21, 15, 0).unwrap());
        assert_eq!(msg.sequence_hint, None);
    }

    #[test]
    fn test_record_as_encoded_string_with_id() {
        let record = json!(
            "{\"role\":\"lab\",\"content\":{\"reportId\":\"r-9\"},\"date\":\"05/03/2024\",\"time\":\"08:00\",\"_id\":\"abc\"}"
        );
        let msg = Message::from_record(&record, "conv-1").unwrap();
        assert_eq!(msg.sender_role, SenderRole::Laboratory);
        assert_eq!(msg.report_id(), Some("r-9"));
        assert_eq!(msg.sequence_hint.as_deref(), Some("abc"));
    }

    #[test]
    fn test_record_with_flat_kind_tag() {
        let record = json!({
            "senderRole": "laboratory",
            "kind": "report",
            "reportId": "r1",
            "fileName": "cbc.pdf",
            "date": "2024-04-01",
            "time": "10:00",
        });
        let msg = Message::from_record(&record, "c").unwrap();
        assert_eq!(
            msg.kind,
            MessageKind::ReportReference {
                report_id: "r1".to_string(),
                caption: Some("cbc.pdf".to_string()),
            }
        );

        // The record's own kind tag wins over an event type
        let record = json!({
            "type": "message",
            "senderRole": "doctor",
            "kind": "note",
            "category": "dosage",
            "message": "halve the dose",
            "date": "2024-04-01",
            "time": "10:05",
        });
        assert_eq!(
            Message::from_record(&record, "c").unwrap().kind,
            MessageKind::StructuredNote {
                body: "halve the dose".to_string(),
                note_category: "dosage".to_string(),
            }
        );

        // A tag that cannot be honoured falls back to the payload fields
        let record = json!({"senderRole": "laboratory", "kind": "report", "message": "results soon"});
        assert_eq!(
            Message::from_record(&record, "c").unwrap().kind,
            MessageKind::text("results soon")
        );
    }

    #[test]
    fn test_record_without_role_is_rejected() {
        let record = json!({"message": "orphan", "date": "2024-01-01", "time": "10:00"});
        assert!(matches!(
            Message::from_record(&record, "c"),
            Err(ChatError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_fingerprint_ignores_sequence_hint() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let time = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        let a = Message::new("c", SenderRole::Doctor, MessageKind::text("hi"), date, time);
        let b = a.clone().with_sequence_hint("srv-1");
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = Message::new("c", SenderRole::Patient, MessageKind::text("hi"), date, time);
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_fingerprint_skips_receipt_time() {
        let record = json!({"senderRole": "doctor", "message": "hello"});
        let first = Message::from_record(&record, "c").unwrap();
        assert!(first.receipt_timed);

        // Same record seen again a couple of seconds later
        let mut again = Message::from_record(&record, "c").unwrap();
        again.sent_at_time = first.sent_at_time + chrono::Duration::seconds(2);
        assert_eq!(first.fingerprint(), again.fingerprint());

        let timed = json!({"senderRole": "doctor", "message": "hello", "date": "2024-04-01", "time": "10:00"});
        let timed = Message::from_record(&timed, "c").unwrap();
        assert!(!timed.receipt_timed);
        assert_ne!(timed.fingerprint(), first.fingerprint());
    }

    #[test]
    fn test_preview_truncates() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let time = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        let long = "x".repeat(200);
        let msg = Message::new("c", SenderRole::Doctor, MessageKind::text(long), date, time);
        assert_eq!(msg.preview().chars().count(), 81);
    }
}
