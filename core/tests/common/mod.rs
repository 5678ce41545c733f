//! In-memory backend and connector for session tests
#![allow(dead_code)]

use bytes::Bytes;
use carechat_core::backend::{Backend, OutgoingMessage, ReportMeta, SendReceipt};
use carechat_core::message::{ConversationScope, Message, Participant, SenderRole};
use carechat_core::realtime::{Connector, FrameStream, SubscribeRequest};
use carechat_core::{ChatError, Config, Result};
use chrono::{NaiveDate, NaiveTime};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const DAY: &str = "2024-04-01";

pub fn doctor() -> Participant {
    Participant::new(SenderRole::Doctor, "d1")
}

pub fn patient() -> Participant {
    Participant::new(SenderRole::Patient, "p1")
}

pub fn laboratory() -> Participant {
    Participant::new(SenderRole::Laboratory, "l1")
}

pub fn scope() -> ConversationScope {
    ConversationScope::new(doctor(), patient())
}

pub fn test_config() -> Config {
    Config {
        request_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
        ..Config::default()
    }
}

/// A backend history record
pub fn record(role: &str, body: &str, time: &str) -> Value {
    json!({ "senderRole": role, "message": body, "date": DAY, "time": time })
}

/// A channel frame carrying `record`
pub fn frame(record: &Value) -> String {
    json!({ "type": "message", "message": record }).to_string()
}

pub fn at(time: &str) -> NaiveTime {
    NaiveTime::parse_from_str(time, "%H:%M").unwrap()
}

pub fn day() -> NaiveDate {
    NaiveDate::parse_from_str(DAY, "%Y-%m-%d").unwrap()
}

/// Body text of each message, in view order
pub fn bodies(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.kind.display_text()).collect()
}

#[derive(Debug, Clone)]
pub enum HistoryScript {
    NotFound,
    Records(Value),
    Fail,
    /// Transport-level failure surfaced as a raw I/O error
    Broken,
}

pub struct FakeBackend {
    history: Mutex<HistoryScript>,
    history_delay: Mutex<Duration>,
    fail_send: AtomicBool,
    ack_sends: AtomicBool,
    sent: Mutex<Vec<OutgoingMessage>>,
    pub history_calls: AtomicUsize,
    pub report_meta_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(history: HistoryScript) -> Arc<Self> {
        Arc::new(Self {
            history: Mutex::new(history),
            history_delay: Mutex::new(Duration::ZERO),
            fail_send: AtomicBool::new(false),
            ack_sends: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            history_calls: AtomicUsize::new(0),
            report_meta_calls: AtomicUsize::new(0),
        })
    }

    pub fn with_records(records: Vec<Value>) -> Arc<Self> {
        Self::new(HistoryScript::Records(Value::Array(records)))
    }

    pub fn set_history(&self, history: HistoryScript) {
        *self.history.lock().unwrap() = history;
    }

    pub fn delay_history(&self, delay: Duration) {
        *self.history_delay.lock().unwrap() = delay;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    /// When off, sends are accepted without echoing the record
    pub fn ack_sends(&self, ack: bool) {
        self.ack_sends.store(ack, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl Backend for FakeBackend {
    async fn fetch_history(&self, _scope: &ConversationScope) -> Result<Option<Value>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.history_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let script = self.history.lock().unwrap().clone();
        match script {
            HistoryScript::NotFound => Ok(None),
            HistoryScript::Records(body) => Ok(Some(body)),
            HistoryScript::Fail => Err(ChatError::HistoryLoad("503 Service Unavailable".to_string())),
            HistoryScript::Broken => Err(ChatError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))),
        }
    }

    async fn post_message(&self, outgoing: &OutgoingMessage) -> Result<SendReceipt> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(ChatError::Send("500 Internal Server Error".to_string()));
        }
        self.sent.lock().unwrap().push(outgoing.clone());

        if !self.ack_sends.load(Ordering::SeqCst) {
            return Ok(SendReceipt::Accepted {
                client_ref: outgoing.client_ref,
            });
        }
        let message = Message::new(
            outgoing.conversation_id.clone(),
            outgoing.sender_role,
            outgoing.kind.clone(),
            day(),
            at("12:00"),
        )
        .with_sequence_hint(outgoing.client_ref.to_string());
        Ok(SendReceipt::Acknowledged {
            client_ref: outgoing.client_ref,
            message,
        })
    }

    async fn fetch_report_meta(&self, report_id: &str) -> Result<ReportMeta> {
        self.report_meta_calls.fetch_add(1, Ordering::SeqCst);
        if report_id == "missing" {
            return Err(ChatError::Report("404 Not Found".to_string()));
        }
        Ok(ReportMeta {
            report_id: report_id.to_string(),
            file_name: format!("{}.pdf", report_id),
            content_type: Some("application/pdf".to_string()),
        })
    }

    async fn fetch_report_content(&self, report_id: &str) -> Result<Bytes> {
        Ok(Bytes::from(format!("%PDF {}", report_id)))
    }
}

type FrameSender = mpsc::UnboundedSender<Result<String>>;

/// Connector whose "server side" is driven by the test
#[derive(Clone, Default)]
pub struct FakeConnector {
    live: Arc<Mutex<Option<FrameSender>>>,
    refuse: Arc<AtomicBool>,
    handshake_delay: Arc<Mutex<Duration>>,
    pub requests: Arc<Mutex<Vec<SubscribeRequest>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn delay_handshake(&self, delay: Duration) {
        *self.handshake_delay.lock().unwrap() = delay;
    }

    pub fn connections(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Deliver a frame on the current connection. Returns false when no
    /// consumer is listening any more.
    pub fn push(&self, text: impl Into<String>) -> bool {
        match self.live.lock().unwrap().as_ref() {
            Some(tx) => tx.send(Ok(text.into())).is_ok(),
            None => false,
        }
    }

    /// Simulate a transport failure on the current connection
    pub fn drop_connection(&self) {
        if let Some(tx) = self.live.lock().unwrap().take() {
            let _ = tx.send(Err(ChatError::ChannelConnection(
                "connection reset by peer".to_string(),
            )));
        }
    }

    /// True while the client still holds the current connection
    pub fn is_live(&self) -> bool {
        self.live
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl Connector for FakeConnector {
    async fn connect(&self, request: &SubscribeRequest) -> Result<FrameStream> {
        let delay = *self.handshake_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ChatError::ChannelConnection("connection refused".to_string()));
        }

        self.requests.lock().unwrap().push(request.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        *self.live.lock().unwrap() = Some(tx);

        let frames = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(frames.boxed())
    }
}

/// Poll until `cond` holds or a second passes
pub async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
