/// One-shot history fetch for a conversation
use crate::backend::Backend;
use crate::error::{ChatError, Result};
use crate::message::{ConversationScope, Message};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Keys a backend may wrap the history array under
const WRAPPER_KEYS: &[&str] = &["messages", "data", "chats", "history"];

pub struct HistoryLoader<B> {
    backend: Arc<B>,
}

impl<B: Backend> HistoryLoader<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Fetch and decode prior messages.
    ///
    /// "Not found" is a fresh conversation and yields an empty list. Any other
    /// failure is a `HistoryLoad` error; retrying is the caller's call.
    pub async fn load(&self, scope: &ConversationScope) -> Result<Vec<Message>> {
        let conversation_id = scope.conversation_id();

        let body = match self.backend.fetch_history(scope).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                info!("No history yet for {}", conversation_id);
                return Ok(Vec::new());
            }
            Err(ChatError::HistoryLoad(e)) | Err(ChatError::Timeout(e)) => {
                return Err(ChatError::HistoryLoad(e))
            }
            Err(e) => return Err(ChatError::HistoryLoad(e.to_string())),
        };

        let messages = decode_history(&body, &conversation_id)?;
        debug!("Loaded {} messages for {}", messages.len(), conversation_id);
        Ok(messages)
    }
}

/// Decode a history body: a bare array, an array under a wrapper key, or
/// either of those JSON-encoded as a string. Undecodable records are skipped.
pub fn decode_history(body: &Value, conversation_id: &str) -> Result<Vec<Message>> {
    let records = history_records(body)?;
    let mut messages = Vec::with_capacity(records.len());
    for record in &records {
        match Message::from_record(record, conversation_id) {
            Ok(message) => messages.push(message),
            Err(e) => warn!("Skipping history record in {}: {}", conversation_id, e),
        }
    }
    Ok(messages)
}

fn history_records(body: &Value) -> Result<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items.clone()),
        Value::Null => Ok(Vec::new()),
        Value::String(s) => {
            let inner: Value = serde_json::from_str(s).map_err(|e| {
                ChatError::HistoryLoad(format!("history string is not JSON: {}", e))
            })?;
            match inner {
                Value::String(_) => Err(ChatError::HistoryLoad(
                    "history is a doubly encoded string".to_string(),
                )),
                other => history_records(&other),
            }
        }
        Value::Object(obj) => match WRAPPER_KEYS.iter().find_map(|k| obj.get(*k)) {
            Some(inner) => history_records(inner),
            None => Err(ChatError::HistoryLoad(
                "history object has no message list".to_string(),
            )),
        },
        other => Err(ChatError::HistoryLoad(format!(
            "unexpected history body: {}",
            other
        ))),
    }
}
