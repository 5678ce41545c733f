/// Backend collaborator: history, send, and report lookups over REST
///
/// Endpoints (relative to `api_url`):
///   GET  /conversations/:id/messages     history, 404 = no history yet
///   POST /conversations/:id/messages     body: OutgoingMessage
///   GET  /reports/:report_id             report metadata
///   GET  /reports/:report_id/content     report bytes (redirects to a signed URL)
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::message::{ConversationScope, Credential, Message, MessageKind, Participant, SenderRole};
use bytes::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use tracing::{debug, info};
use uuid::Uuid;

/// Remote service that owns persisted conversations and reports
pub trait Backend: Send + Sync + 'static {
    /// Raw history body, or `None` when the backend has no history for the scope
    fn fetch_history(
        &self,
        scope: &ConversationScope,
    ) -> impl Future<Output = Result<Option<Value>>> + Send;

    fn post_message(
        &self,
        outgoing: &OutgoingMessage,
    ) -> impl Future<Output = Result<SendReceipt>> + Send;

    fn fetch_report_meta(&self, report_id: &str) -> impl Future<Output = Result<ReportMeta>> + Send;

    fn fetch_report_content(&self, report_id: &str) -> impl Future<Output = Result<Bytes>> + Send;
}

/// A message on its way to the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Client-side reference so a failure can be pinned to one message
    pub client_ref: Uuid,
    pub conversation_id: String,
    pub sender_role: SenderRole,
    pub sender_id: String,
    pub recipient: Participant,
    pub kind: MessageKind,
}

impl OutgoingMessage {
    pub fn new(scope: &ConversationScope, kind: MessageKind) -> Self {
        Self {
            client_ref: Uuid::new_v4(),
            conversation_id: scope.conversation_id(),
            sender_role: scope.local.role,
            sender_id: scope.local.id.clone(),
            recipient: scope.remote.clone(),
            kind,
        }
    }
}

/// Outcome of a send the backend accepted
#[derive(Debug, Clone, PartialEq)]
pub enum SendReceipt {
    /// Backend echoed the persisted record
    Acknowledged { client_ref: Uuid, message: Message },
    /// Backend accepted the message; the record will arrive through the channel
    Accepted { client_ref: Uuid },
}

impl SendReceipt {
    pub fn client_ref(&self) -> Uuid {
        match self {
            SendReceipt::Acknowledged { client_ref, .. } | SendReceipt::Accepted { client_ref } => {
                *client_ref
            }
        }
    }

    pub fn message(&self) -> Option<&Message> {
        match self {
            SendReceipt::Acknowledged { message, .. } => Some(message),
            SendReceipt::Accepted { .. } => None,
        }
    }

    /// Build a receipt from a send response body
    pub fn from_response(client_ref: Uuid, body: &Value, conversation_id: &str) -> Self {
        let record = if looks_like_record(body) {
            Some(body)
        } else {
            ["message", "data", "chat"]
                .iter()
                .filter_map(|k| body.get(*k))
                .find(|v| looks_like_record(v))
        };

        match record.map(|r| Message::from_record(r, conversation_id)) {
            Some(Ok(message)) => SendReceipt::Acknowledged {
                client_ref,
                message,
            },
            Some(Err(e)) => {
                debug!("Send acknowledgement not decodable, treating as accepted: {}", e);
                SendReceipt::Accepted { client_ref }
            }
            None => SendReceipt::Accepted { client_ref },
        }
    }
}

fn looks_like_record(value: &Value) -> bool {
    value.as_object().is_some_and(|o| {
        ["senderRole", "sender_role", "role"]
            .iter()
            .any(|k| o.contains_key(*k))
    })
}

/// Display metadata for an uploaded report. Immutable once uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMeta {
    #[serde(default, alias = "reportId", alias = "_id", alias = "id")]
    pub report_id: String,
    #[serde(default, alias = "fileName", alias = "filename", alias = "name")]
    pub file_name: String,
    #[serde(
        default,
        alias = "contentType",
        alias = "fileType",
        alias = "mimeType",
        alias = "type"
    )]
    pub content_type: Option<String>,
}

/// `Backend` over HTTP with a bearer credential
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    credential: Credential,
}

impl HttpBackend {
    pub fn new(config: &Config, credential: Credential) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!("Backend client for {}", config.api_url);
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            credential,
        })
    }

    fn messages_url(&self, conversation_id: &str) -> String {
        format!(
            "{}/conversations/{}/messages",
            self.base_url,
            urlencoding::encode(conversation_id)
        )
    }

    fn report_url(&self, report_id: &str) -> String {
        format!("{}/reports/{}", self.base_url, urlencoding::encode(report_id))
    }
}

/// Timeouts keep their own variant: the request may still have landed
fn transport_error(e: reqwest::Error, context: &str, wrap: fn(String) -> ChatError) -> ChatError {
    if e.is_timeout() {
        ChatError::Timeout(format!("{}: {}", context, e))
    } else if e.is_connect() {
        wrap(format!("{}: backend unreachable ({})", context, e))
    } else {
        wrap(format!("{}: {}", context, e))
    }
}

async fn status_error(
    response: reqwest::Response,
    context: &str,
    wrap: fn(String) -> ChatError,
) -> ChatError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    wrap(format!("{}: status {} {}", context, status.as_u16(), body.trim()))
}

impl Backend for HttpBackend {
    async fn fetch_history(&self, scope: &ConversationScope) -> Result<Option<Value>> {
        let conversation_id = scope.conversation_id();
        let url = self.messages_url(&conversation_id);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.credential.expose())
            .query(&[
                ("localRole", scope.local.role.as_str()),
                ("localId", scope.local.id.as_str()),
                ("remoteRole", scope.remote.role.as_str()),
                ("remoteId", scope.remote.id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(e, "history request", ChatError::HistoryLoad))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response, "history request", ChatError::HistoryLoad).await);
        }

        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, "history body", ChatError::HistoryLoad))?;
        if body.trim().is_empty() {
            return Ok(Some(Value::Array(Vec::new())));
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| ChatError::HistoryLoad(format!("history body is not JSON: {}", e)))
    }

    async fn post_message(&self, outgoing: &OutgoingMessage) -> Result<SendReceipt> {
        let url = self.messages_url(&outgoing.conversation_id);
        debug!("POST {} ({})", url, outgoing.client_ref);

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.credential.expose())
            .json(outgoing)
            .send()
            .await
            .map_err(|e| transport_error(e, "send request", ChatError::Send))?;

        if !response.status().is_success() {
            return Err(status_error(response, "send request", ChatError::Send).await);
        }

        let body = response.text().await.unwrap_or_default();
        let value = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
        Ok(SendReceipt::from_response(
            outgoing.client_ref,
            &value,
            &outgoing.conversation_id,
        ))
    }

    async fn fetch_report_meta(&self, report_id: &str) -> Result<ReportMeta> {
        let url = self.report_url(report_id);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.credential.expose())
            .send()
            .await
            .map_err(|e| transport_error(e, "report metadata", ChatError::Report))?;

        if !response.status().is_success() {
            return Err(status_error(response, "report metadata", ChatError::Report).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ChatError::Report(format!("report metadata is not JSON: {}", e)))?;
        let inner = ["report", "data"]
            .iter()
            .find_map(|k| body.get(*k).filter(|v| v.is_object()))
            .unwrap_or(&body);

        let mut meta: ReportMeta = serde_json::from_value(inner.clone())
            .map_err(|e| ChatError::Report(format!("unexpected report metadata: {}", e)))?;
        if meta.report_id.is_empty() {
            meta.report_id = report_id.to_string();
        }
        Ok(meta)
    }

    async fn fetch_report_content(&self, report_id: &str) -> Result<Bytes> {
        let url = format!("{}/content", self.report_url(report_id));
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.credential.expose())
            .send()
            .await
            .map_err(|e| transport_error(e, "report content", ChatError::Report))?;

        if !response.status().is_success() {
            return Err(status_error(response, "report content", ChatError::Report).await);
        }

        response
            .bytes()
            .await
            .map_err(|e| transport_error(e, "report content body", ChatError::Report))
    }
}
