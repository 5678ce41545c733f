/// Error types for the conversation sync core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// History fetch failed for a reason other than "not found"
    #[error("History load error: {0}")]
    HistoryLoad(String),

    /// Realtime channel could not connect, or is not connected
    #[error("Channel connection error: {0}")]
    ChannelConnection(String),

    /// Backend rejected or failed an outgoing message
    #[error("Send error: {0}")]
    Send(String),

    /// Report metadata or content lookup failed
    #[error("Report lookup error: {0}")]
    Report(String),

    /// Structured payload could not be parsed. Coerced to plain text, never shown
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Request did not complete in time; the outcome is unknown
    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Invalid session state: {0}")]
    SessionState(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChatError {
    /// Transient network/transport failures the UI may offer to retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChatError::HistoryLoad(_)
                | ChatError::ChannelConnection(_)
                | ChatError::Send(_)
                | ChatError::Report(_)
                | ChatError::Timeout(_)
                | ChatError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
