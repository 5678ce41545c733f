/// CareChat - Realtime conversation sync
///
/// Client core for patient, doctor, laboratory and pharmacy conversations:
/// history loading, a live channel, deduplicated ordered message storage
/// and one session lifecycle tying them together.

pub mod backend;
pub mod cli_app;
pub mod config;
pub mod error;
pub mod history;
pub mod message;
pub mod message_store;
pub mod realtime;
pub mod registry;
pub mod report_cache;
pub mod session;
pub(crate) mod utils;

pub use backend::{Backend, HttpBackend, OutgoingMessage, ReportMeta, SendReceipt};
pub use config::Config;
pub use error::{ChatError, Result};
pub use message::{ConversationScope, Credential, Message, MessageKind, Participant, SenderRole};
pub use message_store::MessageStore;
pub use realtime::{ChannelState, Connector, RealtimeChannel, ReconnectPolicy, WsConnector};
pub use registry::{ConversationSummary, SessionRegistry};
pub use session::{ConversationSession, HistoryStatus, OpenOutcome, SessionEvent, SessionState};
