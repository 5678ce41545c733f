/// One active conversation: history + realtime channel + message store
///
/// Lifecycle: Idle → Opening → Active → Closed. A closed session is never
/// reopened; build a new one for the next conversation.
use crate::backend::{Backend, OutgoingMessage, ReportMeta, SendReceipt};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::history::HistoryLoader;
use crate::message::{ConversationScope, Credential, Message, MessageKind};
use crate::message_store::{DateGroup, MessageStore};
use crate::realtime::{ChannelState, Connector, RealtimeChannel};
use crate::report_cache::ReportCache;
use crate::utils::lock;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Active,
    Closed,
}

/// Pushed to subscribers whenever something the UI renders changes
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A new message was merged into the store
    MessageMerged(Message),
    /// History was seeded into the store
    HistoryLoaded { count: usize },
    /// History could not be loaded; the view is empty until `retry_history`
    HistoryFailed { reason: String },
    ChannelStateChanged(ChannelState),
    ChannelError { reason: String },
    Closed,
}

#[derive(Debug)]
pub enum HistoryStatus {
    Loaded(usize),
    Failed(ChatError),
}

/// Result of a successful `open`: the channel is live, history may not be
#[derive(Debug)]
pub struct OpenOutcome {
    pub history: HistoryStatus,
}

pub struct ConversationSession<B, C> {
    state: Mutex<SessionState>,
    scope: Mutex<Option<ConversationScope>>,
    credential: Mutex<Option<Credential>>,
    store: Arc<Mutex<MessageStore>>,
    /// Set on close; inbound callbacks check it before touching the store
    closed: Arc<AtomicBool>,
    loader: HistoryLoader<B>,
    channel: RealtimeChannel<B, C>,
    reports: ReportCache<B>,
    events: broadcast::Sender<SessionEvent>,
    state_forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Backend, C: Connector> ConversationSession<B, C> {
    pub fn new(backend: Arc<B>, connector: C, config: &Config) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            state: Mutex::new(SessionState::Idle),
            scope: Mutex::new(None),
            credential: Mutex::new(None),
            store: Arc::new(Mutex::new(MessageStore::new())),
            closed: Arc::new(AtomicBool::new(false)),
            loader: HistoryLoader::new(backend.clone()),
            channel: RealtimeChannel::new(backend.clone(), connector, config),
            reports: ReportCache::new(backend),
            events,
            state_forwarder: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn scope(&self) -> Option<ConversationScope> {
        lock(&self.scope).clone()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Receive change notifications. The only push surface of the session.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Load history and open the channel concurrently, then go `Active`.
    ///
    /// A channel failure fails the open and puts the session back to `Idle`.
    /// A history failure does not: the outcome reports it and the channel
    /// keeps merging live messages.
    pub async fn open(
        &self,
        scope: ConversationScope,
        credential: Credential,
    ) -> Result<OpenOutcome> {
        self.transition(SessionState::Idle, SessionState::Opening)?;
        let conversation_id = scope.conversation_id();
        info!("Opening conversation {}", conversation_id);

        *lock(&self.scope) = Some(scope.clone());
        *lock(&self.credential) = Some(credential.clone());
        self.wire_channel();
        self.forward_channel_state();

        let (history, connected) = tokio::join!(
            self.loader.load(&scope),
            self.channel.open(scope.clone(), credential)
        );

        if self.closed.load(Ordering::Acquire) {
            debug!("Session closed while opening {}, discarding results", conversation_id);
            self.channel.close();
            return Err(ChatError::SessionClosed);
        }

        if let Err(e) = connected {
            warn!("Could not open {}: {}", conversation_id, e);
            self.channel.close();
            self.stop_forwarder();
            *lock(&self.store) = MessageStore::new();
            *lock(&self.state) = SessionState::Idle;
            return Err(e);
        }

        let history = match history {
            Ok(messages) => HistoryStatus::Loaded(self.seed(messages)),
            Err(e) => {
                warn!("History for {} unavailable: {}", conversation_id, e);
                let _ = self.events.send(SessionEvent::HistoryFailed {
                    reason: e.to_string(),
                });
                HistoryStatus::Failed(e)
            }
        };

        self.transition(SessionState::Opening, SessionState::Active)
            .map_err(|_| ChatError::SessionClosed)?;
        info!("Conversation {} active", conversation_id);
        Ok(OpenOutcome { history })
    }

    /// Send a new message. Nothing is added locally until the backend
    /// acknowledges it or it comes back through the channel.
    pub async fn send(&self, kind: MessageKind) -> Result<SendReceipt> {
        let outgoing = self.compose(kind)?;
        self.send_outgoing(outgoing).await
    }

    pub async fn send_text(&self, body: impl Into<String>) -> Result<SendReceipt> {
        self.send(MessageKind::text(body)).await
    }

    /// Build an outgoing message without sending it, so a failed send can be
    /// retried under the same client reference.
    pub fn compose(&self, kind: MessageKind) -> Result<OutgoingMessage> {
        let scope = self
            .scope()
            .ok_or_else(|| ChatError::SessionState("session is not open".to_string()))?;
        Ok(OutgoingMessage::new(&scope, kind))
    }

    pub async fn send_outgoing(&self, outgoing: OutgoingMessage) -> Result<SendReceipt> {
        self.require_active()?;
        let client_ref = outgoing.client_ref;

        match self.channel.send(outgoing).await {
            Ok(receipt) => {
                if let Some(message) = receipt.message() {
                    self.merge(message.clone());
                }
                Ok(receipt)
            }
            Err(e) => {
                warn!("Message {} not sent: {}", client_ref, e);
                Err(e)
            }
        }
    }

    /// Reload history after a failed first load. No-op once seeded.
    pub async fn retry_history(&self) -> Result<usize> {
        self.require_active()?;
        if lock(&self.store).is_seeded() {
            debug!("History already loaded");
            return Ok(0);
        }
        let scope = self
            .scope()
            .ok_or_else(|| ChatError::SessionState("session is not open".to_string()))?;

        match self.loader.load(&scope).await {
            Ok(messages) => {
                self.require_active()?;
                Ok(self.seed(messages))
            }
            Err(e) => {
                let _ = self.events.send(SessionEvent::HistoryFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Manually reopen a dropped channel
    pub async fn reconnect(&self) -> Result<()> {
        self.require_active()?;
        let (scope, credential) = match (self.scope(), lock(&self.credential).clone()) {
            (Some(scope), Some(credential)) => (scope, credential),
            _ => return Err(ChatError::SessionState("session is not open".to_string())),
        };
        self.channel.open(scope, credential).await
    }

    pub fn ordered_view(&self) -> Vec<Message> {
        lock(&self.store).ordered_view()
    }

    pub fn ordered_view_filtered<F>(&self, filter: F) -> Vec<Message>
    where
        F: Fn(&Message) -> bool,
    {
        lock(&self.store).ordered_view_filtered(filter)
    }

    pub fn group_by_date(&self) -> Vec<DateGroup> {
        lock(&self.store).group_by_date()
    }

    pub fn last_message(&self) -> Option<Message> {
        lock(&self.store).last()
    }

    pub fn message_count(&self) -> usize {
        lock(&self.store).len()
    }

    pub fn is_history_loaded(&self) -> bool {
        lock(&self.store).is_seeded()
    }

    pub async fn report_metadata(&self, report_id: &str) -> Result<ReportMeta> {
        self.reports.metadata(report_id).await
    }

    pub async fn report_content(&self, report_id: &str) -> Result<Bytes> {
        self.reports.content(report_id).await
    }

    /// Tear down the channel and discard the store. Idempotent.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), SessionState::Closed);
        if previous == SessionState::Closed {
            return;
        }

        self.closed.store(true, Ordering::Release);
        self.channel.close();
        self.channel.clear_handlers();
        self.stop_forwarder();
        *lock(&self.store) = MessageStore::new();
        let _ = self.events.send(SessionEvent::Closed);

        match self.scope() {
            Some(scope) => info!("Conversation {} closed", scope.conversation_id()),
            None => debug!("Idle session closed"),
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(match *state {
                SessionState::Closed => ChatError::SessionClosed,
                current => ChatError::SessionState(format!(
                    "cannot go {:?} -> {:?} from {:?}",
                    from, to, current
                )),
            });
        }
        *state = to;
        Ok(())
    }

    fn require_active(&self) -> Result<()> {
        match self.state() {
            SessionState::Active => Ok(()),
            SessionState::Closed => Err(ChatError::SessionClosed),
            other => Err(ChatError::SessionState(format!(
                "session is {:?}, not Active",
                other
            ))),
        }
    }

    fn seed(&self, messages: Vec<Message>) -> usize {
        let count = messages.len();
        if lock(&self.store).seed(messages) {
            let _ = self.events.send(SessionEvent::HistoryLoaded { count });
        }
        count
    }

    fn merge(&self, message: Message) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if lock(&self.store).insert(message.clone()) {
            let _ = self.events.send(SessionEvent::MessageMerged(message));
        }
    }

    /// Route channel callbacks into the store. Insert is idempotent and
    /// order-independent, so events racing the history load are safe.
    fn wire_channel(&self) {
        let store = self.store.clone();
        let closed = self.closed.clone();
        let events = self.events.clone();
        self.channel.on_message(move |message| {
            if closed.load(Ordering::Acquire) {
                return;
            }
            if lock(&store).insert(message.clone()) {
                let _ = events.send(SessionEvent::MessageMerged(message));
            }
        });

        let closed = self.closed.clone();
        let events = self.events.clone();
        self.channel.on_error(move |error| {
            if closed.load(Ordering::Acquire) {
                return;
            }
            let _ = events.send(SessionEvent::ChannelError {
                reason: error.to_string(),
            });
        });
    }

    fn forward_channel_state(&self) {
        let mut states = self.channel.watch_state();
        let closed = self.closed.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                if closed.load(Ordering::Acquire) {
                    break;
                }
                let _ = events.send(SessionEvent::ChannelStateChanged(state));
            }
        });
        if let Some(old) = lock(&self.state_forwarder).replace(task) {
            old.abort();
        }
    }

    fn stop_forwarder(&self) {
        if let Some(task) = lock(&self.state_forwarder).take() {
            task.abort();
        }
    }
}

impl<B, C> Drop for ConversationSession<B, C> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(task) = lock(&self.state_forwarder).take() {
            task.abort();
        }
    }
}
