/// Realtime channel: one live subscription per conversation
///
/// State machine:
///   Disconnected → Connecting → Connected → Disconnected (error/close)
///   Connected → Reconnecting → Connected | Disconnected   (only with a ReconnectPolicy)
///
/// Receiving happens over the subscription; sending always goes through the
/// backend's request/response call so the caller can see the outcome.
use crate::backend::{Backend, OutgoingMessage, SendReceipt};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::message::{ConversationScope, Credential, Message};
use crate::realtime::protocol::{InboundEvent, SubscribeRequest};
use crate::realtime::reconnect::ReconnectPolicy;
use crate::realtime::transport::{Connector, FrameStream};
use crate::utils::lock;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Connection state of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Retrying after a drop; only entered with a reconnect policy
    Reconnecting,
}

type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(ChatError) + Send + Sync>;

/// State shared with the reader task
struct Shared {
    state: watch::Sender<ChannelState>,
    on_message: Mutex<Option<MessageHandler>>,
    on_error: Mutex<Option<ErrorHandler>>,
    /// Bumped on every open/close; a reader whose epoch is stale stops delivering
    epoch: AtomicU64,
}

impl Shared {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch
    }

    fn set_state(&self, next: ChannelState) {
        let changed = self.state.send_if_modified(|s| {
            if *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
        if changed {
            debug!("Channel state -> {:?}", next);
        }
    }

    fn deliver(&self, message: Message) {
        let handler = lock(&self.on_message).clone();
        match handler {
            Some(handler) => handler(message),
            None => debug!("Inbound message with no consumer registered"),
        }
    }

    fn fail(&self, error: ChatError) {
        self.set_state(ChannelState::Disconnected);
        warn!("Channel dropped: {}", error);
        let handler = lock(&self.on_error).clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }
}

pub struct RealtimeChannel<B, C> {
    backend: Arc<B>,
    connector: Arc<C>,
    connect_timeout: Duration,
    send_timeout: Duration,
    reconnect: Option<ReconnectPolicy>,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Backend, C: Connector> RealtimeChannel<B, C> {
    pub fn new(backend: Arc<B>, connector: C, config: &Config) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            backend,
            connector: Arc::new(connector),
            connect_timeout: config.connect_timeout,
            send_timeout: config.request_timeout,
            reconnect: config.reconnect,
            shared: Arc::new(Shared {
                state,
                on_message: Mutex::new(None),
                on_error: Mutex::new(None),
                epoch: AtomicU64::new(0),
            }),
            reader: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Observe state transitions (for a "reconnecting" indicator)
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Register the single consumer of inbound messages, replacing any previous one.
    /// Delivery follows transport order; no cross-message ordering is promised.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        *lock(&self.shared.on_message) = Some(Arc::new(handler));
    }

    /// Register the callback for connection loss after a successful open
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(ChatError) + Send + Sync + 'static,
    {
        *lock(&self.shared.on_error) = Some(Arc::new(handler));
    }

    pub fn clear_handlers(&self) {
        *lock(&self.shared.on_message) = None;
        *lock(&self.shared.on_error) = None;
    }

    /// Connect and subscribe. Resolves once the handshake is done; later
    /// drops are reported through `on_error`. Only valid from `Disconnected`.
    pub async fn open(&self, scope: ConversationScope, credential: Credential) -> Result<()> {
        let started = self.shared.state.send_if_modified(|s| {
            if *s == ChannelState::Disconnected {
                *s = ChannelState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ChatError::ChannelConnection(format!(
                "channel is already {:?}",
                self.state()
            )));
        }

        let epoch = self.shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let request = SubscribeRequest::new(scope, credential);
        let conversation_id = request.scope.conversation_id();
        info!("Opening channel for {}", conversation_id);

        let stream = match connect(&*self.connector, &request, self.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                if self.shared.is_current(epoch) {
                    self.shared.set_state(ChannelState::Disconnected);
                }
                warn!("Channel open failed for {}: {}", conversation_id, e);
                return Err(e);
            }
        };

        if !self.shared.is_current(epoch) {
            return Err(ChatError::ChannelConnection(
                "channel closed while connecting".to_string(),
            ));
        }

        self.shared.set_state(ChannelState::Connected);
        info!("Channel connected for {}", conversation_id);

        let task = tokio::spawn(read_loop(
            self.shared.clone(),
            self.connector.clone(),
            request,
            stream,
            epoch,
            self.reconnect,
            self.connect_timeout,
        ));
        if let Some(old) = lock(&self.reader).replace(task) {
            old.abort();
        }
        Ok(())
    }

    /// Submit a message through the backend.
    ///
    /// Fails fast when the channel is not connected. `Timeout` means the
    /// outcome is unknown: the message may still arrive through the channel.
    pub async fn send(&self, outgoing: OutgoingMessage) -> Result<SendReceipt> {
        let state = self.state();
        if state != ChannelState::Connected {
            return Err(ChatError::ChannelConnection(format!(
                "channel is {:?}, message {} not sent",
                state, outgoing.client_ref
            )));
        }

        match timeout(self.send_timeout, self.backend.post_message(&outgoing)).await {
            Ok(Ok(receipt)) => {
                debug!("Message {} accepted", outgoing.client_ref);
                Ok(receipt)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ChatError::Timeout(format!(
                "no acknowledgement for {} after {:?}",
                outgoing.client_ref, self.send_timeout
            ))),
        }
    }

    /// Release the transport. Idempotent, valid from any state.
    pub fn close(&self) {
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(task) = lock(&self.reader).take() {
            task.abort();
        }
        if self.state() != ChannelState::Disconnected {
            info!("Channel closed");
        }
        self.shared.set_state(ChannelState::Disconnected);
    }
}

impl<B, C> Drop for RealtimeChannel<B, C> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reader).take() {
            task.abort();
        }
    }
}

async fn connect<C: Connector>(
    connector: &C,
    request: &SubscribeRequest,
    connect_timeout: Duration,
) -> Result<FrameStream> {
    match timeout(connect_timeout, connector.connect(request)).await {
        Ok(result) => result,
        Err(_) => Err(ChatError::ChannelConnection(format!(
            "handshake timed out after {:?}",
            connect_timeout
        ))),
    }
}

async fn read_loop<C: Connector>(
    shared: Arc<Shared>,
    connector: Arc<C>,
    request: SubscribeRequest,
    mut stream: FrameStream,
    epoch: u64,
    reconnect: Option<ReconnectPolicy>,
    connect_timeout: Duration,
) {
    let conversation_id = request.scope.conversation_id();

    loop {
        let failure = pump(&shared, &mut stream, epoch, &conversation_id).await;
        if !shared.is_current(epoch) {
            return;
        }

        let Some(policy) = reconnect else {
            shared.fail(failure);
            return;
        };

        warn!("Channel for {} lost ({}), reconnecting", conversation_id, failure);
        shared.set_state(ChannelState::Reconnecting);

        let mut reopened = None;
        for attempt in 0..policy.max_retries {
            sleep(policy.delay_for(attempt)).await;
            if !shared.is_current(epoch) {
                return;
            }
            match connect(&*connector, &request, connect_timeout).await {
                Ok(s) => {
                    reopened = Some(s);
                    break;
                }
                Err(e) => debug!("Reconnect attempt {} failed: {}", attempt + 1, e),
            }
        }

        if !shared.is_current(epoch) {
            return;
        }
        match reopened {
            Some(s) => {
                stream = s;
                shared.set_state(ChannelState::Connected);
                info!("Channel for {} reconnected", conversation_id);
            }
            None => {
                shared.fail(ChatError::ChannelConnection(format!(
                    "gave up after {} reconnect attempts: {}",
                    policy.max_retries, failure
                )));
                return;
            }
        }
    }
}

/// Deliver frames until the stream fails or ends; returns why it stopped
async fn pump(
    shared: &Shared,
    stream: &mut FrameStream,
    epoch: u64,
    conversation_id: &str,
) -> ChatError {
    while let Some(item) = stream.next().await {
        if !shared.is_current(epoch) {
            return ChatError::SessionClosed;
        }
        match item {
            Ok(text) => match InboundEvent::decode(&text, conversation_id) {
                Ok(InboundEvent::Message(message)) => shared.deliver(message),
                Ok(InboundEvent::Ignored(kind)) => debug!("Ignoring '{}' event", kind),
                Err(e) => warn!("Dropping undecodable frame: {}", e),
            },
            Err(e) => return e,
        }
    }
    ChatError::ChannelConnection("connection closed by server".to_string())
}
