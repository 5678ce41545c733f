/// Channel transports
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::realtime::protocol::SubscribeRequest;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Inbound text frames; an `Err` item means the transport failed
pub type FrameStream = BoxStream<'static, Result<String>>;

/// Opens a subscription. The returned stream ends when the remote closes.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, request: &SubscribeRequest) -> impl Future<Output = Result<FrameStream>> + Send;
}

/// WebSocket connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ws_url.clone())
    }
}

impl Connector for WsConnector {
    async fn connect(&self, request: &SubscribeRequest) -> Result<FrameStream> {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ChatError::ChannelConnection(format!("{}: {}", self.url, e)))?;

        let frame = serde_json::to_string(&request.frame())?;
        ws.send(WsMessage::Text(frame))
            .await
            .map_err(|e| ChatError::ChannelConnection(format!("subscribe failed: {}", e)))?;

        info!(
            "Subscribed to {} on {}",
            request.scope.conversation_id(),
            self.url
        );

        let frames = ws.filter_map(|item| async move {
            match item {
                Ok(WsMessage::Text(text)) => Some(Ok(text)),
                Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        warn!("Dropping non UTF-8 binary frame");
                        None
                    }
                },
                Ok(WsMessage::Close(reason)) => {
                    debug!("Server closed channel: {:?}", reason);
                    None
                }
                // ping/pong are answered by tungstenite itself
                Ok(_) => None,
                Err(e) => Some(Err(ChatError::ChannelConnection(e.to_string()))),
            }
        });

        Ok(frames.boxed())
    }
}
