/// WebSocket transport tests
/// WsConnector and RealtimeChannel against a local tokio-tungstenite server

mod common;

use carechat_core::message::Credential;
use carechat_core::realtime::{ChannelState, Connector, RealtimeChannel, SubscribeRequest, WsConnector};
use carechat_core::ChatError;
use common::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;

fn request() -> SubscribeRequest {
    SubscribeRequest::new(scope(), Credential::new("ws-token"))
}

#[tokio::test]
async fn test_connector_subscribes_and_yields_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (subscribed_tx, subscribed_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let first = ws.next().await.unwrap().unwrap();
        subscribed_tx.send(first.into_text().unwrap()).unwrap();

        ws.send(WsMessage::Text(frame(&record("patient", "hi", "09:00"))))
            .await
            .unwrap();
        ws.send(WsMessage::Ping(vec![1, 2, 3])).await.unwrap();
        ws.send(WsMessage::Text(r#"{"type":"typing"}"#.to_string()))
            .await
            .unwrap();
        ws.send(WsMessage::Binary(
            record("doctor", "binary", "09:01").to_string().into_bytes(),
        ))
        .await
        .unwrap();
        // Keep the socket open until the client has read everything
        tokio::time::sleep(Duration::from_millis(300)).await;
    });

    let connector = WsConnector::new(format!("ws://{}", addr));
    let mut frames = connector.connect(&request()).await.unwrap();

    let subscribe: Value = serde_json::from_str(&subscribed_rx.await.unwrap()).unwrap();
    assert_eq!(subscribe["type"], "subscribe");
    assert_eq!(subscribe["token"], "ws-token");
    assert_eq!(subscribe["conversationId"], scope().conversation_id());
    assert_eq!(subscribe["participant"]["id"], "d1");

    let mut received = Vec::new();
    for _ in 0..3 {
        let next = timeout(Duration::from_secs(1), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        received.push(next);
    }
    assert!(received[0].contains("\"hi\""));
    assert!(received[1].contains("typing"));
    assert!(received[2].contains("binary"));

    server.abort();
}

#[tokio::test]
async fn test_connector_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let connector = WsConnector::new(format!("ws://{}", addr));
    assert!(matches!(
        connector.connect(&request()).await,
        Err(ChatError::ChannelConnection(_))
    ));
}

#[tokio::test]
async fn test_channel_delivers_and_reports_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (go_tx, go_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _subscribe = ws.next().await;

        ws.send(WsMessage::Text(frame(&record("laboratory", "results ready", "11:00"))))
            .await
            .unwrap();
        ws.send(WsMessage::Text("garbage".to_string())).await.unwrap();
        ws.send(WsMessage::Text(frame(&record("laboratory", "second", "11:01"))))
            .await
            .unwrap();

        let _ = go_rx.await;
        let _ = ws.close(None).await;
    });

    let backend = FakeBackend::new(HistoryScript::NotFound);
    let channel = RealtimeChannel::new(
        backend,
        WsConnector::new(format!("ws://{}", addr)),
        &test_config(),
    );

    let (message_tx, mut message_rx) = mpsc::unbounded_channel();
    channel.on_message(move |m| {
        let _ = message_tx.send(m);
    });
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    channel.on_error(move |e| {
        let _ = error_tx.send(e);
    });

    channel
        .open(scope(), Credential::new("ws-token"))
        .await
        .unwrap();
    assert_eq!(channel.state(), ChannelState::Connected);

    let first = timeout(Duration::from_secs(1), message_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(1), message_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.kind.display_text(), "results ready");
    assert_eq!(second.kind.display_text(), "second");

    go_tx.send(()).unwrap();
    let dropped = timeout(Duration::from_secs(1), error_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(dropped, ChatError::ChannelConnection(_)));
    assert_eq!(channel.state(), ChannelState::Disconnected);

    channel.close();
    server.abort();
}
