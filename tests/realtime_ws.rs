//! Real-time client against a local WebSocket server
//!
//! Run with: cargo test --test realtime_ws

#![cfg(feature = "websocket")]

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use vitalsync::auth::StaticTokenProvider;
use vitalsync::realtime::{
    ChannelMessage, ConnectionState, EventProcessor, MessageType, RealtimeClient, WsConnector,
};
use vitalsync::storage::RecordStore;
use vitalsync::{RealtimeConfig, Storage, SyncStatus};

#[derive(Clone)]
struct ServerState {
    headers: Arc<Mutex<Vec<(String, String)>>>,
    received: mpsc::UnboundedSender<ChannelMessage>,
    push: Arc<Mutex<Vec<ChannelMessage>>>,
}

async fn upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    {
        let mut seen = state.headers.lock();
        for name in ["authorization", "x-client-type", "x-client-id"] {
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                seen.push((name.to_string(), value.to_string()));
            }
        }
    }
    ws.on_upgrade(move |socket| serve(socket, state))
}

async fn serve(mut socket: WebSocket, state: ServerState) {
    // Wait for the handshake before pushing anything
    while let Some(Ok(frame)) = socket.recv().await {
        let Message::Text(text) = frame else { continue };
        let Ok(message) = ChannelMessage::decode(text.as_bytes()) else { continue };
        let is_handshake = message.message_type == MessageType::Handshake;
        let is_ping = message.message_type == MessageType::Ping;
        let _ = state.received.send(message);

        if is_handshake {
            let outgoing: Vec<ChannelMessage> = state.push.lock().drain(..).collect();
            for msg in outgoing {
                if socket.send(Message::Text(msg.encode().unwrap())).await.is_err() {
                    return;
                }
            }
        }
        if is_ping {
            let pong = ChannelMessage::new(MessageType::Pong, Vec::new());
            let _ = socket.send(Message::Text(pong.encode().unwrap())).await;
        }
    }
}

async fn start_server(push: Vec<ChannelMessage>) -> (String, ServerState, mpsc::UnboundedReceiver<ChannelMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = ServerState {
        headers: Arc::new(Mutex::new(Vec::new())),
        received: tx,
        push: Arc::new(Mutex::new(push)),
    };
    let app = Router::new()
        .route("/ws", get(upgrade))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("ws://{}/ws", addr), state, rx)
}

fn client_for(url: String, token: Option<&str>) -> RealtimeClient {
    let config = RealtimeConfig {
        url,
        ..Default::default()
    };
    RealtimeClient::new(
        config,
        Arc::new(StaticTokenProvider::new(token.map(str::to_string))),
        Arc::new(WsConnector::new(Duration::from_secs(5))),
    )
}

#[tokio::test]
async fn test_connect_handshake_and_push_update_applied() {
    let metric_id = Uuid::new_v4();
    let update = ChannelMessage::json(
        MessageType::MetricUpdate,
        &json!({
            "metricId": metric_id.to_string(),
            "type": "heart_rate",
            "value": 57.0,
            "unit": "bpm",
            "timestamp": "2024-05-01T06:30:00Z",
            "source": "watch"
        }),
    )
    .unwrap();
    let (url, server, mut received) = start_server(vec![update.clone()]).await;

    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let processor = Arc::new(EventProcessor::new(storage.clone()));
    let client = client_for(url, Some("secret-token"));
    processor.attach(&client);
    let mut events = client.events();

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    let handshake = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handshake.message_type, MessageType::Handshake);

    let headers = server.headers.lock().clone();
    assert!(headers.contains(&("authorization".into(), "Bearer secret-token".into())));
    assert!(headers.contains(&("x-client-type".into(), "vitalsync".into())));

    let pushed = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed.id, update.id);

    let record = storage.get_record(metric_id).unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.payload["value"], json!(57.0));

    client.request_insight_update("ins-42").await.unwrap();
    let request = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.message_type, MessageType::InsightUpdateRequest);
    assert_eq!(
        request.payload_json::<serde_json::Value>().unwrap(),
        json!({"insightId": "ins-42"})
    );

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.reconnect_pending());
}

#[tokio::test]
async fn test_unreachable_server_schedules_reconnect() {
    // Bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(format!("ws://{}/ws", addr), Some("t"));
    assert!(client.connect().await.is_err());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.last_error().is_some());
    assert!(client.reconnect_pending());

    client.disconnect();
    assert!(!client.reconnect_pending());
}
