use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use cove_core::config::SignalingConfig;
use cove_core::protocol::{SessionDescription, SignalEnvelope};
use cove_core::signaling::{
    EndReason, SignalingClient, SignalingEvent, SignalingState, WebSocketConnector,
};

#[derive(Clone)]
struct StubRelay {
    upgrades: Arc<AtomicUsize>,
    received: mpsc::UnboundedSender<(String, Value)>,
}

#[derive(Deserialize)]
struct JoinQuery {
    #[serde(rename = "participantId")]
    participant_id: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<StubRelay>,
    Path(token): Path<String>,
    Query(query): Query<JoinQuery>,
) -> Response {
    match token.as_str() {
        "known" => {
            state.upgrades.fetch_add(1, Ordering::SeqCst);
            ws.on_upgrade(move |socket| relay_socket(socket, query.participant_id, state))
                .into_response()
        }
        "finished" => {
            state.upgrades.fetch_add(1, Ordering::SeqCst);
            ws.on_upgrade(|mut socket| async move {
                let _ = socket
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: 1008,
                        reason: "session is no longer active".into(),
                    })))
                    .await;
            })
            .into_response()
        }
        _ => (StatusCode::FORBIDDEN, "unknown session").into_response(),
    }
}

/// Pushes a status frame, echoes the first signal back as if the peer sent it, then ends
/// the session.
async fn relay_socket(socket: WebSocket, participant_id: String, state: StubRelay) {
    let (mut sender, mut receiver) = socket.split();
    let status = json!({
        "type": "status",
        "status": "active",
        "token": "known",
        "message_char_limit": 2000,
        "participants": [
            {"participant_id": participant_id, "role": "host"},
            {"participant_id": "peer-2", "role": "guest"},
        ],
        "connected_participants": [participant_id, "peer-2"],
    });
    if sender
        .send(WsMessage::Text(status.to_string()))
        .await
        .is_err()
    {
        return;
    }

    while let Some(Ok(message)) = receiver.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(mut value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let _ = state.received.send((participant_id.clone(), value.clone()));
        value["sender"] = Value::String("peer-2".into());
        let _ = sender.send(WsMessage::Text(value.to_string())).await;
        let _ = sender
            .send(WsMessage::Text(json!({"type": "session_closed"}).to_string()))
            .await;
        let _ = sender
            .send(WsMessage::Close(Some(CloseFrame {
                code: 1000,
                reason: "".into(),
            })))
            .await;
        break;
    }
}

async fn start_stub() -> (SocketAddr, StubRelay, mpsc::UnboundedReceiver<(String, Value)>) {
    let (received, frames) = mpsc::unbounded_channel();
    let state = StubRelay {
        upgrades: Arc::new(AtomicUsize::new(0)),
        received,
    };
    let app = Router::new()
        .route("/ws/sessions/:token", get(ws_handler))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state, frames)
}

fn client(
    addr: SocketAddr,
    token: &str,
) -> (SignalingClient, mpsc::UnboundedReceiver<SignalingEvent>) {
    let relay_url = format!("ws://{addr}/ws/sessions");
    let config = SignalingConfig {
        relay_url: relay_url.clone(),
        reconnect_base_delay: Duration::from_millis(50),
        ..SignalingConfig::default()
    };
    let (tx, events) = mpsc::unbounded_channel();
    let client = SignalingClient::new(
        token,
        "p-1",
        config,
        Arc::new(WebSocketConnector::new(relay_url)),
        tx,
    );
    (client, events)
}

async fn next_matching(
    events: &mut mpsc::UnboundedReceiver<SignalingEvent>,
    mut predicate: impl FnMut(&SignalingEvent) -> bool,
) -> SignalingEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for signaling event")
            .expect("signaling event stream ended");
        if predicate(&event) {
            return event;
        }
    }
}

#[test_timeout::session_test(timeout = 20)]
async fn status_and_signals_cross_a_real_websocket() {
    let (addr, state, mut frames) = start_stub().await;
    let (client, mut events) = client(addr, "known");
    client.connect();

    let SignalingEvent::Status(status) =
        next_matching(&mut events, |event| matches!(event, SignalingEvent::Status(_))).await
    else {
        unreachable!()
    };
    assert!(status.is_active());
    assert_eq!(status.connected_count(), 2);
    assert_eq!(status.message_char_limit, Some(2000));
    assert!(client.is_connected());

    let offer = SignalEnvelope::offer(&SessionDescription::offer("v=0")).unwrap();
    client.send(&offer).unwrap();
    let (from, frame) = frames.recv().await.unwrap();
    assert_eq!(from, "p-1");
    assert_eq!(frame["type"], "signal");
    assert_eq!(frame["signalType"], "offer");
    assert_eq!(frame["payload"]["type"], "offer");

    let SignalingEvent::Signal(echoed) =
        next_matching(&mut events, |event| matches!(event, SignalingEvent::Signal(_))).await
    else {
        unreachable!()
    };
    assert_eq!(echoed["sender"], "peer-2");

    let ended = next_matching(&mut events, |event| {
        matches!(event, SignalingEvent::SessionEnded(_))
    })
    .await;
    assert_eq!(ended, SignalingEvent::SessionEnded(EndReason::Closed));
    next_matching(&mut events, |event| {
        *event == SignalingEvent::StateChanged(SignalingState::Disconnected)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(state.upgrades.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), SignalingState::Disconnected);
}

#[test_timeout::session_test(timeout = 20)]
async fn unknown_token_is_refused_at_the_handshake() {
    let (addr, state, _frames) = start_stub().await;
    let (client, mut events) = client(addr, "missing");
    client.connect();

    let ended = next_matching(&mut events, |event| {
        matches!(event, SignalingEvent::SessionEnded(_))
    })
    .await;
    assert_eq!(ended, SignalingEvent::SessionEnded(EndReason::Rejected));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.state(), SignalingState::Error);
    assert_eq!(state.upgrades.load(Ordering::SeqCst), 0);
}

#[test_timeout::session_test(timeout = 20)]
async fn policy_close_is_a_rejection() {
    let (addr, state, _frames) = start_stub().await;
    let (client, mut events) = client(addr, "finished");
    client.connect();

    let ended = next_matching(&mut events, |event| {
        matches!(event, SignalingEvent::SessionEnded(_))
    })
    .await;
    assert_eq!(ended, SignalingEvent::SessionEnded(EndReason::Rejected));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(state.upgrades.load(Ordering::SeqCst), 1);
}
