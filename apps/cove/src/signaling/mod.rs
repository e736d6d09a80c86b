//! Reconnecting relay session.
//!
//! The client owns one supervisor task per `connect()`. The supervisor dials the relay
//! through a [`RelayConnector`], pumps inbound frames into [`SignalingEvent`]s and, on an
//! unexpected close, waits out an exponential backoff before dialing again.

mod memory;
mod websocket;

pub use memory::{MemoryRelay, MemoryRelayError};
pub use websocket::WebSocketConnector;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SignalingConfig;
use crate::protocol::{SessionStatus, SignalEnvelope, StatusPayload};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Closed,
    Expired,
    Deleted,
    /// The relay refused the socket (unknown token, unknown participant or a finished session).
    Rejected,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EndReason::Closed => "closed",
            EndReason::Expired => "expired",
            EndReason::Deleted => "deleted",
            EndReason::Rejected => "rejected",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    StateChanged(SignalingState),
    Status(SessionStatus),
    SessionEnded(EndReason),
    /// Opaque payload for the orchestrator; usually a `signal` envelope from the peer.
    Signal(Value),
    /// Recoverable relay-side complaint (`{type:"error"}`).
    Error(String),
    GaveUp { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling transport is not connected")]
    NotConnected,
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("relay refused connection (code {0})")]
    Refused(u16),
}

/// Frames delivered by a live relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayInbound {
    Text(String),
    Closed { code: Option<u16> },
}

/// One live relay socket. Dropping `outbound` closes it cleanly.
pub struct RelayConnection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<RelayInbound>,
}

#[async_trait]
pub trait RelayConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        token: &str,
        participant_id: &str,
    ) -> Result<RelayConnection, SignalingError>;
}

struct Shared {
    token: String,
    participant_id: String,
    config: SignalingConfig,
    connector: Arc<dyn RelayConnector>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    state: Mutex<SignalingState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    intentional_close: AtomicBool,
}

impl Shared {
    fn set_state(&self, next: SignalingState) {
        let changed = {
            let mut state = self.state.lock();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            tracing::debug!(
                target = "cove::signaling",
                participant_id = %self.participant_id,
                state = ?next,
                "signaling state changed"
            );
            let _ = self.events.send(SignalingEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }
}

pub struct SignalingClient {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    pub fn new(
        token: impl Into<String>,
        participant_id: impl Into<String>,
        config: SignalingConfig,
        connector: Arc<dyn RelayConnector>,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                token: token.into(),
                participant_id: participant_id.into(),
                config,
                connector,
                events,
                state: Mutex::new(SignalingState::Disconnected),
                outbound: Mutex::new(None),
                intentional_close: AtomicBool::new(false),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SignalingState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SignalingState::Connected
    }

    /// Starts the supervisor. Calling again while it is alive is a no-op.
    pub fn connect(&self) {
        let mut supervisor = self.supervisor.lock();
        if supervisor
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        self.shared.intentional_close.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        *supervisor = Some(tokio::spawn(supervise(shared)));
    }

    /// Closes the socket and suppresses reconnects until the next `connect()`.
    pub fn disconnect(&self) {
        self.shared.intentional_close.store(true, Ordering::SeqCst);
        let handle = self.supervisor.lock().take();
        let had_socket = self.shared.outbound.lock().take().is_some();
        if had_socket {
            self.shared.set_state(SignalingState::Closing);
        }
        if let Some(handle) = handle {
            handle.abort();
        }
        self.shared.set_state(SignalingState::Disconnected);
    }

    /// Sends immediately or fails with `NotConnected`; nothing is buffered.
    pub fn send(&self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        let text = serde_json::to_string(envelope)?;
        self.send_text(text)
    }

    pub fn send_text(&self, text: String) -> Result<(), SignalingError> {
        let outbound = self.shared.outbound.lock();
        match outbound.as_ref() {
            Some(sender) if self.state() == SignalingState::Connected => sender
                .send(text)
                .map_err(|_| SignalingError::NotConnected),
            _ => Err(SignalingError::NotConnected),
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}

enum PumpOutcome {
    Closed(Option<u16>),
    SessionEnded,
}

async fn supervise(shared: Arc<Shared>) {
    let mut attempt: u32 = 0;
    loop {
        shared.set_state(if attempt == 0 {
            SignalingState::Connecting
        } else {
            SignalingState::Reconnecting
        });

        match shared
            .connector
            .connect(&shared.token, &shared.participant_id)
            .await
        {
            Ok(connection) => {
                attempt = 0;
                *shared.outbound.lock() = Some(connection.outbound);
                shared.set_state(SignalingState::Connected);
                let outcome = pump(&shared, connection.inbound).await;
                shared.outbound.lock().take();
                if shared.intentional_close.load(Ordering::SeqCst) {
                    shared.set_state(SignalingState::Disconnected);
                    return;
                }
                match outcome {
                    PumpOutcome::SessionEnded | PumpOutcome::Closed(Some(CLOSE_NORMAL)) => {
                        tracing::debug!(
                            target = "cove::signaling",
                            participant_id = %shared.participant_id,
                            "relay closed cleanly; not reconnecting"
                        );
                        shared.set_state(SignalingState::Disconnected);
                        return;
                    }
                    PumpOutcome::Closed(Some(CLOSE_POLICY_VIOLATION)) => {
                        refused(&shared, CLOSE_POLICY_VIOLATION);
                        return;
                    }
                    PumpOutcome::Closed(code) => {
                        tracing::info!(
                            target = "cove::signaling",
                            participant_id = %shared.participant_id,
                            code = ?code,
                            "relay connection dropped"
                        );
                    }
                }
            }
            Err(SignalingError::Refused(code)) => {
                refused(&shared, code);
                return;
            }
            Err(err) => {
                tracing::warn!(
                    target = "cove::signaling",
                    participant_id = %shared.participant_id,
                    attempt,
                    error = %err,
                    "relay connect failed"
                );
            }
        }

        attempt += 1;
        if attempt > shared.config.max_reconnect_attempts {
            tracing::warn!(
                target = "cove::signaling",
                participant_id = %shared.participant_id,
                attempts = attempt - 1,
                "giving up on relay"
            );
            shared.set_state(SignalingState::Error);
            shared.emit(SignalingEvent::GaveUp {
                attempts: attempt - 1,
            });
            return;
        }
        let delay = shared.config.reconnect_delay(attempt);
        shared.set_state(SignalingState::Reconnecting);
        tracing::debug!(
            target = "cove::signaling",
            participant_id = %shared.participant_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling relay reconnect"
        );
        tokio::time::sleep(delay).await;
        if shared.intentional_close.load(Ordering::SeqCst) {
            return;
        }
    }
}

fn refused(shared: &Shared, code: u16) {
    tracing::warn!(
        target = "cove::signaling",
        participant_id = %shared.participant_id,
        code,
        "relay refused the session socket"
    );
    shared.set_state(SignalingState::Error);
    shared.emit(SignalingEvent::SessionEnded(EndReason::Rejected));
}

async fn pump(shared: &Shared, mut inbound: mpsc::UnboundedReceiver<RelayInbound>) -> PumpOutcome {
    let mut ended = false;
    while let Some(frame) = inbound.recv().await {
        match frame {
            RelayInbound::Text(text) => {
                if let Some(event) = classify(&text) {
                    ended |= matches!(event, SignalingEvent::SessionEnded(_));
                    shared.emit(event);
                }
            }
            RelayInbound::Closed { code } => {
                return if ended {
                    PumpOutcome::SessionEnded
                } else {
                    PumpOutcome::Closed(code)
                };
            }
        }
    }
    if ended {
        PumpOutcome::SessionEnded
    } else {
        PumpOutcome::Closed(None)
    }
}

/// Maps one relay frame onto an event. Frames that are not JSON objects are dropped.
pub fn classify(text: &str) -> Option<SignalingEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) | Err(_) => {
            tracing::debug!(target = "cove::signaling", "dropping malformed relay frame");
            return None;
        }
    };
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "status" => match serde_json::from_value::<StatusPayload>(value) {
            Ok(payload) => Some(SignalingEvent::Status(payload.normalize())),
            Err(err) => {
                tracing::debug!(
                    target = "cove::signaling",
                    error = %err,
                    "dropping unparsable status frame"
                );
                None
            }
        },
        "session_closed" => Some(SignalingEvent::SessionEnded(EndReason::Closed)),
        "session_expired" => Some(SignalingEvent::SessionEnded(EndReason::Expired)),
        "session_deleted" => Some(SignalingEvent::SessionEnded(EndReason::Deleted)),
        "error" => Some(SignalingEvent::Error(
            value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("relay error")
                .to_string(),
        )),
        _ => Some(SignalingEvent::Signal(value)),
    }
}
