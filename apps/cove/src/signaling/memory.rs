//! In-process relay with the same routing rules as the hosted one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;

use super::{
    CLOSE_NORMAL, RelayConnection, RelayConnector, RelayInbound, SignalingError,
};
use crate::protocol::{ParticipantRole, SessionState, StatusParticipant, StatusPayload};

pub const DEFAULT_MESSAGE_CHAR_LIMIT: usize = 2000;
const DEFAULT_SESSION_TTL_SECONDS: i64 = 3600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryRelayError {
    #[error("session {0} not found")]
    UnknownSession(String),
    #[error("session already has two participants")]
    SessionFull,
    #[error("session is no longer joinable")]
    SessionFinished,
}

struct Participant {
    id: String,
    role: ParticipantRole,
    joined_at: DateTime<Utc>,
}

struct Socket {
    id: u64,
    sender: mpsc::UnboundedSender<RelayInbound>,
}

struct RelaySession {
    status: SessionState,
    message_char_limit: usize,
    ttl_seconds: i64,
    validity_expires_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    participants: Vec<Participant>,
    sockets: Vec<(String, Socket)>,
}

impl RelaySession {
    fn status_frame(&self, token: &str) -> String {
        let now = Utc::now();
        let remaining_seconds = match (self.status, self.expires_at) {
            (SessionState::Active, Some(ends)) => Some((ends - now).num_seconds().max(0)),
            _ => None,
        };
        let payload = StatusPayload {
            status: self.status,
            token: Some(token.to_string()),
            validity_expires_at: Some(timestamp(self.validity_expires_at)),
            session_started_at: self.started_at.map(timestamp),
            session_expires_at: self.expires_at.map(timestamp),
            remaining_seconds,
            message_char_limit: Some(self.message_char_limit),
            participants: self
                .participants
                .iter()
                .map(|participant| StatusParticipant {
                    participant_id: participant.id.clone(),
                    role: Some(participant.role),
                    joined_at: Some(timestamp(participant.joined_at)),
                })
                .collect(),
            connected_participants: self.sockets.iter().map(|(id, _)| id.clone()).collect(),
        };
        let mut value = serde_json::to_value(payload).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut value {
            map.insert("type".into(), Value::String("status".into()));
        }
        value.to_string()
    }

    fn broadcast(&self, frame: &str, exclude: Option<&str>) {
        for (participant_id, socket) in &self.sockets {
            if Some(participant_id.as_str()) == exclude {
                continue;
            }
            let _ = socket.sender.send(RelayInbound::Text(frame.to_string()));
        }
    }

    fn send_to(&self, participant_id: &str, frame: &str) {
        if let Some((_, socket)) = self.sockets.iter().find(|(id, _)| id == participant_id) {
            let _ = socket.sender.send(RelayInbound::Text(frame.to_string()));
        }
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Default)]
struct RelayState {
    sessions: HashMap<String, RelaySession>,
    next_socket: u64,
    dials: HashMap<String, u32>,
    refuse_dials: u32,
}

/// Shared handle; clones talk to the same relay.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a token in the `issued` state.
    pub fn issue(&self, token: &str) {
        self.issue_with_limit(token, DEFAULT_MESSAGE_CHAR_LIMIT);
    }

    pub fn issue_with_limit(&self, token: &str, message_char_limit: usize) {
        let now = Utc::now();
        self.state.lock().sessions.insert(
            token.to_string(),
            RelaySession {
                status: SessionState::Issued,
                message_char_limit,
                ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
                validity_expires_at: now + ChronoDuration::hours(24),
                started_at: None,
                expires_at: None,
                participants: Vec::new(),
                sockets: Vec::new(),
            },
        );
    }

    /// First participant becomes host; the second becomes guest and activates the session.
    /// Re-joining with a known id returns the existing role.
    pub fn join(
        &self,
        token: &str,
        participant_id: &str,
    ) -> Result<ParticipantRole, MemoryRelayError> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(token)
            .ok_or_else(|| MemoryRelayError::UnknownSession(token.to_string()))?;
        if let Some(existing) = session
            .participants
            .iter()
            .find(|participant| participant.id == participant_id)
        {
            return Ok(existing.role);
        }
        if session.status.is_terminal() {
            return Err(MemoryRelayError::SessionFinished);
        }
        if session.participants.len() >= 2 {
            return Err(MemoryRelayError::SessionFull);
        }
        let now = Utc::now();
        let role = if session.participants.is_empty() {
            ParticipantRole::Host
        } else {
            ParticipantRole::Guest
        };
        session.participants.push(Participant {
            id: participant_id.to_string(),
            role,
            joined_at: now,
        });
        if role == ParticipantRole::Guest {
            session.status = SessionState::Active;
            session.started_at = Some(now);
            session.expires_at = Some(now + ChronoDuration::seconds(session.ttl_seconds));
        }
        Ok(role)
    }

    /// Pushes a lifecycle frame to every socket and closes them normally.
    pub fn end(&self, token: &str, status: SessionState) {
        let frame = match status {
            SessionState::Expired => "session_expired",
            SessionState::Deleted => "session_deleted",
            _ => "session_closed",
        };
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(token) else {
            return;
        };
        session.status = if status.is_terminal() {
            status
        } else {
            SessionState::Closed
        };
        session.broadcast(&json!({ "type": frame }).to_string(), None);
        for (_, socket) in session.sockets.drain(..) {
            let _ = socket.sender.send(RelayInbound::Closed {
                code: Some(CLOSE_NORMAL),
            });
        }
    }

    /// Moves the session to `status` without closing sockets and pushes the new status.
    pub fn set_status(&self, token: &str, status: SessionState) {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(token) else {
            return;
        };
        session.status = status;
        let frame = session.status_frame(token);
        session.broadcast(&frame, None);
    }

    /// Severs a participant's socket without a close code, as a network drop would.
    pub fn drop_connection(&self, token: &str, participant_id: &str) {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(token) else {
            return;
        };
        if let Some(index) = session
            .sockets
            .iter()
            .position(|(id, _)| id == participant_id)
        {
            let (_, socket) = session.sockets.remove(index);
            let _ = socket.sender.send(RelayInbound::Closed { code: None });
            let frame = session.status_frame(token);
            session.broadcast(&frame, None);
        }
    }

    /// Makes the next `count` dials fail as if the relay were unreachable.
    pub fn refuse_next_dials(&self, count: u32) {
        self.state.lock().refuse_dials = count;
    }

    pub fn dial_count(&self, participant_id: &str) -> u32 {
        self.state
            .lock()
            .dials
            .get(participant_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn connected(&self, token: &str) -> Vec<String> {
        self.state
            .lock()
            .sessions
            .get(token)
            .map(|session| session.sockets.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn status(&self, token: &str) -> Option<SessionState> {
        self.state
            .lock()
            .sessions
            .get(token)
            .map(|session| session.status)
    }

    fn handle_frame(&self, token: &str, participant_id: &str, text: &str) {
        let state = self.state.lock();
        let Some(session) = state.sessions.get(token) else {
            return;
        };
        let payload: Value = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(_) => {
                session.send_to(participant_id, &error_frame("Invalid payload format."));
                return;
            }
        };
        if payload.get("type").and_then(Value::as_str) != Some("signal") {
            session.send_to(participant_id, &error_frame("Unsupported message type."));
            return;
        }
        let Some(signal_type) = payload
            .get("signalType")
            .filter(|value| !value.is_null() && value.as_str() != Some(""))
        else {
            session.send_to(participant_id, &error_frame("signalType is required."));
            return;
        };
        let forwarded = json!({
            "type": "signal",
            "signalType": signal_type,
            "payload": payload.get("payload").cloned().unwrap_or(Value::Null),
            "sender": participant_id,
        });
        session.broadcast(&forwarded.to_string(), Some(participant_id));
    }

    fn disconnect(&self, token: &str, participant_id: &str, socket_id: u64) {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(token) else {
            return;
        };
        let before = session.sockets.len();
        session
            .sockets
            .retain(|(id, socket)| !(id == participant_id && socket.id == socket_id));
        if session.sockets.len() != before {
            let frame = session.status_frame(token);
            session.broadcast(&frame, None);
        }
    }
}

fn error_frame(message: &str) -> String {
    json!({ "type": "error", "message": message }).to_string()
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(
        &self,
        token: &str,
        participant_id: &str,
    ) -> Result<RelayConnection, SignalingError> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<RelayInbound>();
        let socket_id = {
            let mut state = self.state.lock();
            *state.dials.entry(participant_id.to_string()).or_default() += 1;
            if state.refuse_dials > 0 {
                state.refuse_dials -= 1;
                return Err(SignalingError::Connect("relay unreachable".into()));
            }
            state.next_socket += 1;
            let socket_id = state.next_socket;
            let session = state
                .sessions
                .get_mut(token)
                .ok_or(SignalingError::Refused(super::CLOSE_POLICY_VIOLATION))?;
            if session.status.is_terminal()
                || !session
                    .participants
                    .iter()
                    .any(|participant| participant.id == participant_id)
            {
                return Err(SignalingError::Refused(super::CLOSE_POLICY_VIOLATION));
            }
            if let Some(index) = session
                .sockets
                .iter()
                .position(|(id, _)| id == participant_id)
            {
                let (_, stale) = session.sockets.remove(index);
                let _ = stale.sender.send(RelayInbound::Closed { code: None });
            }
            session.sockets.push((
                participant_id.to_string(),
                Socket {
                    id: socket_id,
                    sender: inbound_tx,
                },
            ));
            let frame = session.status_frame(token);
            session.broadcast(&frame, None);
            socket_id
        };

        let relay = self.clone();
        let token = token.to_string();
        let participant_id = participant_id.to_string();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                relay.handle_frame(&token, &participant_id, &text);
            }
            relay.disconnect(&token, &participant_id, socket_id);
        });

        Ok(RelayConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
