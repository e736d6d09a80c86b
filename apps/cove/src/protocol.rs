//! Wire types for the relay (signaling) socket and the peer message channel.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    Guest,
}

impl ParticipantRole {
    /// Hosts win negotiation collisions; guests yield.
    pub fn is_polite(self) -> bool {
        matches!(self, ParticipantRole::Guest)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantRole::Host => "host",
            ParticipantRole::Guest => "guest",
        }
    }
}

impl std::fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ParticipantRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(ParticipantRole::Host),
            "guest" => Ok(ParticipantRole::Guest),
            other => Err(format!("unknown participant role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Issued,
    Active,
    Closed,
    Expired,
    Deleted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Closed | SessionState::Expired | SessionState::Deleted
        )
    }
}

/// Normalized view of the relay's `status` push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub status: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub validity_expires_at: Option<DateTime<Utc>>,
    pub remaining_seconds: Option<i64>,
    pub participant_ids: Vec<String>,
    pub connected_participant_ids: Vec<String>,
    pub message_char_limit: Option<usize>,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        self.status == SessionState::Active
    }

    pub fn connected_count(&self) -> usize {
        self.connected_participant_ids.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusParticipant {
    pub participant_id: String,
    #[serde(default)]
    pub role: Option<ParticipantRole>,
    #[serde(default)]
    pub joined_at: Option<String>,
}

/// `status` envelope exactly as the relay pushes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusPayload {
    pub status: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub validity_expires_at: Option<String>,
    #[serde(default)]
    pub session_started_at: Option<String>,
    #[serde(default)]
    pub session_expires_at: Option<String>,
    #[serde(default)]
    pub remaining_seconds: Option<i64>,
    #[serde(default)]
    pub message_char_limit: Option<usize>,
    #[serde(default)]
    pub participants: Vec<StatusParticipant>,
    #[serde(default)]
    pub connected_participants: Vec<String>,
}

impl StatusPayload {
    pub fn normalize(&self) -> SessionStatus {
        SessionStatus {
            status: self.status,
            started_at: self.session_started_at.as_deref().and_then(parse_timestamp),
            expires_at: self.session_expires_at.as_deref().and_then(parse_timestamp),
            validity_expires_at: self.validity_expires_at.as_deref().and_then(parse_timestamp),
            remaining_seconds: self.remaining_seconds,
            participant_ids: self
                .participants
                .iter()
                .map(|participant| participant.participant_id.clone())
                .collect(),
            connected_participant_ids: self.connected_participants.clone(),
            message_char_limit: self.message_char_limit,
        }
    }
}

/// Accepts RFC 3339 as well as the zone-less ISO form the membership service emits for
/// naive UTC datetimes.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Signal,
    Status,
    SessionClosed,
    SessionExpired,
    SessionDeleted,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
}

/// Unit exchanged with the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(
        rename = "signalType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub signal_type: Option<SignalType>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl SignalEnvelope {
    pub fn signal(signal_type: SignalType, payload: Value) -> Self {
        Self {
            kind: EnvelopeKind::Signal,
            signal_type: Some(signal_type),
            payload,
            sender: None,
        }
    }

    pub fn offer(desc: &SessionDescription) -> Result<Self, serde_json::Error> {
        Ok(Self::signal(SignalType::Offer, serde_json::to_value(desc)?))
    }

    pub fn answer(desc: &SessionDescription) -> Result<Self, serde_json::Error> {
        Ok(Self::signal(SignalType::Answer, serde_json::to_value(desc)?))
    }

    pub fn ice_candidate(candidate: &IceCandidate) -> Result<Self, serde_json::Error> {
        Ok(Self::signal(
            SignalType::IceCandidate,
            serde_json::to_value(candidate)?,
        ))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn has_media(&self) -> bool {
        self.sdp
            .lines()
            .any(|line| line.starts_with("m=audio") || line.starts_with("m=video"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EncryptionMode {
    #[serde(rename = "aes-gcm")]
    AesGcm,
    #[serde(rename = "none")]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    pub session_id: String,
    pub message_id: String,
    pub participant_id: String,
    pub role: ParticipantRole,
    pub created_at: DateTime<Utc>,
    pub encryption: EncryptionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallAction {
    Request,
    Accept,
    Reject,
    Cancel,
    End,
    Busy,
}

/// Application envelope carried over the peer message channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEnvelope {
    Message {
        message: EncryptedMessage,
    },
    Ack {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Capabilities {
        #[serde(rename = "supportsEncryption")]
        supports_encryption: bool,
    },
    Call {
        action: CallAction,
        from: String,
    },
    Delete {
        #[serde(rename = "messageId")]
        message_id: String,
    },
}

impl ChannelEnvelope {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Decrypted, caller-facing chat message.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Message {
    pub message_id: String,
    pub participant_id: String,
    pub role: ParticipantRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}
