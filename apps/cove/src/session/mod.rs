//! Session orchestrator.
//!
//! One task owns the signaling client, the current [`PeerLink`], the transcript and every
//! timer. It consumes a single inbox (relay events, link events, timer firings and caller
//! commands) and reports outward through [`SessionEvent`]s. Callers drive it through a
//! cloneable [`SessionHandle`].
//!
//! The host owns the message channel and is the only side that offers. The guest is the
//! polite peer: it rolls back on glare and rebuilds its link when the connection fails
//! while the session is still active.

mod call;
mod messages;
mod timers;

pub use call::{CallEffect, CallMachine, CallState, InvalidTransition};
pub use messages::{DeleteOutcome, InsertOutcome, MessageStore};
pub use timers::{TimerFired, TimerKind, Timers};

use std::collections::HashSet;
use std::mem::Discriminant;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::crypto::{self, CryptoError, SessionKey};
use crate::peer::{
    CandidateOutcome, ChannelState, ConnectionState, IceState, LinkEvent, LinkStatus,
    NegotiationState, PeerEvent, PeerFactory, PeerLink, PeerLinkError,
};
use crate::protocol::{
    CallAction, ChannelEnvelope, EncryptedMessage, EncryptionMode, EnvelopeKind, IceCandidate,
    Message, ParticipantRole, SdpKind, SessionDescription, SessionState, SessionStatus,
    SignalEnvelope, SignalType,
};
use crate::signaling::{
    EndReason, RelayConnector, SignalingClient, SignalingError, SignalingEvent, SignalingState,
};

/// Who we are within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub token: String,
    /// Stamped on outgoing messages; incoming messages for another session are dropped.
    pub session_id: String,
    pub participant_id: String,
    pub role: ParticipantRole,
}

impl SessionContext {
    /// Uses the token as the session id, which is what the relay keys sessions by.
    pub fn new(
        token: impl Into<String>,
        participant_id: impl Into<String>,
        role: ParticipantRole,
    ) -> Self {
        let token = token.into();
        Self {
            session_id: token.clone(),
            token,
            participant_id: participant_id.into(),
            role,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("end-to-end encryption unavailable; messages are sent in plaintext")]
    EncryptionUnavailable,
    #[error("received a message that failed authentication")]
    AuthenticationFailed,
    #[error("message channel did not open in time")]
    ChannelTimeout,
    #[error("peer connection could not be established")]
    NegotiationFailed,
    #[error("session ended ({reason})")]
    SessionEnded { reason: EndReason },
    #[error("relay unreachable after {attempts} reconnect attempts")]
    SignalingLost { attempts: u32 },
    #[error("relay error: {0}")]
    Relay(String),
    #[error("peer capabilities are still being negotiated")]
    Negotiating,
    #[error("message channel is not open")]
    NotConnected,
    #[error("message is empty")]
    EmptyMessage,
    #[error("message has {length} characters; the limit is {limit}")]
    MessageTooLong { limit: usize, length: usize },
    #[error("only the author can delete a message")]
    NotAuthor,
    #[error("unknown message {0}")]
    UnknownMessage(String),
    #[error("call action {action:?} is not valid while {state:?}")]
    InvalidCallAction { state: CallState, action: CallAction },
    #[error("encryption failed: {0}")]
    Crypto(CryptoError),
    #[error("peer link error: {0}")]
    Link(PeerLinkError),
    #[error("session is closed")]
    Closed,
}

impl From<InvalidTransition> for SessionError {
    fn from(err: InvalidTransition) -> Self {
        SessionError::InvalidCallAction {
            state: err.state,
            action: err.action,
        }
    }
}

impl From<PeerLinkError> for SessionError {
    fn from(err: PeerLinkError) -> Self {
        match err {
            PeerLinkError::ChannelNotOpen | PeerLinkError::NotInitialized => {
                SessionError::NotConnected
            }
            other => SessionError::Link(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Signaling(SignalingState),
    Status(SessionStatus),
    Connection(ConnectionState),
    Channel(ChannelState),
    /// A fresh peer link replaced the previous one.
    LinkRecreated { generation: u64 },
    PeerCapability { supports_encryption: bool },
    MessageReceived(Message),
    Delivered { message_id: String },
    MessageDeleted { message_id: String },
    CallState(CallState),
    RemoteCall(CallAction),
    /// A message whose hash did not match its content was discarded.
    IntegrityWarning { message_id: String },
    Error(SessionError),
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub status: Option<SessionStatus>,
    pub signaling: SignalingState,
    pub link: Option<LinkStatus>,
    pub link_generation: u64,
    pub call: CallState,
    pub local_supports_encryption: bool,
    pub peer_supports_encryption: Option<bool>,
    pub messages: Vec<Message>,
    pub awaiting_ack: usize,
    pub pending_timers: usize,
    pub ended: bool,
}

enum Command {
    Send {
        text: String,
        reply: oneshot::Sender<Result<Message, SessionError>>,
    },
    Delete {
        message_id: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Call {
        action: CallAction,
        reply: oneshot::Sender<Result<CallState, SessionError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    End {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable command handle. The orchestrator keeps serving snapshots after the session
/// ends and exits once every handle is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Encrypts (when both sides can) and sends `text`, returning the stored message.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<Message, SessionError> {
        let text = text.into();
        self.request(|reply| Command::Send { text, reply }).await?
    }

    pub async fn delete_message(&self, message_id: impl Into<String>) -> Result<(), SessionError> {
        let message_id = message_id.into();
        self.request(|reply| Command::Delete { message_id, reply })
            .await?
    }

    pub async fn call(&self, action: CallAction) -> Result<CallState, SessionError> {
        self.request(|reply| Command::Call { action, reply }).await?
    }

    pub async fn request_call(&self) -> Result<CallState, SessionError> {
        self.call(CallAction::Request).await
    }

    pub async fn accept_call(&self) -> Result<CallState, SessionError> {
        self.call(CallAction::Accept).await
    }

    pub async fn reject_call(&self) -> Result<CallState, SessionError> {
        self.call(CallAction::Reject).await
    }

    pub async fn cancel_call(&self) -> Result<CallState, SessionError> {
        self.call(CallAction::Cancel).await
    }

    pub async fn end_call(&self) -> Result<CallState, SessionError> {
        self.call(CallAction::End).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Tears the session down. Safe to call any number of times.
    pub async fn end(&self) {
        let _ = self.request(|reply| Command::End { reply }).await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }
}

struct Inbox {
    signaling: mpsc::UnboundedReceiver<SignalingEvent>,
    link: mpsc::UnboundedReceiver<LinkEvent>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    commands: mpsc::UnboundedReceiver<Command>,
}

pub struct SessionOrchestrator {
    context: SessionContext,
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    signaling: SignalingClient,
    factory: Arc<dyn PeerFactory>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    link: Option<PeerLink>,
    generation: u64,
    link_offered: bool,
    ignore_offer: bool,
    remote_media: bool,
    timers: Timers,
    key: Option<Arc<SessionKey>>,
    status: Option<SessionStatus>,
    peer_present: bool,
    peer_capability: Option<bool>,
    capability_attempts: u32,
    ice_retries: u32,
    ice_restart_tried: bool,
    store: MessageStore,
    call: CallMachine,
    reported: HashSet<Discriminant<SessionError>>,
    ended: bool,
}

impl SessionOrchestrator {
    /// Starts the orchestrator task. Events are delivered on `events` until
    /// [`SessionEvent::Closed`].
    pub fn spawn(
        context: SessionContext,
        config: SessionConfig,
        connector: Arc<dyn RelayConnector>,
        factory: Arc<dyn PeerFactory>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let signaling = SignalingClient::new(
            context.token.clone(),
            context.participant_id.clone(),
            config.signaling.clone(),
            connector,
            signaling_tx,
        );
        let orchestrator = SessionOrchestrator {
            context,
            config,
            events,
            signaling,
            factory,
            link_events: link_tx,
            link: None,
            generation: 0,
            link_offered: false,
            ignore_offer: false,
            remote_media: false,
            timers: Timers::new(timer_tx),
            key: None,
            status: None,
            peer_present: false,
            peer_capability: None,
            capability_attempts: 0,
            ice_retries: 0,
            ice_restart_tried: false,
            store: MessageStore::new(),
            call: CallMachine::default(),
            reported: HashSet::new(),
            ended: false,
        };
        let inbox = Inbox {
            signaling: signaling_rx,
            link: link_rx,
            timers: timer_rx,
            commands: command_rx,
        };
        let task = tokio::spawn(orchestrator.run(inbox));
        (
            SessionHandle {
                commands: command_tx,
            },
            task,
        )
    }

    async fn run(mut self, mut inbox: Inbox) {
        self.start().await;
        while !self.ended {
            tokio::select! {
                Some(event) = inbox.signaling.recv() => self.on_signaling(event).await,
                Some(event) = inbox.link.recv() => self.on_link_event(event).await,
                Some(fired) = inbox.timers.recv() => {
                    if self.timers.accept(fired) {
                        self.on_timer(fired.kind).await;
                    }
                }
                command = inbox.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => self.end_session().await,
                },
            }
        }
        while let Some(command) = inbox.commands.recv().await {
            self.on_command(command).await;
        }
    }

    fn is_host(&self) -> bool {
        self.context.role == ParticipantRole::Host
    }

    fn local_supports_encryption(&self) -> bool {
        self.key.is_some()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Surfaces `error`; the sticky kinds are only reported the first time.
    fn report(&mut self, error: SessionError) {
        let once = matches!(
            error,
            SessionError::EncryptionUnavailable
                | SessionError::AuthenticationFailed
                | SessionError::ChannelTimeout
                | SessionError::NegotiationFailed
                | SessionError::SessionEnded { .. }
                | SessionError::SignalingLost { .. }
        );
        if once && !self.reported.insert(std::mem::discriminant(&error)) {
            return;
        }
        tracing::warn!(
            target = "cove::session",
            participant_id = %self.context.participant_id,
            error = %error,
            "session error"
        );
        self.emit(SessionEvent::Error(error));
    }

    async fn start(&mut self) {
        if self.config.encryption {
            match crypto::cached_key(&self.context.token) {
                Ok(key) => self.key = Some(key),
                Err(err) => {
                    tracing::warn!(
                        target = "cove::session",
                        error = %err,
                        "session key unavailable"
                    );
                    self.report(SessionError::EncryptionUnavailable);
                }
            }
        }
        tracing::info!(
            target = "cove::session",
            participant_id = %self.context.participant_id,
            role = %self.context.role,
            "session starting"
        );
        self.signaling.connect();
        self.recreate_link().await;
    }

    /// Closes the current link (if any) and builds a fresh one for the next generation.
    async fn recreate_link(&mut self) {
        if let Some(mut old) = self.link.take() {
            old.close().await;
        }
        self.generation += 1;
        self.link_offered = false;
        self.ice_restart_tried = false;
        self.ignore_offer = false;
        self.remote_media = false;
        self.peer_capability = None;
        self.capability_attempts = 0;
        self.timers.cancel(TimerKind::CapabilityRetry);
        if self.call.reset() {
            self.emit(SessionEvent::CallState(CallState::Idle));
        }

        let mut link = PeerLink::new(
            self.generation,
            Arc::clone(&self.factory),
            self.link_events.clone(),
        );
        if let Err(err) = link
            .initialize(&self.config.peer, self.context.role.is_polite())
            .await
        {
            tracing::error!(
                target = "cove::session",
                generation = self.generation,
                error = %err,
                "failed to open peer connection"
            );
            self.report(SessionError::NegotiationFailed);
            return;
        }
        if self.is_host() {
            if let Err(err) = link.create_channel().await {
                tracing::warn!(
                    target = "cove::session",
                    generation = self.generation,
                    error = %err,
                    "failed to create message channel"
                );
            }
        }
        tracing::debug!(
            target = "cove::session",
            generation = self.generation,
            "peer link ready"
        );
        self.link = Some(link);
        if self.generation > 1 {
            self.emit(SessionEvent::LinkRecreated {
                generation: self.generation,
            });
        }
    }

    fn channel_open(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.channel_state() == ChannelState::Open)
    }

    fn link_connected(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.connection_state() == ConnectionState::Connected)
    }

    fn session_active(&self) -> bool {
        self.status.as_ref().is_some_and(SessionStatus::is_active)
    }

    fn send_signal(&self, envelope: Result<SignalEnvelope, serde_json::Error>, what: &str) {
        let result = envelope
            .map_err(SignalingError::from)
            .and_then(|envelope| self.signaling.send(&envelope));
        if let Err(err) = result {
            tracing::warn!(
                target = "cove::session",
                signal = what,
                error = %err,
                "failed to relay signal"
            );
        }
    }

    async fn send_envelope(&self, envelope: &ChannelEnvelope) -> Result<(), SessionError> {
        let link = self.link.as_ref().ok_or(SessionError::NotConnected)?;
        let text = envelope
            .encode()
            .map_err(|err| SessionError::Link(PeerLinkError::Native(err.to_string())))?;
        link.send(&text).await.map_err(SessionError::from)
    }

    async fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::StateChanged(state) => self.emit(SessionEvent::Signaling(state)),
            SignalingEvent::Status(status) => self.on_status(status).await,
            SignalingEvent::SessionEnded(reason) => {
                self.report(SessionError::SessionEnded { reason });
                self.end_session().await;
            }
            SignalingEvent::Signal(value) => self.on_signal(value).await,
            SignalingEvent::Error(message) => self.report(SessionError::Relay(message)),
            SignalingEvent::GaveUp { attempts } => {
                self.report(SessionError::SignalingLost { attempts })
            }
        }
    }

    async fn on_status(&mut self, status: SessionStatus) {
        self.emit(SessionEvent::Status(status.clone()));
        let reason = match status.status {
            SessionState::Closed => Some(EndReason::Closed),
            SessionState::Expired => Some(EndReason::Expired),
            SessionState::Deleted => Some(EndReason::Deleted),
            SessionState::Issued | SessionState::Active => None,
        };
        if let Some(reason) = reason {
            self.report(SessionError::SessionEnded { reason });
            self.end_session().await;
            return;
        }

        let present = status.is_active() && status.connected_count() >= 2;
        self.status = Some(status);

        if self.is_host() {
            if present && !self.peer_present {
                self.peer_present = true;
                self.on_peer_arrived().await;
            } else if !present && self.peer_present {
                self.peer_present = false;
                self.timers.cancel(TimerKind::NegotiationDebounce);
            }
        } else if self.session_active() {
            let failing = self.link.as_ref().is_some_and(|link| {
                matches!(
                    link.connection_state(),
                    ConnectionState::Failed | ConnectionState::Disconnected
                )
            });
            if failing {
                self.schedule_guest_recovery();
            }
        }
    }

    /// Both participants are on the relay: offer after the debounce, on a fresh link if
    /// the current one was already used and never opened.
    async fn on_peer_arrived(&mut self) {
        if self.channel_open() {
            return;
        }
        if self.link_offered || self.link.is_none() {
            self.recreate_link().await;
        }
        self.timers.cancel(TimerKind::IceRetry);
        self.timers
            .schedule(TimerKind::NegotiationDebounce, self.config.negotiation_debounce);
    }

    async fn on_signal(&mut self, value: Value) {
        let envelope: SignalEnvelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(target = "cove::session", error = %err, "dropping relay frame");
                return;
            }
        };
        if envelope.kind != EnvelopeKind::Signal
            || envelope.sender.as_deref() == Some(self.context.participant_id.as_str())
        {
            return;
        }
        match envelope.signal_type {
            Some(SignalType::Offer) | Some(SignalType::Answer) => {
                match serde_json::from_value::<SessionDescription>(envelope.payload) {
                    Ok(desc) if desc.kind == SdpKind::Offer => self.on_remote_offer(desc).await,
                    Ok(desc) if desc.kind == SdpKind::Answer => self.on_remote_answer(desc).await,
                    Ok(desc) => tracing::debug!(
                        target = "cove::session",
                        kind = ?desc.kind,
                        "ignoring description"
                    ),
                    Err(err) => tracing::debug!(
                        target = "cove::session",
                        error = %err,
                        "dropping malformed description"
                    ),
                }
            }
            Some(SignalType::IceCandidate) => {
                match serde_json::from_value::<IceCandidate>(envelope.payload) {
                    Ok(candidate) => self.on_remote_candidate(candidate).await,
                    Err(err) => tracing::debug!(
                        target = "cove::session",
                        error = %err,
                        "dropping malformed candidate"
                    ),
                }
            }
            None => tracing::debug!(target = "cove::session", "signal without signalType"),
        }
    }

    async fn on_remote_offer(&mut self, offer: SessionDescription) {
        if !self.is_host() {
            let stale = self.link.as_ref().is_none_or(|link| {
                link.has_remote_description()
                    && link.connection_state() != ConnectionState::Connected
                    && link.negotiation_state() == NegotiationState::Stable
            });
            if stale {
                self.timers.cancel(TimerKind::GuestRecovery);
                self.recreate_link().await;
            }
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };

        let collision = link.negotiation_state() != NegotiationState::Stable;
        self.ignore_offer = !link.is_polite() && collision;
        if self.ignore_offer {
            tracing::debug!(
                target = "cove::session",
                generation = link.generation(),
                "ignoring colliding offer"
            );
            return;
        }

        match accept_offer(link, &offer, collision).await {
            Ok(answer) => {
                self.send_signal(SignalEnvelope::answer(&answer), "answer");
                self.remote_media = offer.has_media();
                if self.remote_media && self.call.media_negotiated() {
                    self.emit(SessionEvent::CallState(self.call.state()));
                }
            }
            Err(err) => self.on_description_failure("offer", err),
        }
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if link.negotiation_state() != NegotiationState::HaveLocalOffer {
            tracing::debug!(
                target = "cove::session",
                generation = link.generation(),
                "ignoring answer without a pending offer"
            );
            return;
        }
        self.ignore_offer = false;
        match link.set_remote_description(&answer).await {
            Ok(_) => {
                self.remote_media = answer.has_media();
                if self.remote_media && self.call.media_negotiated() {
                    self.emit(SessionEvent::CallState(self.call.state()));
                }
            }
            Err(err) => self.on_description_failure("answer", err),
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.ignore_offer {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match link.add_ice_candidate(candidate).await {
            Ok(CandidateOutcome::Queued) => tracing::trace!(
                target = "cove::session",
                pending = link.pending_candidates(),
                "queued remote candidate"
            ),
            Ok(_) => {}
            Err(err) => tracing::debug!(
                target = "cove::session",
                error = %err,
                "dropping remote candidate"
            ),
        }
    }

    fn on_description_failure(&mut self, what: &str, err: PeerLinkError) {
        tracing::warn!(
            target = "cove::session",
            description = what,
            error = %err,
            "negotiation attempt aborted"
        );
        if self.is_host() {
            self.schedule_host_retry();
        } else {
            self.schedule_guest_recovery();
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        if event.generation != self.generation || self.link.is_none() {
            tracing::trace!(
                target = "cove::session",
                generation = event.generation,
                current = self.generation,
                "dropping stale link event"
            );
            return;
        }
        match event.event {
            PeerEvent::LocalCandidate(candidate) => {
                self.send_signal(SignalEnvelope::ice_candidate(&candidate), "candidate");
            }
            PeerEvent::GatheringState(_) => {}
            PeerEvent::IceState(state) => match state {
                IceState::Failed => self.on_link_failure(),
                IceState::Disconnected if !self.is_host() => self.schedule_guest_recovery(),
                _ => {}
            },
            PeerEvent::ConnectionState(state) => {
                self.emit(SessionEvent::Connection(state));
                match state {
                    ConnectionState::Connected => {
                        tracing::info!(
                            target = "cove::session",
                            generation = self.generation,
                            "peer connected"
                        );
                        self.ice_retries = 0;
                        self.ice_restart_tried = false;
                        self.timers.cancel(TimerKind::IceRetry);
                        self.timers.cancel(TimerKind::GuestRecovery);
                    }
                    ConnectionState::Failed => self.on_link_failure(),
                    ConnectionState::Disconnected if !self.is_host() => {
                        self.schedule_guest_recovery()
                    }
                    _ => {}
                }
            }
            PeerEvent::ChannelState(state) => {
                self.emit(SessionEvent::Channel(state));
                if state == ChannelState::Open {
                    self.on_channel_open().await;
                }
            }
            PeerEvent::ChannelMessage(text) => self.on_channel_message(&text).await,
            PeerEvent::ChannelTimeout => {
                self.report(SessionError::ChannelTimeout);
                self.on_link_failure();
            }
        }
    }

    fn on_link_failure(&mut self) {
        if self.is_host() {
            self.schedule_host_retry();
        } else {
            self.schedule_guest_recovery();
        }
    }

    /// Retry `n` waits `n * ice_retry_step`; past the limit the failure is terminal.
    fn schedule_host_retry(&mut self) {
        if self.ended
            || self.timers.is_pending(TimerKind::IceRetry)
            || self
                .reported
                .contains(&std::mem::discriminant(&SessionError::NegotiationFailed))
        {
            return;
        }
        self.ice_retries += 1;
        if self.ice_retries > self.config.ice_retry_limit {
            tracing::error!(
                target = "cove::session",
                attempts = self.ice_retries - 1,
                "giving up on peer connection"
            );
            self.report(SessionError::NegotiationFailed);
            return;
        }
        let delay = self.config.ice_retry_step * self.ice_retries;
        tracing::info!(
            target = "cove::session",
            attempt = self.ice_retries,
            delay_ms = delay.as_millis() as u64,
            "scheduling connection retry"
        );
        self.timers.schedule(TimerKind::IceRetry, delay);
    }

    fn schedule_guest_recovery(&mut self) {
        if self.ended
            || self.is_host()
            || !self.session_active()
            || self.timers.is_pending(TimerKind::GuestRecovery)
        {
            return;
        }
        self.timers
            .schedule(TimerKind::GuestRecovery, self.config.guest_recovery_delay);
    }

    async fn send_offer(&mut self, ice_restart: bool) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match link.make_offer(ice_restart).await {
            Ok(offer) => {
                self.link_offered = true;
                tracing::debug!(
                    target = "cove::session",
                    generation = self.generation,
                    media = offer.has_media(),
                    ice_restart,
                    "sending offer"
                );
                self.send_signal(SignalEnvelope::offer(&offer), "offer");
            }
            Err(err) => self.on_description_failure("offer", err),
        }
    }

    async fn on_channel_open(&mut self) {
        self.capability_attempts = 0;
        self.announce_capabilities().await;
    }

    async fn announce_capabilities(&mut self) {
        let envelope = ChannelEnvelope::Capabilities {
            supports_encryption: self.local_supports_encryption(),
        };
        if let Err(err) = self.send_envelope(&envelope).await {
            tracing::debug!(
                target = "cove::session",
                error = %err,
                "failed to announce capabilities"
            );
            return;
        }
        self.capability_attempts += 1;
        if self.peer_capability.is_none()
            && self.capability_attempts <= self.config.capability_retry_limit
        {
            self.timers.schedule(
                TimerKind::CapabilityRetry,
                self.config.capability_retry_interval,
            );
        }
    }

    fn learn_peer_capability(&mut self, supports_encryption: bool) {
        if self.peer_capability == Some(supports_encryption) {
            return;
        }
        self.peer_capability = Some(supports_encryption);
        self.timers.cancel(TimerKind::CapabilityRetry);
        tracing::debug!(
            target = "cove::session",
            supports_encryption,
            "peer capability known"
        );
        self.emit(SessionEvent::PeerCapability {
            supports_encryption,
        });
        if !(supports_encryption && self.local_supports_encryption()) {
            self.report(SessionError::EncryptionUnavailable);
        }
    }

    async fn on_channel_message(&mut self, text: &str) {
        let envelope = match ChannelEnvelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(
                    target = "cove::session",
                    error = %err,
                    "dropping malformed channel envelope"
                );
                return;
            }
        };
        match envelope {
            ChannelEnvelope::Message { message } => self.on_remote_message(message).await,
            ChannelEnvelope::Ack { message_id } => {
                if self.store.acknowledge(&message_id) {
                    self.emit(SessionEvent::Delivered { message_id });
                }
            }
            ChannelEnvelope::Capabilities {
                supports_encryption,
            } => self.learn_peer_capability(supports_encryption),
            ChannelEnvelope::Call { action, .. } => self.on_remote_call(action).await,
            ChannelEnvelope::Delete { message_id } => self.on_remote_delete(message_id),
        }
    }

    async fn on_remote_message(&mut self, message: EncryptedMessage) {
        if message.session_id != self.context.session_id
            || message.participant_id == self.context.participant_id
        {
            return;
        }
        if self.peer_capability.is_none() {
            self.learn_peer_capability(message.encryption == EncryptionMode::AesGcm);
        }

        let content = match message.encryption {
            EncryptionMode::AesGcm => {
                let Some(key) = self.key.clone() else {
                    self.report(SessionError::EncryptionUnavailable);
                    return;
                };
                let Some(payload) = message.encrypted_content.as_deref() else {
                    return;
                };
                match crypto::decrypt(&key, payload) {
                    Ok(content) => content,
                    Err(CryptoError::AuthenticationFailed) => {
                        self.report(SessionError::AuthenticationFailed);
                        return;
                    }
                    Err(err) => {
                        tracing::debug!(
                            target = "cove::session",
                            message_id = %message.message_id,
                            error = %err,
                            "dropping undecodable message"
                        );
                        return;
                    }
                }
            }
            EncryptionMode::None => match message.content.clone() {
                Some(content) => content,
                None => return,
            },
        };

        if let Some(hash) = message.hash.as_deref() {
            let expected = crypto::hash(
                &message.session_id,
                &message.participant_id,
                &message.message_id,
                &content,
            );
            if hash != expected {
                tracing::warn!(
                    target = "cove::session",
                    message_id = %message.message_id,
                    "message hash mismatch"
                );
                self.emit(SessionEvent::IntegrityWarning {
                    message_id: message.message_id,
                });
                return;
            }
        }

        let ack = ChannelEnvelope::Ack {
            message_id: message.message_id.clone(),
        };
        if let Err(err) = self.send_envelope(&ack).await {
            tracing::debug!(target = "cove::session", error = %err, "failed to send ack");
        }

        let received = Message {
            message_id: message.message_id,
            participant_id: message.participant_id,
            role: message.role,
            content,
            created_at: message.created_at,
            deleted: false,
        };
        match self.store.insert(received.clone()) {
            InsertOutcome::Added => self.emit(SessionEvent::MessageReceived(received)),
            outcome => tracing::debug!(
                target = "cove::session",
                message_id = %received.message_id,
                outcome = ?outcome,
                "message not added"
            ),
        }
    }

    fn on_remote_delete(&mut self, message_id: String) {
        let requester = match self.store.get(&message_id) {
            Some(message) if message.participant_id == self.context.participant_id => {
                tracing::warn!(
                    target = "cove::session",
                    message_id = %message_id,
                    "peer tried to delete one of our messages"
                );
                return;
            }
            Some(message) => message.participant_id.clone(),
            None => String::new(),
        };
        if self.store.delete(&message_id, &requester) == DeleteOutcome::Deleted {
            self.emit(SessionEvent::MessageDeleted { message_id });
        }
    }

    async fn on_remote_call(&mut self, action: CallAction) {
        let before = self.call.state();
        let effects = self.call.remote(action);
        self.emit(SessionEvent::RemoteCall(action));
        self.apply_call_effects(effects).await;
        if self.call.state() != before {
            self.emit(SessionEvent::CallState(self.call.state()));
        }
    }

    async fn apply_call_effects(&mut self, effects: Vec<CallEffect>) {
        for effect in effects {
            match effect {
                CallEffect::Notify(action) => self.notify_call(action).await,
                CallEffect::ReplyBusy => self.notify_call(CallAction::Busy).await,
                CallEffect::StartMedia => {
                    let Some(link) = self.link.as_mut() else {
                        continue;
                    };
                    if let Err(err) = link.attach_media().await {
                        tracing::warn!(
                            target = "cove::session",
                            error = %err,
                            "failed to attach audio"
                        );
                        continue;
                    }
                    if self.is_host() {
                        self.send_offer(false).await;
                    } else if self.remote_media {
                        // The host's media offer overtook its accept.
                        self.call.media_negotiated();
                    }
                }
                CallEffect::StopMedia => {
                    self.remote_media = false;
                    if let Some(link) = self.link.as_mut() {
                        if let Err(err) = link.detach_media().await {
                            tracing::warn!(
                                target = "cove::session",
                                error = %err,
                                "failed to detach audio"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn notify_call(&self, action: CallAction) {
        let envelope = ChannelEnvelope::Call {
            action,
            from: self.context.participant_id.clone(),
        };
        if let Err(err) = self.send_envelope(&envelope).await {
            tracing::warn!(
                target = "cove::session",
                action = ?action,
                error = %err,
                "failed to send call action"
            );
        }
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        if self.ended {
            return;
        }
        tracing::trace!(target = "cove::session", timer = ?kind, "timer fired");
        match kind {
            TimerKind::NegotiationDebounce => {
                if self.is_host() && self.peer_present && self.session_active() {
                    self.send_offer(false).await;
                }
            }
            TimerKind::CapabilityRetry => {
                if self.peer_capability.is_none() && self.channel_open() {
                    self.announce_capabilities().await;
                }
            }
            TimerKind::IceRetry => {
                if !self.peer_present || self.link_connected() {
                    return;
                }
                // With the channel still open, try one ICE restart before rebuilding.
                if self.channel_open() && !self.ice_restart_tried {
                    tracing::info!(
                        target = "cove::session",
                        generation = self.generation,
                        "restarting ice on the current link"
                    );
                    self.ice_restart_tried = true;
                    self.send_offer(true).await;
                    self.schedule_host_retry();
                    return;
                }
                self.recreate_link().await;
                self.send_offer(false).await;
            }
            TimerKind::GuestRecovery => {
                if self.session_active() && !self.link_connected() {
                    tracing::info!(target = "cove::session", "rebuilding peer link");
                    self.recreate_link().await;
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { text, reply } => {
                let result = if self.ended {
                    Err(SessionError::Closed)
                } else {
                    self.send_text(text).await
                };
                let _ = reply.send(result);
            }
            Command::Delete { message_id, reply } => {
                let result = if self.ended {
                    Err(SessionError::Closed)
                } else {
                    self.delete_message(message_id).await
                };
                let _ = reply.send(result);
            }
            Command::Call { action, reply } => {
                let result = if self.ended {
                    Err(SessionError::Closed)
                } else {
                    self.local_call(action).await
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::End { reply } => {
                self.end_session().await;
                let _ = reply.send(());
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<Message, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if let Some(limit) = self.status.as_ref().and_then(|status| status.message_char_limit) {
            let length = text.chars().count();
            if length > limit {
                return Err(SessionError::MessageTooLong { limit, length });
            }
        }
        if !self.channel_open() {
            return Err(SessionError::NotConnected);
        }
        let peer_supports = self.peer_capability.ok_or(SessionError::Negotiating)?;

        let message_id = crypto::new_message_id();
        let hash = crypto::hash(
            &self.context.session_id,
            &self.context.participant_id,
            &message_id,
            &text,
        );
        let key = self.key.clone().filter(|_| peer_supports);
        let (encryption, encrypted_content, content) = match &key {
            Some(key) => (
                EncryptionMode::AesGcm,
                Some(crypto::encrypt(key, &text).map_err(SessionError::Crypto)?),
                None,
            ),
            None => (EncryptionMode::None, None, Some(text.clone())),
        };
        let created_at = Utc::now();
        let envelope = ChannelEnvelope::Message {
            message: EncryptedMessage {
                session_id: self.context.session_id.clone(),
                message_id: message_id.clone(),
                participant_id: self.context.participant_id.clone(),
                role: self.context.role,
                created_at,
                encryption,
                encrypted_content,
                content,
                hash: Some(hash),
            },
        };
        self.send_envelope(&envelope).await?;

        let message = Message {
            message_id: message_id.clone(),
            participant_id: self.context.participant_id.clone(),
            role: self.context.role,
            content: text,
            created_at,
            deleted: false,
        };
        self.store.insert(message.clone());
        self.store.expect_ack(&message_id);
        tracing::debug!(
            target = "cove::session",
            message_id = %message_id,
            encryption = ?encryption,
            "message sent"
        );
        Ok(message)
    }

    async fn delete_message(&mut self, message_id: String) -> Result<(), SessionError> {
        match self.store.get(&message_id) {
            None => return Err(SessionError::UnknownMessage(message_id)),
            Some(message) if message.participant_id != self.context.participant_id => {
                return Err(SessionError::NotAuthor);
            }
            Some(message) if message.deleted => return Ok(()),
            Some(_) => {}
        }
        if !self.channel_open() {
            return Err(SessionError::NotConnected);
        }
        self.send_envelope(&ChannelEnvelope::Delete {
            message_id: message_id.clone(),
        })
        .await?;
        if self.store.delete(&message_id, &self.context.participant_id) == DeleteOutcome::Deleted
        {
            self.emit(SessionEvent::MessageDeleted { message_id });
        }
        Ok(())
    }

    async fn local_call(&mut self, action: CallAction) -> Result<CallState, SessionError> {
        if !self.channel_open() {
            return Err(SessionError::NotConnected);
        }
        let effects = self.call.local(action)?;
        self.apply_call_effects(effects).await;
        let state = self.call.state();
        self.emit(SessionEvent::CallState(state));
        Ok(state)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status.clone(),
            signaling: self.signaling.state(),
            link: self.link.as_ref().map(PeerLink::status),
            link_generation: self.generation,
            call: self.call.state(),
            local_supports_encryption: self.local_supports_encryption(),
            peer_supports_encryption: self.peer_capability,
            messages: self.store.ordered(),
            awaiting_ack: self.store.awaiting_ack(),
            pending_timers: self.timers.pending(),
            ended: self.ended,
        }
    }

    /// Idempotent teardown: timers first, then the link, then the relay socket.
    async fn end_session(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.timers.clear_all();
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.signaling.disconnect();
        tracing::info!(
            target = "cove::session",
            participant_id = %self.context.participant_id,
            "session ended"
        );
        self.emit(SessionEvent::Closed);
    }
}

/// Applies a remote offer (rolling back a local one on glare) and installs the answer.
async fn accept_offer(
    link: &mut PeerLink,
    offer: &SessionDescription,
    collision: bool,
) -> Result<SessionDescription, PeerLinkError> {
    if collision {
        link.rollback().await?;
    }
    link.set_remote_description(offer).await?;
    link.make_answer().await
}
