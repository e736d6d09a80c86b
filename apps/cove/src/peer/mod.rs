//! Peer link: one native peer connection plus the ordering and timeout contract the
//! session relies on.
//!
//! Whatever sits behind [`NativePeer`] (the webrtc stack or the in-process loopback), the
//! [`PeerLink`] guarantees that
//! - remote candidates are held until a remote description exists, then applied in
//!   arrival order, with individual failures logged and skipped;
//! - a message channel that never opens produces exactly one `ChannelTimeout`;
//! - nothing is delivered once `close()` has returned.

mod loopback;
mod webrtc;

pub use loopback::{LoopbackControl, LoopbackFactory, LoopbackNetwork};
pub use webrtc::WebRtcFactory;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PeerConfig;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

pub const CHANNEL_LABEL: &str = "cove";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerLinkError {
    #[error("peer link already initialized")]
    AlreadyInitialized,
    #[error("peer link not initialized")]
    NotInitialized,
    #[error("message channel is not open")]
    ChannelNotOpen,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("native peer error: {0}")]
    Native(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Events raised by a native peer, plus `ChannelTimeout` which only the link itself emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    IceState(IceState),
    ConnectionState(ConnectionState),
    GatheringState(GatheringState),
    ChannelState(ChannelState),
    ChannelMessage(String),
    ChannelTimeout,
}

/// A [`PeerEvent`] tagged with the link generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub generation: u64,
    pub event: PeerEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Queued,
    Rejected,
}

#[async_trait]
pub trait NativePeer: Send + Sync {
    async fn create_data_channel(&self, label: &str) -> Result<(), PeerLinkError>;
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerLinkError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerLinkError>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), PeerLinkError>;
    async fn set_remote_description(&self, desc: &SessionDescription)
    -> Result<(), PeerLinkError>;
    async fn rollback(&self) -> Result<(), PeerLinkError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerLinkError>;
    async fn send(&self, text: &str) -> Result<(), PeerLinkError>;
    async fn attach_media(&self) -> Result<(), PeerLinkError>;
    async fn detach_media(&self) -> Result<(), PeerLinkError>;
    /// Stops every callback and releases the connection.
    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync + 'static {
    async fn open(
        &self,
        config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn NativePeer>, PeerLinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub connection: ConnectionState,
    pub ice: IceState,
    pub gathering: GatheringState,
    pub channel: ChannelState,
    pub negotiation: NegotiationState,
    pub media_attached: bool,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            connection: ConnectionState::New,
            ice: IceState::New,
            gathering: GatheringState::New,
            channel: ChannelState::New,
            negotiation: NegotiationState::Stable,
            media_attached: false,
        }
    }
}

enum Control {
    ArmChannelTimer,
}

pub struct PeerLink {
    generation: u64,
    factory: Arc<dyn PeerFactory>,
    events: mpsc::UnboundedSender<LinkEvent>,
    native: Option<Box<dyn NativePeer>>,
    control: Option<mpsc::UnboundedSender<Control>>,
    status: Arc<Mutex<LinkStatus>>,
    pending: VecDeque<IceCandidate>,
    remote_set: bool,
    polite: bool,
    forwarder: Option<JoinHandle<()>>,
}

impl PeerLink {
    pub fn new(
        generation: u64,
        factory: Arc<dyn PeerFactory>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            generation,
            factory,
            events,
            native: None,
            control: None,
            status: Arc::new(Mutex::new(LinkStatus::default())),
            pending: VecDeque::new(),
            remote_set: false,
            polite: false,
            forwarder: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_initialized(&self) -> bool {
        self.native.is_some()
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.lock()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status.lock().connection
    }

    pub fn ice_state(&self) -> IceState {
        self.status.lock().ice
    }

    pub fn gathering_state(&self) -> GatheringState {
        self.status.lock().gathering
    }

    pub fn channel_state(&self) -> ChannelState {
        self.status.lock().channel
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.status.lock().negotiation
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub async fn initialize(
        &mut self,
        config: &PeerConfig,
        polite: bool,
    ) -> Result<(), PeerLinkError> {
        if self.native.is_some() {
            return Err(PeerLinkError::AlreadyInitialized);
        }
        let (native_tx, native_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let native = self.factory.open(config, native_tx).await?;

        *self.status.lock() = LinkStatus::default();
        self.polite = polite;
        self.native = Some(native);
        self.control = Some(control_tx);
        self.forwarder = Some(tokio::spawn(forward(
            self.generation,
            config.channel_timeout(),
            native_rx,
            control_rx,
            Arc::clone(&self.status),
            self.events.clone(),
        )));
        tracing::debug!(
            target = "cove::peer",
            generation = self.generation,
            polite,
            "peer link initialized"
        );
        Ok(())
    }

    fn native(&self) -> Result<&dyn NativePeer, PeerLinkError> {
        self.native.as_deref().ok_or(PeerLinkError::NotInitialized)
    }

    pub async fn create_channel(&mut self) -> Result<(), PeerLinkError> {
        self.native()?.create_data_channel(CHANNEL_LABEL).await?;
        let mut status = self.status.lock();
        if status.channel == ChannelState::New {
            status.channel = ChannelState::Connecting;
        }
        Ok(())
    }

    pub async fn create_offer(
        &mut self,
        ice_restart: bool,
    ) -> Result<SessionDescription, PeerLinkError> {
        self.native()?.create_offer(ice_restart).await
    }

    pub async fn create_answer(&mut self) -> Result<SessionDescription, PeerLinkError> {
        self.native()?.create_answer().await
    }

    pub async fn set_local_description(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<(), PeerLinkError> {
        self.native()?.set_local_description(desc).await?;
        let mut status = self.status.lock();
        status.negotiation = match desc.kind {
            SdpKind::Offer => NegotiationState::HaveLocalOffer,
            SdpKind::Rollback => NegotiationState::Stable,
            SdpKind::Answer | SdpKind::Pranswer => NegotiationState::Stable,
        };
        Ok(())
    }

    /// Creates an offer and installs it as the local description.
    pub async fn make_offer(
        &mut self,
        ice_restart: bool,
    ) -> Result<SessionDescription, PeerLinkError> {
        let offer = self.create_offer(ice_restart).await?;
        self.set_local_description(&offer).await?;
        Ok(offer)
    }

    /// Creates an answer to the applied remote offer and installs it locally.
    pub async fn make_answer(&mut self) -> Result<SessionDescription, PeerLinkError> {
        let answer = self.create_answer().await?;
        self.set_local_description(&answer).await?;
        Ok(answer)
    }

    /// Applies the remote description, then drains queued candidates in arrival order.
    /// Returns how many queued candidates were applied.
    pub async fn set_remote_description(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<usize, PeerLinkError> {
        if matches!(desc.kind, SdpKind::Rollback) {
            return Err(PeerLinkError::InvalidDescription(
                "rollback is not a remote description".into(),
            ));
        }
        self.native()?.set_remote_description(desc).await?;
        self.remote_set = true;
        {
            let mut status = self.status.lock();
            status.negotiation = match desc.kind {
                SdpKind::Offer => NegotiationState::HaveRemoteOffer,
                _ => NegotiationState::Stable,
            };
        }
        if let Some(control) = &self.control {
            let _ = control.send(Control::ArmChannelTimer);
        }

        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            match self.native()?.add_ice_candidate(&candidate).await {
                Ok(()) => applied += 1,
                Err(err) => {
                    tracing::warn!(
                        target = "cove::peer",
                        generation = self.generation,
                        candidate = %candidate.candidate,
                        error = %err,
                        "skipping queued candidate"
                    );
                }
            }
        }
        Ok(applied)
    }

    pub async fn rollback(&mut self) -> Result<(), PeerLinkError> {
        self.native()?.rollback().await?;
        self.status.lock().negotiation = NegotiationState::Stable;
        Ok(())
    }

    pub async fn add_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome, PeerLinkError> {
        let native = self.native()?;
        if !self.remote_set {
            self.pending.push_back(candidate);
            return Ok(CandidateOutcome::Queued);
        }
        match native.add_ice_candidate(&candidate).await {
            Ok(()) => Ok(CandidateOutcome::Applied),
            Err(err) => {
                tracing::warn!(
                    target = "cove::peer",
                    generation = self.generation,
                    candidate = %candidate.candidate,
                    error = %err,
                    "remote candidate rejected"
                );
                Ok(CandidateOutcome::Rejected)
            }
        }
    }

    pub async fn send(&self, text: &str) -> Result<(), PeerLinkError> {
        let native = self.native()?;
        if self.channel_state() != ChannelState::Open {
            return Err(PeerLinkError::ChannelNotOpen);
        }
        native.send(text).await
    }

    /// Adds the local audio track; the message channel is left untouched.
    pub async fn attach_media(&mut self) -> Result<(), PeerLinkError> {
        self.native()?.attach_media().await?;
        self.status.lock().media_attached = true;
        Ok(())
    }

    pub async fn detach_media(&mut self) -> Result<(), PeerLinkError> {
        if !self.status.lock().media_attached {
            return Ok(());
        }
        self.native()?.detach_media().await?;
        self.status.lock().media_attached = false;
        Ok(())
    }

    pub fn media_attached(&self) -> bool {
        self.status.lock().media_attached
    }

    /// Idempotent. No event for this link is delivered after it returns.
    pub async fn close(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.control = None;
        if let Some(native) = self.native.take() {
            native.close().await;
            tracing::debug!(
                target = "cove::peer",
                generation = self.generation,
                "peer link closed"
            );
        }
        self.pending.clear();
        self.remote_set = false;
        let mut status = self.status.lock();
        status.connection = ConnectionState::Closed;
        status.ice = IceState::Closed;
        status.channel = ChannelState::Closed;
        status.negotiation = NegotiationState::Closed;
        status.media_attached = false;
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

async fn forward(
    generation: u64,
    channel_timeout: Duration,
    mut native_rx: mpsc::UnboundedReceiver<PeerEvent>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    status: Arc<Mutex<LinkStatus>>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut deadline: Option<Instant> = None;
    let emit = |event: PeerEvent| events.send(LinkEvent { generation, event }).is_ok();

    loop {
        let sleep_target = deadline;
        tokio::select! {
            event = native_rx.recv() => {
                let Some(event) = event else { break };
                {
                    let mut status = status.lock();
                    match &event {
                        PeerEvent::IceState(state) => status.ice = *state,
                        PeerEvent::ConnectionState(state) => status.connection = *state,
                        PeerEvent::GatheringState(state) => status.gathering = *state,
                        PeerEvent::ChannelState(state) => status.channel = *state,
                        _ => {}
                    }
                }
                if matches!(
                    event,
                    PeerEvent::ChannelState(ChannelState::Open | ChannelState::Closed)
                ) {
                    deadline = None;
                }
                if !emit(event) {
                    break;
                }
            }
            control = control_rx.recv() => {
                match control {
                    Some(Control::ArmChannelTimer) => {
                        let open = status.lock().channel == ChannelState::Open;
                        if !open && deadline.is_none() {
                            deadline = Some(Instant::now() + channel_timeout);
                        }
                    }
                    None => break,
                }
            }
            _ = async {
                if let Some(at) = sleep_target {
                    tokio::time::sleep_until(at).await;
                }
            }, if sleep_target.is_some() => {
                deadline = None;
                tracing::warn!(
                    target = "cove::peer",
                    generation,
                    timeout_ms = channel_timeout.as_millis() as u64,
                    "message channel did not open in time"
                );
                if !emit(PeerEvent::ChannelTimeout) {
                    break;
                }
            }
        }
    }
}
