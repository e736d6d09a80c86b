//! In-process stand-in for the native peer connection.
//!
//! Peers find each other through the `a=loopback-peer:<id>` line of their descriptions.
//! A pair connects once both sides have completed an offer/answer exchange naming each
//! other and each has applied at least one remote candidate. The message channel opens
//! on connect if either side created one. An ICE restart offer drops the connection and its
//! applied candidates but leaves an open channel in place.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ChannelState, ConnectionState, GatheringState, IceState, NativePeer, NegotiationState,
    PeerEvent, PeerFactory, PeerLinkError,
};
use crate::config::PeerConfig;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

const PEER_ATTR: &str = "a=loopback-peer:";
const RESTART_ATTR: &str = "a=ice-options:restart";

#[derive(Debug)]
struct SlotState {
    closed: bool,
    negotiation: NegotiationState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_peer: Option<String>,
    negotiated: bool,
    connected: bool,
    channel_created: bool,
    channel: ChannelState,
    media: bool,
    offers: u32,
    ice_restarts: u32,
    applied: Vec<IceCandidate>,
    failing: Vec<String>,
    sent: Vec<String>,
}

impl SlotState {
    fn ready(&self) -> bool {
        !self.closed && self.negotiated && !self.applied.is_empty()
    }

    /// New ICE credentials: the pair must exchange descriptions and candidates again.
    fn restart_ice(&mut self) {
        self.connected = false;
        self.negotiated = false;
        self.applied.clear();
    }
}

fn is_restart(desc: &SessionDescription) -> bool {
    desc.kind == SdpKind::Offer && desc.sdp.lines().any(|line| line.trim() == RESTART_ATTR)
}

struct PeerSlot {
    id: String,
    port: u16,
    state: Mutex<SlotState>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerSlot {
    fn emit(&self, event: PeerEvent) {
        if !self.state.lock().closed {
            let _ = self.events.send(event);
        }
    }

    fn describe(&self, kind: SdpKind, version: u32, media: bool) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=- {port} {version} IN IP4 127.0.0.1\r\n{PEER_ATTR}{id}\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n",
            port = self.port,
            id = self.id,
        );
        if media {
            sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        }
        SessionDescription { kind, sdp }
    }

    fn candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host ufrag {}",
                self.port, self.id
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some(self.id.clone()),
        }
    }
}

#[derive(Default)]
struct NetworkState {
    slots: HashMap<String, Arc<PeerSlot>>,
    by_name: HashMap<String, Vec<String>>,
    next_port: u16,
    failing: Vec<String>,
}

/// Shared fabric for loopback peers. Clones refer to the same network.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose peers are registered under `name` (one entry per link generation).
    pub fn factory(&self, name: &str) -> LoopbackFactory {
        LoopbackFactory {
            network: self.clone(),
            name: name.to_string(),
        }
    }

    /// Control handle for the most recently created peer under `name`.
    pub fn latest(&self, name: &str) -> Option<LoopbackControl> {
        let inner = self.inner.lock();
        let id = inner.by_name.get(name)?.last()?;
        inner.slots.get(id).map(|slot| LoopbackControl {
            slot: Arc::clone(slot),
            network: self.clone(),
        })
    }

    /// Every peer, including ones created later, rejects remote candidates containing
    /// `pattern`.
    pub fn fail_candidates_containing(&self, pattern: &str) {
        self.inner.lock().failing.push(pattern.to_string());
    }

    fn rejects(&self, candidate: &IceCandidate) -> bool {
        self.inner
            .lock()
            .failing
            .iter()
            .any(|pattern| candidate.candidate.contains(pattern.as_str()))
    }

    /// Number of peers ever created under `name`.
    pub fn created(&self, name: &str) -> usize {
        self.inner
            .lock()
            .by_name
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn slot(&self, id: &str) -> Option<Arc<PeerSlot>> {
        self.inner.lock().slots.get(id).cloned()
    }

    fn register(&self, name: &str, events: mpsc::UnboundedSender<PeerEvent>) -> Arc<PeerSlot> {
        let mut inner = self.inner.lock();
        inner.next_port = inner.next_port.wrapping_add(1);
        let port = 40_000u16.wrapping_add(inner.next_port);
        let generation = inner.by_name.get(name).map(Vec::len).unwrap_or(0) + 1;
        let id = format!("{name}-{generation}");
        let slot = Arc::new(PeerSlot {
            id: id.clone(),
            port,
            state: Mutex::new(SlotState {
                closed: false,
                negotiation: NegotiationState::Stable,
                local: None,
                remote: None,
                remote_peer: None,
                negotiated: false,
                connected: false,
                channel_created: false,
                channel: ChannelState::New,
                media: false,
                offers: 0,
                ice_restarts: 0,
                applied: Vec::new(),
                failing: Vec::new(),
                sent: Vec::new(),
            }),
            events,
        });
        inner.slots.insert(id.clone(), Arc::clone(&slot));
        inner.by_name.entry(name.to_string()).or_default().push(id);
        slot
    }

    fn try_connect(&self, slot: &Arc<PeerSlot>) {
        let (remote_id, ready, connected) = {
            let state = slot.state.lock();
            (state.remote_peer.clone(), state.ready(), state.connected)
        };
        if !ready || connected {
            return;
        }
        let Some(remote) = remote_id.and_then(|id| self.slot(&id)) else {
            return;
        };
        let remote_ready = {
            let state = remote.state.lock();
            state.ready() && state.remote_peer.as_deref() == Some(slot.id.as_str())
        };
        if !remote_ready {
            return;
        }

        let channel_exists = {
            let local = slot.state.lock().channel_created;
            let remote = remote.state.lock().channel_created;
            local || remote
        };
        for side in [slot, &remote] {
            let (created, reopen) = {
                let mut state = side.state.lock();
                state.connected = true;
                let reopen = channel_exists
                    && !matches!(state.channel, ChannelState::Open | ChannelState::Closed);
                if reopen {
                    state.channel = ChannelState::Open;
                }
                (state.channel_created, reopen)
            };
            side.emit(PeerEvent::IceState(IceState::Checking));
            side.emit(PeerEvent::IceState(IceState::Connected));
            side.emit(PeerEvent::ConnectionState(ConnectionState::Connecting));
            side.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
            if reopen {
                if !created {
                    side.emit(PeerEvent::ChannelState(ChannelState::Connecting));
                }
                side.emit(PeerEvent::ChannelState(ChannelState::Open));
            }
        }
    }

    /// Drops connectivity for `slot` and its connected partner.
    fn sever(&self, slot: &Arc<PeerSlot>) {
        let remote_id = slot.state.lock().remote_peer.clone();
        let remote = remote_id.and_then(|id| self.slot(&id));
        for side in std::iter::once(slot).chain(remote.as_ref()) {
            let was_connected = {
                let mut state = side.state.lock();
                let was = state.connected;
                state.connected = false;
                if was && state.channel == ChannelState::Open {
                    state.channel = ChannelState::Closed;
                }
                was
            };
            if was_connected {
                side.emit(PeerEvent::ChannelState(ChannelState::Closed));
                side.emit(PeerEvent::IceState(IceState::Disconnected));
                side.emit(PeerEvent::IceState(IceState::Failed));
                side.emit(PeerEvent::ConnectionState(ConnectionState::Failed));
            }
        }
    }
}

#[derive(Clone)]
pub struct LoopbackFactory {
    network: LoopbackNetwork,
    name: String,
}

#[async_trait]
impl PeerFactory for LoopbackFactory {
    async fn open(
        &self,
        _config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn NativePeer>, PeerLinkError> {
        let slot = self.network.register(&self.name, events);
        Ok(Box::new(LoopbackPeer {
            slot,
            network: self.network.clone(),
        }))
    }
}

struct LoopbackPeer {
    slot: Arc<PeerSlot>,
    network: LoopbackNetwork,
}

impl LoopbackPeer {
    fn ensure_open(&self) -> Result<(), PeerLinkError> {
        if self.slot.state.lock().closed {
            Err(PeerLinkError::Native("peer connection closed".into()))
        } else {
            Ok(())
        }
    }
}

fn peer_id_of(desc: &SessionDescription) -> Result<String, PeerLinkError> {
    desc.sdp
        .lines()
        .find_map(|line| line.trim().strip_prefix(PEER_ATTR))
        .map(str::to_string)
        .ok_or_else(|| PeerLinkError::InvalidDescription("missing loopback peer id".into()))
}

#[async_trait]
impl NativePeer for LoopbackPeer {
    async fn create_data_channel(&self, _label: &str) -> Result<(), PeerLinkError> {
        self.ensure_open()?;
        let mut state = self.slot.state.lock();
        state.channel_created = true;
        if state.channel == ChannelState::New {
            state.channel = ChannelState::Connecting;
        }
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerLinkError> {
        self.ensure_open()?;
        let mut state = self.slot.state.lock();
        state.offers += 1;
        let mut offer = self.slot.describe(SdpKind::Offer, state.offers, state.media);
        if ice_restart {
            state.ice_restarts += 1;
            offer.sdp.push_str(RESTART_ATTR);
            offer.sdp.push_str("\r\n");
        }
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerLinkError> {
        self.ensure_open()?;
        let state = self.slot.state.lock();
        if state.negotiation != NegotiationState::HaveRemoteOffer {
            return Err(PeerLinkError::Native(
                "cannot answer without a remote offer".into(),
            ));
        }
        let remote_media = state.remote.as_ref().is_some_and(SessionDescription::has_media);
        Ok(self
            .slot
            .describe(SdpKind::Answer, state.offers, remote_media))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), PeerLinkError> {
        self.ensure_open()?;
        {
            let mut state = self.slot.state.lock();
            match (desc.kind, state.negotiation) {
                (SdpKind::Offer, NegotiationState::Stable | NegotiationState::HaveLocalOffer) => {
                    state.negotiation = NegotiationState::HaveLocalOffer;
                    if is_restart(desc) {
                        state.restart_ice();
                    }
                }
                (SdpKind::Answer | SdpKind::Pranswer, NegotiationState::HaveRemoteOffer) => {
                    state.negotiation = NegotiationState::Stable;
                    state.negotiated = true;
                }
                (kind, negotiation) => {
                    return Err(PeerLinkError::InvalidDescription(format!(
                        "cannot apply local {kind:?} in {negotiation:?}"
                    )));
                }
            }
            state.local = Some(desc.clone());
        }
        self.slot
            .emit(PeerEvent::GatheringState(GatheringState::Gathering));
        self.slot.emit(PeerEvent::LocalCandidate(self.slot.candidate()));
        self.slot
            .emit(PeerEvent::GatheringState(GatheringState::Complete));
        self.network.try_connect(&self.slot);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), PeerLinkError> {
        self.ensure_open()?;
        let remote_id = peer_id_of(desc)?;
        {
            let mut state = self.slot.state.lock();
            match (desc.kind, state.negotiation) {
                (SdpKind::Offer, NegotiationState::Stable) => {
                    state.negotiation = NegotiationState::HaveRemoteOffer;
                    if is_restart(desc) {
                        state.restart_ice();
                    }
                }
                (SdpKind::Answer | SdpKind::Pranswer, NegotiationState::HaveLocalOffer) => {
                    state.negotiation = NegotiationState::Stable;
                    state.negotiated = true;
                }
                (kind, negotiation) => {
                    return Err(PeerLinkError::InvalidDescription(format!(
                        "cannot apply remote {kind:?} in {negotiation:?}"
                    )));
                }
            }
            state.remote = Some(desc.clone());
            state.remote_peer = Some(remote_id);
        }
        self.network.try_connect(&self.slot);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerLinkError> {
        self.ensure_open()?;
        let mut state = self.slot.state.lock();
        if state.negotiation == NegotiationState::HaveLocalOffer {
            state.local = None;
        }
        state.negotiation = NegotiationState::Stable;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerLinkError> {
        self.ensure_open()?;
        let rejected_by_network = self.network.rejects(candidate);
        {
            let mut state = self.slot.state.lock();
            if rejected_by_network
                || state
                    .failing
                    .iter()
                    .any(|pattern| candidate.candidate.contains(pattern.as_str()))
            {
                return Err(PeerLinkError::Native(format!(
                    "candidate rejected: {}",
                    candidate.candidate
                )));
            }
            state.applied.push(candidate.clone());
        }
        self.network.try_connect(&self.slot);
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<(), PeerLinkError> {
        let remote_id = {
            let mut state = self.slot.state.lock();
            if state.closed || !state.connected || state.channel != ChannelState::Open {
                return Err(PeerLinkError::ChannelNotOpen);
            }
            state.sent.push(text.to_string());
            state.remote_peer.clone()
        };
        let remote = remote_id
            .and_then(|id| self.network.slot(&id))
            .ok_or(PeerLinkError::ChannelNotOpen)?;
        remote.emit(PeerEvent::ChannelMessage(text.to_string()));
        Ok(())
    }

    async fn attach_media(&self) -> Result<(), PeerLinkError> {
        self.ensure_open()?;
        self.slot.state.lock().media = true;
        Ok(())
    }

    async fn detach_media(&self) -> Result<(), PeerLinkError> {
        self.ensure_open()?;
        self.slot.state.lock().media = false;
        Ok(())
    }

    async fn close(&self) {
        if self.slot.state.lock().closed {
            return;
        }
        self.network.sever(&self.slot);
        let mut state = self.slot.state.lock();
        state.closed = true;
        state.connected = false;
        state.channel = ChannelState::Closed;
        state.negotiation = NegotiationState::Closed;
    }
}

/// Test-side view of one loopback peer.
#[derive(Clone)]
pub struct LoopbackControl {
    slot: Arc<PeerSlot>,
    network: LoopbackNetwork,
}

impl LoopbackControl {
    pub fn id(&self) -> &str {
        &self.slot.id
    }

    pub fn inject_ice_state(&self, state: IceState) {
        self.slot.emit(PeerEvent::IceState(state));
    }

    pub fn inject_connection_state(&self, state: ConnectionState) {
        self.slot.emit(PeerEvent::ConnectionState(state));
    }

    /// Simulates a network failure on this peer and its partner.
    pub fn sever(&self) {
        self.network.sever(&self.slot);
    }

    /// Future candidates whose text contains `pattern` fail to apply.
    pub fn fail_candidates_containing(&self, pattern: &str) {
        self.slot.state.lock().failing.push(pattern.to_string());
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.slot.state.lock().applied.clone()
    }

    pub fn sent_messages(&self) -> Vec<String> {
        self.slot.state.lock().sent.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.slot.state.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.slot.state.lock().closed
    }

    pub fn media_attached(&self) -> bool {
        self.slot.state.lock().media
    }

    pub fn offers_created(&self) -> u32 {
        self.slot.state.lock().offers
    }

    pub fn ice_restarts(&self) -> u32 {
        self.slot.state.lock().ice_restarts
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.slot.state.lock().local.clone()
    }
}
