#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use cove_core::config::{PeerConfig, SessionConfig};
use cove_core::crypto;
use cove_core::peer::{LinkEvent, LoopbackNetwork, NegotiationState, PeerEvent, PeerLink};
use cove_core::protocol::{
    ChannelEnvelope, EncryptedMessage, EncryptionMode, EnvelopeKind, IceCandidate,
    ParticipantRole, SessionDescription, SignalEnvelope, SignalType,
};
use cove_core::session::{SessionContext, SessionEvent, SessionHandle, SessionOrchestrator};
use cove_core::signaling::{MemoryRelay, RelayConnection, RelayConnector, RelayInbound};
use tokio::sync::mpsc;

/// One orchestrated participant plus its event stream.
pub struct Party {
    pub participant_id: String,
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Party {
    pub fn join(
        relay: &MemoryRelay,
        network: &LoopbackNetwork,
        token: &str,
        participant_id: &str,
        config: SessionConfig,
    ) -> Self {
        let role = relay.join(token, participant_id).expect("join session");
        let (tx, events) = mpsc::unbounded_channel();
        let (handle, _task) = SessionOrchestrator::spawn(
            SessionContext::new(token, participant_id, role),
            config,
            Arc::new(relay.clone()),
            Arc::new(network.factory(role.as_str())),
            tx,
        );
        Self {
            participant_id: participant_id.to_string(),
            handle,
            events,
        }
    }

    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&SessionEvent) -> bool,
    ) -> SessionEvent {
        loop {
            let event = self.events.recv().await.expect("session event stream ended");
            if predicate(&event) {
                return event;
            }
        }
    }

    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

/// Host and guest on a fresh relay, connected with capabilities exchanged.
pub async fn connected_pair(token: &str) -> (MemoryRelay, LoopbackNetwork, Party, Party) {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    relay.issue(token);
    let mut host = Party::join(&relay, &network, token, "host-1", SessionConfig::default());
    let mut guest = Party::join(&relay, &network, token, "guest-1", SessionConfig::default());
    host.wait_for(is_capability).await;
    guest.wait_for(is_capability).await;
    (relay, network, host, guest)
}

pub fn is_capability(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::PeerCapability { .. })
}

/// A hand-driven peer speaking the wire protocol directly, for scripting the other side
/// of a session step by step.
pub struct RawPeer {
    pub participant_id: String,
    pub token: String,
    pub link: PeerLink,
    pub answer_offers: bool,
    pub pending_offer: Option<SessionDescription>,
    pub signals_seen: Vec<SignalEnvelope>,
    pub channel_inbox: VecDeque<ChannelEnvelope>,
    relay: RelayConnection,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl RawPeer {
    pub async fn join(
        relay: &MemoryRelay,
        network: &LoopbackNetwork,
        token: &str,
        participant_id: &str,
    ) -> Self {
        let role = relay.join(token, participant_id).expect("join session");
        let connection = relay
            .connect(token, participant_id)
            .await
            .expect("relay socket");
        let (tx, link_events) = mpsc::unbounded_channel();
        let mut link = PeerLink::new(1, Arc::new(network.factory("raw")), tx);
        link.initialize(&PeerConfig::default(), role.is_polite())
            .await
            .expect("raw link");
        Self {
            participant_id: participant_id.to_string(),
            token: token.to_string(),
            link,
            answer_offers: true,
            pending_offer: None,
            signals_seen: Vec::new(),
            channel_inbox: VecDeque::new(),
            relay: connection,
            link_events,
        }
    }

    pub fn send_signal(&self, envelope: &SignalEnvelope) {
        let text = serde_json::to_string(envelope).expect("encode signal");
        self.relay.outbound.send(text).expect("relay socket open");
    }

    pub async fn send_channel(&self, envelope: &ChannelEnvelope) {
        let text = envelope.encode().expect("encode envelope");
        self.link.send(&text).await.expect("channel open");
    }

    /// Handles one relay frame or link event.
    pub async fn step(&mut self) {
        tokio::select! {
            Some(frame) = self.relay.inbound.recv() => self.on_frame(frame).await,
            Some(event) = self.link_events.recv() => self.on_link_event(event.event),
            else => panic!("raw peer inputs closed"),
        }
    }

    pub async fn run_until(&mut self, mut done: impl FnMut(&Self) -> bool) {
        while !done(self) {
            self.step().await;
        }
    }

    pub async fn next_channel(&mut self) -> ChannelEnvelope {
        loop {
            if let Some(envelope) = self.channel_inbox.pop_front() {
                return envelope;
            }
            self.step().await;
        }
    }

    /// Answers the offer held back while `answer_offers` was false, rolling back any
    /// local offer first.
    pub async fn accept_pending_offer(&mut self) {
        let offer = self.pending_offer.take().expect("a held offer");
        self.answer(offer).await;
    }

    async fn answer(&mut self, offer: SessionDescription) {
        if self.link.negotiation_state() != NegotiationState::Stable {
            self.link.rollback().await.expect("rollback");
        }
        self.link
            .set_remote_description(&offer)
            .await
            .expect("apply offer");
        let answer = self.link.make_answer().await.expect("answer");
        self.send_signal(&SignalEnvelope::answer(&answer).expect("answer envelope"));
    }

    async fn on_frame(&mut self, frame: RelayInbound) {
        let RelayInbound::Text(text) = frame else {
            return;
        };
        let Ok(envelope) = serde_json::from_str::<SignalEnvelope>(&text) else {
            return;
        };
        if envelope.kind != EnvelopeKind::Signal {
            return;
        }
        self.signals_seen.push(envelope.clone());
        match envelope.signal_type {
            Some(SignalType::Offer) => {
                let offer: SessionDescription =
                    serde_json::from_value(envelope.payload).expect("offer payload");
                if self.answer_offers {
                    self.answer(offer).await;
                } else {
                    self.pending_offer = Some(offer);
                }
            }
            Some(SignalType::Answer) => {
                let answer: SessionDescription =
                    serde_json::from_value(envelope.payload).expect("answer payload");
                self.link
                    .set_remote_description(&answer)
                    .await
                    .expect("apply answer");
            }
            Some(SignalType::IceCandidate) => {
                let candidate: IceCandidate =
                    serde_json::from_value(envelope.payload).expect("candidate payload");
                self.link
                    .add_ice_candidate(candidate)
                    .await
                    .expect("candidate");
            }
            None => {}
        }
    }

    fn on_link_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => self.send_signal(
                &SignalEnvelope::ice_candidate(&candidate).expect("candidate envelope"),
            ),
            PeerEvent::ChannelMessage(text) => {
                if let Ok(envelope) = ChannelEnvelope::decode(&text) {
                    self.channel_inbox.push_back(envelope);
                }
            }
            _ => {}
        }
    }

    pub fn saw_signal(&self, signal_type: SignalType) -> bool {
        self.signals_seen
            .iter()
            .any(|envelope| envelope.signal_type == Some(signal_type))
    }

    /// A correctly encrypted and hashed message from this peer.
    pub fn message(&self, message_id: &str, text: &str) -> EncryptedMessage {
        let key = crypto::derive_key(&self.token).expect("session key");
        EncryptedMessage {
            session_id: self.token.clone(),
            message_id: message_id.to_string(),
            participant_id: self.participant_id.clone(),
            role: ParticipantRole::Guest,
            created_at: Utc::now(),
            encryption: EncryptionMode::AesGcm,
            encrypted_content: Some(crypto::encrypt(&key, text).expect("encrypt")),
            content: None,
            hash: Some(crypto::hash(
                &self.token,
                &self.participant_id,
                message_id,
                text,
            )),
        }
    }
}
