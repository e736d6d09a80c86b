use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    ChannelState, ConnectionState, GatheringState, IceState, NativePeer, PeerEvent, PeerFactory,
    PeerLinkError,
};
use crate::config::PeerConfig;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

/// Opens peers on the webrtc stack.
#[derive(Debug, Clone, Default)]
pub struct WebRtcFactory;

#[async_trait]
impl PeerFactory for WebRtcFactory {
    async fn open(
        &self,
        config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn NativePeer>, PeerLinkError> {
        let api = build_api(SettingEngine::default())?;
        let rtc_config = RTCConfiguration {
            ice_servers: if config.ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: config.ice_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_native_error)?,
        );
        let peer = WebRtcPeer {
            pc,
            events,
            channel: Arc::new(Mutex::new(None)),
            audio: Mutex::new(None),
        };
        peer.install_handlers();
        Ok(Box::new(peer))
    }
}

fn build_api(setting: SettingEngine) -> Result<API, PeerLinkError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_native_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_native_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    audio: Mutex<Option<Arc<RTCRtpSender>>>,
}

impl WebRtcPeer {
    fn install_handlers(&self) {
        let tx = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(err) => {
                            tracing::warn!(target = "cove::peer::webrtc", error = %err, "failed to serialize local candidate");
                        }
                    }
                })
            }));

        let tx = self.events.clone();
        self.pc.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    tracing::debug!(target = "cove::peer::webrtc", ?state, "ice connection state");
                    if let Some(state) = map_ice_state(state) {
                        let _ = tx.send(PeerEvent::IceState(state));
                    }
                })
            },
        ));

        let tx = self.events.clone();
        self.pc.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    tracing::debug!(target = "cove::peer::webrtc", ?state, "peer connection state");
                    if let Some(state) = map_connection_state(state) {
                        let _ = tx.send(PeerEvent::ConnectionState(state));
                    }
                })
            },
        ));

        let tx = self.events.clone();
        self.pc.on_ice_gathering_state_change(Box::new(
            move |state: RTCIceGathererState| {
                let tx = tx.clone();
                Box::pin(async move {
                    let mapped = match state {
                        RTCIceGathererState::New => Some(GatheringState::New),
                        RTCIceGathererState::Gathering => Some(GatheringState::Gathering),
                        RTCIceGathererState::Complete => Some(GatheringState::Complete),
                        _ => None,
                    };
                    if let Some(mapped) = mapped {
                        let _ = tx.send(PeerEvent::GatheringState(mapped));
                    }
                })
            },
        ));

        let tx = self.events.clone();
        let slot = Arc::clone(&self.channel);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let tx = tx.clone();
                let slot = Arc::clone(&slot);
                Box::pin(async move {
                    tracing::debug!(
                        target = "cove::peer::webrtc",
                        label = %dc.label(),
                        "remote announced data channel"
                    );
                    let _ = tx.send(PeerEvent::ChannelState(ChannelState::Connecting));
                    wire_channel(&dc, tx.clone());
                    *slot.lock() = Some(dc);
                })
            }));
    }

    fn channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().clone()
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<PeerEvent>) {
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            tracing::debug!(target = "cove::peer::webrtc", "data channel open");
            let _ = tx.send(PeerEvent::ChannelState(ChannelState::Open));
        })
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ChannelState(ChannelState::Closed));
        })
    }));

    let tx = events;
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            if !message.is_string {
                tracing::debug!(target = "cove::peer::webrtc", bytes = message.data.len(), "ignoring binary channel frame");
                return;
            }
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(PeerEvent::ChannelMessage(text));
                }
                Err(err) => {
                    tracing::debug!(target = "cove::peer::webrtc", error = %err, "dropping non-utf8 channel frame");
                }
            }
        })
    }));
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    Some(match state {
        RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        _ => return None,
    })
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => return None,
    })
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, PeerLinkError> {
    let invalid = |err: webrtc::Error| PeerLinkError::InvalidDescription(err.to_string());
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()).map_err(invalid),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()).map_err(invalid),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp.clone()).map_err(invalid),
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, PeerLinkError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(PeerLinkError::InvalidDescription(
                "unspecified sdp type".into(),
            ));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn to_native_error<E: std::fmt::Display>(err: E) -> PeerLinkError {
    PeerLinkError::Native(err.to_string())
}

#[async_trait]
impl NativePeer for WebRtcPeer {
    async fn create_data_channel(&self, label: &str) -> Result<(), PeerLinkError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_native_error)?;
        wire_channel(&dc, self.events.clone());
        *self.channel.lock() = Some(dc);
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerLinkError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(to_native_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerLinkError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_native_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), PeerLinkError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|err| PeerLinkError::InvalidDescription(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), PeerLinkError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|err| PeerLinkError::InvalidDescription(err.to_string()))
    }

    async fn rollback(&self) -> Result<(), PeerLinkError> {
        let rollback = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        self.set_local_description(&rollback).await
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerLinkError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_native_error)
    }

    async fn send(&self, text: &str) -> Result<(), PeerLinkError> {
        let channel = self.channel().ok_or(PeerLinkError::ChannelNotOpen)?;
        channel
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(to_native_error)
    }

    async fn attach_media(&self) -> Result<(), PeerLinkError> {
        if self.audio.lock().is_some() {
            return Ok(());
        }
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "cove".to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(to_native_error)?;

        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });
        *self.audio.lock() = Some(sender);
        Ok(())
    }

    async fn detach_media(&self) -> Result<(), PeerLinkError> {
        let sender = self.audio.lock().take();
        if let Some(sender) = sender {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(to_native_error)?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.pc
            .on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
        self.pc
            .on_ice_connection_state_change(Box::new(|_: RTCIceConnectionState| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| Box::pin(async {})));
        self.pc
            .on_ice_gathering_state_change(Box::new(|_: RTCIceGathererState| Box::pin(async {})));
        self.pc
            .on_data_channel(Box::new(|_: Arc<RTCDataChannel>| Box::pin(async {})));

        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.on_message(Box::new(|_: DataChannelMessage| Box::pin(async {})));
            channel.on_close(Box::new(|| Box::pin(async {})));
            if let Err(err) = channel.close().await {
                tracing::debug!(target = "cove::peer::webrtc", error = %err, "data channel close failed");
            }
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "cove::peer::webrtc", error = %err, "peer connection close failed");
        }
    }
}
