//! Production peer transport over the webrtc crate
//!
//! One `WebRtcPeerTransport` wraps one `RTCPeerConnection` for the lifetime
//! of a single call attempt. Callbacks are forwarded as `TransportEvent`s so
//! the manager never touches webrtc types directly.

use crate::media::LocalTrack;
use crate::signaling::CandidateInit;
use crate::transport::{
    IceServer, IceSettings, LinkState, PeerTransport, PeerTransportFactory, SdpKind,
    TransportError, TransportEvent, TransportSample,
};
use crate::types::{ConnectionType, IceConnectionState, MediaKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Peer transport backed by an `RTCPeerConnection`
pub struct WebRtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeerTransport {
    /// Construct a peer connection from resolved ICE servers
    ///
    /// Uses a single bundled transport and a pre-gathered candidate pool;
    /// under force-relay the ICE transport policy is restricted to relay
    /// candidates on top of the STUN-free server list.
    ///
    /// # Errors
    ///
    /// Returns error if the media engine or peer connection cannot be built.
    pub async fn new(
        ice_servers: Vec<IceServer>,
        force_relay: bool,
        candidate_pool_size: u8,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Setup(format!("codec registration failed: {e}")))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::Setup(format!("interceptor registration failed: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.into_iter().map(to_rtc_server).collect(),
            ice_transport_policy: if force_relay {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ice_candidate_pool_size: candidate_pool_size,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| TransportError::Setup(format!("peer connection: {e}")))?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    if let Ok(init) = candidate.to_json() {
                        let _ = tx.send(TransportEvent::LocalCandidate(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                }
            })
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::IceStateChanged(map_ice_state(state)));
            })
        }));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::LinkStateChanged(map_link_state(state)));
            })
        }));

        Ok(Self { pc })
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let capability = match track.kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id.clone(),
            "tandem".to_owned(),
        ));
        let local: Arc<dyn TrackLocal + Send + Sync> = local;
        self.pc
            .add_track(local)
            .await
            .map_err(|e| TransportError::Setup(format!("failed to add track: {e}")))?;
        tracing::debug!(track = %track.id, kind = ?track.kind, "track attached");
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| TransportError::Sdp(format!("create offer: {e}")))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| TransportError::Sdp(format!("set local offer: {e}")))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Sdp(format!("create answer: {e}")))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| TransportError::Sdp(format!("set local answer: {e}")))?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), TransportError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| TransportError::Sdp(format!("invalid remote description: {e}")))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| TransportError::Sdp(format!("set remote description: {e}")))
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    fn ice_state(&self) -> IceConnectionState {
        map_ice_state(self.pc.ice_connection_state())
    }

    fn link_state(&self) -> LinkState {
        map_link_state(self.pc.connection_state())
    }

    async fn selected_route(&self) -> ConnectionType {
        let report = self.pc.get_stats().await;
        let mut candidate_types: HashMap<String, String> = HashMap::new();
        let mut nominated_local: Option<String> = None;
        for (id, entry) in &report.reports {
            match entry {
                StatsReportType::LocalCandidate(candidate) => {
                    candidate_types.insert(
                        id.clone(),
                        format!("{:?}", candidate.candidate_type).to_ascii_lowercase(),
                    );
                }
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    nominated_local = Some(pair.local_candidate_id.clone());
                }
                _ => {}
            }
        }
        match nominated_local.and_then(|id| candidate_types.get(&id)) {
            Some(kind) if kind.contains("relay") => ConnectionType::Relay,
            Some(_) => ConnectionType::Direct,
            None => ConnectionType::Unknown,
        }
    }

    async fn sample_stats(&self) -> Option<TransportSample> {
        let report = self.pc.get_stats().await;
        let mut sample = TransportSample::default();
        let mut saw_inbound = false;
        for entry in report.reports.values() {
            match entry {
                StatsReportType::InboundRTP(inbound) => {
                    sample.bytes_received = sample.bytes_received.saturating_add(inbound.bytes_received);
                    sample.packets_received =
                        sample.packets_received.saturating_add(inbound.packets_received);
                    saw_inbound = true;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    sample.packets_lost = sample
                        .packets_lost
                        .saturating_add(remote.packets_lost.max(0) as u64);
                    sample.round_trip_ms = (remote.round_trip_time.unwrap_or(0.0) * 1000.0) as u32;
                }
                _ => {}
            }
        }
        saw_inbound.then_some(sample)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "peer connection close reported an error");
        }
    }
}

/// Builds one `WebRtcPeerTransport` per call attempt
#[derive(Debug, Clone)]
pub struct WebRtcTransportFactory {
    /// Candidates pre-gathered by the ICE agent before negotiation
    pub candidate_pool_size: u8,
}

impl Default for WebRtcTransportFactory {
    fn default() -> Self {
        Self {
            candidate_pool_size: 1,
        }
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        ice: &IceSettings,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = WebRtcPeerTransport::new(
            ice.resolve(),
            ice.force_relay,
            self.candidate_pool_size,
            events,
        )
        .await?;
        Ok(Arc::new(transport))
    }
}

fn to_rtc_server(server: IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls,
        username: server.username.unwrap_or_default(),
        credential: server.credential.unwrap_or_default(),
        ..Default::default()
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn map_link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}
