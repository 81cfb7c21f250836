//! Shared mocks for the manager integration tests: a scriptable peer
//! transport and helpers for driving the in-memory signaling room.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tandem_call_core::media::LocalTrack;
use tandem_call_core::signaling::{CandidateInit, SignalPayload, SignalingEvent, SignalingParams};
use tandem_call_core::transport::{
    IceSettings, LinkState, PeerTransport, PeerTransportFactory, SdpKind, TransportError,
    TransportEvent, TransportSample,
};
use tandem_call_core::types::{ConnectionType, IceConnectionState, SessionId, UserId};
use tokio::sync::mpsc;

/// Scriptable peer transport capturing every operation in order
pub struct MockTransport {
    label: &'static str,
    events: mpsc::UnboundedSender<TransportEvent>,
    tracks: Mutex<Vec<String>>,
    applied: Mutex<Vec<String>>,
    remote_descriptions: Mutex<Vec<(SdpKind, String)>>,
    offers: Mutex<Vec<bool>>,
    answers: Mutex<usize>,
    ice_state: Mutex<IceConnectionState>,
    link_state: Mutex<LinkState>,
    sample: Mutex<Option<TransportSample>>,
    closed: AtomicBool,
    reject_candidates_containing: Option<&'static str>,
}

impl MockTransport {
    /// Set the ICE state and deliver the change to the manager
    pub fn push_ice(&self, state: IceConnectionState) {
        self.set_ice_state(state);
        let _ = self.events.send(TransportEvent::IceStateChanged(state));
    }

    /// Set the ICE state without emitting an event
    pub fn set_ice_state(&self, state: IceConnectionState) {
        *self.ice_state.lock().unwrap() = state;
    }

    /// Set the link state and deliver the change to the manager
    pub fn push_link(&self, state: LinkState) {
        *self.link_state.lock().unwrap() = state;
        let _ = self.events.send(TransportEvent::LinkStateChanged(state));
    }

    /// Emit a locally gathered candidate
    pub fn emit_local_candidate(&self, candidate: &str) {
        let _ = self
            .events
            .send(TransportEvent::LocalCandidate(CandidateInit {
                candidate: candidate.to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }));
    }

    /// Provide the sample returned by `sample_stats`
    pub fn set_sample(&self, sample: TransportSample) {
        *self.sample.lock().unwrap() = Some(sample);
    }

    /// Tracks attached so far, by id
    pub fn tracks(&self) -> Vec<String> {
        self.tracks.lock().unwrap().clone()
    }

    /// Candidates applied so far, in application order
    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    /// Remote descriptions installed so far
    pub fn remote_descriptions(&self) -> Vec<(SdpKind, String)> {
        self.remote_descriptions.lock().unwrap().clone()
    }

    /// `ice_restart` flag of every offer created so far
    pub fn offers(&self) -> Vec<bool> {
        self.offers.lock().unwrap().clone()
    }

    /// Number of answers created so far
    pub fn answers(&self) -> usize {
        *self.answers.lock().unwrap()
    }

    /// Whether `close` ran
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.tracks.lock().unwrap().push(track.id.clone());
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError> {
        self.offers.lock().unwrap().push(ice_restart);
        Ok(format!("offer-sdp-{}", self.label))
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        *self.answers.lock().unwrap() += 1;
        Ok(format!("answer-sdp-{}", self.label))
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), TransportError> {
        self.remote_descriptions.lock().unwrap().push((kind, sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError> {
        if let Some(marker) = self.reject_candidates_containing {
            if candidate.candidate.contains(marker) {
                return Err(TransportError::Candidate("mock rejection".to_string()));
            }
        }
        self.applied.lock().unwrap().push(candidate.candidate);
        Ok(())
    }

    fn ice_state(&self) -> IceConnectionState {
        *self.ice_state.lock().unwrap()
    }

    fn link_state(&self) -> LinkState {
        *self.link_state.lock().unwrap()
    }

    async fn selected_route(&self) -> ConnectionType {
        ConnectionType::Direct
    }

    async fn sample_stats(&self) -> Option<TransportSample> {
        *self.sample.lock().unwrap()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out `MockTransport`s and remembering them
pub struct MockFactory {
    label: &'static str,
    reject_candidates_containing: Option<&'static str>,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            reject_candidates_containing: None,
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn rejecting(label: &'static str, marker: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            reject_candidates_containing: Some(marker),
            created: Mutex::new(Vec::new()),
        })
    }

    /// The transport created for the (single) call attempt
    pub fn transport(&self) -> Arc<MockTransport> {
        self.created.lock().unwrap()[0].clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerTransportFactory for MockFactory {
    async fn create(
        &self,
        _ice: &IceSettings,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = Arc::new(MockTransport {
            label: self.label,
            events,
            tracks: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            offers: Mutex::new(Vec::new()),
            answers: Mutex::new(0),
            ice_state: Mutex::new(IceConnectionState::New),
            link_state: Mutex::new(LinkState::New),
            sample: Mutex::new(None),
            closed: AtomicBool::new(false),
            reject_candidates_containing: self.reject_candidates_containing,
        });
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// Signaling parameters for a test participant
pub fn params(session: &SessionId, user: &str) -> SignalingParams {
    SignalingParams {
        url: "memory://relay".to_string(),
        session_id: session.clone(),
        user_id: UserId::new(user),
        token: "test-token".to_string(),
    }
}

/// A wire candidate
pub fn candidate(s: &str) -> CandidateInit {
    CandidateInit {
        candidate: s.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

/// Let spawned tasks drain their queues without advancing the clock
pub async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

/// Drain every pending signaling event from a raw room connection
pub fn drain_events(
    rx: &mut mpsc::UnboundedReceiver<SignalingEvent>,
) -> Vec<SignalingEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Count the offers among drained signaling events
pub fn count_offers(events: &[SignalingEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SignalingEvent::Signal(SignalPayload::Offer { .. })))
        .count()
}
