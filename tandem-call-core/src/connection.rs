//! Peer-connection lifecycle manager
//!
//! One `PeerConnectionManager` owns everything a single call attempt needs:
//! the local media stream, the signaling connection, the underlying peer
//! transport, the pending-candidate queue and every timer. The attempt moves
//! through `ConnectionPhase` under a strict ordered protocol; an offer can
//! only ever be created from `Ready`, after local tracks are attached.
//!
//! All timers and event handlers carry the epoch they were spawned under and
//! re-check it before touching state, so nothing fired before `stop()` can
//! mutate the manager afterwards.

use crate::media::{LocalMediaStream, MediaSource};
use crate::signaling::{
    CandidateInit, SignalPayload, SignalingConnection, SignalingConnector, SignalingError,
    SignalingEvent, SignalingParams, SignalingSender,
};
use crate::transport::{
    IceSettings, LinkState, PeerTransport, PeerTransportFactory, SdpKind, TransportEvent,
};
use crate::types::{
    CallRole, ConnectionEvent, ConnectionPhase, ConnectionType, IceConnectionState,
    MediaConstraints, MediaKind, QualityMetrics,
};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Errors fatal to one call attempt
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Camera/microphone could not be acquired; never retried
    #[error("media acquisition failed: {0}")]
    Media(#[from] crate::media::MediaError),

    /// The signaling relay is unavailable or dropped us
    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalingError),

    /// The peer transport could not be constructed
    #[error("transport failed: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// An SDP operation failed; the negotiation cannot recover
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The other participant left after negotiation had begun
    #[error("remote peer disconnected")]
    RemoteDisconnected,

    /// Reconnection gave up
    #[error("reconnect attempts exhausted after {attempts}")]
    RetriesExhausted {
        /// Configured attempt limit
        attempts: u32,
    },

    /// `start()` was called twice
    #[error("call attempt already started")]
    AlreadyStarted,

    /// The manager was stopped
    #[error("call attempt stopped")]
    Stopped,
}

/// Reconnect delays are capped at 2^6 = 64 seconds
const MAX_BACKOFF_SHIFT: u32 = 6;

/// Configuration for one call attempt
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Which media to acquire
    pub constraints: MediaConstraints,
    /// ICE server policy
    pub ice: IceSettings,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Quality sampling period
    pub stats_interval: Duration,
    /// How long candidates may sit queued before a diagnostic is logged
    pub candidate_watchdog: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            constraints: MediaConstraints::video_call(),
            ice: IceSettings::default(),
            max_reconnect_attempts: 5,
            stats_interval: Duration::from_secs(5),
            candidate_watchdog: Duration::from_secs(10),
        }
    }
}

/// FIFO buffer for ICE candidates that arrive before the remote description
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queued: VecDeque<CandidateInit>,
}

impl CandidateBuffer {
    /// Append a candidate in arrival order
    pub fn push(&mut self, candidate: CandidateInit) {
        self.queued.push_back(candidate);
    }

    /// Take every queued candidate, oldest first
    pub fn drain(&mut self) -> Vec<CandidateInit> {
        self.queued.drain(..).collect()
    }

    /// Number of queued candidates
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

#[derive(Clone, Copy)]
enum LinkSignal {
    Ice(IceConnectionState),
    Link(LinkState),
}

struct State {
    phase: ConnectionPhase,
    epoch: u64,
    started: bool,
    stopped: bool,
    peer_present: bool,
    offer_sent: bool,
    remote_description_set: bool,
    pending: CandidateBuffer,
    reconnect_attempts: u32,
    connected_at: Option<Instant>,
    media_stream: Option<LocalMediaStream>,
    signaling: Option<Arc<dyn SignalingSender>>,
    transport: Option<Arc<dyn PeerTransport>>,
    reconnect_timer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            epoch: 0,
            started: false,
            stopped: false,
            peer_present: false,
            offer_sent: false,
            remote_description_set: false,
            pending: CandidateBuffer::default(),
            reconnect_attempts: 0,
            connected_at: None,
            media_stream: None,
            signaling: None,
            transport: None,
            reconnect_timer: None,
            tasks: Vec::new(),
        }
    }
}

struct Shared {
    role: CallRole,
    config: ConnectionConfig,
    media: Arc<dyn MediaSource>,
    connector: Arc<dyn SignalingConnector>,
    factory: Arc<dyn PeerTransportFactory>,
    events: broadcast::Sender<ConnectionEvent>,
    state: Mutex<State>,
}

impl Shared {
    /// Lock the state only if this epoch is still live
    async fn guarded(&self, epoch: u64) -> Option<MutexGuard<'_, State>> {
        let state = self.state.lock().await;
        (!state.stopped && state.epoch == epoch).then_some(state)
    }

    fn set_phase(&self, state: &mut State, phase: ConnectionPhase) {
        if state.phase != phase {
            tracing::debug!(old = ?state.phase, new = ?phase, "connection phase transition");
            state.phase = phase;
            let _ = self.events.send(ConnectionEvent::PhaseChanged { phase });
        }
    }
}

/// Drives one peer-to-peer call attempt from media acquisition to teardown
pub struct PeerConnectionManager {
    shared: Arc<Shared>,
}

impl PeerConnectionManager {
    /// Create a manager for one call attempt
    pub fn new(
        role: CallRole,
        config: ConnectionConfig,
        media: Arc<dyn MediaSource>,
        connector: Arc<dyn SignalingConnector>,
        factory: Arc<dyn PeerTransportFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                role,
                config,
                media,
                connector,
                factory,
                events,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Which side of the call this manager plays
    pub fn role(&self) -> CallRole {
        self.shared.role
    }

    /// Subscribe to connection events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Current negotiation phase
    pub async fn phase(&self) -> ConnectionPhase {
        self.shared.state.lock().await.phase
    }

    /// Current reconnect attempt counter
    pub async fn reconnect_attempts(&self) -> u32 {
        self.shared.state.lock().await.reconnect_attempts
    }

    /// Run the ordered start protocol
    ///
    /// Acquires media, connects signaling, constructs the transport with the
    /// resolved ICE server list, attaches local tracks and enters `Ready`.
    /// The initiator then attempts the offer; the attempt is repeated on
    /// every `peer:joined` announcement and is a no-op in any phase but
    /// `Ready`.
    ///
    /// # Errors
    ///
    /// Media, signaling and transport setup failures are fatal and never
    /// retried; the attempt is torn down before the error is returned.
    #[tracing::instrument(skip(self, params), fields(session = %params.session_id, user = %params.user_id, role = ?self.shared.role))]
    pub async fn start(&self, params: SignalingParams) -> Result<(), ConnectionError> {
        {
            let mut state = self.shared.state.lock().await;
            if state.stopped {
                return Err(ConnectionError::Stopped);
            }
            if state.started {
                return Err(ConnectionError::AlreadyStarted);
            }
            state.started = true;
            self.shared.set_phase(&mut state, ConnectionPhase::GatheringMedia);
        }

        // 1. local media
        let media_stream = match self
            .shared
            .media
            .acquire(&self.shared.config.constraints)
            .await
        {
            Ok(stream) => stream,
            Err(e) => return Err(self.abort_start(e.into()).await),
        };

        // 2. signaling relay
        let SignalingConnection {
            sender: signaling,
            events: signaling_events,
        } = match self.shared.connector.connect(&params).await {
            Ok(connection) => connection,
            Err(e) => {
                media_stream.stop_all();
                return Err(self.abort_start(e.into()).await);
            }
        };

        // 3. peer transport with the resolved ICE server list
        let (transport_tx, transport_events) = mpsc::unbounded_channel();
        let transport = match self
            .shared
            .factory
            .create(&self.shared.config.ice, transport_tx)
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                media_stream.stop_all();
                signaling.close().await;
                return Err(self.abort_start(e.into()).await);
            }
        };

        // 4. local tracks must be attached before any offer exists
        for track in &media_stream.tracks {
            if let Err(e) = transport.add_track(track).await {
                media_stream.stop_all();
                futures::join!(transport.close(), signaling.close());
                return Err(self.abort_start(e.into()).await);
            }
        }

        // 5. ready; event processing may begin
        let epoch = {
            let mut state = self.shared.state.lock().await;
            if state.stopped {
                drop(state);
                media_stream.stop_all();
                futures::join!(transport.close(), signaling.close());
                return Err(ConnectionError::Stopped);
            }
            state.media_stream = Some(media_stream);
            state.signaling = Some(signaling);
            state.transport = Some(transport);
            self.shared.set_phase(&mut state, ConnectionPhase::Ready);
            let epoch = state.epoch;
            state
                .tasks
                .push(Self::spawn_driver(&self.shared, epoch, signaling_events, transport_events));
            state.tasks.push(Self::spawn_watchdog(&self.shared, epoch));
            state.tasks.push(Self::spawn_stats_sampler(&self.shared, epoch));
            epoch
        };

        // 6. initiator attempts the offer right away (no-op until the peer
        // has joined the room)
        if let Err(e) = Self::try_send_offer(&self.shared, epoch).await {
            Self::fail(&self.shared, epoch, &e).await;
            return Err(e);
        }
        Ok(())
    }

    /// Flip the first local audio track and report whether it is now enabled
    ///
    /// Returns `false` with no effect when no audio track exists.
    pub async fn toggle_mute(&self) -> bool {
        self.toggle_track(MediaKind::Audio).await
    }

    /// Flip the first local video track and report whether it is now enabled
    ///
    /// Returns `false` with no effect when no video track exists.
    pub async fn toggle_camera(&self) -> bool {
        self.toggle_track(MediaKind::Video).await
    }

    async fn toggle_track(&self, kind: MediaKind) -> bool {
        let state = self.shared.state.lock().await;
        match state
            .media_stream
            .as_ref()
            .and_then(|stream| stream.first_track(kind))
        {
            Some(track) => track.toggle_enabled(),
            None => false,
        }
    }

    /// Tear the attempt down
    ///
    /// Idempotent and callable from any phase. Cancels every outstanding
    /// timer before stopping tracks, closing the transport and leaving the
    /// signaling room; no callback fired before this point can mutate state
    /// afterwards.
    pub async fn stop(&self) {
        Self::shutdown(&self.shared).await;
    }

    async fn abort_start(&self, err: ConnectionError) -> ConnectionError {
        {
            let mut state = self.shared.state.lock().await;
            state.stopped = true;
            state.epoch += 1;
            self.shared.set_phase(&mut state, ConnectionPhase::Disconnected);
        }
        tracing::error!(error = %err, "call attempt failed during start");
        let _ = self.shared.events.send(ConnectionEvent::Fatal {
            reason: err.to_string(),
        });
        err
    }

    fn spawn_driver(
        shared: &Arc<Shared>,
        epoch: u64,
        mut signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = signaling_events.recv() => match event {
                        Some(event) => Self::on_signaling_event(&shared, epoch, event).await,
                        None => {
                            Self::on_signaling_closed(&shared, epoch).await;
                            break;
                        }
                    },
                    event = transport_events.recv() => match event {
                        Some(event) => Self::on_transport_event(&shared, epoch, event).await,
                        None => break,
                    },
                }
            }
        })
    }

    fn spawn_watchdog(shared: &Arc<Shared>, epoch: u64) -> JoinHandle<()> {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let waited = shared.config.candidate_watchdog;
            tokio::time::sleep(waited).await;
            let Some(state) = shared.guarded(epoch).await else {
                return;
            };
            if !state.remote_description_set && !state.pending.is_empty() {
                // Diagnostic only; there is no automatic recovery from this.
                tracing::warn!(
                    queued = state.pending.len(),
                    waited_secs = waited.as_secs(),
                    "ICE candidates still queued with no remote description"
                );
            }
        })
    }

    fn spawn_stats_sampler(shared: &Arc<Shared>, epoch: u64) -> JoinHandle<()> {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.stats_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !Self::sample_quality(&shared, epoch).await {
                    break;
                }
            }
        })
    }

    async fn on_signaling_event(shared: &Arc<Shared>, epoch: u64, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {}
            SignalingEvent::ConnectError { reason } => {
                let err = ConnectionError::Signaling(SignalingError::ConnectFailed(reason));
                Self::fail(shared, epoch, &err).await;
            }
            SignalingEvent::PeerJoined => {
                if let Some(mut state) = shared.guarded(epoch).await {
                    state.peer_present = true;
                }
                if let Err(e) = Self::try_send_offer(shared, epoch).await {
                    Self::fail(shared, epoch, &e).await;
                }
            }
            SignalingEvent::PeerLeft => Self::on_peer_left(shared, epoch).await,
            SignalingEvent::Signal(SignalPayload::Offer { sdp }) => {
                if let Err(e) = Self::on_remote_offer(shared, epoch, sdp).await {
                    Self::fail(shared, epoch, &e).await;
                }
            }
            SignalingEvent::Signal(SignalPayload::Answer { sdp }) => {
                if let Err(e) = Self::on_remote_answer(shared, epoch, sdp).await {
                    Self::fail(shared, epoch, &e).await;
                }
            }
            SignalingEvent::Signal(SignalPayload::Candidate { candidate }) => {
                Self::on_remote_candidate(shared, epoch, candidate).await;
            }
        }
    }

    async fn on_transport_event(shared: &Arc<Shared>, epoch: u64, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let signaling = match shared.guarded(epoch).await {
                    Some(state) => state.signaling.clone(),
                    None => return,
                };
                if let Some(signaling) = signaling {
                    // Candidate relay is best effort; a lost candidate only
                    // narrows the path choices.
                    if let Err(e) = signaling.send(SignalPayload::Candidate { candidate }).await {
                        tracing::warn!(error = %e, "failed to relay local ICE candidate");
                    }
                }
            }
            TransportEvent::IceStateChanged(state) => {
                Self::apply_link_signal(shared, epoch, LinkSignal::Ice(state)).await;
            }
            TransportEvent::LinkStateChanged(state) => {
                Self::apply_link_signal(shared, epoch, LinkSignal::Link(state)).await;
            }
        }
    }

    /// Create and send the offer if, and only if, the attempt is `Ready`
    ///
    /// This gate is what keeps an offer from ever being sent before local
    /// tracks are attached, regardless of when the peer's join announcement
    /// arrives.
    async fn try_send_offer(shared: &Arc<Shared>, epoch: u64) -> Result<(), ConnectionError> {
        let (transport, signaling) = {
            let Some(mut state) = shared.guarded(epoch).await else {
                return Ok(());
            };
            if shared.role != CallRole::Initiator
                || state.phase != ConnectionPhase::Ready
                || !state.peer_present
                || state.offer_sent
            {
                return Ok(());
            }
            state.offer_sent = true;
            match (state.transport.clone(), state.signaling.clone()) {
                (Some(transport), Some(signaling)) => (transport, signaling),
                _ => return Ok(()),
            }
        };

        let sdp = transport
            .create_offer(false)
            .await
            .map_err(|e| ConnectionError::Negotiation(e.to_string()))?;
        signaling.send(SignalPayload::Offer { sdp }).await?;

        if let Some(mut state) = shared.guarded(epoch).await {
            shared.set_phase(&mut state, ConnectionPhase::Connecting);
        }
        tracing::info!("offer sent");
        Ok(())
    }

    async fn on_remote_offer(
        shared: &Arc<Shared>,
        epoch: u64,
        sdp: String,
    ) -> Result<(), ConnectionError> {
        let (transport, signaling) = {
            let Some(state) = shared.guarded(epoch).await else {
                return Ok(());
            };
            match (state.transport.clone(), state.signaling.clone()) {
                (Some(transport), Some(signaling)) => (transport, signaling),
                _ => return Ok(()),
            }
        };

        transport
            .set_remote_description(SdpKind::Offer, sdp)
            .await
            .map_err(|e| ConnectionError::Negotiation(e.to_string()))?;
        Self::flush_pending_candidates(shared, epoch, &transport).await;

        let sdp = transport
            .create_answer()
            .await
            .map_err(|e| ConnectionError::Negotiation(e.to_string()))?;
        signaling.send(SignalPayload::Answer { sdp }).await?;

        if let Some(mut state) = shared.guarded(epoch).await {
            shared.set_phase(&mut state, ConnectionPhase::Connecting);
        }
        tracing::info!("answer sent");
        Ok(())
    }

    async fn on_remote_answer(
        shared: &Arc<Shared>,
        epoch: u64,
        sdp: String,
    ) -> Result<(), ConnectionError> {
        let transport = {
            let Some(state) = shared.guarded(epoch).await else {
                return Ok(());
            };
            match state.transport.clone() {
                Some(transport) => transport,
                None => return Ok(()),
            }
        };

        transport
            .set_remote_description(SdpKind::Answer, sdp)
            .await
            .map_err(|e| ConnectionError::Negotiation(e.to_string()))?;
        Self::flush_pending_candidates(shared, epoch, &transport).await;
        Ok(())
    }

    /// Drain the queue in arrival order the instant a remote description is set
    async fn flush_pending_candidates(
        shared: &Arc<Shared>,
        epoch: u64,
        transport: &Arc<dyn PeerTransport>,
    ) {
        let queued = {
            let Some(mut state) = shared.guarded(epoch).await else {
                return;
            };
            state.remote_description_set = true;
            state.pending.drain()
        };
        if queued.is_empty() {
            return;
        }
        tracing::debug!(count = queued.len(), "flushing queued ICE candidates");
        for candidate in queued {
            // A single bad candidate must never abort a viable connection.
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "discarding ICE candidate that failed to apply");
            }
        }
    }

    async fn on_remote_candidate(shared: &Arc<Shared>, epoch: u64, candidate: CandidateInit) {
        let transport = {
            let Some(mut state) = shared.guarded(epoch).await else {
                return;
            };
            if !state.remote_description_set {
                state.pending.push(candidate);
                tracing::trace!(
                    queued = state.pending.len(),
                    "ICE candidate queued before remote description"
                );
                return;
            }
            state.transport.clone()
        };
        if let Some(transport) = transport {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "discarding ICE candidate that failed to apply");
            }
        }
    }

    async fn on_peer_left(shared: &Arc<Shared>, epoch: u64) {
        let phase = {
            let Some(mut state) = shared.guarded(epoch).await else {
                return;
            };
            state.peer_present = false;
            state.phase
        };
        if matches!(
            phase,
            ConnectionPhase::Connecting | ConnectionPhase::Connected | ConnectionPhase::Reconnecting
        ) {
            Self::fail(shared, epoch, &ConnectionError::RemoteDisconnected).await;
        } else {
            tracing::debug!("peer left before negotiation began; join-order race");
        }
    }

    async fn on_signaling_closed(shared: &Arc<Shared>, epoch: u64) {
        let phase = match shared.guarded(epoch).await {
            Some(state) => state.phase,
            None => return,
        };
        if matches!(
            phase,
            ConnectionPhase::Connecting | ConnectionPhase::Connected | ConnectionPhase::Reconnecting
        ) {
            let err = ConnectionError::Signaling(SignalingError::ChannelClosed);
            Self::fail(shared, epoch, &err).await;
        }
    }

    /// The single transition function fed by both the ICE-state and the
    /// connection-state callbacks; precedence is failed over connected over
    /// disconnected
    async fn apply_link_signal(shared: &Arc<Shared>, epoch: u64, signal: LinkSignal) {
        let failed = matches!(
            signal,
            LinkSignal::Ice(IceConnectionState::Failed) | LinkSignal::Link(LinkState::Failed)
        );
        let connected = matches!(
            signal,
            LinkSignal::Ice(IceConnectionState::Connected | IceConnectionState::Completed)
                | LinkSignal::Link(LinkState::Connected)
        );
        let interrupted = matches!(
            signal,
            LinkSignal::Ice(IceConnectionState::Disconnected)
                | LinkSignal::Link(LinkState::Disconnected)
        );

        if failed {
            if let LinkSignal::Ice(ice) = signal {
                Self::emit_link_state(shared, epoch, ice).await;
            }
            Self::schedule_reconnect(shared, epoch).await;
            return;
        }

        if connected {
            {
                let Some(mut state) = shared.guarded(epoch).await else {
                    return;
                };
                state.reconnect_attempts = 0;
                if state.connected_at.is_none() {
                    state.connected_at = Some(Instant::now());
                }
                shared.set_phase(&mut state, ConnectionPhase::Connected);
            }
            if let LinkSignal::Ice(ice) = signal {
                Self::emit_link_state(shared, epoch, ice).await;
            }
            return;
        }

        if interrupted {
            if let Some(mut state) = shared.guarded(epoch).await {
                if state.phase == ConnectionPhase::Connected {
                    shared.set_phase(&mut state, ConnectionPhase::Reconnecting);
                }
            }
        }
        if let LinkSignal::Ice(ice) = signal {
            Self::emit_link_state(shared, epoch, ice).await;
        }
    }

    /// Mirror an ICE state change upward so the lifecycle store can merge it
    async fn emit_link_state(shared: &Arc<Shared>, epoch: u64, ice: IceConnectionState) {
        let transport = match shared.guarded(epoch).await {
            Some(state) => state.transport.clone(),
            None => return,
        };
        let connection_type = match (ice, transport) {
            (IceConnectionState::Connected | IceConnectionState::Completed, Some(transport)) => {
                transport.selected_route().await
            }
            _ => ConnectionType::Unknown,
        };
        let _ = shared.events.send(ConnectionEvent::LinkStateChanged {
            ice_state: ice,
            connection_type,
            turn_credentials_used: shared.config.ice.uses_turn(),
        });
    }

    async fn schedule_reconnect(shared: &Arc<Shared>, epoch: u64) {
        let (attempt, delay) = {
            let Some(mut state) = shared.guarded(epoch).await else {
                return;
            };
            // At most one reconnect timer is ever outstanding.
            if state.reconnect_timer.is_some() {
                return;
            }
            state.reconnect_attempts += 1;
            if state.reconnect_attempts > shared.config.max_reconnect_attempts {
                drop(state);
                let err = ConnectionError::RetriesExhausted {
                    attempts: shared.config.max_reconnect_attempts,
                };
                Self::fail(shared, epoch, &err).await;
                return;
            }
            shared.set_phase(&mut state, ConnectionPhase::Reconnecting);
            let attempt = state.reconnect_attempts;
            let delay = Duration::from_secs(1u64 << attempt.min(MAX_BACKOFF_SHIFT));
            let task_shared = Arc::clone(shared);
            state.reconnect_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                PeerConnectionManager::run_reconnect_probe(&task_shared, epoch).await;
            }));
            (attempt, delay)
        };
        tracing::info!(attempt, delay_secs = delay.as_secs(), "link failed, ICE restart scheduled");
    }

    async fn run_reconnect_probe(shared: &Arc<Shared>, epoch: u64) {
        let (transport, signaling) = {
            let Some(mut state) = shared.guarded(epoch).await else {
                return;
            };
            state.reconnect_timer = None;
            match (state.transport.clone(), state.signaling.clone()) {
                (Some(transport), Some(signaling)) => (transport, signaling),
                _ => return,
            }
        };

        // The link may have recovered on its own while the timer was pending.
        let still_failed = transport.ice_state() == IceConnectionState::Failed
            || transport.link_state() == LinkState::Failed;
        if !still_failed {
            tracing::debug!("link recovered before the restart timer fired");
            return;
        }

        tracing::info!("issuing ICE-restart offer");
        match transport.create_offer(true).await {
            Ok(sdp) => {
                if let Err(e) = signaling.send(SignalPayload::Offer { sdp }).await {
                    tracing::warn!(error = %e, "failed to send ICE-restart offer");
                }
            }
            Err(e) => {
                let err = ConnectionError::Negotiation(e.to_string());
                Self::fail(shared, epoch, &err).await;
            }
        }
    }

    /// Sample quality once; returns `false` when the sampler should stop
    async fn sample_quality(shared: &Arc<Shared>, epoch: u64) -> bool {
        let (transport, connected_at, resolution) = {
            let Some(state) = shared.guarded(epoch).await else {
                return false;
            };
            // Sampling is skipped, not errored, while the link is down.
            if state.phase != ConnectionPhase::Connected {
                return true;
            }
            let resolution = state
                .media_stream
                .as_ref()
                .map(|stream| stream.video_resolution())
                .unwrap_or((0, 0));
            (state.transport.clone(), state.connected_at, resolution)
        };
        let Some(transport) = transport else {
            return true;
        };
        let Some(sample) = transport.sample_stats().await else {
            return true;
        };

        // The byte counter is cumulative, so this is an average since the
        // connection was established, not an instantaneous rate.
        let elapsed = connected_at.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0);
        let bitrate_kbps = if elapsed > 0.0 {
            ((sample.bytes_received as f64) * 8.0 / 1000.0 / elapsed) as u32
        } else {
            0
        };
        let delivered = sample.packets_received + sample.packets_lost;
        let packet_loss_pct = if delivered > 0 {
            (sample.packets_lost as f32 / delivered as f32) * 100.0
        } else {
            0.0
        };

        let metrics = QualityMetrics {
            bitrate_kbps,
            packet_loss_pct,
            latency_ms: sample.round_trip_ms,
            frame_width: resolution.0,
            frame_height: resolution.1,
            last_updated: Utc::now(),
        };
        let _ = shared
            .events
            .send(ConnectionEvent::QualitySampled { metrics });
        true
    }

    async fn fail(shared: &Arc<Shared>, epoch: u64, err: &ConnectionError) {
        {
            let Some(mut state) = shared.guarded(epoch).await else {
                return;
            };
            state.stopped = true;
            state.epoch += 1;
            shared.set_phase(&mut state, ConnectionPhase::Disconnected);
        }
        tracing::error!(error = %err, "call attempt failed");
        let _ = shared.events.send(ConnectionEvent::Fatal {
            reason: err.to_string(),
        });
        // Resource teardown runs on its own task so a handler can fail the
        // attempt without aborting itself mid-cleanup.
        let task_shared = Arc::clone(shared);
        tokio::spawn(async move {
            Self::shutdown(&task_shared).await;
        });
    }

    async fn shutdown(shared: &Arc<Shared>) {
        let (tasks, reconnect, transport, signaling, media) = {
            let mut state = shared.state.lock().await;
            state.stopped = true;
            state.epoch += 1;
            let tasks = std::mem::take(&mut state.tasks);
            let reconnect = state.reconnect_timer.take();
            let transport = state.transport.take();
            let signaling = state.signaling.take();
            let media = state.media_stream.take();
            state.pending = CandidateBuffer::default();
            state.remote_description_set = false;
            state.peer_present = false;
            if state.phase != ConnectionPhase::Disconnected {
                state.phase = ConnectionPhase::Disconnected;
                let _ = shared.events.send(ConnectionEvent::PhaseChanged {
                    phase: ConnectionPhase::Disconnected,
                });
            }
            (tasks, reconnect, transport, signaling, media)
        };

        // Every timer dies before any resource is released.
        if let Some(timer) = reconnect {
            timer.abort();
        }
        for task in &tasks {
            task.abort();
        }
        if let Some(media) = media {
            media.stop_all();
        }
        match (transport, signaling) {
            (Some(transport), Some(signaling)) => {
                futures::join!(transport.close(), signaling.close());
            }
            (Some(transport), None) => transport.close().await,
            (None, Some(signaling)) => signaling.close().await,
            (None, None) => {}
        }
    }
}
