//! Peer transport seam
//!
//! The underlying peer-connection object (SDP negotiation, ICE, media
//! transport) sits behind the `PeerTransport` trait so the manager's protocol
//! logic can be driven against mocks, while `webrtc_transport` provides the
//! production implementation over the webrtc crate.

use crate::media::LocalTrack;
use crate::signaling::CandidateInit;
use crate::types::{ConnectionType, IceConnectionState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer connection could not be constructed or configured
    #[error("transport setup failed: {0}")]
    Setup(String),

    /// An SDP create/set operation failed; the negotiation cannot proceed
    #[error("sdp negotiation failed: {0}")]
    Sdp(String),

    /// An individual candidate could not be applied
    #[error("ice candidate rejected: {0}")]
    Candidate(String),

    /// The transport was already closed
    #[error("transport closed")]
    Closed,
}

/// Kind of a remote session description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    /// Remote offer
    Offer,
    /// Remote answer
    Answer,
}

/// Coarse state of the underlying connection object
///
/// Reported by the connection-state callback, alongside the finer-grained
/// ICE state. Both feed the same transition function in the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Freshly constructed
    New,
    /// Transports are being established
    Connecting,
    /// All transports are up
    Connected,
    /// At least one transport lost connectivity
    Disconnected,
    /// A transport failed for good
    Failed,
    /// Shut down
    Closed,
}

/// Events pushed up from the transport to the manager
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local ICE candidate was gathered and should be relayed to the peer
    LocalCandidate(CandidateInit),
    /// The ICE connection state changed
    IceStateChanged(IceConnectionState),
    /// The aggregate connection state changed
    LinkStateChanged(LinkState),
}

/// Point-in-time transport statistics
///
/// Counters are cumulative since the connection was established.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportSample {
    /// Inbound media bytes received so far
    pub bytes_received: u64,
    /// Inbound media packets received so far
    pub packets_received: u64,
    /// Packets reported lost by the remote end
    pub packets_lost: u64,
    /// Round-trip time in milliseconds
    pub round_trip_ms: u32,
}

/// One ICE server entry handed to the underlying connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:` or `turn:` scheme)
    pub urls: Vec<String>,
    /// TURN username, if any
    pub username: Option<String>,
    /// TURN credential, if any
    pub credential: Option<String>,
}

/// TURN relay credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredentials {
    /// TURN server URLs
    pub urls: Vec<String>,
    /// Username
    pub username: String,
    /// Credential
    pub credential: String,
}

/// ICE server policy for one call attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceSettings {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN relay, when provisioned for this deployment
    pub turn: Option<TurnCredentials>,
    /// Force all media through the relay; STUN is omitted entirely
    pub force_relay: bool,
}

impl Default for IceSettings {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn: None,
            force_relay: false,
        }
    }
}

impl IceSettings {
    /// Resolve the server list for the underlying connection
    ///
    /// STUN entries are omitted entirely under the force-relay policy; TURN
    /// entries appear only when credentials are configured.
    pub fn resolve(&self) -> Vec<IceServer> {
        let mut servers = Vec::new();
        if !self.force_relay && !self.stun_servers.is_empty() {
            servers.push(IceServer {
                urls: self.stun_servers.clone(),
                username: None,
                credential: None,
            });
        }
        if let Some(turn) = &self.turn {
            servers.push(IceServer {
                urls: turn.urls.clone(),
                username: Some(turn.username.clone()),
                credential: Some(turn.credential.clone()),
            });
        }
        servers
    }

    /// Whether TURN credentials are configured for this attempt
    pub fn uses_turn(&self) -> bool {
        self.turn.is_some()
    }
}

/// The underlying peer-connection object, one per call attempt
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local track before negotiation begins
    ///
    /// # Errors
    ///
    /// Returns error if the track cannot be added.
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    /// Create an offer and install it as the local description
    ///
    /// With `ice_restart` set, the offer requests fresh ICE credentials.
    ///
    /// # Errors
    ///
    /// Returns error if the offer cannot be created or set.
    async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError>;

    /// Create an answer to the current remote offer and install it locally
    ///
    /// # Errors
    ///
    /// Returns error if the answer cannot be created or set.
    async fn create_answer(&self) -> Result<String, TransportError>;

    /// Install the remote session description
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected.
    async fn set_remote_description(&self, kind: SdpKind, sdp: String)
        -> Result<(), TransportError>;

    /// Apply one remote ICE candidate
    ///
    /// # Errors
    ///
    /// Returns error if this candidate is rejected; other candidates remain
    /// unaffected.
    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError>;

    /// Current ICE connection state
    fn ice_state(&self) -> IceConnectionState;

    /// Current aggregate connection state
    fn link_state(&self) -> LinkState;

    /// Classification of the selected media path
    async fn selected_route(&self) -> ConnectionType;

    /// Read cumulative transport statistics
    ///
    /// Returns `None` when no inbound media has been observed yet; callers
    /// skip the sample rather than treating this as an error.
    async fn sample_stats(&self) -> Option<TransportSample>;

    /// Close the connection and release its resources
    async fn close(&self);
}

/// Builds one transport per call attempt
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Construct a transport configured from the ICE settings
    ///
    /// Transport callbacks are delivered through `events`.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying connection cannot be constructed.
    async fn create(
        &self,
        ice: &IceSettings,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
