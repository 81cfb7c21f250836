//! Core identifiers, enumerations and data structures shared across the call stack

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a matched session between two users
///
/// Sessions are created and scored by the matching service, which is outside
/// this crate; here they are opaque keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Wrap a session identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Wrap a user identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted status of a call record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Record created but not yet ringing (reserved, never stored by this crate)
    Idle,
    /// Receiver has been notified, waiting for accept/reject
    Ringing,
    /// Accepted, negotiation in progress
    Connecting,
    /// Media is flowing
    Connected,
    /// Terminated normally
    Ended,
    /// Terminated by an error
    Failed,
}

impl CallStatus {
    /// Terminal statuses can never be left again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Non-terminal statuses count against the one-active-call invariant
    pub fn is_active(self) -> bool {
        matches!(self, Self::Ringing | Self::Connecting | Self::Connected)
    }
}

/// ICE connection state mirrored from the underlying peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    /// No checks have started
    New,
    /// Connectivity checks in progress
    Checking,
    /// A usable pair was found
    Connected,
    /// Checks finished on all pairs
    Completed,
    /// No usable pair could be found
    Failed,
    /// Connectivity was lost, checks may recover it
    Disconnected,
    /// The transport was shut down
    Closed,
}

/// How media flows between the two peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Host or server-reflexive path
    Direct,
    /// Traffic is relayed through a TURN server
    Relay,
    /// Not yet determined
    Unknown,
}

/// Local negotiation phase for one call attempt
///
/// Owned exclusively by the peer-connection manager for the lifetime of a
/// single attempt; never persisted and destroyed on `stop()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Nothing started yet
    Idle,
    /// Acquiring camera and microphone
    GatheringMedia,
    /// Tracks attached, offers may be created
    Ready,
    /// Offer/answer exchange in flight
    Connecting,
    /// Link is up
    Connected,
    /// Link dropped, restart scheduled
    Reconnecting,
    /// Attempt is over, nothing will run again
    Disconnected,
}

/// Which side of the call this peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    /// Creates the offer
    Initiator,
    /// Answers it
    Receiver,
}

/// Kind of a local media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone capture
    Audio,
    /// Camera capture
    Video,
}

/// Media constraints for a call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Latest quality snapshot for a call
///
/// A single sample overwrites the previous one; no history is retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Inbound video bitrate averaged since the connection was established
    pub bitrate_kbps: u32,
    /// Share of packets lost, in percent
    pub packet_loss_pct: f32,
    /// Round-trip latency in milliseconds
    pub latency_ms: u32,
    /// Negotiated video width in pixels (0 when audio only)
    pub frame_width: u32,
    /// Negotiated video height in pixels (0 when audio only)
    pub frame_height: u32,
    /// When the sample was taken
    pub last_updated: DateTime<Utc>,
}

impl QualityMetrics {
    /// Whether the sample crosses the degradation thresholds
    /// (packet loss above 10% or bitrate below 100 kbps)
    pub fn is_degraded(&self) -> bool {
        self.packet_loss_pct > 10.0 || self.bitrate_kbps < 100
    }
}

/// Events emitted by the peer-connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The local negotiation phase changed
    PhaseChanged {
        /// New phase
        phase: ConnectionPhase,
    },
    /// The underlying link reported a state change
    LinkStateChanged {
        /// Mirrored ICE connection state
        ice_state: IceConnectionState,
        /// Media path classification
        connection_type: ConnectionType,
        /// Whether TURN credentials were configured for this attempt
        turn_credentials_used: bool,
    },
    /// A quality sample was taken
    QualitySampled {
        /// The sample
        metrics: QualityMetrics,
    },
    /// The attempt failed for good; no retry will follow
    Fatal {
        /// Human-readable failure description
        reason: String,
    },
}
