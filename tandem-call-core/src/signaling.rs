//! Signaling relay contract and wire messages
//!
//! The relay is an external collaborator: a room scoped to one session that
//! forwards offer/answer/candidate payloads between exactly two participants
//! and announces joins and leaves. This module defines the contract the
//! peer-connection manager programs against, plus an in-memory room used by
//! tests and the loopback demo.
//!
//! Delivery is unordered and unacknowledged. Anything sent while the other
//! participant is absent is dropped; the offer is therefore re-attempted on
//! every `peer:joined` announcement.

use crate::types::{SessionId, UserId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Could not reach the relay
    #[error("signaling connect failed: {0}")]
    ConnectFailed(String),

    /// Both slots of the room are taken
    #[error("signaling room {0} is full")]
    RoomFull(SessionId),

    /// The connection is gone
    #[error("signaling channel closed")]
    ChannelClosed,

    /// Outbound delivery failed
    #[error("signaling send failed: {0}")]
    SendFailed(String),
}

/// One ICE candidate as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    /// The candidate attribute line
    pub candidate: String,
    /// SDP media stream identification tag
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// Relay payload exchanged between the two participants
///
/// Serialized as `{"type": "offer" | "answer" | "candidate", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    /// SDP offer
    Offer {
        /// SDP content
        sdp: String,
    },
    /// SDP answer
    Answer {
        /// SDP content
        sdp: String,
    },
    /// ICE candidate
    Candidate {
        /// The candidate
        candidate: CandidateInit,
    },
}

/// Events surfaced by a connected signaling channel
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// The channel is up
    Connected,
    /// The channel could not be established or broke during setup
    ConnectError {
        /// Relay-provided reason
        reason: String,
    },
    /// The other participant is present in the room
    PeerJoined,
    /// The other participant left the room
    PeerLeft,
    /// A relayed payload arrived
    Signal(SignalPayload),
}

/// Parameters identifying this participant to the relay
#[derive(Debug, Clone)]
pub struct SignalingParams {
    /// Relay endpoint
    pub url: String,
    /// Session whose room to join
    pub session_id: SessionId,
    /// Joining user
    pub user_id: UserId,
    /// Signaling authorization token for this call
    pub token: String,
}

/// Outbound half of a signaling connection
#[async_trait]
pub trait SignalingSender: Send + Sync {
    /// Relay a payload to the other participant
    ///
    /// # Errors
    ///
    /// Returns error if the channel is no longer usable. A payload sent while
    /// the peer is absent is dropped silently, not an error.
    async fn send(&self, payload: SignalPayload) -> Result<(), SignalingError>;

    /// Leave the room and release the connection
    async fn close(&self);
}

/// A live signaling connection: outbound sender plus inbound event stream
pub struct SignalingConnection {
    /// Outbound half, shareable across tasks
    pub sender: Arc<dyn SignalingSender>,
    /// Inbound events; `None` from `recv` means the channel closed
    pub events: mpsc::UnboundedReceiver<SignalingEvent>,
}

/// Connects participants to the signaling relay
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Join the room for the given session
    ///
    /// # Errors
    ///
    /// Returns error if the relay is unreachable or the room is full.
    async fn connect(&self, params: &SignalingParams) -> Result<SignalingConnection, SignalingError>;
}

struct RoomInner {
    session_id: SessionId,
    members: Mutex<HashMap<UserId, mpsc::UnboundedSender<SignalingEvent>>>,
}

/// In-memory two-slot signaling room
///
/// Implements the relay contract for tests and the CLI loopback demo with the
/// same semantics as the production relay: at most two participants, join and
/// leave announcements in both directions, payloads forwarded only to the
/// other participant and dropped when that participant is absent.
pub struct SignalingRoom {
    inner: Arc<RoomInner>,
}

impl SignalingRoom {
    /// Create an empty room for one session
    pub fn new(session_id: SessionId) -> Self {
        Self {
            inner: Arc::new(RoomInner {
                session_id,
                members: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Session this room belongs to
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Number of participants currently joined
    pub fn occupancy(&self) -> usize {
        self.inner.members.lock().len()
    }

    /// Join the room as the given user
    ///
    /// Existing members are announced to the joiner and vice versa, so a
    /// participant that connects second still observes `PeerJoined`.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::RoomFull` when both slots are taken.
    pub fn join(&self, user_id: UserId) -> Result<SignalingConnection, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut members = self.inner.members.lock();
            if members.len() >= 2 && !members.contains_key(&user_id) {
                return Err(SignalingError::RoomFull(self.inner.session_id.clone()));
            }
            let _ = tx.send(SignalingEvent::Connected);
            for peer_tx in members.values() {
                let _ = peer_tx.send(SignalingEvent::PeerJoined);
                let _ = tx.send(SignalingEvent::PeerJoined);
            }
            members.insert(user_id.clone(), tx);
        }
        tracing::debug!(session = %self.inner.session_id, user = %user_id, "joined signaling room");

        Ok(SignalingConnection {
            sender: Arc::new(RoomSender {
                user_id,
                inner: Arc::clone(&self.inner),
            }),
            events: rx,
        })
    }
}

struct RoomSender {
    user_id: UserId,
    inner: Arc<RoomInner>,
}

#[async_trait]
impl SignalingSender for RoomSender {
    async fn send(&self, payload: SignalPayload) -> Result<(), SignalingError> {
        let members = self.inner.members.lock();
        for (user, tx) in members.iter() {
            if user != &self.user_id {
                let _ = tx.send(SignalingEvent::Signal(payload.clone()));
            }
        }
        Ok(())
    }

    async fn close(&self) {
        let mut members = self.inner.members.lock();
        if members.remove(&self.user_id).is_some() {
            for tx in members.values() {
                let _ = tx.send(SignalingEvent::PeerLeft);
            }
            tracing::debug!(session = %self.inner.session_id, user = %self.user_id, "left signaling room");
        }
    }
}

#[async_trait]
impl SignalingConnector for SignalingRoom {
    async fn connect(&self, params: &SignalingParams) -> Result<SignalingConnection, SignalingError> {
        if params.session_id != self.inner.session_id {
            return Err(SignalingError::ConnectFailed(format!(
                "room belongs to session {}, not {}",
                self.inner.session_id, params.session_id
            )));
        }
        self.join(params.user_id.clone())
    }
}
