//! Tandem call core - peer call lifecycle over relayed signaling
//!
//! This library holds the call stack of the Tandem matching platform: two
//! matched users hold a live peer-to-peer audio/video session whose
//! negotiation is relayed through a signaling room, while a server-of-record
//! tracks call lifecycle for authorization, history and cross-device
//! consistency. It features:
//!
//! - **Ordered negotiation**: offers are gated on local readiness, ICE
//!   candidates queue until a remote description exists and flush in arrival
//!   order
//! - **Durable call records**: an authoritative state machine that tolerates
//!   duplicate and out-of-order reports and never revives a terminal call
//! - **Bounded recovery**: exponential-backoff ICE restarts with a single
//!   outstanding timer, plus a server-side sweep for orphaned records
//! - **Signed signaling tokens**: keyed-MAC session tokens with expiry and
//!   revocation
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tandem_call_core::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Server-of-record side: sessions come from the matching service.
//! let sessions = Arc::new(InMemorySessions::new());
//! let service = CallService::builder(sessions).build();
//! service.start().await;
//!
//! let (record, token) = service
//!     .place_call(
//!         SessionId::new("sess-1"),
//!         UserId::new("alice"),
//!         UserId::new("bob"),
//!     )
//!     .await?;
//!
//! // Client side: one manager per call attempt.
//! let room = Arc::new(SignalingRoom::new(SessionId::new("sess-1")));
//! let manager = PeerConnectionManager::new(
//!     CallRole::Initiator,
//!     ConnectionConfig::default(),
//!     Arc::new(SyntheticMediaSource::default()),
//!     room,
//!     Arc::new(WebRtcTransportFactory::default()),
//! );
//! let _reconciler = service.attach(record.id, manager.subscribe());
//! manager
//!     .start(SignalingParams {
//!         url: "memory://".to_string(),
//!         session_id: SessionId::new("sess-1"),
//!         user_id: UserId::new("alice"),
//!         token: token.token,
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core identifiers, enumerations and shared data structures
pub mod types;

/// Signaling relay contract, wire messages and the in-memory room
pub mod signaling;

/// Local media acquisition and track handles
pub mod media;

/// Peer transport seam and ICE server resolution
pub mod transport;

/// Production peer transport over the webrtc crate
#[cfg(feature = "webrtc-transport")]
pub mod webrtc_transport;

/// Peer-connection lifecycle manager
pub mod connection;

/// Authoritative call lifecycle records and transition rules
pub mod store;

/// Signaling authorization tokens
pub mod token;

/// Service orchestration: store reconciliation and the stale sweep
pub mod service;

// Re-export main types at crate root
pub use connection::{CandidateBuffer, ConnectionConfig, ConnectionError, PeerConnectionManager};
pub use media::{LocalMediaStream, LocalTrack, MediaError, MediaSource, SyntheticMediaSource};
pub use service::{CallService, CallServiceBuilder, ServiceConfig, ServiceError};
pub use signaling::{
    CandidateInit, SignalPayload, SignalingConnection, SignalingConnector, SignalingError,
    SignalingEvent, SignalingParams, SignalingRoom, SignalingSender,
};
pub use store::{
    CallLifecycleStore, CallRecord, InMemorySessions, SessionDirectory, SessionInfo,
    SessionStatus, StoreConfig, StoreError,
};
pub use token::{SessionToken, TokenClaims, TokenError, TokenSigner};
pub use transport::{
    IceServer, IceSettings, LinkState, PeerTransport, PeerTransportFactory, SdpKind,
    TransportError, TransportEvent, TransportSample, TurnCredentials,
};
pub use types::*;
#[cfg(feature = "webrtc-transport")]
pub use webrtc_transport::{WebRtcPeerTransport, WebRtcTransportFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::{ConnectionConfig, ConnectionError, PeerConnectionManager};
    pub use crate::media::{MediaSource, SyntheticMediaSource};
    pub use crate::service::{CallService, ServiceConfig};
    pub use crate::signaling::{
        SignalPayload, SignalingConnector, SignalingEvent, SignalingParams, SignalingRoom,
    };
    pub use crate::store::{
        CallLifecycleStore, CallRecord, InMemorySessions, SessionInfo, SessionStatus,
    };
    pub use crate::token::TokenSigner;
    pub use crate::transport::{IceSettings, TurnCredentials};
    pub use crate::types::{
        CallId, CallRole, CallStatus, ConnectionEvent, ConnectionPhase, ConnectionType,
        IceConnectionState, MediaConstraints, QualityMetrics, SessionId, UserId,
    };
    #[cfg(feature = "webrtc-transport")]
    pub use crate::webrtc_transport::WebRtcTransportFactory;
}
