//! Authoritative call lifecycle records and transition rules
//!
//! The store is the server-of-record for call status. Clients report what
//! their peer connection observes; the store merges those reports into the
//! persisted record under monotonic rules: status only ever moves toward a
//! terminal state, terminal records are never revived, and every transition
//! tolerates replayed or out-of-order delivery. Records are append-only and
//! never deleted.

use crate::token::{SessionToken, TokenError, TokenSigner};
use crate::types::{
    CallId, CallStatus, ConnectionType, IceConnectionState, QualityMetrics, SessionId, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

/// Store errors; all of these are precondition violations rejected
/// synchronously and never retried
#[derive(Error, Debug)]
pub enum StoreError {
    /// Unknown session
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// Calls may only be placed on accepted sessions
    #[error("session {0} is not in an accepted state")]
    SessionNotAccepted(SessionId),

    /// The acting user does not belong to the session
    #[error("user {user} is not a participant of session {session}")]
    NotParticipant {
        /// Session in question
        session: SessionId,
        /// Acting user
        user: UserId,
    },

    /// Accept/reject are receiver-only operations
    #[error("only the receiver may {action} call {call}")]
    NotReceiver {
        /// Call in question
        call: CallId,
        /// Attempted operation
        action: &'static str,
    },

    /// The acting user does not belong to the call
    #[error("user {user} is not a participant of call {call}")]
    NotCallParticipant {
        /// Call in question
        call: CallId,
        /// Acting user
        user: UserId,
    },

    /// Unknown call
    #[error("call {0} not found")]
    CallNotFound(CallId),

    /// The call is not in the status the operation requires
    #[error("call {call} is {status:?}, expected {expected:?}")]
    InvalidStatus {
        /// Call in question
        call: CallId,
        /// Its current status
        status: CallStatus,
        /// Status the operation requires
        expected: CallStatus,
    },

    /// The one-active-call-per-session invariant would be violated
    #[error("session {0} already has an active call")]
    ActiveCallExists(SessionId),

    /// Token verification failed
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Status of a matched session, as reported by the matching service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Match proposed, not yet confirmed
    Pending,
    /// Both users confirmed; calls may be placed
    Accepted,
    /// Match declined
    Declined,
    /// Session wrapped up
    Completed,
}

/// One matched session between exactly two users
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier
    pub id: SessionId,
    /// The two matched users
    pub participants: [UserId; 2],
    /// Current session status
    pub status: SessionStatus,
}

impl SessionInfo {
    /// Whether the given user is one of the two participants
    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participants.iter().any(|p| p == user)
    }
}

/// Read access to the matching service's session records
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Look a session up by id
    async fn lookup(&self, id: &SessionId) -> Option<SessionInfo>;
}

/// In-memory session directory for tests and demos
#[derive(Default)]
pub struct InMemorySessions {
    sessions: RwLock<HashMap<SessionId, SessionInfo>>,
}

impl InMemorySessions {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session
    pub async fn insert(&self, session: SessionInfo) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }
}

#[async_trait]
impl SessionDirectory for InMemorySessions {
    async fn lookup(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.read().await.get(id).cloned()
    }
}

/// The persisted, authoritative record of one call attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    /// Record identifier
    pub id: CallId,
    /// Session the call belongs to
    pub session_id: SessionId,
    /// Who placed the call
    pub caller_id: UserId,
    /// Who was called
    pub receiver_id: UserId,
    /// Current status
    pub status: CallStatus,
    /// Last ICE state reported by either client
    pub ice_connection_state: Option<IceConnectionState>,
    /// Media path classification
    pub connection_type: ConnectionType,
    /// Whether TURN credentials were in play
    pub turn_credentials_used: bool,
    /// When media first flowed
    pub started_at: Option<DateTime<Utc>>,
    /// When the call reached a terminal status
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds between `started_at` and `ended_at`, 0 if never started
    pub duration_secs: u64,
    /// Why the call ended, when not a normal hangup
    pub failure_reason: Option<String>,
    /// Latest quality sample; overwritten, never appended
    pub quality: Option<QualityMetrics>,
    /// Record creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    fn new(session_id: SessionId, caller_id: UserId, receiver_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: CallId::new(),
            session_id,
            caller_id,
            receiver_id,
            status: CallStatus::Ringing,
            ice_connection_state: None,
            connection_type: ConnectionType::Unknown,
            turn_credentials_used: false,
            started_at: None,
            ended_at: None,
            duration_secs: 0,
            failure_reason: None,
            quality: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the record reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the given user is the caller or the receiver
    pub fn is_participant(&self, user: &UserId) -> bool {
        &self.caller_id == user || &self.receiver_id == user
    }

    /// Move the record to a terminal status and derive its duration
    fn finish(&mut self, status: CallStatus, reason: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        if self.ended_at.is_none() {
            self.ended_at = Some(now);
        }
        if let (Some(started), Some(ended)) = (self.started_at, self.ended_at) {
            self.duration_secs = (ended - started).num_seconds().max(0) as u64;
        }
        if self.failure_reason.is_none() {
            self.failure_reason = reason;
        }
    }
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Ringing/connecting calls older than this are swept to failed
    pub stale_after: Duration,
    /// Lifetime of issued signaling tokens
    pub token_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(10 * 60),
            token_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// The server-of-record for call lifecycle
pub struct CallLifecycleStore {
    sessions: Arc<dyn SessionDirectory>,
    signer: TokenSigner,
    config: StoreConfig,
    calls: RwLock<HashMap<CallId, CallRecord>>,
    tokens: RwLock<HashMap<SessionId, SessionToken>>,
}

impl CallLifecycleStore {
    /// Create a store over the given session directory
    pub fn new(sessions: Arc<dyn SessionDirectory>, signer: TokenSigner, config: StoreConfig) -> Self {
        Self {
            sessions,
            signer,
            config,
            calls: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Place a call on a session
    ///
    /// Requires the session to be accepted, both users to be its
    /// participants, and no other call of the session to be active. Creates
    /// a ringing record and issues the session's signaling token. Notifying
    /// the receiver is the caller's concern, not the store's.
    ///
    /// # Errors
    ///
    /// Rejected synchronously when any precondition fails; no record is
    /// created in that case.
    #[tracing::instrument(skip(self), fields(session = %session_id, caller = %caller_id))]
    pub async fn initiate_call(
        &self,
        session_id: SessionId,
        caller_id: UserId,
        receiver_id: UserId,
    ) -> Result<(CallRecord, SessionToken), StoreError> {
        let session = self
            .sessions
            .lookup(&session_id)
            .await
            .ok_or_else(|| StoreError::SessionNotFound(session_id.clone()))?;
        if session.status != SessionStatus::Accepted {
            return Err(StoreError::SessionNotAccepted(session_id));
        }
        for user in [&caller_id, &receiver_id] {
            if !session.is_participant(user) {
                return Err(StoreError::NotParticipant {
                    session: session_id,
                    user: user.clone(),
                });
            }
        }

        let mut calls = self.calls.write().await;
        if calls
            .values()
            .any(|c| c.session_id == session_id && c.status.is_active())
        {
            return Err(StoreError::ActiveCallExists(session_id));
        }

        let record = CallRecord::new(session_id.clone(), caller_id.clone(), receiver_id.clone());
        let token = self
            .signer
            .issue(&session_id, &caller_id, &receiver_id, self.config.token_ttl)?;
        calls.insert(record.id, record.clone());
        drop(calls);

        self.tokens
            .write()
            .await
            .insert(session_id.clone(), token.clone());

        tracing::info!(call = %record.id, "call record created");
        Ok((record, token))
    }

    /// Accept a ringing call; receiver only
    ///
    /// # Errors
    ///
    /// Returns error if the call is unknown, the user is not its receiver or
    /// it is not ringing.
    pub async fn accept_call(
        &self,
        call_id: CallId,
        user_id: &UserId,
    ) -> Result<CallRecord, StoreError> {
        let mut calls = self.calls.write().await;
        let record = calls
            .get_mut(&call_id)
            .ok_or(StoreError::CallNotFound(call_id))?;
        if &record.receiver_id != user_id {
            return Err(StoreError::NotReceiver {
                call: call_id,
                action: "accept",
            });
        }
        if record.status != CallStatus::Ringing {
            return Err(StoreError::InvalidStatus {
                call: call_id,
                status: record.status,
                expected: CallStatus::Ringing,
            });
        }
        record.status = CallStatus::Connecting;
        record.updated_at = Utc::now();
        tracing::info!(call = %call_id, "call accepted");
        Ok(record.clone())
    }

    /// Reject a ringing call; receiver only
    ///
    /// # Errors
    ///
    /// Returns error if the call is unknown, the user is not its receiver or
    /// it is not ringing.
    pub async fn reject_call(
        &self,
        call_id: CallId,
        user_id: &UserId,
    ) -> Result<CallRecord, StoreError> {
        let mut calls = self.calls.write().await;
        let record = calls
            .get_mut(&call_id)
            .ok_or(StoreError::CallNotFound(call_id))?;
        if &record.receiver_id != user_id {
            return Err(StoreError::NotReceiver {
                call: call_id,
                action: "reject",
            });
        }
        if record.status != CallStatus::Ringing {
            return Err(StoreError::InvalidStatus {
                call: call_id,
                status: record.status,
                expected: CallStatus::Ringing,
            });
        }
        let now = Utc::now();
        record.finish(CallStatus::Ended, Some("rejected by receiver".to_string()), now);
        record.updated_at = now;
        tracing::info!(call = %call_id, "call rejected");
        Ok(record.clone())
    }

    /// Merge a client-reported connection state into the record
    ///
    /// This is the authoritative state-merge function: connected/completed
    /// ICE states map to a connected call (`started_at` set once,
    /// idempotently), failed maps to a failed call with a reason, closed maps
    /// to ended unless already terminal. Duplicate or out-of-order reports
    /// never revive a terminal record.
    ///
    /// # Errors
    ///
    /// Returns error only for unknown calls.
    pub async fn update_call_state(
        &self,
        call_id: CallId,
        ice_state: Option<IceConnectionState>,
        connection_type: Option<ConnectionType>,
        turn_credentials_used: Option<bool>,
    ) -> Result<CallRecord, StoreError> {
        let mut calls = self.calls.write().await;
        let record = calls
            .get_mut(&call_id)
            .ok_or(StoreError::CallNotFound(call_id))?;
        let now = Utc::now();

        if let Some(connection_type) = connection_type {
            record.connection_type = connection_type;
        }
        if let Some(turn) = turn_credentials_used {
            record.turn_credentials_used = turn;
        }
        if let Some(state) = ice_state {
            record.ice_connection_state = Some(state);
            if !record.is_terminal() {
                match state {
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        record.status = CallStatus::Connected;
                        if record.started_at.is_none() {
                            record.started_at = Some(now);
                        }
                    }
                    IceConnectionState::Failed => {
                        record.finish(
                            CallStatus::Failed,
                            Some("ice connection failed".to_string()),
                            now,
                        );
                    }
                    IceConnectionState::Closed => {
                        record.finish(CallStatus::Ended, None, now);
                    }
                    IceConnectionState::New
                    | IceConnectionState::Checking
                    | IceConnectionState::Disconnected => {}
                }
            }
        }
        record.updated_at = now;
        tracing::debug!(call = %call_id, status = ?record.status, ice = ?record.ice_connection_state, "call state merged");
        Ok(record.clone())
    }

    /// Hang a call up; either participant
    ///
    /// Duration is derived from `started_at`, 0 if media never flowed.
    /// Ending an already-terminal call is a no-op, not an error.
    ///
    /// # Errors
    ///
    /// Returns error if the call is unknown or the user is not a participant.
    pub async fn end_call(
        &self,
        call_id: CallId,
        user_id: &UserId,
    ) -> Result<CallRecord, StoreError> {
        let mut calls = self.calls.write().await;
        let record = calls
            .get_mut(&call_id)
            .ok_or(StoreError::CallNotFound(call_id))?;
        if !record.is_participant(user_id) {
            return Err(StoreError::NotCallParticipant {
                call: call_id,
                user: user_id.clone(),
            });
        }
        if record.is_terminal() {
            return Ok(record.clone());
        }
        let now = Utc::now();
        record.finish(CallStatus::Ended, None, now);
        record.updated_at = now;
        tracing::info!(call = %call_id, duration_secs = record.duration_secs, "call ended");
        Ok(record.clone())
    }

    /// Record a failure detected before any ICE state existed
    /// (media acquisition, signaling connect)
    ///
    /// Idempotent: reporting against a terminal record changes nothing.
    ///
    /// # Errors
    ///
    /// Returns error only for unknown calls.
    pub async fn report_call_failure(
        &self,
        call_id: CallId,
        reason: String,
        ice_state: Option<IceConnectionState>,
    ) -> Result<CallRecord, StoreError> {
        let mut calls = self.calls.write().await;
        let record = calls
            .get_mut(&call_id)
            .ok_or(StoreError::CallNotFound(call_id))?;
        let now = Utc::now();
        if let Some(state) = ice_state {
            record.ice_connection_state = Some(state);
        }
        if !record.is_terminal() {
            record.finish(CallStatus::Failed, Some(reason), now);
        }
        record.updated_at = now;
        tracing::warn!(call = %call_id, reason = ?record.failure_reason, "call failure recorded");
        Ok(record.clone())
    }

    /// Overwrite the latest quality snapshot; no history is kept
    ///
    /// # Errors
    ///
    /// Returns error only for unknown calls.
    pub async fn update_call_quality(
        &self,
        call_id: CallId,
        metrics: QualityMetrics,
    ) -> Result<(), StoreError> {
        let mut calls = self.calls.write().await;
        let record = calls
            .get_mut(&call_id)
            .ok_or(StoreError::CallNotFound(call_id))?;
        record.quality = Some(metrics);
        record.updated_at = Utc::now();
        Ok(())
    }

    /// The unique ringing/connecting/connected record of a session, if any
    pub async fn get_active_call(&self, session_id: &SessionId) -> Option<CallRecord> {
        let calls = self.calls.read().await;
        calls
            .values()
            .find(|c| &c.session_id == session_id && c.status.is_active())
            .cloned()
    }

    /// Fetch one record by id
    pub async fn call(&self, call_id: CallId) -> Option<CallRecord> {
        self.calls.read().await.get(&call_id).cloned()
    }

    /// Every record of a session, oldest first
    pub async fn calls_for_session(&self, session_id: &SessionId) -> Vec<CallRecord> {
        let calls = self.calls.read().await;
        let mut records: Vec<_> = calls
            .values()
            .filter(|c| &c.session_id == session_id)
            .cloned()
            .collect();
        records.sort_by_key(|c| c.created_at);
        records
    }

    /// Force ringing/connecting calls older than the configured threshold to
    /// failed with reason "stale"
    ///
    /// Safe to run concurrently with live client updates: every transition
    /// it makes is terminal and last-write-wins is sufficient. Returns the
    /// number of records swept.
    pub async fn cleanup_stale_calls(&self) -> usize {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(self.config.stale_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let mut calls = self.calls.write().await;
        let mut swept = 0;
        for record in calls.values_mut() {
            if matches!(record.status, CallStatus::Ringing | CallStatus::Connecting)
                && record.created_at < cutoff
            {
                record.finish(CallStatus::Failed, Some("stale".to_string()), now);
                record.updated_at = now;
                swept += 1;
                tracing::warn!(call = %record.id, session = %record.session_id, "stale call swept");
            }
        }
        swept
    }

    /// Verify a signaling token for a joining user
    ///
    /// Checks the signature and expiry, then revocation and participant
    /// membership, and records the user in `used_by`. Returns the session the
    /// token authorizes.
    ///
    /// # Errors
    ///
    /// Returns a token error or a participant violation.
    pub async fn authorize_signaling(
        &self,
        token: &str,
        user_id: &UserId,
    ) -> Result<SessionId, StoreError> {
        let claims = self.signer.verify(token)?;
        if !claims.authorizes(user_id) {
            return Err(StoreError::NotParticipant {
                session: claims.session_id,
                user: user_id.clone(),
            });
        }

        let mut tokens = self.tokens.write().await;
        let stored = tokens
            .get_mut(&claims.session_id)
            .ok_or_else(|| TokenError::Unknown(claims.session_id.clone()))?;
        if stored.is_revoked {
            return Err(StoreError::Token(TokenError::Revoked));
        }
        if !stored.used_by.contains(user_id) {
            stored.used_by.push(user_id.clone());
        }
        Ok(claims.session_id)
    }

    /// The token currently issued for a session, if any
    pub async fn session_token(&self, session_id: &SessionId) -> Option<SessionToken> {
        self.tokens.read().await.get(session_id).cloned()
    }

    /// Revoke the token of a session before its expiry
    pub async fn revoke_token(&self, session_id: &SessionId) {
        if let Some(token) = self.tokens.write().await.get_mut(session_id) {
            token.is_revoked = true;
        }
    }
}
