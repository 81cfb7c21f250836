//! Signaling authorization tokens
//!
//! A token authorizes one user to join the signaling room of a specific call.
//! Tokens are MAC-signed with a keyed BLAKE3 hash so the relay can verify them
//! without a database round trip, and they expire independently of the call.

use crate::types::{SessionId, UserId};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Token errors
#[derive(Error, Debug)]
pub enum TokenError {
    /// Token string could not be parsed
    #[error("token is malformed")]
    Malformed,

    /// MAC did not match
    #[error("token signature mismatch")]
    BadSignature,

    /// Token lifetime is over
    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),

    /// Token was revoked server-side
    #[error("token has been revoked")]
    Revoked,

    /// No token was issued for this session
    #[error("no token issued for session {0}")]
    Unknown(SessionId),
}

/// Claims carried inside a signed token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Session the token authorizes
    pub session_id: SessionId,
    /// Calling participant
    pub caller_id: UserId,
    /// Receiving participant
    pub receiver_id: UserId,
    /// Expiry instant
    pub expires_at: DateTime<Utc>,
}

impl TokenClaims {
    /// Whether the given user is one of the two authorized participants
    pub fn authorizes(&self, user: &UserId) -> bool {
        &self.caller_id == user || &self.receiver_id == user
    }
}

/// A signaling token as persisted by the lifecycle store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToken {
    /// Session the token belongs to
    pub session_id: SessionId,
    /// The opaque signed token string handed to clients
    pub token: String,
    /// Issue instant
    pub issued_at: DateTime<Utc>,
    /// Expiry instant
    pub expires_at: DateTime<Utc>,
    /// Participants that have redeemed the token so far
    pub used_by: Vec<UserId>,
    /// Whether the token was revoked before expiry
    pub is_revoked: bool,
}

/// Signs and verifies session tokens with a keyed BLAKE3 MAC
pub struct TokenSigner {
    key: [u8; 32],
}

impl TokenSigner {
    /// Create a signer from an existing key
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Create a signer with a freshly generated random key
    ///
    /// Tokens signed by one signer cannot be verified by another, so a
    /// deployment must share the key across instances.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Issue a signed token for the two participants of a session
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Malformed` if the claims cannot be encoded.
    pub fn issue(
        &self,
        session_id: &SessionId,
        caller_id: &UserId,
        receiver_id: &UserId,
        ttl: Duration,
    ) -> Result<SessionToken, TokenError> {
        let issued_at = Utc::now();
        let expires_at = issued_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));

        let claims = TokenClaims {
            session_id: session_id.clone(),
            caller_id: caller_id.clone(),
            receiver_id: receiver_id.clone(),
            expires_at,
        };
        let payload = serde_json::to_vec(&claims).map_err(|_| TokenError::Malformed)?;
        let body = URL_SAFE_NO_PAD.encode(payload);
        let tag = blake3::keyed_hash(&self.key, body.as_bytes());
        let token = format!("{body}.{}", URL_SAFE_NO_PAD.encode(tag.as_bytes()));

        Ok(SessionToken {
            session_id: session_id.clone(),
            token,
            issued_at,
            expires_at,
            used_by: Vec::new(),
            is_revoked: false,
        })
    }

    /// Verify a token string and return its claims
    ///
    /// Checks the MAC first, then the expiry. Revocation is a store-side
    /// property and is checked by the lifecycle store, not here.
    ///
    /// # Errors
    ///
    /// Returns an error when the token is malformed, carries a bad signature
    /// or has expired.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let (body, tag) = token.split_once('.').ok_or(TokenError::Malformed)?;

        let given = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| TokenError::Malformed)?;
        let given: [u8; 32] = given.try_into().map_err(|_| TokenError::Malformed)?;
        // blake3::Hash comparison is constant-time
        if blake3::keyed_hash(&self.key, body.as_bytes()) != blake3::Hash::from(given) {
            return Err(TokenError::BadSignature);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| TokenError::Malformed)?;
        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;

        if claims.expires_at < Utc::now() {
            return Err(TokenError::Expired(claims.expires_at));
        }
        Ok(claims)
    }
}
