//! Call service orchestration
//!
//! Glue between the peer-connection manager and the lifecycle store: a
//! manager's event stream is reconciled into the store per call, the stale
//! sweep runs on its own interval independent of client liveness, and
//! degraded quality samples are flagged without touching call status.

use crate::store::{CallLifecycleStore, SessionDirectory, StoreConfig, StoreError};
use crate::token::{SessionToken, TokenSigner};
use crate::types::{CallId, ConnectionEvent, SessionId, UserId};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// A store precondition failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How often the stale-call sweep runs
    pub sweep_interval: Duration,
    /// Store configuration
    pub store: StoreConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            store: StoreConfig::default(),
        }
    }
}

/// Owns the lifecycle store and its background reconciliation
pub struct CallService {
    store: Arc<CallLifecycleStore>,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CallService {
    /// Create a service builder over the given session directory
    pub fn builder(sessions: Arc<dyn SessionDirectory>) -> CallServiceBuilder {
        CallServiceBuilder::new(sessions)
    }

    /// The underlying lifecycle store
    pub fn store(&self) -> &Arc<CallLifecycleStore> {
        &self.store
    }

    /// Start the periodic stale-call sweep
    ///
    /// The sweep enforces the server-side timeout for clients that vanish
    /// without signaling teardown; it keeps running until `stop()`.
    pub async fn start(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }
        let store = Arc::clone(&self.store);
        let period = self.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let swept = store.cleanup_stale_calls().await;
                if swept > 0 {
                    tracing::info!(swept, "stale calls swept");
                }
            }
        }));
        tracing::info!(period_secs = period.as_secs(), "stale-call sweep started");
    }

    /// Stop the sweep task
    pub async fn stop(&self) {
        if let Some(task) = self.sweeper.lock().await.take() {
            task.abort();
        }
    }

    /// Place a call on a session
    ///
    /// # Errors
    ///
    /// Returns error when a store precondition fails.
    pub async fn place_call(
        &self,
        session_id: SessionId,
        caller_id: UserId,
        receiver_id: UserId,
    ) -> Result<(crate::store::CallRecord, SessionToken), ServiceError> {
        Ok(self
            .store
            .initiate_call(session_id, caller_id, receiver_id)
            .await?)
    }

    /// Pipe a manager's events into the store for one call
    ///
    /// Link-state reports merge through `update_call_state`, quality samples
    /// overwrite the snapshot (degraded samples are logged, call status is
    /// untouched), and fatal errors land as `report_call_failure`. The task
    /// ends when the manager drops its event channel.
    pub fn attach(
        &self,
        call_id: CallId,
        mut events: broadcast::Receiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => reconcile(&store, call_id, event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(call = %call_id, skipped, "connection events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

async fn reconcile(store: &CallLifecycleStore, call_id: CallId, event: ConnectionEvent) {
    match event {
        // the local phase never touches the persisted record
        ConnectionEvent::PhaseChanged { .. } => {}
        ConnectionEvent::LinkStateChanged {
            ice_state,
            connection_type,
            turn_credentials_used,
        } => {
            if let Err(e) = store
                .update_call_state(
                    call_id,
                    Some(ice_state),
                    Some(connection_type),
                    Some(turn_credentials_used),
                )
                .await
            {
                tracing::debug!(call = %call_id, error = %e, "link state not merged");
            }
        }
        ConnectionEvent::QualitySampled { metrics } => {
            if metrics.is_degraded() {
                tracing::warn!(
                    call = %call_id,
                    bitrate_kbps = metrics.bitrate_kbps,
                    packet_loss_pct = metrics.packet_loss_pct,
                    "call quality degraded"
                );
            }
            if let Err(e) = store.update_call_quality(call_id, metrics).await {
                tracing::debug!(call = %call_id, error = %e, "quality sample not stored");
            }
        }
        ConnectionEvent::Fatal { reason } => {
            if let Err(e) = store.report_call_failure(call_id, reason, None).await {
                tracing::debug!(call = %call_id, error = %e, "failure not recorded");
            }
        }
    }
}

/// Builder for `CallService`
pub struct CallServiceBuilder {
    sessions: Arc<dyn SessionDirectory>,
    signer: Option<TokenSigner>,
    config: ServiceConfig,
}

impl CallServiceBuilder {
    /// Create a builder over the given session directory
    pub fn new(sessions: Arc<dyn SessionDirectory>) -> Self {
        Self {
            sessions,
            signer: None,
            config: ServiceConfig::default(),
        }
    }

    /// Use a specific token signing key
    pub fn with_signer(mut self, signer: TokenSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Override the configuration
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the service
    pub fn build(self) -> CallService {
        let signer = self.signer.unwrap_or_else(TokenSigner::generate);
        let store = Arc::new(CallLifecycleStore::new(
            self.sessions,
            signer,
            self.config.store.clone(),
        ));
        CallService {
            store,
            sweep_interval: self.config.sweep_interval,
            sweeper: Mutex::new(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{InMemorySessions, SessionInfo, SessionStatus};
    use crate::types::CallStatus;

    async fn accepted_session(sessions: &InMemorySessions) -> (SessionId, UserId, UserId) {
        let session_id = SessionId::new("sess-1");
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        sessions
            .insert(SessionInfo {
                id: session_id.clone(),
                participants: [alice.clone(), bob.clone()],
                status: SessionStatus::Accepted,
            })
            .await;
        (session_id, alice, bob)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_fails_stale_ringing_calls() {
        let sessions = Arc::new(InMemorySessions::new());
        let (session_id, alice, bob) = accepted_session(&sessions).await;

        let service = CallService::builder(sessions)
            .with_config(ServiceConfig {
                sweep_interval: Duration::from_secs(60),
                store: StoreConfig {
                    stale_after: Duration::ZERO,
                    ..StoreConfig::default()
                },
            })
            .build();

        let (record, _token) = service
            .place_call(session_id.clone(), alice, bob)
            .await
            .unwrap();
        service.start().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let record = service.store().call(record.id).await.unwrap();
        assert_eq!(record.status, CallStatus::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some("stale"));

        service.stop().await;
    }

    #[tokio::test]
    async fn test_attach_records_fatal_failures() {
        let sessions = Arc::new(InMemorySessions::new());
        let (session_id, alice, bob) = accepted_session(&sessions).await;
        let service = CallService::builder(sessions).build();

        let (record, _token) = service.place_call(session_id, alice, bob).await.unwrap();

        let (tx, rx) = broadcast::channel(8);
        let task = service.attach(record.id, rx);
        tx.send(ConnectionEvent::Fatal {
            reason: "media acquisition failed: camera busy".to_string(),
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let record = service.store().call(record.id).await.unwrap();
        assert_eq!(record.status, CallStatus::Failed);
        assert!(record
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("camera busy"));
    }
}
