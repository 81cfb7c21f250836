//! Recovery and timer tests under a paused clock: exponential backoff, the
//! single-outstanding-timer guarantee, restart-after-recheck, attempt
//! exhaustion and quality sampling.

mod support;

use std::sync::Arc;
use std::time::Duration;
use support::{candidate, count_offers, drain_events, params, settle, MockFactory};
use tandem_call_core::connection::{ConnectionConfig, PeerConnectionManager};
use tandem_call_core::media::SyntheticMediaSource;
use tandem_call_core::signaling::{SignalPayload, SignalingConnection, SignalingRoom};
use tandem_call_core::transport::TransportSample;
use tandem_call_core::types::{
    CallRole, ConnectionEvent, ConnectionPhase, IceConnectionState, SessionId, UserId,
};

async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}

/// Bring an initiator to `Connected` against a raw room participant
async fn connected_call(
    max_reconnect_attempts: u32,
) -> (
    PeerConnectionManager,
    Arc<MockFactory>,
    SignalingConnection,
    Arc<SignalingRoom>,
) {
    let session = SessionId::new("sess-1");
    let room = Arc::new(SignalingRoom::new(session.clone()));
    let factory = MockFactory::new("caller");
    let caller = PeerConnectionManager::new(
        CallRole::Initiator,
        ConnectionConfig {
            max_reconnect_attempts,
            ..ConnectionConfig::default()
        },
        Arc::new(SyntheticMediaSource::default()),
        room.clone(),
        factory.clone(),
    );

    caller.start(params(&session, "alice")).await.unwrap();
    let mut remote = room.join(UserId::new("bob")).unwrap();
    settle().await;
    assert_eq!(count_offers(&drain_events(&mut remote.events)), 1);

    remote
        .sender
        .send(SignalPayload::Answer {
            sdp: "answer-sdp-remote".to_string(),
        })
        .await
        .unwrap();
    settle().await;

    factory.transport().push_ice(IceConnectionState::Connected);
    settle().await;
    assert_eq!(caller.phase().await, ConnectionPhase::Connected);
    drain_events(&mut remote.events);

    (caller, factory, remote, room)
}

#[tokio::test(start_paused = true)]
async fn ice_failure_schedules_a_two_second_restart() {
    let (caller, factory, mut remote, _room) = connected_call(5).await;

    factory.transport().push_ice(IceConnectionState::Failed);
    settle().await;
    assert_eq!(caller.reconnect_attempts().await, 1);
    assert_eq!(caller.phase().await, ConnectionPhase::Reconnecting);
    assert_eq!(count_offers(&drain_events(&mut remote.events)), 0);

    // one second in, the timer has not fired
    advance(Duration::from_secs(1)).await;
    assert_eq!(count_offers(&drain_events(&mut remote.events)), 0);

    // past two seconds the ICE-restart offer goes out
    advance(Duration::from_millis(1010)).await;
    assert_eq!(factory.transport().offers(), vec![false, true]);
    assert_eq!(count_offers(&drain_events(&mut remote.events)), 1);

    // recovery resets the attempt counter
    factory.transport().push_ice(IceConnectionState::Connected);
    settle().await;
    assert_eq!(caller.reconnect_attempts().await, 0);
    assert_eq!(caller.phase().await, ConnectionPhase::Connected);

    caller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn attempt_counter_resets_so_backoff_starts_over() {
    let (caller, factory, mut remote, _room) = connected_call(5).await;

    factory.transport().push_ice(IceConnectionState::Failed);
    advance(Duration::from_millis(2010)).await;
    assert_eq!(factory.transport().offers().len(), 2);

    factory.transport().push_ice(IceConnectionState::Connected);
    settle().await;
    assert_eq!(caller.reconnect_attempts().await, 0);
    drain_events(&mut remote.events);

    // a fresh failure backs off two seconds again, not four
    factory.transport().push_ice(IceConnectionState::Failed);
    settle().await;
    assert_eq!(caller.reconnect_attempts().await, 1);
    advance(Duration::from_millis(1990)).await;
    assert_eq!(factory.transport().offers().len(), 2);
    advance(Duration::from_millis(30)).await;
    assert_eq!(factory.transport().offers().len(), 3);
    assert!(factory.transport().offers()[2]);

    caller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_failure_reports_arm_a_single_timer() {
    let (caller, factory, mut remote, _room) = connected_call(5).await;

    factory.transport().push_ice(IceConnectionState::Failed);
    factory.transport().push_ice(IceConnectionState::Failed);
    factory.transport().push_link(tandem_call_core::transport::LinkState::Failed);
    settle().await;

    // three reports, one timer, one attempt
    assert_eq!(caller.reconnect_attempts().await, 1);

    advance(Duration::from_millis(2010)).await;
    assert_eq!(factory.transport().offers(), vec![false, true]);
    assert_eq!(count_offers(&drain_events(&mut remote.events)), 1);

    caller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn restart_is_skipped_when_the_link_self_recovered() {
    let (caller, factory, mut remote, _room) = connected_call(5).await;

    factory.transport().push_ice(IceConnectionState::Failed);
    settle().await;
    assert_eq!(caller.reconnect_attempts().await, 1);

    // ICE recovers on its own before the timer fires
    factory.transport().set_ice_state(IceConnectionState::Connected);
    advance(Duration::from_millis(2010)).await;

    assert_eq!(factory.transport().offers(), vec![false]);
    assert_eq!(count_offers(&drain_events(&mut remote.events)), 0);

    caller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_disconnect_permanently() {
    let (caller, factory, mut remote, _room) = connected_call(2).await;
    let mut events = caller.subscribe();

    // attempt 1: fail, wait 2s, restart
    factory.transport().push_ice(IceConnectionState::Failed);
    advance(Duration::from_millis(2010)).await;
    assert_eq!(factory.transport().offers().len(), 2);

    // attempt 2: fail, wait 4s, restart
    factory.transport().push_ice(IceConnectionState::Failed);
    advance(Duration::from_millis(4010)).await;
    assert_eq!(factory.transport().offers().len(), 3);

    // a third failure exceeds the limit
    factory.transport().push_ice(IceConnectionState::Failed);
    settle().await;

    assert_eq!(caller.phase().await, ConnectionPhase::Disconnected);
    assert!(factory.transport().is_closed());

    let mut saw_exhausted = false;
    while let Ok(event) = events.try_recv() {
        if let ConnectionEvent::Fatal { reason } = event {
            assert!(reason.contains("exhausted"));
            saw_exhausted = true;
        }
    }
    assert!(saw_exhausted);

    // nothing fires ever again
    factory.transport().push_ice(IceConnectionState::Failed);
    advance(Duration::from_secs(128)).await;
    assert_eq!(factory.transport().offers().len(), 3);
    assert_eq!(caller.phase().await, ConnectionPhase::Disconnected);
    assert_eq!(count_offers(&drain_events(&mut remote.events)), 0);
}

#[tokio::test(start_paused = true)]
async fn quality_samples_flow_while_connected() {
    let (caller, factory, _remote, _room) = connected_call(5).await;
    let mut events = caller.subscribe();

    factory.transport().set_sample(TransportSample {
        bytes_received: 125_000,
        packets_received: 90,
        packets_lost: 10,
        round_trip_ms: 48,
    });

    advance(Duration::from_secs(5)).await;

    let mut sampled = None;
    while let Ok(event) = events.try_recv() {
        if let ConnectionEvent::QualitySampled { metrics } = event {
            sampled = Some(metrics);
        }
    }
    let metrics = sampled.expect("expected a quality sample");

    // 125 kB over the 5 connected seconds: a 200 kbps lifetime average
    assert_eq!(metrics.bitrate_kbps, 200);
    assert!((metrics.packet_loss_pct - 10.0).abs() < f32::EPSILON);
    assert_eq!(metrics.latency_ms, 48);
    assert_eq!((metrics.frame_width, metrics.frame_height), (1280, 720));

    caller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn sampling_is_skipped_not_errored_when_not_connected() {
    let session = SessionId::new("sess-1");
    let room = Arc::new(SignalingRoom::new(session.clone()));
    let factory = MockFactory::new("caller");
    let caller = PeerConnectionManager::new(
        CallRole::Initiator,
        ConnectionConfig::default(),
        Arc::new(SyntheticMediaSource::default()),
        room.clone(),
        factory.clone(),
    );
    caller.start(params(&session, "alice")).await.unwrap();
    let mut events = caller.subscribe();

    factory.transport().set_sample(TransportSample {
        bytes_received: 10_000,
        packets_received: 10,
        packets_lost: 0,
        round_trip_ms: 20,
    });

    advance(Duration::from_secs(30)).await;

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ConnectionEvent::QualitySampled { .. }));
    }
    assert_eq!(caller.phase().await, ConnectionPhase::Ready);

    caller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn watchdog_observes_queued_candidates_without_acting() {
    let session = SessionId::new("sess-1");
    let room = Arc::new(SignalingRoom::new(session.clone()));
    let factory = MockFactory::new("callee");
    let callee = PeerConnectionManager::new(
        CallRole::Receiver,
        ConnectionConfig::default(),
        Arc::new(SyntheticMediaSource::default()),
        room.clone(),
        factory.clone(),
    );
    callee.start(params(&session, "bob")).await.unwrap();
    let remote = room.join(UserId::new("alice")).unwrap();

    remote
        .sender
        .send(SignalPayload::Candidate {
            candidate: candidate("cand-early"),
        })
        .await
        .unwrap();
    settle().await;

    // the watchdog fires (log only); the queue must be untouched
    advance(Duration::from_secs(11)).await;
    assert!(factory.transport().applied_candidates().is_empty());

    // a very late offer still flushes the queue in order
    remote
        .sender
        .send(SignalPayload::Offer {
            sdp: "offer-sdp-remote".to_string(),
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(factory.transport().applied_candidates(), vec!["cand-early"]);

    callee.stop().await;
}
