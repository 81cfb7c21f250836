//! Tandem CLI - drive the call stack from a terminal
//!
//! The `demo` command runs a complete loopback call inside one process: a
//! server-of-record with an accepted session, a two-slot signaling room and
//! two peer-connection managers negotiating over real WebRTC transports.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tandem_call_core::prelude::*;
use tokio::time::Instant;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log filter, e.g. "tandem=debug"
    #[arg(long, env = "TANDEM_LOG", default_value = "tandem=info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local loopback call through the full stack
    Demo {
        /// Negotiate audio only
        #[arg(long)]
        audio_only: bool,

        /// Give up after this many seconds
        #[arg(long, default_value = "20")]
        timeout: u64,
    },

    /// Issue a signaling token and print its claims
    Token {
        /// Session to issue the token for
        #[arg(default_value = "sess-demo")]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log.clone())
        .init();

    match cli.command {
        Commands::Demo {
            audio_only,
            timeout,
        } => run_demo(audio_only, Duration::from_secs(timeout)).await,
        Commands::Token { session } => issue_token(&session),
    }
}

async fn run_demo(audio_only: bool, timeout: Duration) -> Result<()> {
    let session_id = SessionId::new(format!("sess-{:04x}", rand::random::<u16>()));
    let alice = UserId::new("alice");
    let bob = UserId::new("bob");

    // Server-of-record with one accepted session
    let sessions = Arc::new(InMemorySessions::new());
    sessions
        .insert(SessionInfo {
            id: session_id.clone(),
            participants: [alice.clone(), bob.clone()],
            status: SessionStatus::Accepted,
        })
        .await;
    let service = CallService::builder(sessions).build();
    service.start().await;

    let (record, token) = service
        .place_call(session_id.clone(), alice.clone(), bob.clone())
        .await?;
    println!("📞 call {} ringing on session {}", record.id, session_id);

    service.store().accept_call(record.id, &bob).await?;
    for user in [&alice, &bob] {
        service.store().authorize_signaling(&token.token, user).await?;
    }

    // Both participants share one in-process signaling room
    let room = Arc::new(SignalingRoom::new(session_id.clone()));
    let factory = Arc::new(WebRtcTransportFactory::default());
    let media = Arc::new(SyntheticMediaSource::default());
    let config = ConnectionConfig {
        constraints: if audio_only {
            MediaConstraints::audio_only()
        } else {
            MediaConstraints::video_call()
        },
        ..ConnectionConfig::default()
    };

    let caller = PeerConnectionManager::new(
        CallRole::Initiator,
        config.clone(),
        media.clone(),
        room.clone(),
        factory.clone(),
    );
    let callee = PeerConnectionManager::new(
        CallRole::Receiver,
        config,
        media,
        room.clone(),
        factory,
    );
    let _caller_reconciler = service.attach(record.id, caller.subscribe());
    let _callee_reconciler = service.attach(record.id, callee.subscribe());

    caller
        .start(signaling_params(&session_id, &alice, &token.token))
        .await?;
    callee
        .start(signaling_params(&session_id, &bob, &token.token))
        .await?;
    println!("🔗 negotiating...");

    let deadline = Instant::now() + timeout;
    loop {
        let phases = (caller.phase().await, callee.phase().await);
        if phases == (ConnectionPhase::Connected, ConnectionPhase::Connected) {
            break;
        }
        if matches!(phases.0, ConnectionPhase::Disconnected)
            || matches!(phases.1, ConnectionPhase::Disconnected)
        {
            report(&service, record.id).await;
            bail!("a peer disconnected before the call came up");
        }
        if Instant::now() > deadline {
            report(&service, record.id).await;
            bail!("negotiation did not complete within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    println!("✅ both peers connected");

    // let a couple of quality samples land before hanging up
    tokio::time::sleep(Duration::from_secs(3)).await;

    caller.stop().await;
    callee.stop().await;
    service.store().end_call(record.id, &alice).await?;
    report(&service, record.id).await;
    service.stop().await;

    println!("📞 call ended");
    Ok(())
}

async fn report(service: &CallService, call_id: CallId) {
    if let Some(record) = service.store().call(call_id).await {
        println!(
            "   status: {:?} | ice: {:?} | path: {:?} | duration: {}s",
            record.status, record.ice_connection_state, record.connection_type, record.duration_secs
        );
        if let Some(quality) = record.quality {
            println!(
                "   quality: {} kbps, {:.1}% loss, {} ms rtt",
                quality.bitrate_kbps, quality.packet_loss_pct, quality.latency_ms
            );
        }
        if let Some(reason) = record.failure_reason {
            println!("   reason: {reason}");
        }
    }
}

fn signaling_params(session_id: &SessionId, user_id: &UserId, token: &str) -> SignalingParams {
    SignalingParams {
        url: "memory://local".to_string(),
        session_id: session_id.clone(),
        user_id: user_id.clone(),
        token: token.to_string(),
    }
}

fn issue_token(session: &str) -> Result<()> {
    let signer = TokenSigner::generate();
    let token = signer.issue(
        &SessionId::new(session),
        &UserId::new("alice"),
        &UserId::new("bob"),
        Duration::from_secs(24 * 60 * 60),
    )?;
    let claims = signer.verify(&token.token)?;

    println!("token: {}", token.token);
    println!("claims: {}", serde_json::to_string_pretty(&claims)?);
    Ok(())
}
