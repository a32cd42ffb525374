//! Room Controller
//!
//! WebSocket signaling server orchestrating multi-party SFU rooms.
//!
//! # Servers
//!
//! - WebSocket signaling endpoint (default: 0.0.0.0:3000), `?roomId=<id>`
//! - HTTP server for health, metrics and the admin API (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Start the media worker pool
//! 4. Initialize actor system (`RoomRegistryHandle`)
//! 5. Start admin HTTP server (health, metrics, admin API)
//! 6. Start signaling server
//! 7. Wait for shutdown signal or media worker death

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use room_controller::actors::{ActorMetrics, RoomRegistryHandle, RoomSettings};
use room_controller::admin::{admin_router, AdminAuthState, AdminState};
use room_controller::config::Config;
use room_controller::media::codecs::default_router_codecs;
use room_controller::media::loopback::LoopbackEngine;
use room_controller::media::{MediaPool, TransportSettings, WorkerSettings};
use room_controller::observability::{init_metrics_recorder, HealthState};
use room_controller::signaling::{signaling_router, SignalingState};
use room_controller::speaker::SpeakerSettings;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initial outgoing bitrate estimate for new transports.
const INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;

/// Time given to connection actors to flush before the pool closes.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration first: it decides the log format
    let config = Config::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "room_controller=debug,tower_http=debug".into());
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Room Controller");
    info!(
        rc_id = %config.rc_id,
        signaling_bind_address = %config.signaling_bind_address,
        admin_bind_address = %config.admin_bind_address,
        num_workers = config.num_workers,
        max_peers_per_room = config.max_peers_per_room,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Media worker pool. Any worker dying cancels `fatal_token`.
    info!(workers = config.num_workers, "Starting media worker pool...");
    let fatal_token = CancellationToken::new();
    let engine = LoopbackEngine::new();
    let pool = MediaPool::create(
        &engine,
        config.num_workers,
        &WorkerSettings {
            rtc_min_port: config.rtc_min_port,
            rtc_max_port: config.rtc_max_port,
        },
        default_router_codecs(),
        fatal_token.clone(),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to start media worker pool");
        e
    })?;
    info!(workers = pool.size(), "Media worker pool started");

    // Actor system
    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryHandle::new(
        config.rc_id.clone(),
        Arc::clone(&pool),
        room_settings(&config),
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    // Cancelled when the registry shuts down
    let shutdown_token = registry.child_token();

    // Admin server (health, metrics, admin API). Bind before spawning to
    // fail fast on bind errors.
    let admin_addr: SocketAddr = config.admin_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.admin_bind_address, "Invalid admin bind address");
        format!("Invalid admin bind address: {e}")
    })?;
    let admin_app = admin_router(
        Arc::new(AdminState {
            rc_id: config.rc_id.clone(),
            registry: registry.clone(),
            pool: Arc::clone(&pool),
        }),
        Arc::new(AdminAuthState::new(&config.admin_jwt_secret)),
        Arc::clone(&health_state),
        prometheus_handle,
    );
    let admin_listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %admin_addr, "Failed to bind admin server");
            format!("Failed to bind admin server to {admin_addr}: {e}")
        })?;

    let admin_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %admin_addr, "Admin server starting");
        let server = axum::serve(admin_listener, admin_app).with_graceful_shutdown(async move {
            admin_shutdown_token.cancelled().await;
            info!("Admin server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Admin server failed");
        }
    });

    // Signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;
    let signaling_app = signaling_router(SignalingState {
        registry: registry.clone(),
        metrics: Arc::clone(&actor_metrics),
        cancel_token: shutdown_token.child_token(),
    });
    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_serving();
    info!("Room Controller running - press Ctrl+C to shutdown");

    let worker_died = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
            false
        }
        () = fatal_token.cancelled() => {
            error!("Media worker died, shutting down");
            health_state.set_worker_lost();
            true
        }
    };

    // Load balancers stop sending peers here from now on
    health_state.set_draining();

    // Closes every room, which disconnects every peer
    if let Err(e) = registry.shutdown().await {
        warn!(error = %e, "Actor system shutdown error");
    }
    tokio::time::sleep(DRAIN_GRACE).await;

    pool.close().await;

    if worker_died {
        return Err("media worker died".into());
    }

    info!("Room Controller shutdown complete");
    Ok(())
}

fn room_settings(config: &Config) -> RoomSettings {
    RoomSettings {
        max_peers: config.max_peers_per_room,
        speaker: SpeakerSettings {
            interval: config.speaker_interval,
            threshold_dbov: config.speaker_threshold_dbov,
        },
        transport: TransportSettings {
            listen_ip: config.listen_ip,
            announced_ip: config.announced_ip.clone(),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: INITIAL_OUTGOING_BITRATE,
        },
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
