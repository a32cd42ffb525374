//! Liveness and readiness probes.
//!
//! - `GET /health` - 200 while the media workers are alive
//! - `GET /ready` - 200 only while new peers are being admitted
//!
//! Both answer with a small JSON body naming the current phase so an
//! operator can tell a draining instance from one that lost a worker.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Where the instance is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Worker pool or listeners not up yet.
    Starting,
    /// Admitting peers.
    Serving,
    /// Shutdown started; existing rooms are closing.
    Draining,
    /// A media worker died. The process is about to exit.
    WorkerLost,
}

impl Phase {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Serving,
            2 => Phase::Draining,
            3 => Phase::WorkerLost,
            _ => Phase::Starting,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Phase::Starting => 0,
            Phase::Serving => 1,
            Phase::Draining => 2,
            Phase::WorkerLost => 3,
        }
    }
}

/// Shared probe state, flipped by `main` as the instance starts and stops.
#[derive(Debug, Default)]
pub struct HealthState {
    phase: AtomicU8,
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn set_serving(&self) {
        self.set(Phase::Serving);
    }

    pub fn set_draining(&self) {
        // A lost worker outranks a drain that it triggered
        let _ = self.phase.compare_exchange(
            Phase::Serving.as_u8(),
            Phase::Draining.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.phase.compare_exchange(
            Phase::Starting.as_u8(),
            Phase::Draining.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn set_worker_lost(&self) {
        self.set(Phase::WorkerLost);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.phase() != Phase::WorkerLost
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Serving
    }

    fn set(&self, phase: Phase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }
}

#[derive(Debug, Serialize)]
struct ProbeBody {
    phase: Phase,
}

/// Router with `/health` and `/ready`. Mounted without authentication.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<ProbeBody>) {
    probe(state.is_live(), state.phase())
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<ProbeBody>) {
    probe(state.is_ready(), state.phase())
}

fn probe(ok: bool, phase: Phase) -> (StatusCode, Json<ProbeBody>) {
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ProbeBody { phase }))
}
