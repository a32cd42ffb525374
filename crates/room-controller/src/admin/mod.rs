//! Admin HTTP surface.
//!
//! Served on the admin listener next to the health probes:
//!
//! - `GET /health`, `GET /ready` - public
//! - `GET /metrics` - Prometheus text
//! - `GET /admin/v1/stats` - host and per-worker resource usage
//! - `GET /admin/v1/tenants` - rooms and peers per tenant
//! - `GET /admin/v1/rooms/:room_id` - full session dump of one room
//!
//! Everything but the health probes requires an admin bearer token.

pub mod auth;
pub mod handlers;

pub use auth::{require_admin, AdminAuthState, AdminClaims, ADMIN_ROLE};

use crate::actors::RoomRegistryHandle;
use crate::media::MediaPool;
use crate::observability::{health_router, HealthState};
use axum::{middleware, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Request timeout for admin routes.
const ADMIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// State shared by the admin handlers.
pub struct AdminState {
    pub rc_id: String,
    pub registry: RoomRegistryHandle,
    pub pool: Arc<MediaPool>,
}

/// Build the admin listener's router.
///
/// Layer order (bottom-to-top execution):
/// 1. `require_admin` - on admin and metrics routes only
/// 2. `TraceLayer` - Log request details
/// 3. `TimeoutLayer` - Timeout the request (outermost)
pub fn admin_router(
    state: Arc<AdminState>,
    auth: Arc<AdminAuthState>,
    health: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&auth),
            require_admin,
        ))
        .with_state(metrics_handle);

    let admin_routes = Router::new()
        .route("/admin/v1/stats", get(handlers::get_stats))
        .route("/admin/v1/tenants", get(handlers::list_tenants))
        .route("/admin/v1/rooms/:room_id", get(handlers::get_room))
        .route_layer(middleware::from_fn_with_state(auth, require_admin))
        .with_state(state);

    health_router(health)
        .merge(metrics_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(ADMIN_REQUEST_TIMEOUT))
}
