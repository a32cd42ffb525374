//! Observability for the Room Controller.
//!
//! # Privacy by Default
//!
//! Actor loops use `#[instrument(skip_all)]` with explicit fields. Room ids,
//! peer ids and producer ids appear in logs but never as metric labels.
//! Metric labels are bounded:
//! - `actor_type`: 3 values (registry, room, connection)
//! - `action`: bounded by signaling request actions (~12 values)
//! - `outcome`: 2-4 values per metric
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `rc_rooms_active` | Gauge | none | Rooms currently open |
//! | `rc_peers_active` | Gauge | none | Peers across all rooms |
//! | `rc_rooms_created_total` | Counter | none | Rooms created since start |
//! | `rc_peer_joins_total` | Counter | `outcome` | Join attempts |
//! | `rc_producers_active` | Gauge | none | Live producers |
//! | `rc_consumers_active` | Gauge | none | Live consumers |
//! | `rc_broadcast_dropped_total` | Counter | none | Broadcasts dropped on full outbound queues |
//! | `rc_signaling_requests_total` | Counter | `action`, `outcome` | Signaling request results |
//! | `rc_signaling_latency_seconds` | Histogram | `action` | Request handling latency |
//! | `rc_dominant_speaker_changes_total` | Counter | none | Speaker change events |
//! | `rc_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `rc_actor_panics_total` | Counter | `actor_type` | Panicked actor tasks |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState, Phase};
pub use metrics::init_metrics_recorder;
