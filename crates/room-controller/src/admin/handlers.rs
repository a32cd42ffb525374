//! Admin API handlers.

use super::AdminState;
use crate::actors::{RoomSnapshot, RoomSummary};
use crate::errors::RcError;
use crate::media::WorkerStatus;
use crate::system_info::{gather_system_info, SystemInfo};
use axum::extract::{Path, State};
use axum::Json;
use common::types::RoomId;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

/// Response of `GET /admin/v1/stats`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub instance_id: String,
    pub system: SystemInfo,
    pub workers: Vec<WorkerStatus>,
}

/// One row of `GET /admin/v1/tenants`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantUsage {
    pub tenant: String,
    pub rooms: usize,
    pub peers: usize,
}

/// Host and per-worker resource usage.
#[instrument(skip_all, name = "rc.admin.stats")]
pub async fn get_stats(
    State(state): State<Arc<AdminState>>,
) -> Result<Json<StatsResponse>, RcError> {
    let system = tokio::task::spawn_blocking(gather_system_info)
        .await
        .map_err(|e| RcError::Internal(format!("system info task failed: {e}")))?;
    let pool = state.pool.status().await;

    Ok(Json(StatsResponse {
        instance_id: state.rc_id.clone(),
        system,
        workers: pool.workers,
    }))
}

/// Rooms and peers grouped by tenant.
#[instrument(skip_all, name = "rc.admin.tenants")]
pub async fn list_tenants(
    State(state): State<Arc<AdminState>>,
) -> Result<Json<Vec<TenantUsage>>, RcError> {
    let rooms = state.registry.list_rooms().await?;
    Ok(Json(aggregate_tenants(&rooms)))
}

/// Session dump of one room.
#[instrument(skip_all, name = "rc.admin.room")]
pub async fn get_room(
    State(state): State<Arc<AdminState>>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomSnapshot>, RcError> {
    let snapshot = state.registry.get_room(RoomId::new(room_id)).await?;
    Ok(Json(snapshot))
}

/// Prometheus text exposition.
pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

/// Sorted by tenant name.
pub fn aggregate_tenants(rooms: &[RoomSummary]) -> Vec<TenantUsage> {
    let mut tenants: BTreeMap<&str, TenantUsage> = BTreeMap::new();
    for room in rooms {
        let tenant = room.room_id.tenant();
        let usage = tenants.entry(tenant).or_insert_with(|| TenantUsage {
            tenant: tenant.to_string(),
            rooms: 0,
            peers: 0,
        });
        usage.rooms += 1;
        usage.peers += room.peers;
    }
    tenants.into_values().collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn room(id: &str, peers: usize) -> RoomSummary {
        RoomSummary {
            room_id: RoomId::new(id),
            peers,
        }
    }

    #[test]
    fn test_tenants_grouped_by_prefix() {
        let usage = aggregate_tenants(&[
            room("globex:ops", 2),
            room("acme:standup", 3),
            room("acme:retro", 1),
            room("lobby", 4),
        ]);
        assert_eq!(
            usage,
            vec![
                TenantUsage {
                    tenant: "acme".to_string(),
                    rooms: 2,
                    peers: 4
                },
                TenantUsage {
                    tenant: "default".to_string(),
                    rooms: 1,
                    peers: 4
                },
                TenantUsage {
                    tenant: "globex".to_string(),
                    rooms: 1,
                    peers: 2
                },
            ]
        );
    }

    #[test]
    fn test_no_rooms_no_tenants() {
        assert!(aggregate_tenants(&[]).is_empty());
    }
}
