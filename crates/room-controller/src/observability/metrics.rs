//! Metrics definitions for the Room Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `rc_` prefix for Room Controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels never carry room, peer or producer ids. Every label value comes
//! from a closed set in code.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling latency buckets - includes media engine round trips
        .set_buckets_for_metric(
            Matcher::Prefix("rc_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Peer Metrics (Gauges)
// ============================================================================

/// Metric: `rc_rooms_active`
pub fn set_rooms_active(count: usize) {
    // usize to f64 conversion is safe for realistic room counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_rooms_active").set(count as f64);
}

/// Metric: `rc_peers_active`
///
/// Adjusted by each room actor as peers join and leave.
pub fn adjust_peers_active(delta: f64) {
    gauge!("rc_peers_active").increment(delta);
}

/// Metric: `rc_producers_active`
pub fn adjust_producers_active(delta: f64) {
    gauge!("rc_producers_active").increment(delta);
}

/// Metric: `rc_consumers_active`
pub fn adjust_consumers_active(delta: f64) {
    gauge!("rc_consumers_active").increment(delta);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `rc_actor_mailbox_depth`
/// Labels: `actor_type` (registry, room, connection)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// Metric: `rc_rooms_created_total`
pub fn record_room_created() {
    counter!("rc_rooms_created_total").increment(1);
}

/// Record a join attempt.
///
/// Metric: `rc_peer_joins_total`
/// Labels: `outcome` (accepted, room_full, creation_failed, draining)
pub fn record_peer_join(outcome: &str) {
    counter!("rc_peer_joins_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a broadcast dropped because the recipient's outbound queue was full.
///
/// Metric: `rc_broadcast_dropped_total`
pub fn record_broadcast_dropped() {
    counter!("rc_broadcast_dropped_total").increment(1);
}

/// Record a handled signaling request.
///
/// Metric: `rc_signaling_requests_total`, `rc_signaling_latency_seconds`
/// Labels: `action`, `outcome` (success, error)
pub fn record_signaling_request(action: &str, outcome: &str, duration: Duration) {
    counter!("rc_signaling_requests_total",
        "action" => action.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("rc_signaling_latency_seconds", "action" => action.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `rc_dominant_speaker_changes_total`
pub fn record_dominant_speaker_change() {
    counter!("rc_dominant_speaker_changes_total").increment(1);
}

/// Record an actor panic event.
///
/// Metric: `rc_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("rc_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_recording_without_recorder_is_noop() {
        set_rooms_active(3);
        adjust_peers_active(1.0);
        adjust_peers_active(-1.0);
        record_peer_join("accepted");
        record_signaling_request("produce", "success", Duration::from_millis(3));
    }

    #[test]
    fn test_metrics_recorded_with_expected_names() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_rooms_active(2);
            adjust_peers_active(3.0);
            adjust_producers_active(2.0);
            adjust_consumers_active(1.0);
            set_actor_mailbox_depth("room", 4);
            record_room_created();
            record_peer_join("accepted");
            record_peer_join("room_full");
            record_broadcast_dropped();
            record_signaling_request("consume", "error", Duration::from_millis(1));
            record_dominant_speaker_change();
            record_actor_panic("connection");
        });

        let names: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "rc_rooms_active",
            "rc_peers_active",
            "rc_producers_active",
            "rc_consumers_active",
            "rc_actor_mailbox_depth",
            "rc_rooms_created_total",
            "rc_peer_joins_total",
            "rc_broadcast_dropped_total",
            "rc_signaling_requests_total",
            "rc_signaling_latency_seconds",
            "rc_dominant_speaker_changes_total",
            "rc_actor_panics_total",
        ] {
            assert!(
                names.iter().any(|n| n == expected),
                "missing metric {expected}, got {names:?}"
            );
        }
    }

    #[test]
    fn test_join_outcomes_are_separate_series() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_peer_join("accepted");
            record_peer_join("accepted");
            record_peer_join("room_full");
        });

        let mut accepted = 0;
        let mut full = 0;
        for (key, _, _, value) in snapshotter.snapshot().into_vec() {
            if key.key().name() != "rc_peer_joins_total" {
                continue;
            }
            let outcome = key
                .key()
                .labels()
                .find(|l| l.key() == "outcome")
                .map(|l| l.value().to_string())
                .unwrap();
            let DebugValue::Counter(count) = value else {
                panic!("expected counter");
            };
            match outcome.as_str() {
                "accepted" => accepted = count,
                "room_full" => full = count,
                other => panic!("unexpected outcome {other}"),
            }
        }
        assert_eq!(accepted, 2);
        assert_eq!(full, 1);
    }
}
