//! Actor metrics and mailbox monitoring.
//!
//! Each actor owns a [`MailboxMonitor`] and feeds it the length of its
//! queue after every message it takes. Depth bands per actor type:
//!
//! | Actor Type | Normal | Elevated | Critical |
//! |------------|--------|----------|----------|
//! | Registry   | < 100  | 100-500  | > 500    |
//! | Room       | < 100  | 100-500  | > 500    |
//! | Connection | < 50   | 50-200   | > 200    |
//!
//! A band change is logged once and published as
//! `rc_actor_mailbox_depth`. [`ActorMetrics`] holds the instance-wide
//! counters behind the registry status and the room/peer gauges.

use crate::observability::metrics as prom;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `RoomRegistryActor` (singleton).
    Registry,
    /// `RoomActor` (one per room).
    Room,
    /// `ConnectionActor` (one per signaling connection).
    Connection,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Room => "room",
            ActorType::Connection => "connection",
        }
    }

    /// Depths above the first value are elevated, above the second critical.
    #[must_use]
    pub const fn bands(self) -> (usize, usize) {
        match self {
            ActorType::Registry | ActorType::Room => (100, 500),
            ActorType::Connection => (50, 200),
        }
    }

    #[must_use]
    pub const fn level_for(self, depth: usize) -> MailboxLevel {
        let (elevated, critical) = self.bands();
        if depth > critical {
            MailboxLevel::Critical
        } else if depth > elevated {
            MailboxLevel::Elevated
        } else {
            MailboxLevel::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MailboxLevel {
    Normal,
    Elevated,
    Critical,
}

/// Queue depth tracking for one actor. Owned by the actor's run loop.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Room id, peer id, or instance id.
    actor_id: String,
    depth: usize,
    peak_depth: usize,
    level: MailboxLevel,
    messages_processed: u64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: 0,
            peak_depth: 0,
            level: MailboxLevel::Normal,
            messages_processed: 0,
        }
    }

    /// Count one handled message and record the queue length left behind it.
    pub fn record_processed(&mut self, remaining: usize) {
        self.messages_processed += 1;
        self.depth = remaining;
        self.peak_depth = self.peak_depth.max(remaining);

        let level = self.actor_type.level_for(remaining);
        if level == self.level {
            return;
        }
        let previous = std::mem::replace(&mut self.level, level);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), remaining);

        if level > previous {
            warn!(
                target: "rc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = remaining,
                level = ?level,
                "Mailbox depth rising"
            );
        } else {
            info!(
                target: "rc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = remaining,
                peak_depth = self.peak_depth,
                level = ?level,
                "Mailbox depth recovered"
            );
        }
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed
    }
}

/// Instance-wide counters, shared by every actor.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    active_rooms: AtomicUsize,
    active_peers: AtomicUsize,
    actor_panics: AtomicU64,
    total_messages_processed: AtomicU64,
    /// Broadcasts dropped on full outbound queues.
    broadcasts_dropped: AtomicU64,
}

/// Point-in-time counts for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorMetricsSnapshot {
    pub rooms: usize,
    pub peers: usize,
    pub messages_processed: u64,
    pub broadcasts_dropped: u64,
    pub actor_panics: u64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let rooms = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_room_created();
        prom::set_rooms_active(rooms);
    }

    pub fn room_removed(&self) {
        let rooms = decrement(&self.active_rooms);
        prom::set_rooms_active(rooms);
    }

    pub fn peer_joined(&self) {
        self.active_peers.fetch_add(1, Ordering::Relaxed);
        prom::adjust_peers_active(1.0);
    }

    pub fn peer_left(&self) {
        decrement(&self.active_peers);
        prom::adjust_peers_active(-1.0);
    }

    /// A supervised actor task panicked.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "rc.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor task panicked"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast_dropped(&self) {
        self.broadcasts_dropped.fetch_add(1, Ordering::Relaxed);
        prom::record_broadcast_dropped();
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.active_peers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> ActorMetricsSnapshot {
        ActorMetricsSnapshot {
            rooms: self.room_count(),
            peers: self.peer_count(),
            messages_processed: self.total_messages_processed.load(Ordering::Relaxed),
            broadcasts_dropped: self.broadcasts_dropped.load(Ordering::Relaxed),
            actor_panics: self.actor_panics.load(Ordering::Relaxed),
        }
    }
}

/// Saturating decrement, returning the new value.
fn decrement(counter: &AtomicUsize) -> usize {
    let previous = counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(1))
        })
        .unwrap_or(0);
    previous.saturating_sub(1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_per_actor_type() {
        assert_eq!(ActorType::Room.level_for(100), MailboxLevel::Normal);
        assert_eq!(ActorType::Room.level_for(101), MailboxLevel::Elevated);
        assert_eq!(ActorType::Registry.level_for(501), MailboxLevel::Critical);
        assert_eq!(ActorType::Connection.level_for(51), MailboxLevel::Elevated);
        assert_eq!(ActorType::Connection.level_for(201), MailboxLevel::Critical);
    }

    #[test]
    fn test_monitor_tracks_depth_and_peak() {
        let mut monitor = MailboxMonitor::new(ActorType::Connection, "peer-1");

        monitor.record_processed(3);
        monitor.record_processed(75);
        assert_eq!(monitor.current_level(), MailboxLevel::Elevated);
        monitor.record_processed(250);
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
        monitor.record_processed(0);

        assert_eq!(monitor.current_depth(), 0);
        assert_eq!(monitor.peak_depth(), 250);
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);
        assert_eq!(monitor.messages_processed(), 4);
    }

    #[test]
    fn test_actor_metrics_counts() {
        let metrics = ActorMetrics::new();

        metrics.room_created();
        metrics.room_created();
        metrics.peer_joined();
        metrics.peer_joined();
        metrics.peer_joined();
        metrics.peer_left();
        metrics.room_removed();
        metrics.record_broadcast_dropped();
        metrics.record_message_processed();
        metrics.record_panic(ActorType::Room);

        assert_eq!(
            metrics.snapshot(),
            ActorMetricsSnapshot {
                rooms: 1,
                peers: 2,
                messages_processed: 1,
                broadcasts_dropped: 1,
                actor_panics: 1,
            }
        );
    }

    #[test]
    fn test_actor_metrics_saturate_at_zero() {
        let metrics = ActorMetrics::new();
        metrics.room_removed();
        metrics.peer_left();
        assert_eq!(metrics.room_count(), 0);
        assert_eq!(metrics.peer_count(), 0);
    }
}
