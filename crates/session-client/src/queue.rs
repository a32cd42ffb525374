//! Producers waiting for the receive transport.

use common::types::ProducerId;
use signaling_protocol::messages::ProducerInfo;
use std::collections::{HashSet, VecDeque};

/// FIFO of producers announced before the receive transport was connected.
///
/// Each producer appears at most once; draining returns entries in arrival
/// order.
#[derive(Debug, Default)]
pub struct PendingConsumeQueue {
    entries: VecDeque<ProducerInfo>,
    queued: HashSet<ProducerId>,
}

impl PendingConsumeQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a producer. Returns false if it was already queued.
    pub fn push(&mut self, producer: ProducerInfo) -> bool {
        if !self.queued.insert(producer.producer_id) {
            return false;
        }
        self.entries.push_back(producer);
        true
    }

    /// Drop a producer that closed while waiting. Returns whether it was queued.
    pub fn remove(&mut self, producer_id: ProducerId) -> bool {
        if !self.queued.remove(&producer_id) {
            return false;
        }
        self.entries.retain(|p| p.producer_id != producer_id);
        true
    }

    #[must_use]
    pub fn contains(&self, producer_id: ProducerId) -> bool {
        self.queued.contains(&producer_id)
    }

    /// Take every entry, oldest first.
    pub fn drain(&mut self) -> Vec<ProducerInfo> {
        self.queued.clear();
        self.entries.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::{MediaKind, PeerId};
    use signaling_protocol::rtp::AppData;

    fn producer(kind: MediaKind) -> ProducerInfo {
        ProducerInfo {
            producer_id: ProducerId::new(),
            peer_id: PeerId::new(),
            kind,
            app_data: AppData::new(),
            paused: false,
        }
    }

    #[test]
    fn test_drain_preserves_arrival_order() {
        let mut queue = PendingConsumeQueue::new();
        let a = producer(MediaKind::Video);
        let b = producer(MediaKind::Audio);
        let c = producer(MediaKind::Video);
        queue.push(a.clone());
        queue.push(b.clone());
        queue.push(c.clone());

        let drained: Vec<ProducerId> = queue.drain().into_iter().map(|p| p.producer_id).collect();
        assert_eq!(drained, vec![a.producer_id, b.producer_id, c.producer_id]);
        assert!(queue.is_empty());
        assert!(!queue.contains(a.producer_id));
    }

    #[test]
    fn test_duplicate_announcement_queued_once() {
        let mut queue = PendingConsumeQueue::new();
        let a = producer(MediaKind::Audio);
        assert!(queue.push(a.clone()));
        assert!(!queue.push(a.clone()));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_closed_producer() {
        let mut queue = PendingConsumeQueue::new();
        let a = producer(MediaKind::Audio);
        let b = producer(MediaKind::Video);
        queue.push(a.clone());
        queue.push(b.clone());

        assert!(queue.remove(a.producer_id));
        assert!(!queue.remove(a.producer_id));

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained.first().unwrap().producer_id, b.producer_id);
    }

    #[test]
    fn test_producer_can_be_requeued_after_drain() {
        let mut queue = PendingConsumeQueue::new();
        let a = producer(MediaKind::Audio);
        queue.push(a.clone());
        queue.drain();
        assert!(queue.push(a));
    }
}
