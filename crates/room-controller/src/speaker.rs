//! Dominant-speaker detection.
//!
//! One detector per room. The room actor calls [`DominantSpeakerDetector::sample`]
//! on a fixed interval; the detector reads the current level of every
//! subscribed audio producer and reports an event only when the loudest
//! producer changes, or once when the room falls silent.

use common::types::{MediaKind, PeerId, ProducerId};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::media::MediaProducer;

/// Default sampling interval.
pub const DEFAULT_SPEAKER_INTERVAL: Duration = Duration::from_millis(800);

/// Default silence threshold in dBov.
pub const DEFAULT_SPEAKER_THRESHOLD_DBOV: f32 = -80.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeakerSettings {
    pub interval: Duration,
    /// Levels at or below this are treated as silence.
    pub threshold_dbov: f32,
}

impl Default for SpeakerSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SPEAKER_INTERVAL,
            threshold_dbov: DEFAULT_SPEAKER_THRESHOLD_DBOV,
        }
    }
}

/// Edge event emitted by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerEvent {
    Changed {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    Silence,
}

struct Subscription {
    producer: Arc<dyn MediaProducer>,
    peer_id: PeerId,
}

pub struct DominantSpeakerDetector {
    threshold_dbov: f32,
    subscriptions: Vec<Subscription>,
    current: Option<(ProducerId, PeerId)>,
}

impl DominantSpeakerDetector {
    #[must_use]
    pub fn new(threshold_dbov: f32) -> Self {
        Self {
            threshold_dbov,
            subscriptions: Vec::new(),
            current: None,
        }
    }

    /// Start observing an audio producer. Non-audio producers are ignored.
    pub fn subscribe(&mut self, producer: Arc<dyn MediaProducer>, peer_id: PeerId) -> bool {
        if producer.kind() != MediaKind::Audio {
            return false;
        }
        let producer_id = producer.id();
        if self
            .subscriptions
            .iter()
            .any(|s| s.producer.id() == producer_id)
        {
            return false;
        }
        debug!(
            target: "rc.speaker",
            producer_id = %producer_id,
            peer_id = %peer_id,
            "Audio producer subscribed"
        );
        self.subscriptions.push(Subscription { producer, peer_id });
        true
    }

    /// Stop observing a producer. The next sample reflects the removal.
    pub fn unsubscribe(&mut self, producer_id: ProducerId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|s| s.producer.id() != producer_id);
        before != self.subscriptions.len()
    }

    #[must_use]
    pub fn current(&self) -> Option<(ProducerId, PeerId)> {
        self.current
    }

    #[must_use]
    pub fn subscribed(&self) -> usize {
        self.subscriptions.len()
    }

    /// Take one sample and return an event if the dominant speaker changed.
    ///
    /// Ties go to the producer subscribed first.
    pub fn sample(&mut self) -> Option<SpeakerEvent> {
        let mut loudest: Option<(f32, &Subscription)> = None;
        for subscription in &self.subscriptions {
            if subscription.producer.is_paused() {
                continue;
            }
            let Some(level) = subscription.producer.audio_level() else {
                continue;
            };
            if level <= self.threshold_dbov {
                continue;
            }
            if loudest.map_or(true, |(best, _)| level > best) {
                loudest = Some((level, subscription));
            }
        }

        match loudest {
            Some((_, subscription)) => {
                let producer_id = subscription.producer.id();
                let peer_id = subscription.peer_id;
                if self.current.map(|(id, _)| id) == Some(producer_id) {
                    return None;
                }
                self.current = Some((producer_id, peer_id));
                Some(SpeakerEvent::Changed {
                    producer_id,
                    peer_id,
                })
            }
            None => self.current.take().map(|_| SpeakerEvent::Silence),
        }
    }
}
