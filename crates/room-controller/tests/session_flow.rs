//! End-to-end session tests.
//!
//! Real registry, room and connection actors on the loopback engine, with
//! session negotiators on the other end of in-memory signaling streams.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::types::{MediaKind, ProducerId, RoomId};
use rc_test_utils::{assert_eventually, presence, random_room_id};
use room_controller::actors::{serve_connection, ActorMetrics, RoomRegistryHandle, RoomSettings};
use room_controller::errors::RcError;
use room_controller::media::codecs::default_router_codecs;
use room_controller::media::loopback::LoopbackEngine;
use room_controller::media::{MediaPool, WorkerSettings};
use room_controller::signaling::{
    channel_pair, ChannelClient, StreamFrame, CLOSE_POLICY_VIOLATION, CLOSE_TRY_AGAIN_LATER,
};
use room_controller::speaker::SpeakerSettings;
use session_client::fake::{FakeDevice, FakeDeviceProbe};
use session_client::{
    LocalTrack, NegotiatorHandle, NegotiatorState, SessionEvent, SessionNegotiator, TrackSource,
};
use signaling_protocol::messages::ConsumerInfo;
use signaling_protocol::{decode_envelope, encode_envelope, Envelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Controller {
    engine: LoopbackEngine,
    registry: RoomRegistryHandle,
    metrics: Arc<ActorMetrics>,
}

impl Controller {
    async fn start(max_peers: usize) -> Self {
        let engine = LoopbackEngine::new();
        let pool = MediaPool::create(
            &engine,
            2,
            &WorkerSettings {
                rtc_min_port: 40000,
                rtc_max_port: 40100,
            },
            default_router_codecs(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let metrics = ActorMetrics::new();
        let settings = RoomSettings {
            max_peers,
            speaker: SpeakerSettings {
                interval: Duration::from_millis(50),
                ..SpeakerSettings::default()
            },
            ..RoomSettings::default()
        };
        let registry =
            RoomRegistryHandle::new("rc-test".to_string(), pool, settings, Arc::clone(&metrics));
        Self {
            engine,
            registry,
            metrics,
        }
    }

    /// Open a raw signaling stream to `room_id`.
    fn open(&self, room_id: Option<&str>) -> ChannelClient {
        let (server, client) = channel_pair(64);
        tokio::spawn(serve_connection(
            server,
            room_id.map(str::to_string),
            self.registry.clone(),
            Arc::clone(&self.metrics),
            CancellationToken::new(),
        ));
        client
    }

    /// Join `room_id` with a negotiator publishing `tracks`.
    fn join(&self, room_id: &str, tracks: Vec<LocalTrack>) -> Participant {
        let client = self.open(Some(room_id));
        let device = FakeDevice::new();
        let probe = device.probe();
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (events_tx, events) = mpsc::channel(512);
        let (handle, task) = SessionNegotiator::spawn(
            tracks,
            device,
            outbound_tx,
            events_tx,
            CancellationToken::new(),
        );
        tokio::spawn(pump(client, outbound_rx, handle.clone()));
        Participant {
            handle,
            events,
            probe,
            task,
        }
    }

    async fn room_closed(&self, room_id: &str) -> bool {
        matches!(
            self.registry.get_room(RoomId::new(room_id)).await,
            Err(RcError::RoomNotFound(_))
        )
    }
}

/// Carry envelopes between a negotiator and its signaling stream.
async fn pump(
    mut client: ChannelClient,
    mut outbound: mpsc::Receiver<Envelope>,
    handle: NegotiatorHandle,
) {
    loop {
        tokio::select! {
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    client.close();
                    return;
                };
                let text = encode_envelope(&envelope).unwrap();
                if client.send(text).await.is_err() {
                    let _ = handle.connection_closed().await;
                    return;
                }
            }
            frame = client.recv() => {
                match frame {
                    Some(StreamFrame::Text(text)) => {
                        let envelope = decode_envelope(&text).unwrap();
                        if handle.deliver(envelope).await.is_err() {
                            return;
                        }
                    }
                    Some(StreamFrame::Close { .. }) | None => {
                        let _ = handle.connection_closed().await;
                        return;
                    }
                }
            }
        }
    }
}

struct Participant {
    handle: NegotiatorHandle,
    events: mpsc::Receiver<SessionEvent>,
    probe: FakeDeviceProbe,
    task: JoinHandle<()>,
}

impl Participant {
    async fn wait_event<F>(&mut self, mut matches: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("negotiator stopped");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn steady(&mut self) {
        self.wait_event(|e| *e == SessionEvent::StateChanged(NegotiatorState::ConsumingSteadyState))
            .await;
    }

    async fn consumers_added(&mut self, count: usize) -> Vec<ConsumerInfo> {
        let mut added = Vec::new();
        while added.len() < count {
            if let SessionEvent::ConsumerAdded(info) = self
                .wait_event(|e| matches!(e, SessionEvent::ConsumerAdded(_)))
                .await
            {
                added.push(info);
            }
        }
        added
    }

    async fn producer_id(&self, source: TrackSource) -> ProducerId {
        self.handle.status().await.unwrap().producers[&source].producer_id
    }

    async fn leave(self) {
        self.handle.leave().await.unwrap();
        tokio::time::timeout(WAIT, self.task).await.unwrap().unwrap();
    }
}

async fn close_frame(client: &mut ChannelClient) -> (u16, String) {
    loop {
        let frame = tokio::time::timeout(WAIT, client.recv())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended without close frame");
        if let StreamFrame::Close { code, reason } = frame {
            return (code, reason);
        }
    }
}

#[tokio::test]
async fn test_publish_consume_and_teardown() {
    let rc = Controller::start(16).await;
    let room = random_room_id();

    let mut alice = rc.join(&room, vec![LocalTrack::camera(), LocalTrack::microphone()]);
    let admin = alice
        .wait_event(|e| matches!(e, SessionEvent::AdminInfo { .. }))
        .await;
    assert!(matches!(admin, SessionEvent::AdminInfo { is_admin: true, .. }));
    alice.steady().await;
    let video = alice.producer_id(TrackSource::Webcam).await;
    let audio = alice.producer_id(TrackSource::Mic).await;

    let mut bob = rc.join(&room, Vec::new());
    let admin = bob
        .wait_event(|e| matches!(e, SessionEvent::AdminInfo { .. }))
        .await;
    assert!(matches!(admin, SessionEvent::AdminInfo { is_admin: false, .. }));

    // Both of alice's producers arrive through existingProducers
    let added = bob.consumers_added(2).await;
    let mut consumed: Vec<ProducerId> = added.iter().map(|c| c.producer_id).collect();
    consumed.sort();
    let mut expected = vec![video, audio];
    expected.sort();
    assert_eq!(consumed, expected);
    for consumer in &added {
        let kind = if consumer.producer_id == video {
            MediaKind::Video
        } else {
            MediaKind::Audio
        };
        assert_eq!(consumer.kind, kind);
        let source = if kind == MediaKind::Video { "webcam" } else { "mic" };
        assert_eq!(consumer.app_data["source"], source);
    }

    // Consumers are resumed once attached
    let snapshot = rc.registry.get_room(RoomId::new(room.as_str())).await.unwrap();
    assert_eq!(snapshot.peers.len(), 2);
    assert_eventually(WAIT, || {
        let registry = rc.registry.clone();
        let room = room.clone();
        async move {
            let snapshot = registry.get_room(RoomId::new(room)).await.unwrap();
            snapshot
                .peers
                .iter()
                .flat_map(|p| p.consumers.iter())
                .filter(|c| !c.paused)
                .count()
                == 2
        }
    })
    .await
    .unwrap();

    alice.leave().await;

    let mut closed = Vec::new();
    for _ in 0..2 {
        if let SessionEvent::ConsumerClosed { producer_id, .. } = bob
            .wait_event(|e| matches!(e, SessionEvent::ConsumerClosed { .. }))
            .await
        {
            closed.push(producer_id);
        }
    }
    closed.sort();
    assert_eq!(closed, expected);
    assert!(bob.probe.consumers().is_empty());
    assert!(!rc.room_closed(&room).await);

    bob.leave().await;
    assert_eventually(WAIT, || rc.room_closed(&room)).await.unwrap();
}

#[tokio::test]
async fn test_late_publisher_reaches_steady_peer() {
    let rc = Controller::start(16).await;
    let room = random_room_id();

    let mut bob = rc.join(&room, Vec::new());
    bob.steady().await;

    let mut alice = rc.join(&room, vec![LocalTrack::microphone()]);
    alice.steady().await;

    let added = bob.consumers_added(1).await;
    let consumer = added.first().unwrap();
    assert_eq!(consumer.producer_id, alice.producer_id(TrackSource::Mic).await);
    assert_eq!(consumer.kind, MediaKind::Audio);
    assert_eq!(bob.probe.consumed_producers(), vec![consumer.producer_id]);
}

#[tokio::test]
async fn test_mute_and_screen_share_reach_other_peer() {
    let rc = Controller::start(16).await;
    let room = random_room_id();

    let mut alice = rc.join(&room, vec![LocalTrack::microphone()]);
    alice.steady().await;
    let mut bob = rc.join(&room, Vec::new());
    bob.consumers_added(1).await;

    alice.handle.set_audio_enabled(false).await.unwrap();
    let change = bob
        .wait_event(|e| matches!(e, SessionEvent::RemoteProducerStateChanged(_)))
        .await;
    let SessionEvent::RemoteProducerStateChanged(change) = change else {
        unreachable!();
    };
    assert!(change.paused);
    assert_eq!(change.producer_id, alice.producer_id(TrackSource::Mic).await);

    alice.handle.start_screen_share().await.unwrap();
    let screen = bob.consumers_added(1).await;
    let screen = screen.first().unwrap();
    assert_eq!(screen.app_data["source"], "screen");

    alice.handle.stop_screen_share().await.unwrap();
    let closed = bob
        .wait_event(|e| matches!(e, SessionEvent::ConsumerClosed { .. }))
        .await;
    assert_eq!(
        closed,
        SessionEvent::ConsumerClosed {
            consumer_id: screen.id,
            producer_id: screen.producer_id,
        }
    );
}

#[tokio::test]
async fn test_admin_handoff_and_presence() {
    let rc = Controller::start(16).await;
    let room = random_room_id();

    let mut alice = rc.join(&room, Vec::new());
    alice.steady().await;
    let mut bob = rc.join(&room, Vec::new());
    bob.steady().await;
    let mut carol = rc.join(&room, Vec::new());
    carol.steady().await;

    carol.handle.update_presence(presence(false)).await.unwrap();
    let update = alice
        .wait_event(|e| matches!(e, SessionEvent::PeerStatusUpdated { .. }))
        .await;
    let SessionEvent::PeerStatusUpdated { status, .. } = update else {
        unreachable!();
    };
    assert_eq!(status, presence(false));

    alice.leave().await;

    // Earliest remaining peer takes over
    bob.wait_event(|e| matches!(e, SessionEvent::AdminInfo { is_admin: true, .. }))
        .await;
    assert!(bob.handle.status().await.unwrap().is_admin);
    assert!(!carol.handle.status().await.unwrap().is_admin);
}

#[tokio::test]
async fn test_dominant_speaker_reaches_peers() {
    let rc = Controller::start(16).await;
    let room = random_room_id();

    let mut alice = rc.join(&room, vec![LocalTrack::microphone()]);
    alice.steady().await;
    let mut bob = rc.join(&room, Vec::new());
    bob.consumers_added(1).await;

    let producer_id = alice.producer_id(TrackSource::Mic).await;
    rc.engine
        .producer(producer_id)
        .unwrap()
        .set_audio_level(Some(-20.0));

    let event = bob
        .wait_event(|e| {
            matches!(e, SessionEvent::DominantSpeakerChanged(s) if s.producer_id.is_some())
        })
        .await;
    let SessionEvent::DominantSpeakerChanged(speaker) = event else {
        unreachable!();
    };
    assert_eq!(speaker.producer_id, Some(producer_id));
    assert_eq!(speaker.peer_id, alice.handle.status().await.unwrap().peer_id);
}

#[tokio::test]
async fn test_full_room_refuses_second_peer() {
    let rc = Controller::start(1).await;
    let room = random_room_id();

    let mut alice = rc.join(&room, Vec::new());
    alice.steady().await;

    let mut refused = rc.open(Some(&room));
    let (code, reason) = close_frame(&mut refused).await;
    assert_eq!(code, CLOSE_TRY_AGAIN_LATER);
    assert_eq!(reason, "Room is full");

    let snapshot = rc.registry.get_room(RoomId::new(room.as_str())).await.unwrap();
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(rc.metrics.peer_count(), 1);
}

#[tokio::test]
async fn test_missing_room_id_is_refused() {
    let rc = Controller::start(16).await;

    for room_id in [None, Some("   ")] {
        let mut client = rc.open(room_id);
        let (code, _) = close_frame(&mut client).await;
        assert_eq!(code, CLOSE_POLICY_VIOLATION);
    }
    assert_eq!(rc.registry.get_status().await.unwrap().room_count, 0);
}

#[tokio::test]
async fn test_dropped_connection_cleans_up_room() {
    let rc = Controller::start(16).await;
    let room = random_room_id();

    let mut alice = rc.join(&room, vec![LocalTrack::microphone()]);
    alice.steady().await;
    let mut bob = rc.join(&room, Vec::new());
    bob.consumers_added(1).await;

    // Abrupt end of the negotiator drops its outbound channel, which
    // closes the stream like a closed browser tab
    alice.handle.cancel();
    tokio::time::timeout(WAIT, alice.task).await.unwrap().unwrap();

    bob.wait_event(|e| matches!(e, SessionEvent::ConsumerClosed { .. }))
        .await;
    bob.wait_event(|e| matches!(e, SessionEvent::AdminInfo { is_admin: true, .. }))
        .await;

    bob.leave().await;
    assert_eventually(WAIT, || rc.room_closed(&room)).await.unwrap();
    assert_eq!(rc.metrics.peer_count(), 0);
}
