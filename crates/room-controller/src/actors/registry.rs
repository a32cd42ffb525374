//! `RoomRegistryActor` - singleton owner of the room-id to room mapping.
//!
//! The registry is the top-level actor of the room controller:
//!
//! - Creates a `RoomActor` on the first join for an unknown room id
//! - Queues joins that arrive while a room's router is being assigned
//! - Closes rooms that became empty, once the room confirms it still is
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors room actor health (panic detection via `JoinHandle`)
//!
//! # Room lifecycle
//!
//! ```text
//!            join            router assigned          room emptied
//!   (none) -------> Creating ----------------> Active -------------> Closing
//!                      ^                         ^                     |
//!                      |   closed, joins queued  |   still occupied    |
//!                      +-------------------------+---------------------+
//! ```
//!
//! Joins for a room in `Creating` or `Closing` are held and admitted in
//! arrival order once the room settles.

use super::messages::{
    JoinAccepted, JoinRequest, RegistryMessage, RegistryStatus, RoomSnapshot, RoomSummary,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomSettings};
use crate::errors::RcError;
use crate::media::{EngineError, MediaPool, MediaRouter, RouterAssignment};
use crate::observability::metrics as prom;

use common::types::RoomId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long shutdown waits for each room actor to finish.
const ROOM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type JoinResponder = oneshot::Sender<Result<JoinAccepted, RcError>>;

/// Handle to the `RoomRegistryActor`.
///
/// This is the public interface for interacting with the registry.
#[derive(Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Create a new `RoomRegistryActor` and return a handle to it.
    ///
    /// Rooms get routers from `pool` round-robin and are configured with
    /// `settings`.
    #[must_use]
    pub fn new(
        rc_id: String,
        pool: Arc<MediaPool>,
        settings: RoomSettings,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor::new(
            rc_id,
            receiver,
            sender.downgrade(),
            cancel_token.clone(),
            pool,
            settings,
            metrics,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Admit a peer into `room_id`, creating the room if it does not exist.
    pub async fn join(&self, room_id: RoomId, join: JoinRequest) -> Result<JoinAccepted, RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Join {
                room_id,
                join,
                respond_to: tx,
            })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Session dump of one room.
    pub async fn get_room(&self, room_id: RoomId) -> Result<RoomSnapshot, RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Peer counts of every open room, sorted by room id.
    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::ListRooms { respond_to: tx })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop admitting peers and close every room.
    pub async fn shutdown(&self) -> Result<(), RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Sent by a room when its last peer left.
    pub async fn room_emptied(&self, room_id: RoomId) -> Result<(), RcError> {
        self.sender
            .send(RegistryMessage::RoomEmptied { room_id })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))
    }

    /// Cancel the registry (and all rooms).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// A room actor the registry supervises.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    /// Closed by the registry if the room task dies without closing it.
    router: Arc<dyn MediaRouter>,
}

enum RoomEntry {
    /// Router assignment in flight.
    Creating { waiters: Vec<(JoinRequest, JoinResponder)> },
    Active(ManagedRoom),
    /// Asked to close because it emptied; waiting for confirmation.
    Closing {
        managed: ManagedRoom,
        waiters: Vec<(JoinRequest, JoinResponder)>,
    },
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    rc_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Re-enters the mailbox from spawned router-assignment and close tasks.
    self_sender: mpsc::WeakSender<RegistryMessage>,
    cancel_token: CancellationToken,
    pool: Arc<MediaPool>,
    settings: RoomSettings,
    rooms: HashMap<RoomId, RoomEntry>,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    fn new(
        rc_id: String,
        receiver: mpsc::Receiver<RegistryMessage>,
        self_sender: mpsc::WeakSender<RegistryMessage>,
        cancel_token: CancellationToken,
        pool: Arc<MediaPool>,
        settings: RoomSettings,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let mailbox = MailboxMonitor::new(ActorType::Registry, rc_id.clone());

        Self {
            rc_id,
            receiver,
            self_sender,
            cancel_token,
            pool,
            settings,
            rooms: HashMap::new(),
            accepting_new: true,
            metrics,
            mailbox,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "rc.actor.registry", fields(rc_id = %self.rc_id))]
    async fn run(mut self) {
        info!(
            target: "rc.actor.registry",
            rc_id = %self.rc_id,
            "RoomRegistryActor started"
        );

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rc.actor.registry",
                        rc_id = %self.rc_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.record_processed(self.receiver.len());
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "rc.actor.registry",
                                rc_id = %self.rc_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rc.actor.registry",
            rc_id = %self.rc_id,
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Join {
                room_id,
                join,
                respond_to,
            } => {
                self.join(room_id, join, respond_to).await;
            }

            RegistryMessage::RouterAssigned { room_id, result } => {
                self.router_assigned(room_id, result).await;
            }

            RegistryMessage::RoomEmptied { room_id } => {
                self.room_emptied(room_id);
            }

            RegistryMessage::CloseChecked { room_id, closed } => {
                self.close_checked(room_id, closed).await;
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                self.get_room(&room_id, respond_to);
            }

            RegistryMessage::ListRooms { respond_to } => {
                self.list_rooms(respond_to);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown { respond_to } => {
                let result = self.initiate_shutdown();
                let _ = respond_to.send(result);
            }
        }
    }

    async fn join(&mut self, room_id: RoomId, join: JoinRequest, respond_to: JoinResponder) {
        if !self.accepting_new {
            prom::record_peer_join("draining");
            let _ = respond_to.send(Err(RcError::Draining));
            return;
        }

        match self.rooms.get_mut(&room_id) {
            Some(RoomEntry::Active(managed)) => {
                let _ = managed.handle.forward_join(join, respond_to).await;
            }
            Some(RoomEntry::Creating { waiters } | RoomEntry::Closing { waiters, .. }) => {
                debug!(
                    target: "rc.actor.registry",
                    room_id = %room_id,
                    queued = waiters.len() + 1,
                    "Room not settled, join queued"
                );
                waiters.push((join, respond_to));
            }
            None => {
                self.start_creating(room_id, vec![(join, respond_to)]);
            }
        }
    }

    /// Assign a router off the actor loop and hold `waiters` until it lands.
    fn start_creating(&mut self, room_id: RoomId, waiters: Vec<(JoinRequest, JoinResponder)>) {
        debug!(
            target: "rc.actor.registry",
            room_id = %room_id,
            "Creating room"
        );
        self.rooms
            .insert(room_id.clone(), RoomEntry::Creating { waiters });

        let pool = Arc::clone(&self.pool);
        let weak = self.self_sender.clone();
        tokio::spawn(async move {
            let result = pool.assign_router().await;
            if let Some(sender) = weak.upgrade() {
                let _ = sender
                    .send(RegistryMessage::RouterAssigned { room_id, result })
                    .await;
            } else if let Ok(assignment) = result {
                assignment.router.close().await;
            }
        });
    }

    async fn router_assigned(
        &mut self,
        room_id: RoomId,
        result: Result<RouterAssignment, EngineError>,
    ) {
        let Some(RoomEntry::Creating { waiters }) = self.rooms.remove(&room_id) else {
            warn!(
                target: "rc.actor.registry",
                room_id = %room_id,
                "Router assigned for a room not being created"
            );
            if let Ok(assignment) = result {
                tokio::spawn(async move { assignment.router.close().await });
            }
            return;
        };

        let assignment = match result {
            Ok(assignment) => assignment,
            Err(e) => {
                error!(
                    target: "rc.actor.registry",
                    room_id = %room_id,
                    error = %e,
                    "Room creation failed"
                );
                for (_, respond_to) in waiters {
                    prom::record_peer_join("error");
                    let _ = respond_to.send(Err(RcError::RoomCreation(e.to_string())));
                }
                return;
            }
        };

        if !self.accepting_new {
            tokio::spawn(async move { assignment.router.close().await });
            for (_, respond_to) in waiters {
                prom::record_peer_join("draining");
                let _ = respond_to.send(Err(RcError::Draining));
            }
            return;
        }

        let router_id = assignment.router.id();
        let worker_index = assignment.worker_index;
        let router = Arc::clone(&assignment.router);
        let registry = self.self_sender.upgrade().map(|sender| RoomRegistryHandle {
            sender,
            cancel_token: self.cancel_token.clone(),
        });
        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            assignment,
            self.settings.clone(),
            registry,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );
        self.metrics.room_created();

        info!(
            target: "rc.actor.registry",
            rc_id = %self.rc_id,
            room_id = %room_id,
            router_id = %router_id,
            worker_index = worker_index,
            total_rooms = self.metrics.room_count(),
            "Room created"
        );

        for (join, respond_to) in waiters {
            let _ = handle.forward_join(join, respond_to).await;
        }
        self.rooms.insert(
            room_id,
            RoomEntry::Active(ManagedRoom {
                handle,
                task_handle,
                router,
            }),
        );
    }

    /// Ask an emptied room to close. Joins are held until it answers.
    fn room_emptied(&mut self, room_id: RoomId) {
        let Some(RoomEntry::Active(managed)) = self.rooms.remove(&room_id) else {
            return;
        };
        let room = managed.handle.clone();
        self.rooms.insert(
            room_id.clone(),
            RoomEntry::Closing {
                managed,
                waiters: Vec::new(),
            },
        );

        let weak = self.self_sender.clone();
        tokio::spawn(async move {
            // A room that stopped answering is gone either way.
            let closed = room.close_if_empty().await.unwrap_or(true);
            if let Some(sender) = weak.upgrade() {
                let _ = sender
                    .send(RegistryMessage::CloseChecked { room_id, closed })
                    .await;
            }
        });
    }

    async fn close_checked(&mut self, room_id: RoomId, closed: bool) {
        let Some(RoomEntry::Closing { managed, waiters }) = self.rooms.remove(&room_id) else {
            return;
        };

        if !closed {
            debug!(
                target: "rc.actor.registry",
                room_id = %room_id,
                "Room re-occupied, keeping it open"
            );
            for (join, respond_to) in waiters {
                let _ = managed.handle.forward_join(join, respond_to).await;
            }
            self.rooms.insert(room_id, RoomEntry::Active(managed));
            return;
        }

        self.metrics.room_removed();
        let rc_id = self.rc_id.clone();
        let closed_room = room_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "rc.actor.registry",
                        rc_id = %rc_id,
                        room_id = %closed_room,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "rc.actor.registry",
                        rc_id = %rc_id,
                        room_id = %closed_room,
                        error = ?e,
                        "Room actor task panicked during close"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rc.actor.registry",
                        rc_id = %rc_id,
                        room_id = %closed_room,
                        "Room actor task close timed out"
                    );
                }
            }
        });

        info!(
            target: "rc.actor.registry",
            rc_id = %self.rc_id,
            room_id = %room_id,
            total_rooms = self.metrics.room_count(),
            "Empty room closed"
        );

        if !waiters.is_empty() {
            if self.accepting_new {
                self.start_creating(room_id, waiters);
            } else {
                for (_, respond_to) in waiters {
                    prom::record_peer_join("draining");
                    let _ = respond_to.send(Err(RcError::Draining));
                }
            }
        }
    }

    fn room_handle(&self, room_id: &RoomId) -> Option<RoomActorHandle> {
        match self.rooms.get(room_id) {
            Some(RoomEntry::Active(managed) | RoomEntry::Closing { managed, .. }) => {
                Some(managed.handle.clone())
            }
            Some(RoomEntry::Creating { .. }) | None => None,
        }
    }

    /// Snapshots are collected off the actor loop.
    fn get_room(
        &self,
        room_id: &RoomId,
        respond_to: oneshot::Sender<Result<RoomSnapshot, RcError>>,
    ) {
        let Some(room) = self.room_handle(room_id) else {
            let _ = respond_to.send(Err(RcError::RoomNotFound(room_id.to_string())));
            return;
        };
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            let result = room
                .snapshot()
                .await
                .map_err(|_| RcError::RoomNotFound(room_id));
            let _ = respond_to.send(result);
        });
    }

    fn list_rooms(&self, respond_to: oneshot::Sender<Vec<RoomSummary>>) {
        let mut rooms: Vec<RoomActorHandle> = self
            .rooms
            .keys()
            .filter_map(|room_id| self.room_handle(room_id))
            .collect();
        rooms.sort_by(|a, b| a.room_id().cmp(b.room_id()));

        tokio::spawn(async move {
            let mut summaries = Vec::with_capacity(rooms.len());
            for room in rooms {
                if let Ok(snapshot) = room.snapshot().await {
                    summaries.push(RoomSummary {
                        room_id: snapshot.room_id,
                        peers: snapshot.peers.len(),
                    });
                }
            }
            let _ = respond_to.send(summaries);
        });
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.metrics.room_count(),
            peer_count: self.metrics.peer_count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.receiver.len(),
        }
    }

    fn initiate_shutdown(&mut self) -> Result<(), RcError> {
        info!(
            target: "rc.actor.registry",
            rc_id = %self.rc_id,
            room_count = self.rooms.len(),
            "Initiating graceful shutdown"
        );

        self.accepting_new = false;
        self.cancel_token.cancel();

        Ok(())
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "rc.actor.registry",
            rc_id = %self.rc_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        let mut managed_rooms = Vec::new();
        for (room_id, entry) in self.rooms.drain() {
            let (managed, waiters) = match entry {
                RoomEntry::Creating { waiters } => (None, waiters),
                RoomEntry::Active(managed) => (Some(managed), Vec::new()),
                RoomEntry::Closing { managed, waiters } => (Some(managed), waiters),
            };
            for (_, respond_to) in waiters {
                prom::record_peer_join("draining");
                let _ = respond_to.send(Err(RcError::Draining));
            }
            if let Some(managed) = managed {
                managed.handle.cancel();
                managed_rooms.push((room_id, managed));
            }
        }

        for (room_id, managed) in managed_rooms {
            match tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "rc.actor.registry",
                        rc_id = %self.rc_id,
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "rc.actor.registry",
                        rc_id = %self.rc_id,
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rc.actor.registry",
                        rc_id = %self.rc_id,
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "rc.actor.registry",
            rc_id = %self.rc_id,
            "Graceful shutdown complete"
        );
    }

    /// Reap active rooms whose task ended without being asked to close.
    async fn check_room_health(&mut self) {
        let failed: Vec<RoomId> = self
            .rooms
            .iter()
            .filter_map(|(room_id, entry)| match entry {
                RoomEntry::Active(managed) if managed.task_handle.is_finished() => {
                    Some(room_id.clone())
                }
                _ => None,
            })
            .collect();

        for room_id in failed {
            let Some(RoomEntry::Active(managed)) = self.rooms.remove(&room_id) else {
                continue;
            };
            warn!(
                target: "rc.actor.registry",
                rc_id = %self.rc_id,
                room_id = %room_id,
                "Room actor task finished unexpectedly"
            );

            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "rc.actor.registry",
                        rc_id = %self.rc_id,
                        room_id = %room_id,
                        "Room actor exited cleanly"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "rc.actor.registry",
                            rc_id = %self.rc_id,
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked - peers disconnected"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }

            let router = managed.router;
            tokio::spawn(async move { router.close().await });
            self.metrics.room_removed();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::connection::ConnectionActorHandle;
    use crate::media::codecs::default_router_codecs;
    use crate::media::loopback::LoopbackEngine;
    use crate::media::{MediaWorker, WorkerSettings};
    use common::types::PeerId;
    use signaling_protocol::Envelope;

    async fn test_pool(engine: &LoopbackEngine) -> Arc<MediaPool> {
        MediaPool::create(
            engine,
            2,
            &WorkerSettings {
                rtc_min_port: 40000,
                rtc_max_port: 40100,
            },
            default_router_codecs(),
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    async fn registry_with(
        engine: &LoopbackEngine,
        settings: RoomSettings,
    ) -> (RoomRegistryHandle, Arc<ActorMetrics>) {
        let pool = test_pool(engine).await;
        let metrics = ActorMetrics::new();
        let registry =
            RoomRegistryHandle::new("rc-test".to_string(), pool, settings, Arc::clone(&metrics));
        (registry, metrics)
    }

    fn connection() -> (JoinRequest, ConnectionActorHandle, mpsc::Receiver<Envelope>) {
        let peer_id = PeerId::new();
        let (connection, rx) = ConnectionActorHandle::detached(peer_id, 16);
        (
            JoinRequest {
                peer_id,
                connection: connection.clone(),
            },
            connection,
            rx,
        )
    }

    async fn wait_for_rooms(registry: &RoomRegistryHandle, expected: usize) {
        let registry = registry.clone();
        rc_test_utils::assert_eventually(Duration::from_secs(2), move || {
            let registry = registry.clone();
            async move { registry.get_status().await.unwrap().room_count == expected }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_first_join_creates_room() {
        let engine = LoopbackEngine::new();
        let (registry, metrics) = registry_with(&engine, RoomSettings::default()).await;

        let (join, _conn, _rx) = connection();
        let accepted = registry.join(RoomId::new("acme:standup"), join).await.unwrap();

        assert!(accepted.is_admin);
        assert_eq!(accepted.room.room_id().as_str(), "acme:standup");
        assert!(!accepted.rtp_capabilities.codecs.is_empty());
        assert_eq!(metrics.room_count(), 1);
        assert_eq!(metrics.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_joins_share_one_room() {
        let engine = LoopbackEngine::new();
        let (registry, metrics) = registry_with(&engine, RoomSettings::default()).await;

        let mut joins = Vec::new();
        let mut keep = Vec::new();
        for _ in 0..5 {
            let (join, conn, rx) = connection();
            keep.push((conn, rx));
            let registry = registry.clone();
            joins.push(tokio::spawn(async move {
                registry.join(RoomId::new("race"), join).await
            }));
        }

        let mut admins = 0;
        for join in joins {
            if join.await.unwrap().unwrap().is_admin {
                admins += 1;
            }
        }
        assert_eq!(admins, 1);
        assert_eq!(metrics.room_count(), 1);

        let snapshot = registry.get_room(RoomId::new("race")).await.unwrap();
        assert_eq!(snapshot.peers.len(), 5);
    }

    #[tokio::test]
    async fn test_rooms_are_spread_over_workers() {
        let engine = LoopbackEngine::new();
        let (registry, _metrics) = registry_with(&engine, RoomSettings::default()).await;

        let (a, _ca, _ra) = connection();
        let (b, _cb, _rb) = connection();
        registry.join(RoomId::new("a"), a).await.unwrap();
        registry.join(RoomId::new("b"), b).await.unwrap();

        let a = registry.get_room(RoomId::new("a")).await.unwrap();
        let b = registry.get_room(RoomId::new("b")).await.unwrap();
        assert_ne!(a.worker_index, b.worker_index);
    }

    #[tokio::test]
    async fn test_empty_room_is_closed() {
        let engine = LoopbackEngine::new();
        let (registry, metrics) = registry_with(&engine, RoomSettings::default()).await;

        let (join, _conn, _rx) = connection();
        let peer_id = join.peer_id;
        let accepted = registry.join(RoomId::new("short"), join).await.unwrap();
        accepted.room.disconnect(peer_id).await.unwrap();

        wait_for_rooms(&registry, 0).await;
        assert!(matches!(
            registry.get_room(RoomId::new("short")).await,
            Err(RcError::RoomNotFound(_))
        ));
        assert_eq!(metrics.peer_count(), 0);

        // The id can be reused.
        let (join, _conn, _rx) = connection();
        let accepted = registry.join(RoomId::new("short"), join).await.unwrap();
        assert!(accepted.is_admin);
    }

    #[tokio::test]
    async fn test_router_failure_rejects_join() {
        let engine = LoopbackEngine::new();
        let (registry, metrics) = registry_with(&engine, RoomSettings::default()).await;
        engine.set_router_creation_fails(true);

        let (join, _conn, _rx) = connection();
        let result = registry.join(RoomId::new("broken"), join).await;
        assert!(matches!(result, Err(RcError::RoomCreation(_))));
        assert_eq!(metrics.room_count(), 0);

        engine.set_router_creation_fails(false);
        let (join, _conn, _rx) = connection();
        assert!(registry.join(RoomId::new("broken"), join).await.is_ok());
    }

    #[tokio::test]
    async fn test_full_room_rejects_join() {
        let engine = LoopbackEngine::new();
        let (registry, _metrics) = registry_with(
            &engine,
            RoomSettings {
                max_peers: 1,
                ..RoomSettings::default()
            },
        )
        .await;

        let (first, _c1, _r1) = connection();
        let (second, _c2, _r2) = connection();
        registry.join(RoomId::new("tiny"), first).await.unwrap();
        let result = registry.join(RoomId::new("tiny"), second).await;
        assert!(matches!(result, Err(RcError::RoomFull(_))));
    }

    #[tokio::test]
    async fn test_list_rooms_reports_peer_counts() {
        let engine = LoopbackEngine::new();
        let (registry, _metrics) = registry_with(&engine, RoomSettings::default()).await;

        let mut keep = Vec::new();
        for room in ["acme:a", "acme:a", "globex:b"] {
            let (join, conn, rx) = connection();
            keep.push((conn, rx));
            registry.join(RoomId::new(room), join).await.unwrap();
        }

        let rooms = registry.list_rooms().await.unwrap();
        assert_eq!(
            rooms,
            vec![
                RoomSummary {
                    room_id: RoomId::new("acme:a"),
                    peers: 2
                },
                RoomSummary {
                    room_id: RoomId::new("globex:b"),
                    peers: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects_new_joins() {
        let engine = LoopbackEngine::new();
        let (registry, metrics) = registry_with(&engine, RoomSettings::default()).await;

        let (join, conn, _rx) = connection();
        registry.join(RoomId::new("busy"), join).await.unwrap();

        registry.shutdown().await.unwrap();
        assert!(registry.is_cancelled());

        let conn_check = conn.clone();
        rc_test_utils::assert_eventually(Duration::from_secs(2), move || {
            let cancelled = conn_check.is_cancelled();
            async move { cancelled }
        })
        .await
        .unwrap();
        let metrics_check = Arc::clone(&metrics);
        rc_test_utils::assert_eventually(Duration::from_secs(2), move || {
            let rooms = metrics_check.room_count();
            async move { rooms == 0 }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_dead_room_task_releases_its_router() {
        let engine = LoopbackEngine::new();
        let pool = test_pool(&engine).await;
        let metrics = ActorMetrics::new();
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let mut actor = RoomRegistryActor::new(
            "rc-test".to_string(),
            receiver,
            sender.downgrade(),
            CancellationToken::new(),
            Arc::clone(&pool),
            RoomSettings::default(),
            Arc::clone(&metrics),
        );

        let assignment = pool.assign_router().await.unwrap();
        let worker = engine.worker(assignment.worker_index).unwrap();
        let router = Arc::clone(&assignment.router);
        let (handle, task_handle) = RoomActor::spawn(
            RoomId::new("doomed"),
            assignment,
            RoomSettings::default(),
            None,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        metrics.room_created();

        // Dropped mid-run, the room never reaches its own router close.
        task_handle.abort();
        while !task_handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(worker.router_count(), 1);

        actor.rooms.insert(
            RoomId::new("doomed"),
            RoomEntry::Active(ManagedRoom {
                handle,
                task_handle,
                router,
            }),
        );
        actor.check_room_health().await;

        assert!(actor.rooms.is_empty());
        assert_eq!(metrics.room_count(), 0);
        rc_test_utils::assert_eventually(Duration::from_secs(2), || {
            let routers = worker.router_count();
            async move { routers == 0 }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_child_token_follows_registry() {
        let engine = LoopbackEngine::new();
        let (registry, _metrics) = registry_with(&engine, RoomSettings::default()).await;

        let child = registry.child_token();
        assert!(!child.is_cancelled());
        registry.cancel();
        assert!(child.is_cancelled());
    }
}
