//! `RoomActor` - per-room actor that owns all peer session state.
//!
//! Each `RoomActor`:
//! - Owns one router for its whole lifetime
//! - Owns every peer's transports, producers and consumers
//! - Serializes all mutations of the room through its mailbox
//! - Fans out producer lifecycle events to the other peers
//! - Samples the dominant speaker on a fixed interval
//!
//! # Engine calls
//!
//! Creating transports, producers and consumers can take a while. The actor
//! never awaits them inline: each call runs in its own task and its result
//! comes back through the mailbox as [`RoomMessage::Completed`], so other
//! peers are not blocked and completions are ordered with everything else.
//!
//! # Delivery
//!
//! Responses and `adminInfo` use non-blocking delivery; a peer whose queue
//! is full is evicted. Broadcasts are at-most-once: a full queue drops the
//! notification and counts it.

use super::connection::ConnectionActorHandle;
use super::messages::{
    ConsumerSnapshot, EngineCompletion, JoinAccepted, JoinRequest, PeerSnapshot,
    ProducerSnapshot, RequestContext, RoomMessage, RoomSnapshot, TransportDirection,
    TransportSnapshot,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::RoomRegistryHandle;
use crate::errors::RcError;
use crate::media::{
    EngineError, MediaConsumer, MediaProducer, MediaRouter, MediaTransport, RouterAssignment,
    TransportSettings, TransportState,
};
use crate::observability::metrics as prom;
use crate::speaker::{DominantSpeakerDetector, SpeakerEvent, SpeakerSettings};

use chrono::{DateTime, Utc};
use common::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
use serde_json::Value;
use signaling_protocol::messages::{
    response_action_for, AdminInfo, ConsumeRequest, ConsumerInfo, ConsumerRef,
    DominantSpeakerInfo, PeerStatus, ProduceRequest, ProducedInfo, ProducerClosedInfo,
    ProducerInfo, ProducerPauseState, ProducerRef, ProducerStateChange,
};
use signaling_protocol::rtp::{AppData, DtlsParameters};
use signaling_protocol::{ClientRequest, Envelope, ErrorBody, ErrorCode, ServerMessage};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Default room capacity.
pub const DEFAULT_MAX_PEERS: usize = 16;

/// Per-room settings.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub max_peers: usize,
    pub speaker: SpeakerSettings,
    pub transport: TransportSettings,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            speaker: SpeakerSettings::default(),
            transport: TransportSettings {
                listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                announced_ip: None,
                enable_udp: true,
                enable_tcp: true,
                prefer_udp: true,
                initial_available_outgoing_bitrate: 1_000_000,
            },
        }
    }
}

/// Handle to a `RoomActor`.
#[derive(Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Admit a peer.
    pub async fn join(&self, join: JoinRequest) -> Result<JoinAccepted, RcError> {
        let (tx, rx) = oneshot::channel();
        self.forward_join(join, tx).await?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Hand a join to the room, with the reply going to `respond_to`.
    ///
    /// If the room is gone the join is answered with an error here.
    pub async fn forward_join(
        &self,
        join: JoinRequest,
        respond_to: oneshot::Sender<Result<JoinAccepted, RcError>>,
    ) -> Result<(), RcError> {
        if let Err(mpsc::error::SendError(message)) = self
            .sender
            .send(RoomMessage::Join { join, respond_to })
            .await
        {
            if let RoomMessage::Join { respond_to, .. } = message {
                let _ = respond_to.send(Err(RcError::Internal("room closed".to_string())));
            }
            return Err(RcError::Internal(
                "channel send failed: room closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Forward a signaling request. The reply goes to the peer's connection.
    pub async fn signal(
        &self,
        peer_id: PeerId,
        request_id: Option<u64>,
        request: ClientRequest,
    ) -> Result<(), RcError> {
        self.sender
            .send(RoomMessage::Signal {
                peer_id,
                request_id,
                request,
            })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))
    }

    /// Notify the room that a peer's connection ended.
    pub async fn disconnect(&self, peer_id: PeerId) -> Result<(), RcError> {
        self.sender
            .send(RoomMessage::Disconnect { peer_id })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))
    }

    /// Full session dump.
    pub async fn snapshot(&self) -> Result<RoomSnapshot, RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetSnapshot { respond_to: tx })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))
    }

    /// Close the room if it has no peers. Returns whether it closed.
    pub async fn close_if_empty(&self) -> Result<bool, RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::CloseIfEmpty { respond_to: tx })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// What fills one transport slot of a peer.
enum TransportSlot {
    Empty,
    /// `createTransport` in flight.
    Creating,
    Ready(PeerTransport),
}

struct PeerTransport {
    transport: Arc<dyn MediaTransport>,
    state: TransportState,
    connecting: bool,
    connected: bool,
}

struct RoomProducer {
    producer: Arc<dyn MediaProducer>,
    app_data: AppData,
}

struct RoomConsumer {
    consumer: Arc<dyn MediaConsumer>,
    producer_peer: PeerId,
}

/// Server-side session of one peer.
struct Peer {
    peer_id: PeerId,
    connection: ConnectionActorHandle,
    /// Admission order, used for admin promotion and snapshot ordering.
    join_seq: u64,
    joined_at: DateTime<Utc>,
    is_admin: bool,
    status: Value,
    send: TransportSlot,
    recv: TransportSlot,
    /// In creation order.
    producers: Vec<RoomProducer>,
    consumers: HashMap<ConsumerId, RoomConsumer>,
    /// Producers with a consumer, existing or being created.
    consuming: HashSet<ProducerId>,
}

impl Peer {
    fn new(
        peer_id: PeerId,
        connection: ConnectionActorHandle,
        join_seq: u64,
        is_admin: bool,
    ) -> Self {
        Self {
            peer_id,
            connection,
            join_seq,
            joined_at: Utc::now(),
            is_admin,
            status: Value::Null,
            send: TransportSlot::Empty,
            recv: TransportSlot::Empty,
            producers: Vec::new(),
            consumers: HashMap::new(),
            consuming: HashSet::new(),
        }
    }

    fn slot(&self, direction: TransportDirection) -> &TransportSlot {
        match direction {
            TransportDirection::Send => &self.send,
            TransportDirection::Recv => &self.recv,
        }
    }

    fn slot_mut(&mut self, direction: TransportDirection) -> &mut TransportSlot {
        match direction {
            TransportDirection::Send => &mut self.send,
            TransportDirection::Recv => &mut self.recv,
        }
    }

    fn owns_transport(&self, direction: TransportDirection, transport_id: TransportId) -> bool {
        matches!(
            self.slot(direction),
            TransportSlot::Ready(slot) if slot.transport.id() == transport_id
        )
    }

    fn producer(&self, producer_id: ProducerId) -> Option<&RoomProducer> {
        self.producers
            .iter()
            .find(|p| p.producer.id() == producer_id)
    }

    fn producer_info(&self, producer: &RoomProducer) -> ProducerInfo {
        ProducerInfo {
            producer_id: producer.producer.id(),
            peer_id: self.peer_id,
            kind: producer.producer.kind(),
            app_data: producer.app_data.clone(),
            paused: producer.producer.is_paused(),
        }
    }

    fn snapshot(&self) -> PeerSnapshot {
        let transport = |slot: &TransportSlot| match slot {
            TransportSlot::Ready(t) => Some(TransportSnapshot {
                id: t.transport.id(),
                state: t.state,
                connected: t.connected,
            }),
            TransportSlot::Empty | TransportSlot::Creating => None,
        };

        let mut consumers: Vec<ConsumerSnapshot> = self
            .consumers
            .values()
            .map(|c| ConsumerSnapshot {
                id: c.consumer.id(),
                producer_id: c.consumer.producer_id(),
                producer_peer_id: c.producer_peer,
                kind: c.consumer.kind(),
                paused: c.consumer.is_paused(),
            })
            .collect();
        consumers.sort_by_key(|c| c.id);

        PeerSnapshot {
            peer_id: self.peer_id,
            is_admin: self.is_admin,
            joined_at: self.joined_at,
            status: self.status.clone(),
            send_transport: transport(&self.send),
            recv_transport: transport(&self.recv),
            producers: self
                .producers
                .iter()
                .map(|p| ProducerSnapshot {
                    id: p.producer.id(),
                    kind: p.producer.kind(),
                    paused: p.producer.is_paused(),
                    app_data: p.app_data.clone(),
                })
                .collect(),
            consumers,
        }
    }
}

type HandlerResult = Result<Option<ServerMessage>, RcError>;

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: RoomId,
    router: Arc<dyn MediaRouter>,
    worker_index: usize,
    created_at: DateTime<Utc>,
    settings: RoomSettings,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Used by engine-call and transport-watch tasks to re-enter the mailbox.
    self_sender: mpsc::WeakSender<RoomMessage>,
    cancel_token: CancellationToken,
    registry: Option<RoomRegistryHandle>,
    peers: HashMap<PeerId, Peer>,
    next_join_seq: u64,
    detector: DominantSpeakerDetector,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room bound to `assignment`'s router.
    ///
    /// `registry` is notified when the last peer leaves.
    pub fn spawn(
        room_id: RoomId,
        assignment: RouterAssignment,
        settings: RoomSettings,
        registry: Option<RoomRegistryHandle>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            router: assignment.router,
            worker_index: assignment.worker_index,
            created_at: Utc::now(),
            detector: DominantSpeakerDetector::new(settings.speaker.threshold_dbov),
            settings,
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            registry,
            peers: HashMap::new(),
            next_join_seq: 0,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, room_id.to_string()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "rc.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            router_id = %self.router.id(),
            worker_index = self.worker_index,
            "RoomActor started"
        );

        let mut speaker_tick = tokio::time::interval(self.settings.speaker.interval);
        speaker_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rc.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = speaker_tick.tick() => {
                    self.sample_speaker();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_processed(self.receiver.len());
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "rc.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            peers = self.peers.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: RoomMessage) -> bool {
        match message {
            RoomMessage::Join { join, respond_to } => {
                let result = self.admit_peer(join);
                let _ = respond_to.send(result);
            }

            RoomMessage::Signal {
                peer_id,
                request_id,
                request,
            } => {
                self.handle_request(peer_id, request_id, request);
            }

            RoomMessage::Disconnect { peer_id } => {
                self.remove_peer(peer_id);
            }

            RoomMessage::Completed { ctx, completion } => {
                self.handle_completion(ctx, completion);
            }

            RoomMessage::TransportStateChanged {
                peer_id,
                transport_id,
                state,
            } => {
                self.handle_transport_state(peer_id, transport_id, state);
            }

            RoomMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            RoomMessage::CloseIfEmpty { respond_to } => {
                if self.peers.is_empty() {
                    self.router.close().await;
                    info!(
                        target: "rc.actor.room",
                        room_id = %self.room_id,
                        router_id = %self.router.id(),
                        "Room empty, router closed"
                    );
                    let _ = respond_to.send(true);
                    return true;
                }
                let _ = respond_to.send(false);
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    fn admit_peer(&mut self, join: JoinRequest) -> Result<JoinAccepted, RcError> {
        let JoinRequest {
            peer_id,
            connection,
        } = join;

        if self.peers.len() >= self.settings.max_peers {
            prom::record_peer_join("room_full");
            warn!(
                target: "rc.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                max_peers = self.settings.max_peers,
                "Room is full, join rejected"
            );
            return Err(RcError::RoomFull(self.room_id.to_string()));
        }

        if self.peers.contains_key(&peer_id) {
            return Err(RcError::Conflict(format!("peer {peer_id} already joined")));
        }

        let room = self
            .handle()
            .ok_or_else(|| RcError::Internal("room is closing".to_string()))?;

        let is_admin = !self.peers.values().any(|p| p.is_admin);
        let join_seq = self.next_join_seq;
        self.next_join_seq += 1;

        let peer = Peer::new(peer_id, connection, join_seq, is_admin);
        let admin_info = ServerMessage::AdminInfo(AdminInfo { peer_id, is_admin });
        if let Some(envelope) = encode(admin_info, None) {
            self.deliver(&peer, envelope);
        }
        self.peers.insert(peer_id, peer);
        self.metrics.peer_joined();
        prom::record_peer_join("accepted");

        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            is_admin = is_admin,
            peers = self.peers.len(),
            "Peer admitted"
        );

        Ok(JoinAccepted {
            peer_id,
            is_admin,
            rtp_capabilities: self.router.rtp_capabilities(),
            room,
        })
    }

    /// Tear down a peer and everything it owns. Idempotent.
    fn remove_peer(&mut self, peer_id: PeerId) {
        let producer_ids: Vec<ProducerId> = match self.peers.get(&peer_id) {
            Some(peer) => peer.producers.iter().map(|p| p.producer.id()).collect(),
            None => return,
        };
        for producer_id in producer_ids {
            self.withdraw_producer(peer_id, producer_id);
        }

        let Some(peer) = self.peers.remove(&peer_id) else {
            return;
        };
        let was_admin = peer.is_admin;
        peer.connection.cancel();
        self.metrics.peer_left();

        let consumers: Vec<Arc<dyn MediaConsumer>> =
            peer.consumers.into_values().map(|c| c.consumer).collect();
        adjust_consumers(consumers.len(), false);
        let transports: Vec<Arc<dyn MediaTransport>> = [peer.send, peer.recv]
            .into_iter()
            .filter_map(|slot| match slot {
                TransportSlot::Ready(t) => Some(t.transport),
                TransportSlot::Empty | TransportSlot::Creating => None,
            })
            .collect();
        tokio::spawn(async move {
            for consumer in consumers {
                consumer.close().await;
            }
            for transport in transports {
                transport.close().await;
            }
        });

        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            remaining = self.peers.len(),
            "Peer left"
        );

        if was_admin {
            self.promote_admin();
        }

        if self.peers.is_empty() {
            if let Some(registry) = self.registry.clone() {
                let room_id = self.room_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = registry.room_emptied(room_id).await {
                        debug!(
                            target: "rc.actor.room",
                            error = %e,
                            "Registry gone, skipping empty notice"
                        );
                    }
                });
            }
        }
    }

    /// Hand the admin role to the earliest-joined remaining peer.
    fn promote_admin(&mut self) {
        let Some(next) = self.peers.values_mut().min_by_key(|p| p.join_seq) else {
            return;
        };
        next.is_admin = true;
        let peer_id = next.peer_id;

        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            "Administrator promoted"
        );

        if let (Some(peer), Some(envelope)) = (
            self.peers.get(&peer_id),
            encode(
                ServerMessage::AdminInfo(AdminInfo {
                    peer_id,
                    is_admin: true,
                }),
                None,
            ),
        ) {
            self.deliver(peer, envelope);
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    fn handle_request(&mut self, peer_id: PeerId, request_id: Option<u64>, request: ClientRequest) {
        let ctx = RequestContext {
            peer_id,
            request_id,
            action: request.action(),
            started: Instant::now(),
        };

        if !self.peers.contains_key(&peer_id) {
            debug!(
                target: "rc.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                action = ctx.action,
                "Request from unknown peer ignored"
            );
            return;
        }

        let result = match request {
            ClientRequest::GetRtpCapabilities => Ok(Some(ServerMessage::RtpCapabilities(
                self.router.rtp_capabilities(),
            ))),
            ClientRequest::CreateTransport => self.create_transport(ctx, TransportDirection::Send),
            ClientRequest::CreateConsumerTransport => {
                self.create_transport(ctx, TransportDirection::Recv)
            }
            ClientRequest::ConnectTransport(req) => {
                self.connect_transport(ctx, TransportDirection::Send, req.dtls_parameters)
            }
            ClientRequest::ConnectConsumerTransport(req) => {
                self.connect_transport(ctx, TransportDirection::Recv, req.dtls_parameters)
            }
            ClientRequest::DeviceReady => Ok(Some(ServerMessage::ExistingProducers(
                self.producers_visible_to(peer_id),
            ))),
            ClientRequest::Produce(req) => self.produce(ctx, req),
            ClientRequest::Consume(req) => self.consume(ctx, req),
            ClientRequest::ResumeConsumer(req) => self.resume_consumer(ctx, req.consumer_id),
            ClientRequest::ChangeProducerState(req) => self.change_producer_state(ctx, req),
            ClientRequest::CloseProducer(req) => self.close_producer(peer_id, req.producer_id),
            ClientRequest::UpdatePeerStatus(status) => {
                self.update_peer_status(peer_id, status);
                prom::record_signaling_request(ctx.action, "success", ctx.started.elapsed());
                return;
            }
        };

        match result {
            Ok(Some(message)) => self.respond(ctx, Ok(message)),
            Ok(None) => {}
            Err(e) => self.respond(ctx, Err(e)),
        }
    }

    fn create_transport(
        &mut self,
        ctx: RequestContext,
        direction: TransportDirection,
    ) -> HandlerResult {
        let peer = self
            .peers
            .get_mut(&ctx.peer_id)
            .ok_or(RcError::PeerNotFound(ctx.peer_id))?;
        let slot = peer.slot_mut(direction);
        if !matches!(slot, TransportSlot::Empty) {
            return Err(RcError::Conflict(format!(
                "{} transport already exists",
                direction.as_str()
            )));
        }
        *slot = TransportSlot::Creating;

        let router = Arc::clone(&self.router);
        let settings = self.settings.transport.clone();
        self.run_engine_call(ctx, async move {
            EngineCompletion::TransportCreated {
                direction,
                result: router.create_webrtc_transport(&settings).await,
            }
        });
        Ok(None)
    }

    fn connect_transport(
        &mut self,
        ctx: RequestContext,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    ) -> HandlerResult {
        let peer = self
            .peers
            .get_mut(&ctx.peer_id)
            .ok_or(RcError::PeerNotFound(ctx.peer_id))?;
        let TransportSlot::Ready(slot) = peer.slot_mut(direction) else {
            return Err(RcError::TransportNotFound(direction.as_str()));
        };
        if slot.connected || slot.connecting {
            return Err(RcError::Conflict(format!(
                "{} transport already connected",
                direction.as_str()
            )));
        }
        slot.connecting = true;

        let transport = Arc::clone(&slot.transport);
        self.run_engine_call(ctx, async move {
            EngineCompletion::TransportConnected {
                direction,
                transport_id: transport.id(),
                result: transport.connect(dtls_parameters).await,
            }
        });
        Ok(None)
    }

    fn produce(&mut self, ctx: RequestContext, request: ProduceRequest) -> HandlerResult {
        let peer = self
            .peers
            .get(&ctx.peer_id)
            .ok_or(RcError::PeerNotFound(ctx.peer_id))?;
        let TransportSlot::Ready(slot) = &peer.send else {
            return Err(RcError::TransportNotFound(TransportDirection::Send.as_str()));
        };
        let transport = Arc::clone(&slot.transport);

        let ProduceRequest {
            kind,
            rtp_parameters,
            mut app_data,
        } = request;
        // Owner is always stamped server-side.
        app_data.insert(
            "peerId".to_string(),
            Value::String(ctx.peer_id.to_string()),
        );

        self.run_engine_call(ctx, async move {
            EngineCompletion::Produced {
                transport_id: transport.id(),
                app_data,
                result: transport.produce(kind, rtp_parameters).await,
            }
        });
        Ok(None)
    }

    fn consume(&mut self, ctx: RequestContext, request: ConsumeRequest) -> HandlerResult {
        let producer_id = request.producer_id;
        let requester = self
            .peers
            .get(&ctx.peer_id)
            .ok_or(RcError::PeerNotFound(ctx.peer_id))?;
        let TransportSlot::Ready(slot) = &requester.recv else {
            return Err(RcError::TransportNotFound(TransportDirection::Recv.as_str()));
        };
        if !slot.connected {
            return Err(RcError::TransportNotConnected(
                TransportDirection::Recv.as_str(),
            ));
        }
        let transport = Arc::clone(&slot.transport);
        let already_consuming = requester.consuming.contains(&producer_id);

        let owner = self
            .producer_owner(producer_id)
            .ok_or(RcError::ProducerNotFound(producer_id))?;
        if owner == ctx.peer_id {
            return Err(RcError::SelfConsume(producer_id));
        }
        if already_consuming {
            return Err(RcError::AlreadyConsuming(producer_id));
        }
        if !self
            .router
            .can_consume(producer_id, &request.rtp_capabilities)
        {
            return Err(RcError::Incompatible(producer_id));
        }

        if let Some(peer) = self.peers.get_mut(&ctx.peer_id) {
            peer.consuming.insert(producer_id);
        }

        let capabilities = request.rtp_capabilities;
        self.run_engine_call(ctx, async move {
            EngineCompletion::Consumed {
                transport_id: transport.id(),
                producer_id,
                result: transport.consume(producer_id, &capabilities, true).await,
            }
        });
        Ok(None)
    }

    fn resume_consumer(&mut self, ctx: RequestContext, consumer_id: ConsumerId) -> HandlerResult {
        let consumer = self
            .peers
            .get(&ctx.peer_id)
            .and_then(|p| p.consumers.get(&consumer_id))
            .map(|c| Arc::clone(&c.consumer))
            .ok_or(RcError::ConsumerNotFound(consumer_id))?;

        self.run_engine_call(ctx, async move {
            EngineCompletion::ConsumerResumed {
                consumer_id,
                result: consumer.resume().await,
            }
        });
        Ok(None)
    }

    fn change_producer_state(
        &mut self,
        ctx: RequestContext,
        state: ProducerPauseState,
    ) -> HandlerResult {
        let producer = self.owned_producer(ctx.peer_id, state.producer_id)?;
        let ProducerPauseState {
            producer_id,
            paused,
        } = state;

        self.run_engine_call(ctx, async move {
            let result = if paused {
                producer.pause().await
            } else {
                producer.resume().await
            };
            EngineCompletion::ProducerPaused {
                producer_id,
                paused,
                result,
            }
        });
        Ok(None)
    }

    fn close_producer(&mut self, peer_id: PeerId, producer_id: ProducerId) -> HandlerResult {
        self.owned_producer(peer_id, producer_id)?;
        self.withdraw_producer(peer_id, producer_id);
        Ok(Some(ServerMessage::CloseProducerResponse(ProducerRef {
            producer_id,
        })))
    }

    fn update_peer_status(&mut self, peer_id: PeerId, status: Value) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        peer.status = status.clone();
        if peer.is_admin {
            return;
        }

        let Some(admin) = self.peers.values().find(|p| p.is_admin) else {
            return;
        };
        if let Some(envelope) = encode(
            ServerMessage::PeerStatusUpdated(PeerStatus { peer_id, status }),
            None,
        ) {
            self.notify(admin, envelope);
        }
    }

    // ------------------------------------------------------------------
    // Engine completions
    // ------------------------------------------------------------------

    /// Run `call` off the actor loop and feed its result back in.
    fn run_engine_call<F>(&self, ctx: RequestContext, call: F)
    where
        F: Future<Output = EngineCompletion> + Send + 'static,
    {
        let weak = self.self_sender.clone();
        tokio::spawn(async move {
            let completion = call.await;
            let Some(sender) = weak.upgrade() else {
                completion.discard().await;
                return;
            };
            if let Err(mpsc::error::SendError(RoomMessage::Completed { completion, .. })) =
                sender.send(RoomMessage::Completed { ctx, completion }).await
            {
                completion.discard().await;
            }
        });
    }

    fn handle_completion(&mut self, ctx: RequestContext, completion: EngineCompletion) {
        if !self.peers.contains_key(&ctx.peer_id) {
            debug!(
                target: "rc.actor.room",
                room_id = %self.room_id,
                peer_id = %ctx.peer_id,
                action = ctx.action,
                "Completion for departed peer discarded"
            );
            tokio::spawn(completion.discard());
            return;
        }

        match completion {
            EngineCompletion::TransportCreated { direction, result } => {
                self.on_transport_created(ctx, direction, result);
            }
            EngineCompletion::TransportConnected {
                direction,
                transport_id,
                result,
            } => {
                self.on_transport_connected(ctx, direction, transport_id, result);
            }
            EngineCompletion::Produced {
                transport_id,
                app_data,
                result,
            } => {
                self.on_produced(ctx, transport_id, app_data, result);
            }
            EngineCompletion::Consumed {
                transport_id,
                producer_id,
                result,
            } => {
                self.on_consumed(ctx, transport_id, producer_id, result);
            }
            EngineCompletion::ConsumerResumed {
                consumer_id,
                result,
            } => {
                let outcome = result
                    .map(|()| ServerMessage::ResumeConsumerResponse(ConsumerRef { consumer_id }))
                    .map_err(RcError::from);
                self.respond(ctx, outcome);
            }
            EngineCompletion::ProducerPaused {
                producer_id,
                paused,
                result,
            } => {
                self.on_producer_paused(ctx, producer_id, paused, result);
            }
        }
    }

    fn on_transport_created(
        &mut self,
        ctx: RequestContext,
        direction: TransportDirection,
        result: Result<Arc<dyn MediaTransport>, EngineError>,
    ) {
        let Some(peer) = self.peers.get_mut(&ctx.peer_id) else {
            return;
        };
        let slot = peer.slot_mut(direction);

        let transport = match result {
            Ok(transport) => transport,
            Err(e) => {
                *slot = TransportSlot::Empty;
                self.respond(ctx, Err(e.into()));
                return;
            }
        };

        if !matches!(slot, TransportSlot::Creating) {
            tokio::spawn(async move { transport.close().await });
            self.respond(
                ctx,
                Err(RcError::Conflict(format!(
                    "{} transport already exists",
                    direction.as_str()
                ))),
            );
            return;
        }

        let state_rx = transport.state_changes();
        let state = *state_rx.borrow();
        let descriptor = transport.descriptor();
        let transport_id = transport.id();
        *slot = TransportSlot::Ready(PeerTransport {
            transport,
            state,
            connecting: false,
            connected: false,
        });

        debug!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            peer_id = %ctx.peer_id,
            transport_id = %transport_id,
            direction = direction.as_str(),
            "Transport created"
        );

        self.watch_transport(ctx.peer_id, transport_id, state_rx);
        let message = match direction {
            TransportDirection::Send => ServerMessage::CreateTransportResponse(descriptor),
            TransportDirection::Recv => ServerMessage::CreateConsumerTransportResponse(descriptor),
        };
        self.respond(ctx, Ok(message));
    }

    fn on_transport_connected(
        &mut self,
        ctx: RequestContext,
        direction: TransportDirection,
        transport_id: TransportId,
        result: Result<(), EngineError>,
    ) {
        let outcome = match self.peers.get_mut(&ctx.peer_id).map(|p| p.slot_mut(direction)) {
            Some(TransportSlot::Ready(slot)) if slot.transport.id() == transport_id => {
                slot.connecting = false;
                match result {
                    Ok(()) => {
                        slot.connected = true;
                        Ok(match direction {
                            TransportDirection::Send => ServerMessage::TransportConnected,
                            TransportDirection::Recv => ServerMessage::ConsumerTransportConnected,
                        })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            _ => Err(RcError::TransportNotFound(direction.as_str())),
        };
        self.respond(ctx, outcome);
    }

    fn on_produced(
        &mut self,
        ctx: RequestContext,
        transport_id: TransportId,
        app_data: AppData,
        result: Result<Arc<dyn MediaProducer>, EngineError>,
    ) {
        let producer = match result {
            Ok(producer) => producer,
            Err(e) => {
                self.respond(ctx, Err(e.into()));
                return;
            }
        };

        let Some(peer) = self
            .peers
            .get_mut(&ctx.peer_id)
            .filter(|p| p.owns_transport(TransportDirection::Send, transport_id))
        else {
            tokio::spawn(async move { producer.close().await });
            self.respond(
                ctx,
                Err(RcError::TransportNotFound(TransportDirection::Send.as_str())),
            );
            return;
        };

        let producer_id = producer.id();
        let kind = producer.kind();
        let paused = producer.is_paused();
        peer.producers.push(RoomProducer {
            producer: Arc::clone(&producer),
            app_data: app_data.clone(),
        });
        prom::adjust_producers_active(1.0);
        self.detector.subscribe(producer, ctx.peer_id);

        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            peer_id = %ctx.peer_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            "Producer created"
        );

        self.respond(
            ctx,
            Ok(ServerMessage::ProduceResponse(ProducedInfo { id: producer_id })),
        );
        self.broadcast(
            Some(ctx.peer_id),
            ServerMessage::NewProducerAvailable(ProducerInfo {
                producer_id,
                peer_id: ctx.peer_id,
                kind,
                app_data,
                paused,
            }),
        );
    }

    fn on_consumed(
        &mut self,
        ctx: RequestContext,
        transport_id: TransportId,
        producer_id: ProducerId,
        result: Result<Arc<dyn MediaConsumer>, EngineError>,
    ) {
        let source = self
            .peers
            .values()
            .find_map(|p| p.producer(producer_id).map(|rp| (p.peer_id, rp.app_data.clone())));
        let transport_current = self
            .peers
            .get(&ctx.peer_id)
            .is_some_and(|p| p.owns_transport(TransportDirection::Recv, transport_id));

        let consumer = match result {
            Ok(consumer) => consumer,
            Err(e) => {
                if let Some(peer) = self.peers.get_mut(&ctx.peer_id) {
                    peer.consuming.remove(&producer_id);
                }
                self.respond(ctx, Err(e.into()));
                return;
            }
        };

        let (Some((owner, app_data)), true) = (source, transport_current) else {
            // Producer withdrawn or transport replaced while in flight.
            if let Some(peer) = self.peers.get_mut(&ctx.peer_id) {
                peer.consuming.remove(&producer_id);
            }
            let err = if transport_current {
                RcError::ProducerNotFound(producer_id)
            } else {
                RcError::TransportNotFound(TransportDirection::Recv.as_str())
            };
            tokio::spawn(async move { consumer.close().await });
            self.respond(ctx, Err(err));
            return;
        };

        let info = ConsumerInfo {
            id: consumer.id(),
            producer_id,
            peer_id: owner,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            app_data,
        };
        if let Some(peer) = self.peers.get_mut(&ctx.peer_id) {
            peer.consumers.insert(
                info.id,
                RoomConsumer {
                    consumer,
                    producer_peer: owner,
                },
            );
        }
        adjust_consumers(1, true);

        debug!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            peer_id = %ctx.peer_id,
            consumer_id = %info.id,
            producer_id = %producer_id,
            "Consumer created"
        );

        self.respond(ctx, Ok(ServerMessage::ConsumeResponse(info)));
    }

    fn on_producer_paused(
        &mut self,
        ctx: RequestContext,
        producer_id: ProducerId,
        paused: bool,
        result: Result<(), EngineError>,
    ) {
        if let Err(e) = result {
            self.respond(ctx, Err(e.into()));
            return;
        }
        let Some(kind) = self
            .peers
            .get(&ctx.peer_id)
            .and_then(|p| p.producer(producer_id))
            .map(|p| p.producer.kind())
        else {
            self.respond(ctx, Err(RcError::ProducerNotFound(producer_id)));
            return;
        };

        self.respond(
            ctx,
            Ok(ServerMessage::ChangeProducerStateResponse(
                ProducerPauseState {
                    producer_id,
                    paused,
                },
            )),
        );
        self.broadcast(
            Some(ctx.peer_id),
            ServerMessage::ProducerStateChanged(ProducerStateChange {
                producer_id,
                peer_id: ctx.peer_id,
                kind,
                paused,
            }),
        );
    }

    // ------------------------------------------------------------------
    // Transports and producers
    // ------------------------------------------------------------------

    /// Forward state changes of a transport into the mailbox until it ends.
    fn watch_transport(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        mut state_rx: watch::Receiver<TransportState>,
    ) {
        let weak = self.self_sender.clone();
        let token = self.cancel_token.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *state_rx.borrow_and_update();
                        let Some(sender) = weak.upgrade() else {
                            break;
                        };
                        let message = RoomMessage::TransportStateChanged {
                            peer_id,
                            transport_id,
                            state,
                        };
                        if sender.send(message).await.is_err() || state.is_terminal() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn handle_transport_state(
        &mut self,
        peer_id: PeerId,
        transport_id: TransportId,
        state: TransportState,
    ) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        let Some(direction) = [TransportDirection::Send, TransportDirection::Recv]
            .into_iter()
            .find(|d| peer.owns_transport(*d, transport_id))
        else {
            return;
        };

        if !state.is_terminal() {
            if let TransportSlot::Ready(slot) = peer.slot_mut(direction) {
                slot.state = state;
            }
            debug!(
                target: "rc.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                transport_id = %transport_id,
                state = state.as_str(),
                "Transport state changed"
            );
            return;
        }

        warn!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            transport_id = %transport_id,
            direction = direction.as_str(),
            state = state.as_str(),
            "Transport ended, releasing dependents"
        );

        let slot = std::mem::replace(peer.slot_mut(direction), TransportSlot::Empty);
        let mut released: Vec<Arc<dyn MediaConsumer>> = Vec::new();
        let withdrawn: Vec<ProducerId> = match direction {
            TransportDirection::Send => peer.producers.iter().map(|p| p.producer.id()).collect(),
            TransportDirection::Recv => {
                released = peer.consumers.drain().map(|(_, c)| c.consumer).collect();
                peer.consuming.clear();
                Vec::new()
            }
        };

        for producer_id in withdrawn {
            self.withdraw_producer(peer_id, producer_id);
        }
        adjust_consumers(released.len(), false);

        tokio::spawn(async move {
            for consumer in released {
                consumer.close().await;
            }
            if let TransportSlot::Ready(t) = slot {
                t.transport.close().await;
            }
        });
    }

    /// Remove a producer, close its consumers in other peers and tell them.
    fn withdraw_producer(&mut self, owner: PeerId, producer_id: ProducerId) -> bool {
        let Some(peer) = self.peers.get_mut(&owner) else {
            return false;
        };
        let Some(index) = peer
            .producers
            .iter()
            .position(|p| p.producer.id() == producer_id)
        else {
            return false;
        };
        let removed = peer.producers.remove(index);
        self.detector.unsubscribe(producer_id);
        prom::adjust_producers_active(-1.0);

        let mut orphaned: Vec<Arc<dyn MediaConsumer>> = Vec::new();
        for (peer_id, other) in &mut self.peers {
            if *peer_id == owner {
                continue;
            }
            other.consuming.remove(&producer_id);
            other.consumers.retain(|_, c| {
                if c.consumer.producer_id() == producer_id {
                    orphaned.push(Arc::clone(&c.consumer));
                    false
                } else {
                    true
                }
            });
        }
        adjust_consumers(orphaned.len(), false);

        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            peer_id = %owner,
            producer_id = %producer_id,
            consumers_closed = orphaned.len(),
            "Producer closed"
        );

        tokio::spawn(async move {
            for consumer in orphaned {
                consumer.close().await;
            }
            removed.producer.close().await;
        });

        self.broadcast(
            Some(owner),
            ServerMessage::ProducerClosed(ProducerClosedInfo {
                producer_id,
                peer_id: owner,
            }),
        );
        true
    }

    fn producer_owner(&self, producer_id: ProducerId) -> Option<PeerId> {
        self.peers
            .values()
            .find(|p| p.producer(producer_id).is_some())
            .map(|p| p.peer_id)
    }

    /// The producer if `peer_id` owns it.
    fn owned_producer(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
    ) -> Result<Arc<dyn MediaProducer>, RcError> {
        match self.producer_owner(producer_id) {
            Some(owner) if owner == peer_id => self
                .peers
                .get(&peer_id)
                .and_then(|p| p.producer(producer_id))
                .map(|p| Arc::clone(&p.producer))
                .ok_or(RcError::ProducerNotFound(producer_id)),
            Some(_) => Err(RcError::Forbidden(format!(
                "producer {producer_id} belongs to another peer"
            ))),
            None => Err(RcError::ProducerNotFound(producer_id)),
        }
    }

    /// Producers of every other peer, in join order then creation order.
    fn producers_visible_to(&self, peer_id: PeerId) -> Vec<ProducerInfo> {
        let mut peers: Vec<&Peer> = self
            .peers
            .values()
            .filter(|p| p.peer_id != peer_id)
            .collect();
        peers.sort_by_key(|p| p.join_seq);
        peers
            .into_iter()
            .flat_map(|p| p.producers.iter().map(move |rp| p.producer_info(rp)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Dominant speaker
    // ------------------------------------------------------------------

    fn sample_speaker(&mut self) {
        let Some(event) = self.detector.sample() else {
            return;
        };
        let info = match event {
            SpeakerEvent::Changed {
                producer_id,
                peer_id,
            } => DominantSpeakerInfo {
                producer_id: Some(producer_id),
                peer_id: Some(peer_id),
            },
            SpeakerEvent::Silence => DominantSpeakerInfo::default(),
        };
        prom::record_dominant_speaker_change();
        debug!(
            target: "rc.speaker",
            room_id = %self.room_id,
            producer_id = ?info.producer_id,
            peer_id = ?info.peer_id,
            "Dominant speaker changed"
        );
        self.broadcast(None, ServerMessage::DominantSpeaker(info));
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Answer a request. Requests without a response action get nothing.
    fn respond(&self, ctx: RequestContext, result: Result<ServerMessage, RcError>) {
        let outcome = if result.is_ok() { "success" } else { "error" };
        prom::record_signaling_request(ctx.action, outcome, ctx.started.elapsed());

        let Some(peer) = self.peers.get(&ctx.peer_id) else {
            return;
        };
        let Some(response_action) = response_action_for(ctx.action) else {
            return;
        };

        let envelope = match result {
            Ok(message) => match message.into_envelope(ctx.request_id) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(
                        target: "rc.actor.room",
                        action = response_action,
                        error = %e,
                        "Failed to encode response"
                    );
                    Envelope::error_response(
                        response_action,
                        ctx.request_id,
                        ErrorBody::new(ErrorCode::InternalError, "An internal error occurred"),
                    )
                }
            },
            Err(e) => {
                if e.error_code() == ErrorCode::InternalError {
                    error!(
                        target: "rc.actor.room",
                        room_id = %self.room_id,
                        peer_id = %ctx.peer_id,
                        action = ctx.action,
                        error = %e,
                        "Request failed"
                    );
                } else {
                    debug!(
                        target: "rc.actor.room",
                        room_id = %self.room_id,
                        peer_id = %ctx.peer_id,
                        action = ctx.action,
                        error = %e,
                        "Request rejected"
                    );
                }
                Envelope::error_response(response_action, ctx.request_id, e.to_error_body())
            }
        };
        self.deliver(peer, envelope);
    }

    /// Deliver a message the peer must not miss. A peer that cannot keep
    /// up is disconnected.
    fn deliver(&self, peer: &Peer, envelope: Envelope) {
        match peer.connection.try_deliver(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    target: "rc.actor.room",
                    room_id = %self.room_id,
                    peer_id = %peer.peer_id,
                    "Outbound queue full, evicting peer"
                );
                peer.connection.cancel();
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    target: "rc.actor.room",
                    peer_id = %peer.peer_id,
                    "Connection closed, response dropped"
                );
            }
        }
    }

    /// Best-effort notification.
    fn notify(&self, peer: &Peer, envelope: Envelope) {
        match peer.connection.try_deliver(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                self.metrics.record_broadcast_dropped();
                warn!(
                    target: "rc.actor.room",
                    room_id = %self.room_id,
                    peer_id = %peer.peer_id,
                    action = %envelope.action,
                    "Outbound queue full, notification dropped"
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn broadcast(&self, except: Option<PeerId>, message: ServerMessage) {
        let Some(envelope) = encode(message, None) else {
            return;
        };
        for peer in self.peers.values() {
            if Some(peer.peer_id) != except {
                self.notify(peer, envelope.clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn handle(&self) -> Option<RoomActorHandle> {
        self.self_sender.upgrade().map(|sender| RoomActorHandle {
            sender,
            cancel_token: self.cancel_token.clone(),
            room_id: self.room_id.clone(),
        })
    }

    fn snapshot(&self) -> RoomSnapshot {
        let dominant_speaker = self
            .detector
            .current()
            .map(|(producer_id, peer_id)| DominantSpeakerInfo {
                producer_id: Some(producer_id),
                peer_id: Some(peer_id),
            })
            .unwrap_or_default();

        let mut peers: Vec<&Peer> = self.peers.values().collect();
        peers.sort_by_key(|p| p.join_seq);

        RoomSnapshot {
            room_id: self.room_id.clone(),
            router_id: self.router.id(),
            worker_index: self.worker_index,
            created_at: self.created_at,
            dominant_speaker,
            peers: peers.into_iter().map(Peer::snapshot).collect(),
        }
    }

    /// Perform graceful shutdown.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            peers = self.peers.len(),
            "Performing graceful shutdown"
        );

        for (_, peer) in self.peers.drain() {
            peer.connection.cancel();
            self.metrics.peer_left();
            adjust_consumers(peer.consumers.len(), false);
            for consumer in peer.consumers.into_values() {
                consumer.consumer.close().await;
            }
            for producer in peer.producers {
                prom::adjust_producers_active(-1.0);
                producer.producer.close().await;
            }
            for slot in [peer.send, peer.recv] {
                if let TransportSlot::Ready(t) = slot {
                    t.transport.close().await;
                }
            }
        }

        self.router.close().await;

        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            "Graceful shutdown complete"
        );
    }
}

fn encode(message: ServerMessage, request_id: Option<u64>) -> Option<Envelope> {
    let action = message.action();
    match message.into_envelope(request_id) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            error!(
                target: "rc.actor.room",
                action = action,
                error = %e,
                "Failed to encode message"
            );
            None
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn adjust_consumers(count: usize, added: bool) {
    if count == 0 {
        return;
    }
    let delta = count as f64;
    prom::adjust_consumers_active(if added { delta } else { -delta });
}
