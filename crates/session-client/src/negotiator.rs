//! `SessionNegotiator` - client side of the room signaling protocol.
//!
//! One actor per session. It owns the [`Device`], the correlation table and
//! the pending-consume queue, and is driven by two inputs:
//!
//! - Envelopes from the server, handed in with [`NegotiatorHandle::deliver`]
//! - Commands from the application (mute, screen share, presence, leave)
//!
//! Outbound envelopes go to the `outbound` channel; whoever owns the socket
//! writes them. Dropping the actor drops that sender, which is the signal to
//! close the socket.
//!
//! # Ordering
//!
//! - `connectTransport` goes out as soon as the send transport exists
//! - Local tracks are produced after `transportConnected`
//! - `deviceReady` goes out once every initial `produce` is answered
//! - Producers announced before the receive transport is connected wait in
//!   a [`PendingConsumeQueue`] and are consumed in arrival order once
//!   `consumerTransportConnected` arrives

use crate::correlation::{Continuation, PendingRequests};
use crate::device::Device;
use crate::errors::ClientError;
use crate::events::SessionEvent;
use crate::queue::PendingConsumeQueue;
use crate::state::{LocalTrack, NegotiatorState, TrackSource};

use common::types::{ConsumerId, PeerId, ProducerId};
use serde_json::Value;
use signaling_protocol::messages::{
    ConnectTransportRequest, ConsumeRequest, ConsumerInfo, ConsumerRef, ProduceRequest,
    ProducedInfo, ProducerInfo, ProducerPauseState, ProducerRef,
};
use signaling_protocol::rtp::{AppData, RtpCapabilities, TransportDescriptor};
use signaling_protocol::{ClientRequest, Envelope, ErrorBody, ErrorCode, ServerMessage};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the negotiator mailbox.
const NEGOTIATOR_CHANNEL_BUFFER: usize = 256;

type Reply = oneshot::Sender<Result<(), ClientError>>;

/// Messages handled by the negotiator.
enum NegotiatorMessage {
    Inbound(Envelope),
    ConnectionClosed,
    SetTrackEnabled {
        source: TrackSource,
        enabled: bool,
        respond_to: Reply,
    },
    StartScreenShare {
        respond_to: Reply,
    },
    StopScreenShare {
        respond_to: Reply,
    },
    UpdatePresence {
        status: Value,
        respond_to: Reply,
    },
    GetStatus {
        respond_to: oneshot::Sender<NegotiatorStatus>,
    },
    Leave {
        respond_to: oneshot::Sender<()>,
    },
}

/// A local track the server accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalProducer {
    pub producer_id: ProducerId,
    pub paused: bool,
}

/// Point-in-time view of a negotiator.
#[derive(Debug, Clone)]
pub struct NegotiatorStatus {
    pub state: NegotiatorState,
    pub peer_id: Option<PeerId>,
    pub is_admin: bool,
    pub producers: HashMap<TrackSource, LocalProducer>,
    /// Consumer -> producer it receives.
    pub consumers: HashMap<ConsumerId, ProducerId>,
    pub pending_consumes: usize,
    pub requests_in_flight: usize,
}

/// Handle to a `SessionNegotiator`.
#[derive(Clone, Debug)]
pub struct NegotiatorHandle {
    sender: mpsc::Sender<NegotiatorMessage>,
    cancel_token: CancellationToken,
}

impl NegotiatorHandle {
    /// Hand a server envelope to the negotiator.
    pub async fn deliver(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.send(NegotiatorMessage::Inbound(envelope)).await
    }

    /// The signaling connection ended.
    pub async fn connection_closed(&self) -> Result<(), ClientError> {
        self.send(NegotiatorMessage::ConnectionClosed).await
    }

    /// Mute or unmute the microphone.
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), ClientError> {
        self.request(|respond_to| NegotiatorMessage::SetTrackEnabled {
            source: TrackSource::Mic,
            enabled,
            respond_to,
        })
        .await
    }

    /// Turn the camera on or off.
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), ClientError> {
        self.request(|respond_to| NegotiatorMessage::SetTrackEnabled {
            source: TrackSource::Webcam,
            enabled,
            respond_to,
        })
        .await
    }

    pub async fn start_screen_share(&self) -> Result<(), ClientError> {
        self.request(|respond_to| NegotiatorMessage::StartScreenShare { respond_to })
            .await
    }

    pub async fn stop_screen_share(&self) -> Result<(), ClientError> {
        self.request(|respond_to| NegotiatorMessage::StopScreenShare { respond_to })
            .await
    }

    /// Send a presence signal to the room administrator.
    pub async fn update_presence(&self, status: Value) -> Result<(), ClientError> {
        self.request(|respond_to| NegotiatorMessage::UpdatePresence { status, respond_to })
            .await
    }

    pub async fn status(&self) -> Result<NegotiatorStatus, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(NegotiatorMessage::GetStatus { respond_to: tx })
            .await?;

        rx.await
            .map_err(|e| ClientError::Internal(format!("response receive failed: {e}")))
    }

    /// Release every local resource and end the session.
    pub async fn leave(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(NegotiatorMessage::Leave { respond_to: tx }).await?;

        rx.await
            .map_err(|e| ClientError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, message: NegotiatorMessage) -> Result<(), ClientError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| ClientError::Internal(format!("channel send failed: {e}")))
    }

    async fn request<F>(&self, message: F) -> Result<(), ClientError>
    where
        F: FnOnce(Reply) -> NegotiatorMessage,
    {
        let (tx, rx) = oneshot::channel();
        self.send(message(tx)).await?;

        rx.await
            .map_err(|e| ClientError::Internal(format!("response receive failed: {e}")))?
    }
}

/// Receive-transport progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvTransport {
    Empty,
    Creating,
    Connecting,
    Connected,
}

/// The `SessionNegotiator` implementation.
pub struct SessionNegotiator<D: Device> {
    device: D,
    receiver: mpsc::Receiver<NegotiatorMessage>,
    outbound: mpsc::Sender<Envelope>,
    events: mpsc::Sender<SessionEvent>,
    cancel_token: CancellationToken,
    /// Tracks published on join.
    tracks: Vec<LocalTrack>,
    state: NegotiatorState,
    peer_id: Option<PeerId>,
    is_admin: bool,
    pending: PendingRequests,
    queue: PendingConsumeQueue,
    send_connected: bool,
    /// Initial produces not answered yet.
    initial_produces: usize,
    device_ready_sent: bool,
    recv: RecvTransport,
    producers: HashMap<TrackSource, LocalProducer>,
    /// Sources with a `produce` in flight.
    producing: HashSet<TrackSource>,
    consumers: HashMap<ConsumerId, ProducerId>,
    consumer_by_producer: HashMap<ProducerId, ConsumerId>,
    /// Producers that closed while their `consume` was in flight.
    closed_in_flight: HashSet<ProducerId>,
    messages_processed: u64,
}

impl<D: Device> SessionNegotiator<D> {
    /// Spawn a negotiator. It starts with `getRtpCapabilities` right away,
    /// so call this once the signaling connection is open.
    pub fn spawn(
        tracks: Vec<LocalTrack>,
        device: D,
        outbound: mpsc::Sender<Envelope>,
        events: mpsc::Sender<SessionEvent>,
        cancel_token: CancellationToken,
    ) -> (NegotiatorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(NEGOTIATOR_CHANNEL_BUFFER);

        let actor = Self {
            device,
            receiver,
            outbound,
            events,
            cancel_token: cancel_token.clone(),
            tracks,
            state: NegotiatorState::Connecting,
            peer_id: None,
            is_admin: false,
            pending: PendingRequests::new(),
            queue: PendingConsumeQueue::new(),
            send_connected: false,
            initial_produces: 0,
            device_ready_sent: false,
            recv: RecvTransport::Empty,
            producers: HashMap::new(),
            producing: HashSet::new(),
            consumers: HashMap::new(),
            consumer_by_producer: HashMap::new(),
            closed_in_flight: HashSet::new(),
            messages_processed: 0,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = NegotiatorHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sc.negotiator")]
    async fn run(mut self) {
        info!(
            target: "sc.negotiator",
            tracks = self.tracks.len(),
            "SessionNegotiator started"
        );

        let final_state = match self.event_loop().await {
            Ok(()) => NegotiatorState::Closed,
            Err(ClientError::ConnectionClosed) => {
                info!(target: "sc.negotiator", "Outbound channel closed");
                NegotiatorState::Closed
            }
            Err(e) => {
                error!(
                    target: "sc.negotiator",
                    state = %self.state,
                    error = %e,
                    "Session negotiation failed"
                );
                NegotiatorState::Failed
            }
        };
        self.close(final_state).await;

        info!(
            target: "sc.negotiator",
            peer_id = ?self.peer_id,
            state = %self.state,
            messages_processed = self.messages_processed,
            "SessionNegotiator stopped"
        );
    }

    /// Returns `Ok` on an orderly end, `Err` when the session cannot go on.
    async fn event_loop(&mut self) -> Result<(), ClientError> {
        self.emit(SessionEvent::StateChanged(self.state)).await;
        self.send_request(ClientRequest::GetRtpCapabilities, Continuation::LoadDevice)
            .await?;

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sc.negotiator",
                        "SessionNegotiator received cancellation signal"
                    );
                    return Ok(());
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        return Ok(());
                    };
                    self.messages_processed += 1;
                    if self.handle_message(message).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Handle a single message. Returns true if the negotiator should exit.
    async fn handle_message(&mut self, message: NegotiatorMessage) -> Result<bool, ClientError> {
        match message {
            NegotiatorMessage::Inbound(envelope) => {
                self.handle_inbound(envelope).await?;
            }
            NegotiatorMessage::ConnectionClosed => {
                info!(target: "sc.negotiator", "Signaling connection closed");
                return Ok(true);
            }
            NegotiatorMessage::SetTrackEnabled {
                source,
                enabled,
                respond_to,
            } => {
                let result = self.set_track_enabled(source, enabled).await;
                answer(respond_to, result)?;
            }
            NegotiatorMessage::StartScreenShare { respond_to } => {
                let result = self.start_screen_share().await;
                answer(respond_to, result)?;
            }
            NegotiatorMessage::StopScreenShare { respond_to } => {
                let result = self.stop_screen_share().await;
                answer(respond_to, result)?;
            }
            NegotiatorMessage::UpdatePresence { status, respond_to } => {
                let result = self
                    .send_notification(ClientRequest::UpdatePeerStatus(status))
                    .await;
                answer(respond_to, result)?;
            }
            NegotiatorMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            NegotiatorMessage::Leave { respond_to } => {
                info!(target: "sc.negotiator", peer_id = ?self.peer_id, "Leaving session");
                let _ = respond_to.send(());
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    async fn handle_inbound(&mut self, mut envelope: Envelope) -> Result<(), ClientError> {
        if let Some(continuation) = envelope.request_id.and_then(|id| self.pending.resolve(id)) {
            return self.resolve(continuation, envelope).await;
        }

        if let Some(error) = envelope.error.take() {
            warn!(
                target: "sc.negotiator",
                action = %envelope.action,
                request_id = ?envelope.request_id,
                code = ?error.code,
                message = %error.message,
                "Uncorrelated error from server"
            );
            self.emit(SessionEvent::RequestFailed {
                action: envelope.action,
                error,
            })
            .await;
            return Ok(());
        }

        match ServerMessage::from_envelope(envelope) {
            Ok(message) => self.handle_broadcast(message).await,
            Err(e) => {
                warn!(target: "sc.negotiator", error = %e, "Ignoring unexpected server message");
                Ok(())
            }
        }
    }

    /// Run the continuation of a request with its response.
    async fn resolve(
        &mut self,
        continuation: Continuation,
        mut envelope: Envelope,
    ) -> Result<(), ClientError> {
        if let Some(error) = envelope.error.take() {
            return self.request_failed(continuation, error).await;
        }

        let message = ServerMessage::from_envelope(envelope)?;
        match (continuation, message) {
            (Continuation::LoadDevice, ServerMessage::RtpCapabilities(capabilities)) => {
                self.on_capabilities(&capabilities).await
            }
            (
                Continuation::CreateSendTransport,
                ServerMessage::CreateTransportResponse(descriptor),
            ) => self.on_send_transport(&descriptor).await,
            (Continuation::SendTransportConnected, ServerMessage::TransportConnected) => {
                self.on_send_transport_connected().await
            }
            (
                Continuation::Produced { track, initial },
                ServerMessage::ProduceResponse(produced),
            ) => self.on_produced(track, initial, produced).await,
            (Continuation::ExistingProducers, ServerMessage::ExistingProducers(producers)) => {
                self.on_existing_producers(producers).await
            }
            (
                Continuation::CreateRecvTransport,
                ServerMessage::CreateConsumerTransportResponse(descriptor),
            ) => self.on_recv_transport(&descriptor).await,
            (Continuation::RecvTransportConnected, ServerMessage::ConsumerTransportConnected) => {
                self.on_recv_transport_connected().await
            }
            (Continuation::Consumed { producer }, ServerMessage::ConsumeResponse(consumer)) => {
                self.on_consumed(&producer, consumer).await
            }
            (
                Continuation::ConsumerResumed { consumer_id },
                ServerMessage::ResumeConsumerResponse(_),
            ) => {
                debug!(target: "sc.negotiator", consumer_id = %consumer_id, "Consumer resumed");
                Ok(())
            }
            (
                Continuation::ProducerStateChanged {
                    producer_id,
                    paused,
                },
                ServerMessage::ChangeProducerStateResponse(_),
            ) => {
                debug!(
                    target: "sc.negotiator",
                    producer_id = %producer_id,
                    paused,
                    "Producer state acknowledged"
                );
                Ok(())
            }
            (
                Continuation::ProducerClosed { producer_id },
                ServerMessage::CloseProducerResponse(_),
            ) => {
                debug!(
                    target: "sc.negotiator",
                    producer_id = %producer_id,
                    "Producer close acknowledged"
                );
                Ok(())
            }
            (continuation, message) => Err(ClientError::UnexpectedResponse {
                expected: continuation.expected_action(),
                actual: message.action().to_string(),
            }),
        }
    }

    /// A request was answered with an error.
    async fn request_failed(
        &mut self,
        continuation: Continuation,
        error: ErrorBody,
    ) -> Result<(), ClientError> {
        let action = continuation.expected_action();
        match continuation {
            Continuation::Consumed { producer } => {
                if self.closed_in_flight.remove(&producer.producer_id) {
                    debug!(
                        target: "sc.negotiator",
                        producer_id = %producer.producer_id,
                        code = ?error.code,
                        "Consume for closed producer rejected"
                    );
                    return Ok(());
                }
                if error.code == ErrorCode::AlreadyConsuming {
                    debug!(
                        target: "sc.negotiator",
                        producer_id = %producer.producer_id,
                        "Already consuming producer"
                    );
                    return Ok(());
                }
            }
            Continuation::Produced { track, initial } => {
                self.producing.remove(&track.source);
                self.device.close_producer(track.source).await;
                if initial {
                    self.initial_produce_settled().await?;
                }
            }
            Continuation::LoadDevice
            | Continuation::CreateSendTransport
            | Continuation::SendTransportConnected
            | Continuation::ExistingProducers
            | Continuation::CreateRecvTransport
            | Continuation::RecvTransportConnected => {
                self.emit(SessionEvent::RequestFailed {
                    action: action.to_string(),
                    error: error.clone(),
                })
                .await;
                return Err(ClientError::Rejected { action, error });
            }
            Continuation::ConsumerResumed { .. }
            | Continuation::ProducerStateChanged { .. }
            | Continuation::ProducerClosed { .. } => {}
        }

        warn!(
            target: "sc.negotiator",
            action,
            code = ?error.code,
            message = %error.message,
            "Request failed"
        );
        self.emit(SessionEvent::RequestFailed {
            action: action.to_string(),
            error,
        })
        .await;
        Ok(())
    }

    async fn handle_broadcast(&mut self, message: ServerMessage) -> Result<(), ClientError> {
        match message {
            ServerMessage::AdminInfo(info) => {
                self.peer_id = Some(info.peer_id);
                self.is_admin = info.is_admin;
                info!(
                    target: "sc.negotiator",
                    peer_id = %info.peer_id,
                    is_admin = info.is_admin,
                    "Admin info received"
                );
                self.emit(SessionEvent::AdminInfo {
                    peer_id: info.peer_id,
                    is_admin: info.is_admin,
                })
                .await;
            }
            ServerMessage::NewProducerAvailable(producer) => {
                self.offer(producer).await?;
            }
            ServerMessage::ProducerClosed(closed) => {
                self.on_producer_closed(closed.producer_id).await;
            }
            ServerMessage::ProducerStateChanged(change) => {
                self.emit(SessionEvent::RemoteProducerStateChanged(change))
                    .await;
            }
            ServerMessage::DominantSpeaker(speaker) => {
                self.emit(SessionEvent::DominantSpeakerChanged(speaker))
                    .await;
            }
            ServerMessage::PeerStatusUpdated(update) => {
                self.emit(SessionEvent::PeerStatusUpdated {
                    peer_id: update.peer_id,
                    status: update.status,
                })
                .await;
            }
            other => {
                debug!(
                    target: "sc.negotiator",
                    action = other.action(),
                    "Ignoring uncorrelated response"
                );
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Send side
    // ------------------------------------------------------------------------

    async fn on_capabilities(&mut self, capabilities: &RtpCapabilities) -> Result<(), ClientError> {
        self.device.load(capabilities).await?;
        self.set_state(NegotiatorState::CapabilitiesExchanged).await;
        self.send_request(ClientRequest::CreateTransport, Continuation::CreateSendTransport)
            .await
    }

    async fn on_send_transport(
        &mut self,
        descriptor: &TransportDescriptor,
    ) -> Result<(), ClientError> {
        let dtls_parameters = self.device.create_send_transport(descriptor).await?;
        self.set_state(NegotiatorState::SendTransportReady).await;
        debug!(target: "sc.negotiator", transport_id = %descriptor.id, "Send transport created");
        self.send_request(
            ClientRequest::ConnectTransport(ConnectTransportRequest { dtls_parameters }),
            Continuation::SendTransportConnected,
        )
        .await
    }

    async fn on_send_transport_connected(&mut self) -> Result<(), ClientError> {
        self.send_connected = true;
        self.set_state(NegotiatorState::Producing).await;

        let tracks = self.tracks.clone();
        self.initial_produces = tracks.len();
        if tracks.is_empty() {
            return self.send_device_ready().await;
        }
        for track in tracks {
            self.produce(track, true).await?;
        }
        Ok(())
    }

    /// Start producing `track`. A local failure of an initial track only
    /// skips that track.
    async fn produce(&mut self, track: LocalTrack, initial: bool) -> Result<(), ClientError> {
        let rtp_parameters = match self.device.produce(&track).await {
            Ok(parameters) => parameters,
            Err(e) if initial => {
                warn!(
                    target: "sc.negotiator",
                    source = %track.source,
                    error = %e,
                    "Local track could not be produced"
                );
                return self.initial_produce_settled().await;
            }
            Err(e) => return Err(e.into()),
        };

        let mut app_data = AppData::new();
        app_data.insert(
            "source".to_string(),
            Value::String(track.source.as_str().to_string()),
        );

        self.producing.insert(track.source);
        debug!(target: "sc.negotiator", source = %track.source, kind = %track.kind, "Producing");
        self.send_request(
            ClientRequest::Produce(ProduceRequest {
                kind: track.kind,
                rtp_parameters,
                app_data,
            }),
            Continuation::Produced { track, initial },
        )
        .await
    }

    async fn on_produced(
        &mut self,
        track: LocalTrack,
        initial: bool,
        produced: ProducedInfo,
    ) -> Result<(), ClientError> {
        self.producing.remove(&track.source);
        self.producers.insert(
            track.source,
            LocalProducer {
                producer_id: produced.id,
                paused: false,
            },
        );
        info!(
            target: "sc.negotiator",
            source = %track.source,
            producer_id = %produced.id,
            "Producer created"
        );
        self.emit(SessionEvent::ProducerCreated {
            source: track.source,
            producer_id: produced.id,
        })
        .await;

        if initial {
            self.initial_produce_settled().await?;
        }
        Ok(())
    }

    async fn initial_produce_settled(&mut self) -> Result<(), ClientError> {
        self.initial_produces = self.initial_produces.saturating_sub(1);
        if self.initial_produces == 0 && !self.device_ready_sent {
            return self.send_device_ready().await;
        }
        Ok(())
    }

    async fn send_device_ready(&mut self) -> Result<(), ClientError> {
        self.device_ready_sent = true;
        self.send_request(ClientRequest::DeviceReady, Continuation::ExistingProducers)
            .await
    }

    // ------------------------------------------------------------------------
    // Receive side
    // ------------------------------------------------------------------------

    async fn on_existing_producers(
        &mut self,
        producers: Vec<ProducerInfo>,
    ) -> Result<(), ClientError> {
        debug!(
            target: "sc.negotiator",
            count = producers.len(),
            "Existing producers received"
        );
        for producer in producers {
            self.offer(producer).await?;
        }

        if self.recv == RecvTransport::Empty {
            self.recv = RecvTransport::Creating;
            self.send_request(
                ClientRequest::CreateConsumerTransport,
                Continuation::CreateRecvTransport,
            )
            .await?;
        }
        Ok(())
    }

    /// A producer became visible: consume it now or queue it.
    async fn offer(&mut self, producer: ProducerInfo) -> Result<(), ClientError> {
        let producer_id = producer.producer_id;
        if self.consumer_by_producer.contains_key(&producer_id)
            || self.pending.is_consuming(producer_id)
            || self.queue.contains(producer_id)
        {
            debug!(
                target: "sc.negotiator",
                producer_id = %producer_id,
                "Duplicate producer announcement ignored"
            );
            return Ok(());
        }

        if self.recv == RecvTransport::Connected {
            self.consume(producer).await
        } else {
            debug!(
                target: "sc.negotiator",
                producer_id = %producer_id,
                "Queued until receive transport connects"
            );
            self.queue.push(producer);
            Ok(())
        }
    }

    async fn on_recv_transport(
        &mut self,
        descriptor: &TransportDescriptor,
    ) -> Result<(), ClientError> {
        let dtls_parameters = self.device.create_recv_transport(descriptor).await?;
        self.recv = RecvTransport::Connecting;
        self.set_state(NegotiatorState::RecvTransportReady).await;
        debug!(target: "sc.negotiator", transport_id = %descriptor.id, "Receive transport created");
        self.send_request(
            ClientRequest::ConnectConsumerTransport(ConnectTransportRequest { dtls_parameters }),
            Continuation::RecvTransportConnected,
        )
        .await
    }

    async fn on_recv_transport_connected(&mut self) -> Result<(), ClientError> {
        self.recv = RecvTransport::Connected;
        self.set_state(NegotiatorState::ConsumingSteadyState).await;

        let queued = self.queue.drain();
        debug!(
            target: "sc.negotiator",
            count = queued.len(),
            "Draining pending consumes"
        );
        for producer in queued {
            self.consume(producer).await?;
        }
        Ok(())
    }

    async fn consume(&mut self, producer: ProducerInfo) -> Result<(), ClientError> {
        let rtp_capabilities = self.device.rtp_capabilities()?;
        debug!(
            target: "sc.negotiator",
            producer_id = %producer.producer_id,
            kind = %producer.kind,
            "Consuming"
        );
        self.send_request(
            ClientRequest::Consume(ConsumeRequest {
                producer_id: producer.producer_id,
                rtp_capabilities,
            }),
            Continuation::Consumed { producer },
        )
        .await
    }

    async fn on_consumed(
        &mut self,
        producer: &ProducerInfo,
        consumer: ConsumerInfo,
    ) -> Result<(), ClientError> {
        if self.closed_in_flight.remove(&producer.producer_id) {
            debug!(
                target: "sc.negotiator",
                producer_id = %producer.producer_id,
                consumer_id = %consumer.id,
                "Producer closed before its consumer arrived"
            );
            return Ok(());
        }
        if self.consumer_by_producer.contains_key(&consumer.producer_id) {
            return Ok(());
        }

        if let Err(e) = self.device.consume(&consumer).await {
            warn!(
                target: "sc.negotiator",
                producer_id = %consumer.producer_id,
                error = %e,
                "Local consumer could not be attached"
            );
            return Ok(());
        }

        let consumer_id = consumer.id;
        self.consumers.insert(consumer_id, consumer.producer_id);
        self.consumer_by_producer
            .insert(consumer.producer_id, consumer_id);
        info!(
            target: "sc.negotiator",
            consumer_id = %consumer_id,
            producer_id = %consumer.producer_id,
            peer_id = %consumer.peer_id,
            kind = %consumer.kind,
            "Consumer added"
        );
        self.emit(SessionEvent::ConsumerAdded(consumer)).await;

        self.send_request(
            ClientRequest::ResumeConsumer(ConsumerRef { consumer_id }),
            Continuation::ConsumerResumed { consumer_id },
        )
        .await
    }

    /// Tear down whatever exists for a closed producer. Idempotent.
    async fn on_producer_closed(&mut self, producer_id: ProducerId) {
        if self.queue.remove(producer_id) {
            debug!(target: "sc.negotiator", producer_id = %producer_id, "Queued producer closed");
        }
        if self.pending.is_consuming(producer_id) {
            self.closed_in_flight.insert(producer_id);
        }
        if let Some(consumer_id) = self.consumer_by_producer.remove(&producer_id) {
            self.consumers.remove(&consumer_id);
            self.device.close_consumer(consumer_id).await;
            info!(
                target: "sc.negotiator",
                consumer_id = %consumer_id,
                producer_id = %producer_id,
                "Consumer closed"
            );
            self.emit(SessionEvent::ConsumerClosed {
                consumer_id,
                producer_id,
            })
            .await;
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Pause or resume a local producer. The producer is kept either way.
    async fn set_track_enabled(
        &mut self,
        source: TrackSource,
        enabled: bool,
    ) -> Result<(), ClientError> {
        let Some(producer) = self.producers.get_mut(&source) else {
            return Err(ClientError::NoSuchTrack(source.as_str()));
        };
        let paused = !enabled;
        if producer.paused == paused {
            return Ok(());
        }
        self.device.set_producer_paused(source, paused).await?;
        producer.paused = paused;
        let producer_id = producer.producer_id;

        info!(target: "sc.negotiator", source = %source, paused, "Local track toggled");
        self.send_request(
            ClientRequest::ChangeProducerState(ProducerPauseState { producer_id, paused }),
            Continuation::ProducerStateChanged {
                producer_id,
                paused,
            },
        )
        .await
    }

    async fn start_screen_share(&mut self) -> Result<(), ClientError> {
        if !self.send_connected {
            return Err(ClientError::NotReady("send transport not connected"));
        }
        if self.producers.contains_key(&TrackSource::Screen)
            || self.producing.contains(&TrackSource::Screen)
        {
            return Err(ClientError::AlreadySharing);
        }
        self.produce(LocalTrack::screen(), false).await
    }

    async fn stop_screen_share(&mut self) -> Result<(), ClientError> {
        if self.producing.contains(&TrackSource::Screen) {
            return Err(ClientError::NotReady("screen share still starting"));
        }
        let Some(producer) = self.producers.remove(&TrackSource::Screen) else {
            return Ok(());
        };
        self.device.close_producer(TrackSource::Screen).await;
        info!(
            target: "sc.negotiator",
            producer_id = %producer.producer_id,
            "Screen share stopped"
        );
        self.send_request(
            ClientRequest::CloseProducer(ProducerRef {
                producer_id: producer.producer_id,
            }),
            Continuation::ProducerClosed {
                producer_id: producer.producer_id,
            },
        )
        .await
    }

    // ------------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------------

    async fn send_request(
        &mut self,
        request: ClientRequest,
        continuation: Continuation,
    ) -> Result<(), ClientError> {
        let request_id = self.pending.register(continuation);
        let envelope = match request.into_envelope(Some(request_id)) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.pending.resolve(request_id);
                return Err(e.into());
            }
        };
        debug!(
            target: "sc.negotiator",
            action = %envelope.action,
            request_id,
            "Sending request"
        );
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Send a request that gets no response.
    async fn send_notification(&mut self, request: ClientRequest) -> Result<(), ClientError> {
        let envelope = request.into_envelope(None)?;
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    async fn set_state(&mut self, state: NegotiatorState) {
        if self.state == state {
            return;
        }
        info!(
            target: "sc.negotiator",
            from = %self.state,
            to = %state,
            "Negotiation state changed"
        );
        self.state = state;
        self.emit(SessionEvent::StateChanged(state)).await;
    }

    async fn emit(&mut self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!(target: "sc.negotiator", "Event receiver dropped");
        }
    }

    fn status(&self) -> NegotiatorStatus {
        NegotiatorStatus {
            state: self.state,
            peer_id: self.peer_id,
            is_admin: self.is_admin,
            producers: self.producers.clone(),
            consumers: self.consumers.clone(),
            pending_consumes: self.queue.len(),
            requests_in_flight: self.pending.len(),
        }
    }

    /// Release local resources. Requests still in flight are abandoned.
    async fn close(&mut self, final_state: NegotiatorState) {
        let abandoned = self.pending.clear();
        if abandoned > 0 {
            debug!(
                target: "sc.negotiator",
                abandoned,
                "Abandoning unanswered requests"
            );
        }
        self.queue.drain();
        self.device.close().await;
        self.set_state(final_state).await;
    }
}

/// Reply to a command. A closed connection also ends the negotiator.
fn answer(respond_to: Reply, result: Result<(), ClientError>) -> Result<(), ClientError> {
    if matches!(result, Err(ClientError::ConnectionClosed)) {
        let _ = respond_to.send(Err(ClientError::ConnectionClosed));
        return Err(ClientError::ConnectionClosed);
    }
    let _ = respond_to.send(result);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::fake::{FakeDevice, FakeDeviceProbe};
    use common::types::{MediaKind, TransportId};
    use rc_test_utils::{device_capabilities, dtls_parameters, parameters_for, presence};
    use signaling_protocol::messages::{actions, AdminInfo, ProducerClosedInfo};
    use signaling_protocol::rtp::{IceCandidate, IceParameters, IceProtocol};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(1);

    fn descriptor() -> TransportDescriptor {
        TransportDescriptor {
            id: TransportId::new(),
            ice_parameters: IceParameters {
                username_fragment: "ufrag".to_string(),
                password: "pwd".to_string(),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: "127.0.0.1".to_string(),
                protocol: IceProtocol::Udp,
                port: 40_000,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: dtls_parameters(),
        }
    }

    fn remote_producer(kind: MediaKind) -> ProducerInfo {
        ProducerInfo {
            producer_id: ProducerId::new(),
            peer_id: PeerId::new(),
            kind,
            app_data: AppData::new(),
            paused: false,
        }
    }

    fn consumer_for(producer: &ProducerInfo) -> ConsumerInfo {
        ConsumerInfo {
            id: ConsumerId::new(),
            producer_id: producer.producer_id,
            peer_id: producer.peer_id,
            kind: producer.kind,
            rtp_parameters: parameters_for(producer.kind),
            app_data: producer.app_data.clone(),
        }
    }

    /// Plays the server side of one session.
    struct Harness {
        handle: NegotiatorHandle,
        task: JoinHandle<()>,
        outbound: mpsc::Receiver<Envelope>,
        events: mpsc::Receiver<SessionEvent>,
        probe: FakeDeviceProbe,
    }

    impl Harness {
        fn start(tracks: Vec<LocalTrack>) -> Self {
            Self::start_with(tracks, FakeDevice::new())
        }

        fn start_with(tracks: Vec<LocalTrack>, device: FakeDevice) -> Self {
            let probe = device.probe();
            let (outbound_tx, outbound) = mpsc::channel(64);
            let (events_tx, events) = mpsc::channel(256);
            let (handle, task) = SessionNegotiator::spawn(
                tracks,
                device,
                outbound_tx,
                events_tx,
                CancellationToken::new(),
            );
            Self {
                handle,
                task,
                outbound,
                events,
                probe,
            }
        }

        async fn expect(&mut self, action: &str) -> Envelope {
            let envelope = tokio::time::timeout(WAIT, self.outbound.recv())
                .await
                .expect("timed out waiting for request")
                .expect("negotiator stopped");
            assert_eq!(envelope.action, action, "unexpected request {envelope:?}");
            envelope
        }

        async fn assert_quiet(&mut self) {
            tokio::task::yield_now().await;
            if let Ok(Some(envelope)) =
                tokio::time::timeout(Duration::from_millis(50), self.outbound.recv()).await
            {
                panic!("unexpected request {envelope:?}");
            }
        }

        async fn reply(&self, request: &Envelope, message: ServerMessage) {
            let envelope = message.into_envelope(request.request_id).unwrap();
            self.handle.deliver(envelope).await.unwrap();
        }

        async fn reply_error(&self, request: &Envelope, code: ErrorCode) {
            let action =
                signaling_protocol::messages::response_action_for(&request.action).unwrap();
            let envelope = Envelope::error_response(
                action,
                request.request_id,
                ErrorBody::new(code, "refused"),
            );
            self.handle.deliver(envelope).await.unwrap();
        }

        async fn push(&self, message: ServerMessage) {
            self.handle
                .deliver(message.into_envelope(None).unwrap())
                .await
                .unwrap();
        }

        /// Walk through setup up to the `deviceReady` request.
        async fn until_device_ready(&mut self) -> Envelope {
            let caps = self.expect(actions::GET_RTP_CAPABILITIES).await;
            self.reply(&caps, ServerMessage::RtpCapabilities(device_capabilities()))
                .await;
            let create = self.expect(actions::CREATE_TRANSPORT).await;
            self.reply(&create, ServerMessage::CreateTransportResponse(descriptor()))
                .await;
            let connect = self.expect(actions::CONNECT_TRANSPORT).await;
            self.reply(&connect, ServerMessage::TransportConnected).await;

            loop {
                let envelope = tokio::time::timeout(WAIT, self.outbound.recv())
                    .await
                    .expect("timed out")
                    .expect("negotiator stopped");
                match envelope.action.as_str() {
                    actions::PRODUCE => {
                        self.reply(
                            &envelope,
                            ServerMessage::ProduceResponse(ProducedInfo {
                                id: ProducerId::new(),
                            }),
                        )
                        .await;
                    }
                    actions::DEVICE_READY => return envelope,
                    other => panic!("unexpected request {other}"),
                }
            }
        }

        /// Walk through setup until the receive transport is connected.
        async fn until_steady(&mut self, existing: Vec<ProducerInfo>) {
            let ready = self.until_device_ready().await;
            self.reply(&ready, ServerMessage::ExistingProducers(existing))
                .await;
            let create = self.expect(actions::CREATE_CONSUMER_TRANSPORT).await;
            self.reply(
                &create,
                ServerMessage::CreateConsumerTransportResponse(descriptor()),
            )
            .await;
            let connect = self.expect(actions::CONNECT_CONSUMER_TRANSPORT).await;
            self.reply(&connect, ServerMessage::ConsumerTransportConnected)
                .await;
        }

        async fn next_event(&mut self) -> SessionEvent {
            tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed")
        }

        /// Skip events until one matches.
        async fn wait_event<F>(&mut self, mut matches: F) -> SessionEvent
        where
            F: FnMut(&SessionEvent) -> bool,
        {
            loop {
                let event = self.next_event().await;
                if matches(&event) {
                    return event;
                }
            }
        }

        /// Every event emitted so far.
        fn drain_events(&mut self) -> Vec<SessionEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        async fn status(&self) -> NegotiatorStatus {
            self.handle.status().await.unwrap()
        }
    }

    fn consume_target(envelope: &Envelope) -> ProducerId {
        serde_json::from_value(envelope.data["producerId"].clone()).unwrap()
    }

    #[tokio::test]
    async fn test_full_negotiation_reaches_steady_state() {
        let mut h = Harness::start(vec![LocalTrack::camera(), LocalTrack::microphone()]);

        let caps = h.expect(actions::GET_RTP_CAPABILITIES).await;
        assert_eq!(caps.request_id, Some(1));
        h.reply(&caps, ServerMessage::RtpCapabilities(device_capabilities()))
            .await;

        let create = h.expect(actions::CREATE_TRANSPORT).await;
        h.reply(&create, ServerMessage::CreateTransportResponse(descriptor()))
            .await;

        // connectTransport goes out before any produce
        let connect = h.expect(actions::CONNECT_TRANSPORT).await;
        assert!(connect.data["dtlsParameters"]["fingerprints"].is_array());
        h.assert_quiet().await;
        h.reply(&connect, ServerMessage::TransportConnected).await;

        let video = h.expect(actions::PRODUCE).await;
        assert_eq!(video.data["kind"], "video");
        assert_eq!(video.data["appData"]["source"], "webcam");
        let audio = h.expect(actions::PRODUCE).await;
        assert_eq!(audio.data["kind"], "audio");
        assert_eq!(audio.data["appData"]["source"], "mic");

        // deviceReady waits for both produce responses
        h.reply(
            &audio,
            ServerMessage::ProduceResponse(ProducedInfo {
                id: ProducerId::new(),
            }),
        )
        .await;
        h.assert_quiet().await;
        h.reply(
            &video,
            ServerMessage::ProduceResponse(ProducedInfo {
                id: ProducerId::new(),
            }),
        )
        .await;

        let ready = h.expect(actions::DEVICE_READY).await;
        let remote = remote_producer(MediaKind::Video);
        h.reply(&ready, ServerMessage::ExistingProducers(vec![remote.clone()]))
            .await;

        let create_recv = h.expect(actions::CREATE_CONSUMER_TRANSPORT).await;
        h.reply(
            &create_recv,
            ServerMessage::CreateConsumerTransportResponse(descriptor()),
        )
        .await;
        let connect_recv = h.expect(actions::CONNECT_CONSUMER_TRANSPORT).await;
        h.reply(&connect_recv, ServerMessage::ConsumerTransportConnected)
            .await;

        let consume = h.expect(actions::CONSUME).await;
        assert_eq!(consume_target(&consume), remote.producer_id);
        assert!(consume.data["rtpCapabilities"]["codecs"].is_array());
        let consumer = consumer_for(&remote);
        h.reply(&consume, ServerMessage::ConsumeResponse(consumer.clone()))
            .await;

        let resume = h.expect(actions::RESUME_CONSUMER).await;
        assert_eq!(resume.data["consumerId"], serde_json::json!(consumer.id));
        h.reply(
            &resume,
            ServerMessage::ResumeConsumerResponse(ConsumerRef {
                consumer_id: consumer.id,
            }),
        )
        .await;

        let status = h.status().await;
        assert_eq!(status.state, NegotiatorState::ConsumingSteadyState);
        assert_eq!(status.producers.len(), 2);
        assert_eq!(status.consumers.get(&consumer.id), Some(&remote.producer_id));
        assert_eq!(status.requests_in_flight, 0);
        assert_eq!(h.probe.consumed_producers(), vec![remote.producer_id]);

        let states: Vec<NegotiatorState> = h
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                NegotiatorState::Connecting,
                NegotiatorState::CapabilitiesExchanged,
                NegotiatorState::SendTransportReady,
                NegotiatorState::Producing,
                NegotiatorState::RecvTransportReady,
                NegotiatorState::ConsumingSteadyState,
            ]
        );
    }

    #[tokio::test]
    async fn test_no_tracks_sends_device_ready_after_connect() {
        let mut h = Harness::start(Vec::new());
        let ready = h.until_device_ready().await;
        assert_eq!(ready.action, actions::DEVICE_READY);
        assert!(h.status().await.producers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_local_track_does_not_block_device_ready() {
        let device = FakeDevice::new().failing_produce(TrackSource::Webcam);
        let mut h =
            Harness::start_with(vec![LocalTrack::camera(), LocalTrack::microphone()], device);
        h.until_device_ready().await;

        let status = h.status().await;
        assert_eq!(status.producers.len(), 1);
        assert!(status.producers.contains_key(&TrackSource::Mic));
    }

    #[tokio::test]
    async fn test_early_announcements_drain_in_arrival_order() {
        let mut h = Harness::start(Vec::new());
        let a = remote_producer(MediaKind::Video);
        let b = remote_producer(MediaKind::Audio);
        let c = remote_producer(MediaKind::Video);

        // Announced before deviceReady
        h.push(ServerMessage::NewProducerAvailable(a.clone())).await;
        let ready = h.until_device_ready().await;
        h.reply(&ready, ServerMessage::ExistingProducers(vec![b.clone()]))
            .await;

        let create = h.expect(actions::CREATE_CONSUMER_TRANSPORT).await;
        // Announced while the receive transport is being set up
        h.push(ServerMessage::NewProducerAvailable(c.clone())).await;
        h.push(ServerMessage::NewProducerAvailable(a.clone())).await;
        h.reply(
            &create,
            ServerMessage::CreateConsumerTransportResponse(descriptor()),
        )
        .await;
        let connect = h.expect(actions::CONNECT_CONSUMER_TRANSPORT).await;
        h.assert_quiet().await;
        assert_eq!(h.status().await.pending_consumes, 3);

        h.reply(&connect, ServerMessage::ConsumerTransportConnected)
            .await;

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(consume_target(&h.expect(actions::CONSUME).await));
        }
        assert_eq!(order, vec![a.producer_id, b.producer_id, c.producer_id]);
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_duplicate_announcement_consumes_once() {
        let mut h = Harness::start(Vec::new());
        h.until_steady(Vec::new()).await;

        let remote = remote_producer(MediaKind::Audio);
        h.push(ServerMessage::NewProducerAvailable(remote.clone()))
            .await;
        let consume = h.expect(actions::CONSUME).await;

        // While in flight
        h.push(ServerMessage::NewProducerAvailable(remote.clone()))
            .await;
        h.assert_quiet().await;

        h.reply(&consume, ServerMessage::ConsumeResponse(consumer_for(&remote)))
            .await;
        h.expect(actions::RESUME_CONSUMER).await;

        // After the consumer exists
        h.push(ServerMessage::NewProducerAvailable(remote)).await;
        h.assert_quiet().await;
        assert_eq!(h.probe.consumers().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_consumes_resolve_by_request_id() {
        let mut h = Harness::start(Vec::new());
        h.until_steady(Vec::new()).await;

        let first = remote_producer(MediaKind::Video);
        let second = remote_producer(MediaKind::Audio);
        h.push(ServerMessage::NewProducerAvailable(first.clone()))
            .await;
        h.push(ServerMessage::NewProducerAvailable(second.clone()))
            .await;
        let first_request = h.expect(actions::CONSUME).await;
        let second_request = h.expect(actions::CONSUME).await;
        assert_ne!(first_request.request_id, second_request.request_id);

        // Answered in reverse order
        h.reply(
            &second_request,
            ServerMessage::ConsumeResponse(consumer_for(&second)),
        )
        .await;
        h.reply(
            &first_request,
            ServerMessage::ConsumeResponse(consumer_for(&first)),
        )
        .await;
        h.expect(actions::RESUME_CONSUMER).await;
        h.expect(actions::RESUME_CONSUMER).await;

        let consumers = h.probe.consumers();
        assert_eq!(consumers.len(), 2);
        for consumer in consumers {
            let expected = if consumer.producer_id == first.producer_id {
                &first
            } else {
                &second
            };
            assert_eq!(consumer.kind, expected.kind);
        }
    }

    #[tokio::test]
    async fn test_already_consuming_is_silent() {
        let mut h = Harness::start(Vec::new());
        h.until_steady(Vec::new()).await;
        h.drain_events();

        let remote = remote_producer(MediaKind::Video);
        h.push(ServerMessage::NewProducerAvailable(remote)).await;
        let consume = h.expect(actions::CONSUME).await;
        h.reply_error(&consume, ErrorCode::AlreadyConsuming).await;
        h.assert_quiet().await;

        let status = h.status().await;
        assert_eq!(status.requests_in_flight, 0);
        assert!(!h
            .drain_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::RequestFailed { .. })));
    }

    #[tokio::test]
    async fn test_consume_error_is_reported() {
        let mut h = Harness::start(Vec::new());
        h.until_steady(Vec::new()).await;

        h.push(ServerMessage::NewProducerAvailable(remote_producer(
            MediaKind::Video,
        )))
        .await;
        let consume = h.expect(actions::CONSUME).await;
        h.reply_error(&consume, ErrorCode::Incompatible).await;

        let event = h
            .wait_event(|e| matches!(e, SessionEvent::RequestFailed { .. }))
            .await;
        let SessionEvent::RequestFailed { action, error } = event else {
            unreachable!();
        };
        assert_eq!(action, actions::CONSUME_RESPONSE);
        assert_eq!(error.code, ErrorCode::Incompatible);
        assert_eq!(h.status().await.state, NegotiatorState::ConsumingSteadyState);
    }

    #[tokio::test]
    async fn test_producer_closed_tears_down_consumer_once() {
        let mut h = Harness::start(Vec::new());
        let remote = remote_producer(MediaKind::Video);
        h.until_steady(vec![remote.clone()]).await;

        let consume = h.expect(actions::CONSUME).await;
        let consumer = consumer_for(&remote);
        h.reply(&consume, ServerMessage::ConsumeResponse(consumer.clone()))
            .await;
        h.expect(actions::RESUME_CONSUMER).await;

        let closed = ServerMessage::ProducerClosed(ProducerClosedInfo {
            producer_id: remote.producer_id,
            peer_id: remote.peer_id,
        });
        h.push(closed.clone()).await;
        h.push(closed).await;

        h.wait_event(|e| matches!(e, SessionEvent::ConsumerClosed { .. }))
            .await;
        assert!(h.status().await.consumers.is_empty());
        assert_eq!(h.probe.closed_consumers(), vec![consumer.id]);
        assert!(!h
            .drain_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::ConsumerClosed { .. })));
    }

    #[tokio::test]
    async fn test_producer_closed_while_queued_is_never_consumed() {
        let mut h = Harness::start(Vec::new());
        let gone = remote_producer(MediaKind::Video);
        let kept = remote_producer(MediaKind::Audio);

        let ready = h.until_device_ready().await;
        h.reply(
            &ready,
            ServerMessage::ExistingProducers(vec![gone.clone(), kept.clone()]),
        )
        .await;
        h.push(ServerMessage::ProducerClosed(ProducerClosedInfo {
            producer_id: gone.producer_id,
            peer_id: gone.peer_id,
        }))
        .await;

        let create = h.expect(actions::CREATE_CONSUMER_TRANSPORT).await;
        h.reply(
            &create,
            ServerMessage::CreateConsumerTransportResponse(descriptor()),
        )
        .await;
        let connect = h.expect(actions::CONNECT_CONSUMER_TRANSPORT).await;
        h.reply(&connect, ServerMessage::ConsumerTransportConnected)
            .await;

        let consume = h.expect(actions::CONSUME).await;
        assert_eq!(consume_target(&consume), kept.producer_id);
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_late_consume_response_for_closed_producer_is_discarded() {
        let mut h = Harness::start(Vec::new());
        h.until_steady(Vec::new()).await;

        let remote = remote_producer(MediaKind::Video);
        h.push(ServerMessage::NewProducerAvailable(remote.clone()))
            .await;
        let consume = h.expect(actions::CONSUME).await;
        h.push(ServerMessage::ProducerClosed(ProducerClosedInfo {
            producer_id: remote.producer_id,
            peer_id: remote.peer_id,
        }))
        .await;
        h.reply(&consume, ServerMessage::ConsumeResponse(consumer_for(&remote)))
            .await;

        h.assert_quiet().await;
        assert!(h.probe.consumers().is_empty());
        assert!(h.status().await.consumers.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_consume_for_closed_producer_is_silent() {
        let mut h = Harness::start(Vec::new());
        h.until_steady(Vec::new()).await;

        let remote = remote_producer(MediaKind::Audio);
        h.push(ServerMessage::NewProducerAvailable(remote.clone()))
            .await;
        let consume = h.expect(actions::CONSUME).await;
        h.push(ServerMessage::ProducerClosed(ProducerClosedInfo {
            producer_id: remote.producer_id,
            peer_id: remote.peer_id,
        }))
        .await;
        h.reply_error(&consume, ErrorCode::NotFound).await;

        h.assert_quiet().await;
        let status = h.status().await;
        let events = h.drain_events();
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, SessionEvent::RequestFailed { .. })),
            "unexpected events: {events:?}"
        );
        assert!(status.consumers.is_empty());
        assert_eq!(status.requests_in_flight, 0);
        assert_eq!(status.state, NegotiatorState::ConsumingSteadyState);
    }

    #[tokio::test]
    async fn test_mute_pauses_without_recreating_producer() {
        let mut h = Harness::start(vec![LocalTrack::microphone()]);
        h.until_device_ready().await;
        let before = h.status().await.producers[&TrackSource::Mic];

        h.handle.set_audio_enabled(false).await.unwrap();
        let change = h.expect(actions::CHANGE_PRODUCER_STATE).await;
        assert_eq!(change.data["paused"], true);
        assert_eq!(
            change.data["producerId"],
            serde_json::json!(before.producer_id)
        );
        assert_eq!(h.probe.producer_paused(TrackSource::Mic), Some(true));

        // Already muted
        h.handle.set_audio_enabled(false).await.unwrap();
        h.assert_quiet().await;

        h.handle.set_audio_enabled(true).await.unwrap();
        let change = h.expect(actions::CHANGE_PRODUCER_STATE).await;
        assert_eq!(change.data["paused"], false);

        let after = h.status().await.producers[&TrackSource::Mic];
        assert_eq!(after.producer_id, before.producer_id);
        assert!(!after.paused);
    }

    #[tokio::test]
    async fn test_toggle_missing_track_fails() {
        let mut h = Harness::start(vec![LocalTrack::microphone()]);
        h.until_device_ready().await;
        assert!(matches!(
            h.handle.set_video_enabled(false).await,
            Err(ClientError::NoSuchTrack("webcam"))
        ));
    }

    #[tokio::test]
    async fn test_screen_share_start_and_stop() {
        let mut h = Harness::start(Vec::new());
        assert!(matches!(
            h.handle.start_screen_share().await,
            Err(ClientError::NotReady(_))
        ));
        h.until_device_ready().await;

        h.handle.start_screen_share().await.unwrap();
        let produce = h.expect(actions::PRODUCE).await;
        assert_eq!(produce.data["appData"]["source"], "screen");
        assert!(matches!(
            h.handle.start_screen_share().await,
            Err(ClientError::AlreadySharing)
        ));

        let producer_id = ProducerId::new();
        h.reply(
            &produce,
            ServerMessage::ProduceResponse(ProducedInfo { id: producer_id }),
        )
        .await;

        h.handle.stop_screen_share().await.unwrap();
        let close = h.expect(actions::CLOSE_PRODUCER).await;
        assert_eq!(close.data["producerId"], serde_json::json!(producer_id));
        assert_eq!(h.probe.producer_paused(TrackSource::Screen), None);

        // Nothing left to stop
        h.handle.stop_screen_share().await.unwrap();
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_presence_is_fire_and_forget() {
        let mut h = Harness::start(Vec::new());
        h.expect(actions::GET_RTP_CAPABILITIES).await;

        h.handle.update_presence(presence(true)).await.unwrap();
        let update = h.expect(actions::UPDATE_PEER_STATUS).await;
        assert_eq!(update.request_id, None);
        assert_eq!(update.data, presence(true));
    }

    #[tokio::test]
    async fn test_broadcasts_become_events() {
        let mut h = Harness::start(Vec::new());
        let peer_id = PeerId::new();
        h.push(ServerMessage::AdminInfo(AdminInfo {
            peer_id,
            is_admin: true,
        }))
        .await;

        let event = h
            .wait_event(|e| matches!(e, SessionEvent::AdminInfo { .. }))
            .await;
        assert_eq!(
            event,
            SessionEvent::AdminInfo {
                peer_id,
                is_admin: true
            }
        );
        let status = h.status().await;
        assert_eq!(status.peer_id, Some(peer_id));
        assert!(status.is_admin);
    }

    #[tokio::test]
    async fn test_device_load_failure_ends_session() {
        let mut h = Harness::start_with(Vec::new(), FakeDevice::new().failing_load());
        let caps = h.expect(actions::GET_RTP_CAPABILITIES).await;
        h.reply(&caps, ServerMessage::RtpCapabilities(device_capabilities()))
            .await;

        h.wait_event(|e| *e == SessionEvent::StateChanged(NegotiatorState::Failed))
            .await;
        tokio::time::timeout(WAIT, &mut h.task).await.unwrap().unwrap();
        // Outbound sender dropped with the actor
        assert!(h.outbound.recv().await.is_none());
        assert!(h.probe.is_closed());
    }

    #[tokio::test]
    async fn test_rejected_setup_step_ends_session() {
        let mut h = Harness::start(Vec::new());
        let caps = h.expect(actions::GET_RTP_CAPABILITIES).await;
        h.reply(&caps, ServerMessage::RtpCapabilities(device_capabilities()))
            .await;
        let create = h.expect(actions::CREATE_TRANSPORT).await;
        h.reply_error(&create, ErrorCode::Conflict).await;

        h.wait_event(|e| *e == SessionEvent::StateChanged(NegotiatorState::Failed))
            .await;
        tokio::time::timeout(WAIT, &mut h.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_leave_closes_device_and_outbound() {
        let mut h = Harness::start(vec![LocalTrack::microphone()]);
        h.until_steady(Vec::new()).await;

        h.handle.leave().await.unwrap();
        tokio::time::timeout(WAIT, &mut h.task).await.unwrap().unwrap();

        assert!(h.probe.is_closed());
        assert!(h.outbound.recv().await.is_none());
        let last = h.drain_events().pop();
        assert_eq!(last, Some(SessionEvent::StateChanged(NegotiatorState::Closed)));
    }

    #[tokio::test]
    async fn test_connection_closed_abandons_pending_requests() {
        let mut h = Harness::start(Vec::new());
        h.expect(actions::GET_RTP_CAPABILITIES).await;

        h.handle.connection_closed().await.unwrap();
        tokio::time::timeout(WAIT, &mut h.task).await.unwrap().unwrap();
        assert!(h.handle.status().await.is_err());
    }
}
