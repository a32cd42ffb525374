//! `ConnectionActor` - per-peer signaling connection.
//!
//! Each `ConnectionActor`:
//! - Owns exactly one [`SignalingStream`]
//! - Decodes inbound frames and forwards requests to its `RoomActor`
//! - Writes envelopes queued by the room to the peer, in queue order
//!
//! # Lifecycle
//!
//! 1. [`serve_connection`] validates the room id and asks the registry to
//!    admit the peer. Refusals close the stream with a close code.
//! 2. The actor runs until the peer closes, a protocol violation occurs,
//!    or its token is cancelled (room shutdown or slow-peer eviction).
//! 3. On exit it reports the disconnect to the room.

use super::messages::JoinRequest;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::RoomRegistryHandle;
use super::room::RoomActorHandle;
use crate::errors::RcError;
use crate::signaling::{
    SignalingStream, StreamError, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
    CLOSE_POLICY_VIOLATION, CLOSE_TRY_AGAIN_LATER,
};

use common::types::{PeerId, RoomId};
use signaling_protocol::messages::response_action_for;
use signaling_protocol::{decode_envelope, encode_envelope, ClientRequest, CodecError, Envelope};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Outbound queue size per peer.
const CONNECTION_CHANNEL_BUFFER: usize = 256;

/// Handle to a `ConnectionActor`.
///
/// Only non-blocking delivery is offered: the room actor must never wait
/// on a single slow peer.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<Envelope>,
    cancel_token: CancellationToken,
    peer_id: PeerId,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Queue an envelope for the peer without waiting.
    ///
    /// # Errors
    ///
    /// `Full` when the peer is not draining its queue, `Closed` when the
    /// connection already ended.
    pub fn try_deliver(&self, envelope: Envelope) -> Result<(), TrySendError<Envelope>> {
        self.sender.try_send(envelope)
    }

    /// Close the connection.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Handle whose queue is read directly by the caller.
    #[cfg(test)]
    pub(crate) fn detached(peer_id: PeerId, buffer: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (
            Self {
                sender,
                cancel_token: CancellationToken::new(),
                peer_id,
            },
            receiver,
        )
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    peer_id: PeerId,
    room_id: RoomId,
    outbound: mpsc::Receiver<Envelope>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl ConnectionActor {
    /// Create an actor and its handle. The actor does nothing until
    /// [`ConnectionActor::run`] is awaited; envelopes queued before that
    /// are written first.
    #[must_use]
    pub fn new(
        peer_id: PeerId,
        room_id: RoomId,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (Self, ConnectionActorHandle) {
        let (sender, outbound) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);

        let actor = Self {
            peer_id,
            room_id,
            outbound,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Connection, peer_id.to_string()),
        };

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            peer_id,
        };

        (actor, handle)
    }

    /// Run the connection until either side ends it.
    #[instrument(
        skip_all,
        name = "rc.actor.connection",
        fields(peer_id = %self.peer_id, room_id = %self.room_id)
    )]
    pub async fn run<S: SignalingStream>(mut self, mut stream: S, room: RoomActorHandle) {
        debug!(
            target: "rc.actor.connection",
            peer_id = %self.peer_id,
            room_id = %self.room_id,
            "ConnectionActor started"
        );

        // `None` means the peer closed the stream itself.
        let close: Option<(u16, &'static str)> = loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "rc.actor.connection",
                        peer_id = %self.peer_id,
                        "ConnectionActor received cancellation signal"
                    );
                    self.flush(&mut stream).await;
                    break Some((CLOSE_GOING_AWAY, "Connection closed by server"));
                }

                msg = self.outbound.recv() => {
                    match msg {
                        Some(envelope) => {
                            let written = self.write(&mut stream, &envelope).await;
                            self.mailbox.record_processed(self.outbound.len());
                            self.metrics.record_message_processed();
                            if !written {
                                break None;
                            }
                        }
                        None => break Some((CLOSE_NORMAL, "")),
                    }
                }

                frame = stream.recv() => {
                    match frame {
                        Some(Ok(text)) => {
                            if let Some(close) =
                                self.handle_inbound(&mut stream, &room, &text).await
                            {
                                break Some(close);
                            }
                        }
                        Some(Err(StreamError::InvalidFrame(reason))) => {
                            warn!(
                                target: "rc.actor.connection",
                                peer_id = %self.peer_id,
                                reason = %reason,
                                "Invalid frame from peer"
                            );
                            break Some((CLOSE_POLICY_VIOLATION, "Malformed message"));
                        }
                        Some(Err(e)) => {
                            debug!(
                                target: "rc.actor.connection",
                                peer_id = %self.peer_id,
                                error = %e,
                                "Signaling stream failed"
                            );
                            break None;
                        }
                        None => {
                            debug!(
                                target: "rc.actor.connection",
                                peer_id = %self.peer_id,
                                "Peer closed signaling stream"
                            );
                            break None;
                        }
                    }
                }
            }
        };

        if let Err(e) = room.disconnect(self.peer_id).await {
            debug!(
                target: "rc.actor.connection",
                peer_id = %self.peer_id,
                error = %e,
                "Room already gone at disconnect"
            );
        }

        if let Some((code, reason)) = close {
            stream.close(code, reason).await;
        }

        info!(
            target: "rc.actor.connection",
            peer_id = %self.peer_id,
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Handle one inbound text frame. Returns a close code and reason when
    /// the connection must end.
    async fn handle_inbound<S: SignalingStream>(
        &self,
        stream: &mut S,
        room: &RoomActorHandle,
        text: &str,
    ) -> Option<(u16, &'static str)> {
        let envelope = match decode_envelope(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    target: "rc.actor.connection",
                    peer_id = %self.peer_id,
                    error = %e,
                    "Malformed frame from peer"
                );
                let reply = Envelope::protocol_error(None, e.to_error_body());
                self.write(stream, &reply).await;
                return Some((CLOSE_POLICY_VIOLATION, "Malformed message"));
            }
        };

        let request_id = envelope.request_id;
        let action = envelope.action.clone();
        match ClientRequest::from_envelope(envelope) {
            Ok(request) => {
                if let Err(e) = room.signal(self.peer_id, request_id, request).await {
                    warn!(
                        target: "rc.actor.connection",
                        peer_id = %self.peer_id,
                        error = %e,
                        "Room unavailable"
                    );
                    return Some((CLOSE_GOING_AWAY, "Room closed"));
                }
            }
            Err(e) => {
                debug!(
                    target: "rc.actor.connection",
                    peer_id = %self.peer_id,
                    action = %action,
                    error = %e,
                    "Rejected request"
                );
                let reply = match (&e, response_action_for(&action)) {
                    (CodecError::InvalidData { .. }, Some(response)) => {
                        Envelope::error_response(response, request_id, e.to_error_body())
                    }
                    _ => Envelope::protocol_error(request_id, e.to_error_body()),
                };
                if !self.write(stream, &reply).await {
                    return Some((CLOSE_GOING_AWAY, "Write failed"));
                }
            }
        }
        None
    }

    /// Write one envelope. Returns false when the stream is unusable.
    async fn write<S: SignalingStream>(&self, stream: &mut S, envelope: &Envelope) -> bool {
        let text = match encode_envelope(envelope) {
            Ok(text) => text,
            Err(e) => {
                error!(
                    target: "rc.actor.connection",
                    peer_id = %self.peer_id,
                    action = %envelope.action,
                    error = %e,
                    "Failed to encode outbound envelope"
                );
                return true;
            }
        };
        match stream.send(text).await {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    target: "rc.actor.connection",
                    peer_id = %self.peer_id,
                    error = %e,
                    "Failed to write to peer"
                );
                false
            }
        }
    }

    /// Write whatever is already queued before closing.
    async fn flush<S: SignalingStream>(&mut self, stream: &mut S) {
        while let Ok(envelope) = self.outbound.try_recv() {
            if !self.write(stream, &envelope).await {
                break;
            }
        }
    }
}

/// Admit a new signaling connection and serve it until it ends.
///
/// Refusals close the stream without admitting the peer:
/// missing room id with 1008, full room or draining server with 1013,
/// room creation failure with 1011.
pub async fn serve_connection<S: SignalingStream>(
    mut stream: S,
    room_id: Option<String>,
    registry: RoomRegistryHandle,
    metrics: Arc<ActorMetrics>,
    cancel_token: CancellationToken,
) {
    let Some(room_id) = room_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
    else {
        warn!(target: "rc.actor.connection", "Connection without room id rejected");
        stream
            .close(CLOSE_POLICY_VIOLATION, "Room ID is required")
            .await;
        return;
    };

    let room_id = RoomId::new(room_id);
    let peer_id = PeerId::new();
    let (actor, connection) =
        ConnectionActor::new(peer_id, room_id.clone(), cancel_token, metrics);

    let accepted = match registry
        .join(room_id.clone(), JoinRequest { peer_id, connection })
        .await
    {
        Ok(accepted) => accepted,
        Err(e) => {
            let (code, reason) = match &e {
                RcError::RoomFull(_) => (CLOSE_TRY_AGAIN_LATER, "Room is full"),
                RcError::Draining => (CLOSE_TRY_AGAIN_LATER, "Server is shutting down"),
                _ => (CLOSE_INTERNAL_ERROR, "Failed to join room"),
            };
            warn!(
                target: "rc.actor.connection",
                room_id = %room_id,
                peer_id = %peer_id,
                error = %e,
                close_code = code,
                "Join refused"
            );
            stream.close(code, reason).await;
            return;
        }
    };

    info!(
        target: "rc.actor.connection",
        room_id = %room_id,
        peer_id = %peer_id,
        is_admin = accepted.is_admin,
        "Peer joined"
    );

    actor.run(stream, accepted.room).await;
}
