//! WebSocket binding of the signaling stream.

use super::stream::{SignalingStream, StreamError};
use crate::actors::{serve_connection, ActorMetrics, RoomRegistryHandle};
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use signaling_protocol::codec::MAX_FRAME_LEN;
use std::borrow::Cow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// [`SignalingStream`] over an upgraded axum WebSocket.
pub struct WsStream {
    socket: WebSocket,
    closed: bool,
}

impl WsStream {
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            closed: false,
        }
    }
}

#[async_trait]
impl SignalingStream for WsStream {
    async fn recv(&mut self) -> Option<Result<String, StreamError>> {
        if self.closed {
            return None;
        }
        loop {
            let message = match self.socket.recv().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(StreamError::Transport(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(text)),
                Message::Binary(data) => {
                    return Some(String::from_utf8(data).map_err(|_| {
                        StreamError::InvalidFrame("binary frame is not valid UTF-8".to_string())
                    }));
                }
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        };
        if let Err(e) = self.socket.send(Message::Close(Some(frame))).await {
            debug!(target: "rc.actor.connection", error = %e, "Close frame not delivered");
        }
    }
}

/// Shared state of the signaling listener.
#[derive(Clone)]
pub struct SignalingState {
    pub registry: RoomRegistryHandle,
    pub metrics: Arc<ActorMetrics>,
    /// Parent of every connection's token.
    pub cancel_token: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct JoinQuery {
    #[serde(rename = "roomId")]
    room_id: Option<String>,
}

/// Router serving the signaling WebSocket at `/`.
pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<JoinQuery>,
    State(state): State<SignalingState>,
) -> Response {
    ws.max_message_size(MAX_FRAME_LEN)
        .on_upgrade(move |socket| async move {
            serve_connection(
                WsStream::new(socket),
                query.room_id,
                state.registry,
                state.metrics,
                state.cancel_token.child_token(),
            )
            .await;
        })
}
