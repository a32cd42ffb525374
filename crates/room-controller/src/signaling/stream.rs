//! Transport-neutral signaling stream.

use async_trait::async_trait;
use signaling_protocol::CodecError;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream closed")]
    Closed,

    /// A frame the signaling protocol cannot carry (binary, invalid UTF-8).
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Encode(#[from] CodecError),
}

/// A bidirectional text-frame channel to one peer.
#[async_trait]
pub trait SignalingStream: Send {
    /// Next inbound text frame. `None` once the peer closed the stream.
    async fn recv(&mut self) -> Option<Result<String, StreamError>>;

    async fn send(&mut self, text: String) -> Result<(), StreamError>;

    /// Close with a WebSocket close code. Best effort.
    async fn close(&mut self, code: u16, reason: &str);
}

/// What the server side of a [`channel_pair`] emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Server half of an in-memory signaling stream.
pub struct ChannelStream {
    inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<StreamFrame>,
    closed: bool,
}

/// Client half of an in-memory signaling stream.
pub struct ChannelClient {
    outbound: Option<mpsc::Sender<String>>,
    inbound: mpsc::Receiver<StreamFrame>,
}

/// Create a connected in-memory stream pair.
#[must_use]
pub fn channel_pair(buffer: usize) -> (ChannelStream, ChannelClient) {
    let (client_tx, server_rx) = mpsc::channel(buffer);
    let (server_tx, client_rx) = mpsc::channel(buffer);
    (
        ChannelStream {
            inbound: server_rx,
            outbound: server_tx,
            closed: false,
        },
        ChannelClient {
            outbound: Some(client_tx),
            inbound: client_rx,
        },
    )
}

#[async_trait]
impl SignalingStream for ChannelStream {
    async fn recv(&mut self) -> Option<Result<String, StreamError>> {
        if self.closed {
            return None;
        }
        self.inbound.recv().await.map(Ok)
    }

    async fn send(&mut self, text: String) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        self.outbound
            .send(StreamFrame::Text(text))
            .await
            .map_err(|_| StreamError::Closed)
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self
            .outbound
            .send(StreamFrame::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
    }
}

impl ChannelClient {
    /// Send a text frame to the server.
    ///
    /// # Errors
    ///
    /// Fails if the client half was closed or the server dropped its half.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), StreamError> {
        let sender = self.outbound.as_ref().ok_or(StreamError::Closed)?;
        sender
            .send(text.into())
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Next frame from the server, `None` once the server half is gone.
    pub async fn recv(&mut self) -> Option<StreamFrame> {
        self.inbound.recv().await
    }

    /// Close the client side, as a browser tab going away would.
    pub fn close(&mut self) {
        self.outbound = None;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pair_round_trip() {
        let (mut server, mut client) = channel_pair(4);

        client.send("hello").await.unwrap();
        assert_eq!(server.recv().await.unwrap().unwrap(), "hello");

        server.send("world".to_string()).await.unwrap();
        assert_eq!(
            client.recv().await,
            Some(StreamFrame::Text("world".to_string()))
        );
    }

    #[tokio::test]
    async fn test_close_is_reported_once() {
        let (mut server, mut client) = channel_pair(4);

        server.close(1008, "Room ID is required").await;
        server.close(1000, "again").await;
        assert_eq!(
            client.recv().await,
            Some(StreamFrame::Close {
                code: 1008,
                reason: "Room ID is required".to_string()
            })
        );
        assert!(server.send("late".to_string()).await.is_err());
        assert!(server.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_client_close_ends_server_stream() {
        let (mut server, mut client) = channel_pair(4);
        client.close();
        assert!(server.recv().await.is_none());
        assert!(client.send("after close").await.is_err());
    }
}
