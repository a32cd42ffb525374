//! Media engine interface.
//!
//! The room controller never touches RTP itself. Everything media related
//! goes through the object-safe traits below, which model an SFU engine as
//! a set of workers hosting routers, with transports, producers and consumers
//! hanging off each router.
//!
//! ```text
//! MediaEngine
//! └── MediaWorker (one per CPU core, see [`pool`])
//!     └── MediaRouter (one per room)
//!         └── MediaTransport (send + receive per peer)
//!             ├── MediaProducer
//!             └── MediaConsumer
//! ```
//!
//! [`loopback::LoopbackEngine`] implements the traits in process and is what
//! the binary and the tests run with.

pub mod codecs;
pub mod loopback;
pub mod pool;

use async_trait::async_trait;
use common::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId};
use serde::Serialize;
use signaling_protocol::rtp::{
    DtlsParameters, RtpCapabilities, RtpCodecCapability, RtpParameters, TransportDescriptor,
};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

pub use pool::{MediaPool, PoolStatus, RouterAssignment, WorkerStatus};

/// Errors reported by the media engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Worker closed")]
    WorkerClosed,

    #[error("Router closed")]
    RouterClosed,

    #[error("Transport closed")]
    TransportClosed,

    #[error("Transport already connected")]
    AlreadyConnected,

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Cannot consume producer {0} with the given capabilities")]
    CannotConsume(ProducerId),

    #[error("Invalid RTP parameters: {0}")]
    InvalidParameters(String),

    #[error("Engine failure: {0}")]
    Failed(String),
}

/// Settings applied to every worker in the pool.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

/// Settings for WebRTC transports created on behalf of peers.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub listen_ip: IpAddr,
    /// Public address advertised in ICE candidates when behind NAT.
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

impl TransportSettings {
    /// Address written into ICE candidates.
    #[must_use]
    pub fn candidate_ip(&self) -> String {
        self.announced_ip
            .clone()
            .unwrap_or_else(|| self.listen_ip.to_string())
    }
}

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl TransportState {
    /// Failed and closed transports never recover.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        }
    }
}

/// Resource usage of one worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Average usage since the previous sample; may exceed 100 on multi-core.
    pub cpu_percent: f32,
    pub rss_bytes: u64,
    /// CPU time consumed since the worker started.
    pub cpu_time_ms: u64,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Start one worker.
    async fn create_worker(
        &self,
        index: usize,
        settings: &WorkerSettings,
    ) -> Result<Arc<dyn MediaWorker>, EngineError>;
}

#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn pid(&self) -> u32;

    /// Number of routers currently open on this worker.
    fn router_count(&self) -> usize;

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, EngineError>;

    /// Sampled on demand; may block briefly so callers keep it off hot paths.
    async fn resource_usage(&self) -> Result<ResourceUsage, EngineError>;

    /// Resolves with a reason once the worker has died.
    async fn died(&self) -> String;

    async fn close(&self);
}

#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> RouterId;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_webrtc_transport(
        &self,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn MediaTransport>, EngineError>;

    /// Whether `producer_id` exists on this router and can be received by
    /// an endpoint with `capabilities`.
    fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn descriptor(&self) -> TransportDescriptor;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn MediaProducer>, EngineError>;

    async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, EngineError>;

    /// Connection state, updated by the engine.
    fn state_changes(&self) -> watch::Receiver<TransportState>;

    /// Close the transport and everything riding on it.
    async fn close(&self);
}

#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    async fn pause(&self) -> Result<(), EngineError>;

    async fn resume(&self) -> Result<(), EngineError>;

    fn is_paused(&self) -> bool;

    /// Latest measured volume in dBov, `None` when no audio was observed.
    fn audio_level(&self) -> Option<f32>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    async fn resume(&self) -> Result<(), EngineError>;

    fn is_paused(&self) -> bool;

    async fn close(&self);
}
