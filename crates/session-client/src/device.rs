//! Local media stack seam.
//!
//! The negotiator never touches tracks or sockets. Everything local (codec
//! negotiation, transport setup, encoding and decoding) goes through a
//! [`Device`], the way a browser client goes through its SFU device object.

use crate::errors::DeviceError;
use crate::state::{LocalTrack, TrackSource};
use async_trait::async_trait;
use common::types::ConsumerId;
use signaling_protocol::messages::ConsumerInfo;
use signaling_protocol::rtp::{DtlsParameters, RtpCapabilities, RtpParameters, TransportDescriptor};

/// Client-side media device.
///
/// Local producers are identified by their [`TrackSource`]; a device holds
/// at most one producer per source.
#[async_trait]
pub trait Device: Send + 'static {
    /// Load the router's capabilities. Must happen before anything else.
    async fn load(&mut self, router_capabilities: &RtpCapabilities) -> Result<(), DeviceError>;

    /// What this device can receive, sent with every `consume`.
    fn rtp_capabilities(&self) -> Result<RtpCapabilities, DeviceError>;

    /// Build the local send transport. Returns the DTLS parameters for
    /// `connectTransport`.
    async fn create_send_transport(
        &mut self,
        descriptor: &TransportDescriptor,
    ) -> Result<DtlsParameters, DeviceError>;

    /// Build the local receive transport. Returns the DTLS parameters for
    /// `connectConsumerTransport`.
    async fn create_recv_transport(
        &mut self,
        descriptor: &TransportDescriptor,
    ) -> Result<DtlsParameters, DeviceError>;

    /// Start encoding `track` on the send transport and return the RTP
    /// parameters to announce with `produce`.
    async fn produce(&mut self, track: &LocalTrack) -> Result<RtpParameters, DeviceError>;

    async fn set_producer_paused(
        &mut self,
        source: TrackSource,
        paused: bool,
    ) -> Result<(), DeviceError>;

    async fn close_producer(&mut self, source: TrackSource);

    /// Attach a server consumer to the receive transport.
    async fn consume(&mut self, consumer: &ConsumerInfo) -> Result<(), DeviceError>;

    async fn close_consumer(&mut self, consumer_id: ConsumerId);

    /// Release everything.
    async fn close(&mut self);
}
