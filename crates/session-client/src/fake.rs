//! In-memory [`Device`] for tests.
//!
//! Behaves like a browser device that supports every codec the router
//! offers. A [`FakeDeviceProbe`] shares its state so tests can inspect
//! what the negotiator did after the device moved into the actor.

use crate::device::Device;
use crate::errors::DeviceError;
use crate::state::{LocalTrack, TrackSource};
use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, TransportId};
use parking_lot::Mutex;
use signaling_protocol::messages::ConsumerInfo;
use signaling_protocol::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, RtpCapabilities, RtpCodecParameters, RtpParameters,
    TransportDescriptor,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const FALLBACK_PAYLOAD_TYPE: u8 = 100;

#[derive(Debug, Default)]
struct FakeDeviceState {
    router_capabilities: Option<RtpCapabilities>,
    send_transport: Option<TransportId>,
    recv_transport: Option<TransportId>,
    /// Source -> paused.
    producers: HashMap<TrackSource, bool>,
    /// Attach order.
    consumers: Vec<ConsumerInfo>,
    closed_consumers: Vec<ConsumerId>,
    fail_load: bool,
    fail_produce: HashSet<TrackSource>,
    closed: bool,
}

/// Test device.
#[derive(Debug, Clone, Default)]
pub struct FakeDevice {
    state: Arc<Mutex<FakeDeviceState>>,
}

/// Read access to a [`FakeDevice`]'s state.
#[derive(Debug, Clone)]
pub struct FakeDeviceProbe {
    state: Arc<Mutex<FakeDeviceState>>,
}

impl FakeDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn probe(&self) -> FakeDeviceProbe {
        FakeDeviceProbe {
            state: Arc::clone(&self.state),
        }
    }

    /// Make `load` fail.
    #[must_use]
    pub fn failing_load(self) -> Self {
        self.state.lock().fail_load = true;
        self
    }

    /// Make `produce` fail for `source`.
    #[must_use]
    pub fn failing_produce(self, source: TrackSource) -> Self {
        self.state.lock().fail_produce.insert(source);
        self
    }
}

impl FakeDeviceProbe {
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.state.lock().router_capabilities.is_some()
    }

    #[must_use]
    pub fn send_transport(&self) -> Option<TransportId> {
        self.state.lock().send_transport
    }

    #[must_use]
    pub fn recv_transport(&self) -> Option<TransportId> {
        self.state.lock().recv_transport
    }

    /// Whether a producer for `source` exists, and if so whether it is paused.
    #[must_use]
    pub fn producer_paused(&self, source: TrackSource) -> Option<bool> {
        self.state.lock().producers.get(&source).copied()
    }

    /// Producers of attached consumers, in attach order.
    #[must_use]
    pub fn consumed_producers(&self) -> Vec<ProducerId> {
        self.state
            .lock()
            .consumers
            .iter()
            .map(|c| c.producer_id)
            .collect()
    }

    #[must_use]
    pub fn consumers(&self) -> Vec<ConsumerInfo> {
        self.state.lock().consumers.clone()
    }

    #[must_use]
    pub fn closed_consumers(&self) -> Vec<ConsumerId> {
        self.state.lock().closed_consumers.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

fn dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: Some(DtlsRole::Client),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "FA:KE:DE:VI:CE".to_string(),
        }],
    }
}

#[async_trait]
impl Device for FakeDevice {
    async fn load(&mut self, router_capabilities: &RtpCapabilities) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.fail_load {
            return Err(DeviceError::Other("load rejected".to_string()));
        }
        state.router_capabilities = Some(router_capabilities.clone());
        Ok(())
    }

    fn rtp_capabilities(&self) -> Result<RtpCapabilities, DeviceError> {
        self.state
            .lock()
            .router_capabilities
            .clone()
            .ok_or(DeviceError::NotLoaded)
    }

    async fn create_send_transport(
        &mut self,
        descriptor: &TransportDescriptor,
    ) -> Result<DtlsParameters, DeviceError> {
        let mut state = self.state.lock();
        if state.router_capabilities.is_none() {
            return Err(DeviceError::NotLoaded);
        }
        state.send_transport = Some(descriptor.id);
        Ok(dtls_parameters())
    }

    async fn create_recv_transport(
        &mut self,
        descriptor: &TransportDescriptor,
    ) -> Result<DtlsParameters, DeviceError> {
        let mut state = self.state.lock();
        if state.router_capabilities.is_none() {
            return Err(DeviceError::NotLoaded);
        }
        state.recv_transport = Some(descriptor.id);
        Ok(dtls_parameters())
    }

    async fn produce(&mut self, track: &LocalTrack) -> Result<RtpParameters, DeviceError> {
        let mut state = self.state.lock();
        if state.send_transport.is_none() {
            return Err(DeviceError::TransportMissing("send"));
        }
        if state.fail_produce.contains(&track.source) {
            return Err(DeviceError::Track(format!("{} unavailable", track.source)));
        }
        let codec = state
            .router_capabilities
            .as_ref()
            .ok_or(DeviceError::NotLoaded)?
            .codecs
            .iter()
            .find(|c| c.kind == track.kind)
            .ok_or_else(|| DeviceError::UnsupportedCodec(track.kind.to_string()))?;

        let parameters = RtpParameters {
            mid: Some(track.source.as_str().to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec.preferred_payload_type.unwrap_or(FALLBACK_PAYLOAD_TYPE),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: codec.rtcp_feedback.clone(),
            }],
            ..RtpParameters::default()
        };
        state.producers.insert(track.source, false);
        Ok(parameters)
    }

    async fn set_producer_paused(
        &mut self,
        source: TrackSource,
        paused: bool,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let producer = state
            .producers
            .get_mut(&source)
            .ok_or_else(|| DeviceError::Track(format!("no {source} producer")))?;
        *producer = paused;
        Ok(())
    }

    async fn close_producer(&mut self, source: TrackSource) {
        self.state.lock().producers.remove(&source);
    }

    async fn consume(&mut self, consumer: &ConsumerInfo) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.recv_transport.is_none() {
            return Err(DeviceError::TransportMissing("receive"));
        }
        state.consumers.push(consumer.clone());
        Ok(())
    }

    async fn close_consumer(&mut self, consumer_id: ConsumerId) {
        let mut state = self.state.lock();
        let before = state.consumers.len();
        state.consumers.retain(|c| c.id != consumer_id);
        if state.consumers.len() != before {
            state.closed_consumers.push(consumer_id);
        }
    }

    async fn close(&mut self) {
        let mut state = self.state.lock();
        state.producers.clear();
        state.consumers.clear();
        state.send_transport = None;
        state.recv_transport = None;
        state.closed = true;
    }
}
