//! In-process media engine.
//!
//! `LoopbackEngine` keeps the full worker/router/transport/producer/consumer
//! object graph without moving any RTP. Connection state, audio levels and
//! worker death are driven by hooks, which is how tests simulate network
//! failures and speech. Resource usage is sampled from the host process.

use super::codecs::{is_consumable, router_capabilities};
use super::{
    EngineError, MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaTransport,
    MediaWorker, ResourceUsage, TransportSettings, TransportState, WorkerSettings,
};
use async_trait::async_trait;
use common::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId};
use parking_lot::Mutex;
use signaling_protocol::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, IceProtocol,
    RtpCapabilities, RtpCodecCapability, RtpParameters, TransportDescriptor,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

type ProducerTable = Arc<Mutex<HashMap<ProducerId, Arc<LoopbackProducer>>>>;

/// Lookup tables shared by every object of one engine, used by test hooks.
#[derive(Default)]
struct Registry {
    workers: Mutex<Vec<Arc<LoopbackWorker>>>,
    transports: Mutex<HashMap<TransportId, Weak<LoopbackTransport>>>,
    producers: Mutex<HashMap<ProducerId, Weak<LoopbackProducer>>>,
    fail_router_creation: AtomicBool,
}

/// In-process [`MediaEngine`].
#[derive(Clone, Default)]
pub struct LoopbackEngine {
    registry: Arc<Registry>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker created with `index`, if any.
    #[must_use]
    pub fn worker(&self, index: usize) -> Option<Arc<LoopbackWorker>> {
        self.registry
            .workers
            .lock()
            .iter()
            .find(|w| w.index == index)
            .cloned()
    }

    #[must_use]
    pub fn transport(&self, id: TransportId) -> Option<Arc<LoopbackTransport>> {
        self.registry
            .transports
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
    }

    #[must_use]
    pub fn producer(&self, id: ProducerId) -> Option<Arc<LoopbackProducer>> {
        self.registry.producers.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Make every subsequent `create_router` call fail.
    pub fn set_router_creation_fails(&self, fails: bool) {
        self.registry
            .fail_router_creation
            .store(fails, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_worker(
        &self,
        index: usize,
        settings: &WorkerSettings,
    ) -> Result<Arc<dyn MediaWorker>, EngineError> {
        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::Failed(format!(
                "invalid RTC port range {}-{}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let pid = std::process::id();
        let worker = Arc::new(LoopbackWorker {
            index,
            pid,
            usage: Arc::new(Mutex::new(UsageSampler::new(Pid::from_u32(pid)))),
            ports: Arc::new(PortRange {
                min: settings.rtc_min_port,
                max: settings.rtc_max_port,
                next: AtomicU32::new(0),
            }),
            routers: Mutex::new(Vec::new()),
            died: CancellationToken::new(),
            death_reason: Mutex::new(None),
            closed: AtomicBool::new(false),
            registry: Arc::clone(&self.registry),
        });
        self.registry.workers.lock().push(Arc::clone(&worker));
        Ok(worker)
    }
}

struct PortRange {
    min: u16,
    max: u16,
    next: AtomicU32,
}

impl PortRange {
    fn allocate(&self) -> u16 {
        let span = u32::from(self.max - self.min) + 1;
        let offset = self.next.fetch_add(1, Ordering::Relaxed) % span;
        // offset < span <= u16::MAX + 1, so the sum stays within max
        u16::try_from(u32::from(self.min) + offset).unwrap_or(self.max)
    }
}

/// CPU accounting for one worker. sysinfo reports process CPU usage as the
/// delta between two refreshes of the same `System`, so it lives as long as
/// the worker.
struct UsageSampler {
    system: System,
    last_sample: Instant,
    cpu_time: Duration,
}

impl UsageSampler {
    fn new(pid: Pid) -> Self {
        let mut system = System::new();
        system.refresh_process(pid);
        Self {
            system,
            last_sample: Instant::now(),
            cpu_time: Duration::ZERO,
        }
    }

    fn sample(&mut self, pid: Pid) -> ResourceUsage {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample);
        self.last_sample = now;

        if !self.system.refresh_process(pid) {
            return ResourceUsage::default();
        }
        let Some(process) = self.system.process(pid) else {
            return ResourceUsage::default();
        };

        let cpu_percent = process.cpu_usage();
        self.cpu_time += elapsed.mul_f64(f64::from(cpu_percent.max(0.0)) / 100.0);
        ResourceUsage {
            cpu_percent,
            rss_bytes: process.memory(),
            cpu_time_ms: u64::try_from(self.cpu_time.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Simulated worker process.
pub struct LoopbackWorker {
    index: usize,
    pid: u32,
    usage: Arc<Mutex<UsageSampler>>,
    ports: Arc<PortRange>,
    routers: Mutex<Vec<Arc<LoopbackRouter>>>,
    died: CancellationToken,
    death_reason: Mutex<Option<String>>,
    closed: AtomicBool,
    registry: Arc<Registry>,
}

impl LoopbackWorker {
    /// Simulate a fatal worker crash.
    pub fn kill(&self, reason: &str) {
        warn!(
            target: "rc.media.loopback",
            worker_index = self.index,
            reason = %reason,
            "Simulating worker death"
        );
        *self.death_reason.lock() = Some(reason.to_string());
        self.closed.store(true, Ordering::SeqCst);
        let routers = std::mem::take(&mut *self.routers.lock());
        for router in routers {
            router.close_now();
        }
        self.died.cancel();
    }
}

#[async_trait]
impl MediaWorker for LoopbackWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn router_count(&self) -> usize {
        self.routers
            .lock()
            .iter()
            .filter(|r| !r.closed.load(Ordering::SeqCst))
            .count()
    }

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::WorkerClosed);
        }
        if self.registry.fail_router_creation.load(Ordering::SeqCst) {
            return Err(EngineError::Failed("router creation rejected".to_string()));
        }

        let router = Arc::new(LoopbackRouter {
            id: RouterId::new(),
            capabilities: router_capabilities(codecs),
            ports: Arc::clone(&self.ports),
            producers: Arc::default(),
            transports: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            registry: Arc::clone(&self.registry),
        });

        let mut routers = self.routers.lock();
        routers.retain(|r| !r.closed.load(Ordering::SeqCst));
        routers.push(Arc::clone(&router));
        drop(routers);

        debug!(
            target: "rc.media.loopback",
            worker_index = self.index,
            router_id = %router.id,
            "Router created"
        );
        Ok(router)
    }

    async fn resource_usage(&self) -> Result<ResourceUsage, EngineError> {
        let pid = Pid::from_u32(self.pid);
        let usage = Arc::clone(&self.usage);
        tokio::task::spawn_blocking(move || usage.lock().sample(pid))
        .await
        .map_err(|e| EngineError::Failed(format!("resource sampling failed: {e}")))
    }

    async fn died(&self) -> String {
        self.died.cancelled().await;
        self.death_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let routers = std::mem::take(&mut *self.routers.lock());
        for router in routers {
            router.close_now();
        }
    }
}

/// Simulated routing context.
pub struct LoopbackRouter {
    id: RouterId,
    capabilities: RtpCapabilities,
    ports: Arc<PortRange>,
    producers: ProducerTable,
    transports: Mutex<Vec<Arc<LoopbackTransport>>>,
    closed: AtomicBool,
    registry: Arc<Registry>,
}

impl LoopbackRouter {
    fn close_now(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports = std::mem::take(&mut *self.transports.lock());
        for transport in transports {
            transport.close_now();
        }
        self.producers.lock().clear();
    }
}

#[async_trait]
impl MediaRouter for LoopbackRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn MediaTransport>, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::RouterClosed);
        }

        let id = TransportId::new();
        let port = self.ports.allocate();
        let ip = settings.candidate_ip();
        let mut ice_candidates = Vec::new();
        if settings.enable_udp {
            ice_candidates.push(host_candidate(&ip, port, IceProtocol::Udp, settings.prefer_udp));
        }
        if settings.enable_tcp {
            ice_candidates.push(host_candidate(&ip, port, IceProtocol::Tcp, !settings.prefer_udp));
        }

        let descriptor = TransportDescriptor {
            id,
            ice_parameters: IceParameters {
                username_fragment: Uuid::new_v4().simple().to_string(),
                password: Uuid::new_v4().simple().to_string(),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Auto),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: fingerprint_value(),
                }],
            },
        };

        let (state_tx, _) = watch::channel(TransportState::New);
        let transport = Arc::new(LoopbackTransport {
            id,
            descriptor,
            state_tx,
            router_producers: Arc::clone(&self.producers),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            next_mid: AtomicU32::new(0),
            registry: Arc::clone(&self.registry),
        });

        self.transports.lock().push(Arc::clone(&transport));
        self.registry
            .transports
            .lock()
            .insert(id, Arc::downgrade(&transport));
        Ok(transport)
    }

    fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool {
        self.producers
            .lock()
            .get(&producer_id)
            .is_some_and(|p| is_consumable(p.kind, &p.rtp_parameters, capabilities))
    }

    async fn close(&self) {
        self.close_now();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn host_candidate(ip: &str, port: u16, protocol: IceProtocol, preferred: bool) -> IceCandidate {
    IceCandidate {
        foundation: format!("{}candidate", protocol_name(protocol)),
        priority: if preferred { 1_076_302_079 } else { 1_076_276_479 },
        ip: ip.to_string(),
        protocol,
        port,
        candidate_type: "host".to_string(),
    }
}

fn protocol_name(protocol: IceProtocol) -> &'static str {
    match protocol {
        IceProtocol::Udp => "udp",
        IceProtocol::Tcp => "tcp",
    }
}

fn fingerprint_value() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Simulated WebRTC transport.
pub struct LoopbackTransport {
    id: TransportId,
    descriptor: TransportDescriptor,
    state_tx: watch::Sender<TransportState>,
    router_producers: ProducerTable,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
    next_mid: AtomicU32,
    registry: Arc<Registry>,
}

impl LoopbackTransport {
    /// Force a connection state, as ICE/DTLS would.
    ///
    /// Terminal states close everything riding on the transport.
    pub fn set_state(&self, state: TransportState) {
        if state.is_terminal() {
            self.teardown();
        }
        self.state_tx.send_replace(state);
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.state_tx.borrow()
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.state().is_terminal() {
            Err(EngineError::TransportClosed)
        } else {
            Ok(())
        }
    }

    fn teardown(&self) {
        let producers = std::mem::take(&mut *self.producers.lock());
        for producer in producers {
            producer.close_now();
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            consumer.close_now();
        }
        self.registry.transports.lock().remove(&self.id);
    }

    fn close_now(&self) {
        if self.state() == TransportState::Closed {
            return;
        }
        self.set_state(TransportState::Closed);
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn descriptor(&self) -> TransportDescriptor {
        self.descriptor.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.state() == TransportState::Connected {
            return Err(EngineError::AlreadyConnected);
        }
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "missing DTLS fingerprints".to_string(),
            ));
        }
        self.state_tx.send_replace(TransportState::Connecting);
        self.state_tx.send_replace(TransportState::Connected);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn MediaProducer>, EngineError> {
        self.ensure_open()?;
        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "no codecs in RTP parameters".to_string(),
            ));
        }

        let producer = Arc::new(LoopbackProducer {
            id: ProducerId::new(),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(false),
            audio_level: Mutex::new(None),
            closed: AtomicBool::new(false),
            router_producers: Arc::clone(&self.router_producers),
            registry: Arc::clone(&self.registry),
        });

        self.router_producers
            .lock()
            .insert(producer.id, Arc::clone(&producer));
        self.registry
            .producers
            .lock()
            .insert(producer.id, Arc::downgrade(&producer));
        self.producers.lock().push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, EngineError> {
        self.ensure_open()?;
        let producer = self
            .router_producers
            .lock()
            .get(&producer_id)
            .cloned()
            .ok_or(EngineError::ProducerNotFound(producer_id))?;

        if !is_consumable(producer.kind, &producer.rtp_parameters, capabilities) {
            return Err(EngineError::CannotConsume(producer_id));
        }

        let mut rtp_parameters = producer.rtp_parameters.clone();
        rtp_parameters.mid = Some(self.next_mid.fetch_add(1, Ordering::Relaxed).to_string());

        let consumer = Arc::new(LoopbackConsumer {
            id: ConsumerId::new(),
            producer_id,
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().push(Arc::clone(&consumer));
        Ok(consumer)
    }

    fn state_changes(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    async fn close(&self) {
        self.close_now();
    }
}

/// Simulated outgoing track.
pub struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    audio_level: Mutex<Option<f32>>,
    closed: AtomicBool,
    router_producers: ProducerTable,
    registry: Arc<Registry>,
}

impl LoopbackProducer {
    /// Set the volume the level observer will report (dBov).
    pub fn set_audio_level(&self, level: Option<f32>) {
        *self.audio_level.lock() = level;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close_now(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.router_producers.lock().remove(&self.id);
        self.registry.producers.lock().remove(&self.id);
    }
}

#[async_trait]
impl MediaProducer for LoopbackProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn pause(&self) -> Result<(), EngineError> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn audio_level(&self) -> Option<f32> {
        if self.is_closed() || self.is_paused() {
            return None;
        }
        *self.audio_level.lock()
    }

    async fn close(&self) {
        self.close_now();
    }
}

/// Simulated incoming track.
pub struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackConsumer {
    fn close_now(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaConsumer for LoopbackConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::TransportClosed);
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.close_now();
    }
}
