//! Media worker pool.
//!
//! A fixed set of workers created at startup. Rooms are pinned to routers
//! handed out in round-robin order across the workers; there is no load
//! based placement and no migration.
//!
//! Worker death is fatal: each worker has a supervisor task that logs the
//! failure and cancels the pool's fatal token, which the binary turns into
//! a non-zero exit so an external supervisor can restart the process.

use super::{EngineError, MediaEngine, MediaRouter, MediaWorker, ResourceUsage, WorkerSettings};
use futures::future::join_all;
use serde::Serialize;
use signaling_protocol::rtp::RtpCodecCapability;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A router assigned to a new room.
#[derive(Clone)]
pub struct RouterAssignment {
    pub router: Arc<dyn MediaRouter>,
    pub worker_index: usize,
}

/// Per-worker status for the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub index: usize,
    pub pid: u32,
    #[serde(flatten)]
    pub usage: ResourceUsage,
    pub routers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub workers: Vec<WorkerStatus>,
}

struct PooledWorker {
    index: usize,
    worker: Arc<dyn MediaWorker>,
}

/// Round-robin pool of media workers.
pub struct MediaPool {
    workers: Vec<PooledWorker>,
    next: AtomicUsize,
    codecs: Vec<RtpCodecCapability>,
    fatal: CancellationToken,
    supervisor_token: CancellationToken,
}

impl MediaPool {
    /// Start `size` workers.
    ///
    /// `fatal` is cancelled if any worker dies.
    ///
    /// # Errors
    ///
    /// Fails if `size` is zero or any worker fails to start.
    pub async fn create(
        engine: &dyn MediaEngine,
        size: usize,
        settings: &WorkerSettings,
        codecs: Vec<RtpCodecCapability>,
        fatal: CancellationToken,
    ) -> Result<Arc<Self>, EngineError> {
        if size == 0 {
            return Err(EngineError::Failed(
                "pool needs at least one worker".to_string(),
            ));
        }

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let worker = engine.create_worker(index, settings).await?;
            info!(
                target: "rc.media.pool",
                worker_index = index,
                pid = worker.pid(),
                "Media worker started"
            );
            workers.push(PooledWorker { index, worker });
        }

        let pool = Arc::new(Self {
            workers,
            next: AtomicUsize::new(0),
            codecs,
            fatal,
            supervisor_token: CancellationToken::new(),
        });

        for pooled in &pool.workers {
            tokio::spawn(supervise(
                pooled.index,
                Arc::clone(&pooled.worker),
                pool.fatal.clone(),
                pool.supervisor_token.clone(),
            ));
        }

        Ok(pool)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Token cancelled when a worker dies.
    #[must_use]
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Create a router on the next worker in round-robin order.
    ///
    /// # Errors
    ///
    /// Propagates the engine error if the worker cannot create a router.
    pub async fn assign_router(&self) -> Result<RouterAssignment, EngineError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let pooled = self.workers.get(index).ok_or(EngineError::WorkerClosed)?;

        let router = pooled.worker.create_router(&self.codecs).await?;
        info!(
            target: "rc.media.pool",
            worker_index = pooled.index,
            router_id = %router.id(),
            "Router assigned"
        );

        Ok(RouterAssignment {
            router,
            worker_index: pooled.index,
        })
    }

    /// Sample every worker. Runs on demand, never on the media path.
    pub async fn status(&self) -> PoolStatus {
        let samples = join_all(self.workers.iter().map(|pooled| async move {
            let usage = match pooled.worker.resource_usage().await {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(
                        target: "rc.media.pool",
                        worker_index = pooled.index,
                        error = %e,
                        "Failed to sample worker resource usage"
                    );
                    ResourceUsage::default()
                }
            };
            WorkerStatus {
                index: pooled.index,
                pid: pooled.worker.pid(),
                usage,
                routers: pooled.worker.router_count(),
            }
        }))
        .await;

        PoolStatus { workers: samples }
    }

    /// Stop supervising and close every worker.
    pub async fn close(&self) {
        self.supervisor_token.cancel();
        for pooled in &self.workers {
            pooled.worker.close().await;
        }
        info!(target: "rc.media.pool", workers = self.workers.len(), "Media pool closed");
    }
}

async fn supervise(
    index: usize,
    worker: Arc<dyn MediaWorker>,
    fatal: CancellationToken,
    shutdown: CancellationToken,
) {
    tokio::select! {
        () = shutdown.cancelled() => {}
        () = fatal.cancelled() => {}
        reason = worker.died() => {
            error!(
                target: "rc.media.pool",
                worker_index = index,
                pid = worker.pid(),
                reason = %reason,
                "Media worker died, terminating process"
            );
            fatal.cancel();
        }
    }
}
