//! Off-frame identity resolution.
//!
//! A bounded channel feeds a fixed pool of tokio workers. Each job's
//! blocking work (embedding, store lookup, allocation) runs on the
//! blocking pool under a deadline that also bounds the publish step. Only a
//! completed attempt publishes into the [`IdentityCache`], and the
//! in-flight mark is released after that.

use std::sync::Arc;
use std::time::Duration;

use gazer_vecstore::l2_normalize;
use image::RgbImage;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{IdentityCache, InFlight};
use crate::config::ReidConfig;
use crate::error::ReidError;
use crate::model::Embedder;
use crate::registry::{IdentityRegistry, Resolution};
use crate::types::TrackId;

/// One resolution request.
#[derive(Debug, Clone)]
pub struct Job {
    pub track_id: TrackId,
    pub embedding: Option<Vec<f32>>,
    pub crop: Option<RgbImage>,
}

/// Result of [`Pipeline::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// Queued for a worker.
    Accepted,
    /// An attempt for this track is already queued or running.
    InFlight,
    /// The track already has a binding.
    Resolved,
    /// Dropped; the track can be submitted again later.
    QueueFull,
    /// The pipeline is shut down.
    Closed,
}

impl Submit {
    pub fn accepted(self) -> bool {
        self == Submit::Accepted
    }
}

/// Turns a job into a resolved identity. Blocking.
pub struct Resolver {
    registry: Arc<IdentityRegistry>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl Resolver {
    pub fn new(registry: Arc<IdentityRegistry>, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self { registry, embedder }
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    /// Uses the job's embedding, or embeds its crop, then matches or
    /// allocates an identity.
    pub fn resolve(&self, job: &Job) -> Result<Resolution, ReidError> {
        self.resolve_detection(job.embedding.as_deref(), job.crop.as_ref())
    }

    /// Same as [`Resolver::resolve`] for a detection with no track.
    pub fn resolve_detection(
        &self,
        embedding: Option<&[f32]>,
        crop: Option<&RgbImage>,
    ) -> Result<Resolution, ReidError> {
        let mut embedding = match (embedding, crop, &self.embedder) {
            (Some(e), _, _) => e.to_vec(),
            (None, Some(crop), Some(embedder)) => embedder.embed(crop)?,
            (None, Some(_), None) => {
                return Err(ReidError::Embed("crop given but no embedder configured".into()));
            }
            (None, None, _) => return Err(ReidError::Embed("nothing to embed".into())),
        };
        if !l2_normalize(&mut embedding) {
            return Err(ReidError::Embed("zero or non-finite embedding".into()));
        }
        self.registry.resolve(&embedding, crop)
    }
}

/// Bounded queue plus worker pool.
pub struct Pipeline {
    tx: mpsc::Sender<Job>,
    capacity: usize,
    cache: Arc<IdentityCache>,
    inflight: Arc<InFlight>,
    workers: Vec<JoinHandle<()>>,
}

struct WorkerContext {
    resolver: Arc<Resolver>,
    cache: Arc<IdentityCache>,
    inflight: Arc<InFlight>,
    timeout: Duration,
}

impl Pipeline {
    /// Spawns `cfg.workers` workers on the current tokio runtime.
    pub fn start(
        resolver: Arc<Resolver>,
        cache: Arc<IdentityCache>,
        inflight: Arc<InFlight>,
        cfg: &ReidConfig,
    ) -> Self {
        let capacity = cfg.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let ctx = Arc::new(WorkerContext {
            resolver,
            cache: Arc::clone(&cache),
            inflight: Arc::clone(&inflight),
            timeout: cfg.resolve_timeout(),
        });

        let workers = (0..cfg.workers.max(1))
            .map(|n| {
                let rx = Arc::clone(&rx);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        let track = job.track_id;
                        ctx.run(job).await;
                        ctx.inflight.release(track);
                    }
                    debug!(worker = n, "resolution worker stopped");
                })
            })
            .collect::<Vec<_>>();

        info!(workers = workers.len(), capacity, "resolution pipeline started");
        Self {
            tx,
            capacity,
            cache,
            inflight,
            workers,
        }
    }

    /// Queues `job` without waiting.
    ///
    /// The track is marked in flight before it is queued. A track that is
    /// already in flight or already bound is not queued again; a full or
    /// closed queue drops the job and clears the mark.
    pub fn submit(&self, job: Job) -> Submit {
        let track = job.track_id;
        if !self.inflight.try_claim(track) {
            return Submit::InFlight;
        }
        if self.cache.contains(track) {
            self.inflight.release(track);
            return Submit::Resolved;
        }
        match self.tx.try_send(job) {
            Ok(()) => {
                debug!(track_id = %track, "resolution queued");
                Submit::Accepted
            }
            Err(TrySendError::Full(_)) => {
                self.inflight.release(track);
                warn!(track_id = %track, "resolution queue full, dropping");
                Submit::QueueFull
            }
            Err(TrySendError::Closed(_)) => {
                self.inflight.release(track);
                Submit::Closed
            }
        }
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!(error = %e, "resolution worker failed");
            }
        }
    }
}

impl WorkerContext {
    /// Resolves and publishes one job. Both steps share one deadline.
    async fn run(&self, job: Job) {
        let track = job.track_id;
        let deadline = Instant::now() + self.timeout;
        let resolver = Arc::clone(&self.resolver);
        let attempt = tokio::task::spawn_blocking(move || resolver.resolve(&job));

        let resolution = match tokio::time::timeout_at(deadline, attempt).await {
            Ok(Ok(Ok(r))) => r,
            Ok(Ok(Err(e))) => {
                warn!(track_id = %track, error = %e, "resolution failed");
                return;
            }
            Ok(Err(e)) => {
                error!(track_id = %track, error = %e, "resolution task panicked");
                return;
            }
            Err(_) => {
                warn!(track_id = %track, timeout = ?self.timeout, "resolution timed out");
                return;
            }
        };

        let registry = Arc::clone(self.resolver.registry());
        let cache = Arc::clone(&self.cache);
        let reid = resolution.binding.reid;
        let wait = deadline.saturating_duration_since(Instant::now());
        let published =
            tokio::task::spawn_blocking(move || registry.publish(&cache, track, reid, wait)).await;
        match published {
            Ok(Ok(binding)) => debug!(
                track_id = %track,
                reid = %binding.reid,
                created = resolution.created,
                similarity = ?resolution.similarity,
                "track resolved"
            ),
            Ok(Err(e)) => warn!(track_id = %track, error = %e, "publish failed"),
            Err(e) => error!(track_id = %track, error = %e, "publish task panicked"),
        }
    }
}
