//! Frame processing and operator actions over one shared state.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use image::RgbImage;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::annotate::{self, FaceRecord, FrameSummary};
use crate::cache::{IdentityCache, InFlight};
use crate::config::ReidConfig;
use crate::error::ReidError;
use crate::model::{Detector, Embedder};
use crate::pipeline::{Job, Pipeline, Resolver, Submit};
use crate::registry::{DuplicatePair, IdentityRegistry};
use crate::snapshot::ImageStore;
use crate::store::{SimilarityStore, VectorStore};
use crate::tracker::Tracker;
use crate::types::{
    Binding, DISMISSED_PREFIX, Detection, Identity, ReidNum, Status, TrackedDetection, dismissed_name,
    is_placeholder,
};

/// Result of an operator action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminOutcome {
    pub success: bool,
    pub message: String,
}

impl AdminOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// An auto-named identity awaiting an operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownIdentity {
    pub reid: ReidNum,
    pub name: String,
    pub has_image: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub frames: u64,
    pub live_tracks: usize,
    pub cached_bindings: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub resident_identities: usize,
    pub stored_identities: usize,
    pub similarity_threshold: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_dir: Option<PathBuf>,
}

/// Assembles a [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    config: ReidConfig,
    store: Option<Arc<dyn SimilarityStore>>,
    detector: Option<Arc<dyn Detector>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ReidConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to an in-memory [`VectorStore`].
    pub fn store(mut self, store: Arc<dyn SimilarityStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Needed by [`Session::process_frame`] only.
    pub fn detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Needed for detections that carry a crop but no embedding.
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Opens the registry and starts the workers. Must be called from
    /// within a tokio runtime.
    pub fn build(self) -> Result<Session, ReidError> {
        let config = self.config.with_defaults();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(VectorStore::in_memory()));
        let images = config
            .image_dir
            .as_ref()
            .map(|dir| ImageStore::open(dir.clone()))
            .transpose()?;
        let registry = Arc::new(IdentityRegistry::open(
            store,
            images,
            config.similarity_threshold,
            config.query_k,
        )?);

        let cache = Arc::new(IdentityCache::new());
        let inflight = Arc::new(InFlight::new());
        let resolver = Arc::new(Resolver::new(Arc::clone(&registry), self.embedder));
        let pipeline = Pipeline::start(
            Arc::clone(&resolver),
            Arc::clone(&cache),
            Arc::clone(&inflight),
            &config,
        );

        Ok(Session {
            tracker: Mutex::new(Tracker::new(config.iou_threshold, config.max_age)),
            config,
            cache,
            inflight,
            registry,
            resolver,
            pipeline,
            detector: self.detector,
            frames: AtomicU64::new(0),
        })
    }
}

/// Owns the tracker, the identity cache, and the resolution pipeline.
///
/// Frame calls never wait for resolution: a detection whose track is not
/// yet bound is queued and reported as unknown (or processing) until a
/// worker publishes its identity.
pub struct Session {
    config: ReidConfig,
    tracker: Mutex<Tracker>,
    cache: Arc<IdentityCache>,
    inflight: Arc<InFlight>,
    registry: Arc<IdentityRegistry>,
    resolver: Arc<Resolver>,
    pipeline: Pipeline,
    detector: Option<Arc<dyn Detector>>,
    frames: AtomicU64,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn config(&self) -> &ReidConfig {
        &self.config
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// Detects, tracks, and annotates one frame.
    ///
    /// A detector failure is logged and treated as an empty frame.
    pub fn process_frame(&self, frame: &RgbImage) -> Result<(RgbImage, FrameSummary), ReidError> {
        let detector = self
            .detector
            .as_ref()
            .ok_or_else(|| ReidError::InvalidInput("no detector configured".into()))?;
        let detections = match detector.detect(frame) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "detection failed");
                vec![]
            }
        };
        let detections = detections
            .into_iter()
            .map(|mut d| {
                if d.crop.is_none() {
                    d.crop = annotate::crop_region(frame, &d.bbox);
                }
                d
            })
            .collect();

        let tracked = self.track(detections);
        Ok(self.annotate(frame, tracked))
    }

    /// Tracks and summarizes detections without touching pixels.
    pub fn process_detections(&self, detections: Vec<Detection>) -> FrameSummary {
        let tracked = self.track(detections);
        self.summarize(tracked)
    }

    /// Resolves every detection inline, without tracking.
    ///
    /// Blocks on the store. Nothing is cached, so the same person is looked
    /// up again on every frame. A detection that fails to resolve is
    /// reported as unknown.
    pub fn identify(&self, detections: Vec<Detection>) -> FrameSummary {
        let faces = detections
            .into_iter()
            .map(|d| {
                let binding = if d.is_resolvable() {
                    match self
                        .resolver
                        .resolve_detection(d.embedding.as_deref(), d.crop.as_ref())
                    {
                        Ok(r) => Some(r.binding),
                        Err(e) => {
                            warn!(error = %e, "identify failed");
                            None
                        }
                    }
                } else {
                    None
                };
                FaceRecord {
                    track_id: None,
                    status: binding.as_ref().map_or(Status::Unknown, Binding::status),
                    reid: binding.as_ref().map(|b| b.reid),
                    name: binding.map(|b| b.name),
                    bbox: d.bbox,
                    confidence: d.confidence,
                }
            })
            .collect();
        self.frames.fetch_add(1, Ordering::Relaxed);
        FrameSummary::from_faces(faces)
    }

    /// Runs the tracker and drops cache entries of tracks that left.
    pub fn track(&self, detections: Vec<Detection>) -> Vec<TrackedDetection> {
        let (update, pruned) = {
            let mut tracker = self.tracker.lock();
            let update = tracker.update(detections);
            let pruned = self.cache.retain_live(&tracker.live_ids());
            (update, pruned)
        };
        if pruned > 0 || !update.evicted.is_empty() {
            debug!(evicted = update.evicted.len(), pruned, "tracks dropped");
        }
        self.frames.fetch_add(1, Ordering::Relaxed);
        update.tracked
    }

    /// Draws `tracked` onto a copy of `frame` and summarizes it.
    pub fn annotate(&self, frame: &RgbImage, tracked: Vec<TrackedDetection>) -> (RgbImage, FrameSummary) {
        let summary = self.summarize(tracked);
        (annotate::draw(frame, &summary.faces), summary)
    }

    /// Reports what is known about each detection, queuing resolution for
    /// tracks that have no binding and none in flight.
    pub fn summarize(&self, tracked: Vec<TrackedDetection>) -> FrameSummary {
        let faces = tracked.into_iter().map(|td| self.annotate_one(td)).collect();
        FrameSummary::from_faces(faces)
    }

    fn annotate_one(&self, td: TrackedDetection) -> FaceRecord {
        let TrackedDetection {
            track_id,
            detection,
        } = td;
        let bbox = detection.bbox;
        let confidence = detection.confidence;
        let record = |binding: Option<Binding>, status: Status| FaceRecord {
            track_id: Some(track_id),
            reid: binding.as_ref().map(|b| b.reid),
            name: binding.map(|b| b.name),
            bbox,
            confidence,
            status,
        };

        if let Some(b) = self.cache.get(track_id) {
            let status = b.status();
            return record(Some(b), status);
        }
        if self.inflight.contains(track_id) {
            return record(None, Status::Processing);
        }
        if !detection.is_resolvable() {
            return record(None, Status::Unknown);
        }

        let job = Job {
            track_id,
            embedding: detection.embedding,
            crop: detection.crop,
        };
        match self.pipeline.submit(job) {
            Submit::InFlight => record(None, Status::Processing),
            Submit::Resolved => match self.cache.get(track_id) {
                Some(b) => {
                    let status = b.status();
                    record(Some(b), status)
                }
                None => record(None, Status::Unknown),
            },
            Submit::Accepted | Submit::QueueFull | Submit::Closed => {
                record(None, Status::Unknown)
            }
        }
    }

    pub fn rename(&self, reid: &str, name: &str) -> AdminOutcome {
        let name = name.trim();
        if name.is_empty() {
            return AdminOutcome::fail("Name cannot be empty");
        }
        let Ok(reid) = reid.parse::<ReidNum>() else {
            return AdminOutcome::fail("Invalid ReID number");
        };
        match self.registry.rename(&self.cache, reid, name) {
            Ok(_) => AdminOutcome::ok(format!("Renamed ReID {reid} to {name}")),
            Err(e) => AdminOutcome::fail(e.to_string()),
        }
    }

    pub fn merge(&self, source: &str, target: &str) -> AdminOutcome {
        let (Ok(source), Ok(target)) = (source.parse::<ReidNum>(), target.parse::<ReidNum>())
        else {
            return AdminOutcome::fail("Invalid ReID numbers");
        };
        match self.registry.merge(&self.cache, source, target) {
            Ok(_) => AdminOutcome::ok(format!("Merged ReID {source} into {target}")),
            Err(e) => AdminOutcome::fail(e.to_string()),
        }
    }

    /// Renames an identity to `Dismissed_<n>`, taking it off the roster.
    pub fn dismiss(&self, reid: &str) -> AdminOutcome {
        let Ok(reid) = reid.parse::<ReidNum>() else {
            return AdminOutcome::fail("Invalid ReID number");
        };
        match self.registry.rename(&self.cache, reid, &dismissed_name(reid)) {
            Ok(_) => AdminOutcome::ok(format!("Dismissed ReID {reid}")),
            Err(e) => AdminOutcome::fail(e.to_string()),
        }
    }

    pub fn list_identities(&self) -> Result<Vec<Identity>, ReidError> {
        self.registry.identities()
    }

    /// Identities still carrying their `Unknown_<n>` name.
    pub fn unknown_identities(&self) -> Result<Vec<UnknownIdentity>, ReidError> {
        let images = self.registry.images();
        Ok(self
            .registry
            .identities()?
            .into_iter()
            .filter(|i| i.merged_into.is_none() && is_placeholder(&i.name))
            .map(|i| UnknownIdentity {
                has_image: images.is_some_and(|s| s.exists(i.reid)),
                reid: i.reid,
                name: i.name,
            })
            .collect())
    }

    /// Operator-named identities that are neither dismissed nor merged.
    pub fn roster(&self) -> Result<Vec<Identity>, ReidError> {
        Ok(self
            .registry
            .identities()?
            .into_iter()
            .filter(|i| {
                i.merged_into.is_none()
                    && !is_placeholder(&i.name)
                    && !i.name.starts_with(DISMISSED_PREFIX)
            })
            .collect())
    }

    /// The stored JPEG for `reid`, if any.
    pub fn identity_image(&self, reid: ReidNum) -> Result<Option<Vec<u8>>, ReidError> {
        match self.registry.images() {
            Some(images) => images.load(reid),
            None => Ok(None),
        }
    }

    /// Similar resident identities. `None` uses the configured duplicate
    /// threshold.
    pub fn find_duplicates(&self, threshold: Option<f32>) -> Result<Vec<DuplicatePair>, ReidError> {
        let threshold = threshold.unwrap_or_else(|| self.config.duplicate_threshold());
        self.registry.find_duplicates(threshold)
    }

    /// Forgets every live track and binding and zeroes the frame counter.
    /// Stored identities stay.
    pub fn reset(&self) {
        let mut tracker = self.tracker.lock();
        tracker.reset();
        self.cache.clear();
        self.frames.store(0, Ordering::Relaxed);
        drop(tracker);
        info!("session reset");
    }

    pub fn status(&self) -> Result<SessionStatus, ReidError> {
        Ok(SessionStatus {
            frames: self.frames.load(Ordering::Relaxed),
            live_tracks: self.tracker.lock().len(),
            cached_bindings: self.cache.len(),
            in_flight: self.inflight.len(),
            queued: self.pipeline.queued(),
            resident_identities: self.registry.resident_len(),
            stored_identities: self.registry.stored_len()?,
            similarity_threshold: self.registry.threshold(),
            image_dir: self.registry.images().map(|s| s.dir().to_path_buf()),
        })
    }

    /// Stops the workers after the queued jobs finish.
    pub async fn shutdown(self) {
        self.pipeline.shutdown().await;
    }
}
