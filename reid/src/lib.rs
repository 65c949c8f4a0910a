//! Real-time object tracking with asynchronous identity resolution.
//!
//! Each frame's detections are associated to tracks by bounding-box
//! overlap ([`Tracker`]). Tracks without an identity are queued to a worker
//! pool ([`Pipeline`]) that embeds them, looks the embedding up in a
//! [`SimilarityStore`], and either binds the track to the nearest stored
//! identity or creates a new one named `Unknown_<n>`. Results land in the
//! [`IdentityCache`] and show up on later frames; frame calls never wait.
//!
//! ```text
//! detections ─► Tracker ─► Session ─┬─► annotate (cache hit / processing / unknown)
//!                                   └─► Pipeline ─► IdentityRegistry ─► SimilarityStore
//!                                                        │
//!                                                        └─► IdentityCache
//! ```
//!
//! [`Session`] owns all of it and exposes the operator actions: rename,
//! merge, dismiss, duplicate scans, listing, and reset.

pub mod annotate;
pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod tracker;
pub mod types;

pub use annotate::{FaceRecord, FrameSummary};
pub use cache::{IdentityCache, InFlight};
pub use config::ReidConfig;
pub use error::{ReidError, StoreError};
pub use model::{Detector, Embedder};
pub use pipeline::{Job, Pipeline, Resolver, Submit};
pub use registry::{DuplicatePair, IdentityRegistry, Resolution};
pub use session::{AdminOutcome, Session, SessionBuilder, SessionStatus, UnknownIdentity};
pub use snapshot::ImageStore;
pub use store::{
    MemoryRecords, Metadata, RecordBackend, RedbRecords, SimilarityStore, StoreMatch,
    StoredIdentity, VectorStore,
};
pub use tracker::{Track, TrackUpdate, Tracker};
pub use types::{BBox, Binding, Detection, Identity, ReidNum, Status, TrackId, TrackedDetection};
