//! Frame-to-frame association by bounding-box overlap.

use std::collections::{BTreeMap, HashSet};

use tracing::trace;

use crate::types::{BBox, Detection, TrackId, TrackedDetection};

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
pub const DEFAULT_MAX_AGE: u32 = 5;

/// One object followed across frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: TrackId,

    /// Box from the most recent matched detection.
    pub bbox: BBox,

    /// Frames since the last match (0 on the frame it matched).
    pub age: u32,
}

/// Result of [`Tracker::update`].
#[derive(Debug, Default)]
pub struct TrackUpdate {
    /// The input detections in input order, each with its track.
    pub tracked: Vec<TrackedDetection>,

    /// Tracks removed this frame for exceeding the max age.
    pub evicted: Vec<TrackId>,
}

/// Greedy IoU tracker.
///
/// Each detection, in input order, takes the still-unmatched track with
/// the highest IoU strictly above the threshold. Equal IoUs go to the
/// lowest track id. Ids start at 1, only ever increase, and survive
/// [`Tracker::reset`], so an id never names two different objects.
#[derive(Debug)]
pub struct Tracker {
    iou_threshold: f32,
    max_age: u32,
    tracks: BTreeMap<TrackId, Track>,
    next_id: u64,
}

impl Tracker {
    pub fn new(iou_threshold: f32, max_age: u32) -> Self {
        Self {
            iou_threshold,
            max_age: max_age.max(1),
            tracks: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn update(&mut self, detections: Vec<Detection>) -> TrackUpdate {
        for track in self.tracks.values_mut() {
            track.age += 1;
        }

        let mut matched: HashSet<TrackId> = HashSet::with_capacity(detections.len());
        let mut assigned: Vec<Option<TrackId>> = Vec::with_capacity(detections.len());

        for det in &detections {
            let mut best_iou = self.iou_threshold;
            let mut best: Option<TrackId> = None;
            for (id, track) in &self.tracks {
                if matched.contains(id) {
                    continue;
                }
                let iou = det.bbox.iou(&track.bbox);
                if iou > best_iou {
                    best_iou = iou;
                    best = Some(*id);
                }
            }

            if let Some(id) = best
                && let Some(track) = self.tracks.get_mut(&id)
            {
                track.bbox = det.bbox;
                track.age = 0;
                matched.insert(id);
                trace!(track_id = %id, iou = best_iou, "track continued");
            }
            assigned.push(best);
        }

        let mut tracked = Vec::with_capacity(detections.len());
        for (det, slot) in detections.into_iter().zip(assigned) {
            let track_id = match slot {
                Some(id) => id,
                None => self.spawn(det.bbox),
            };
            tracked.push(TrackedDetection {
                track_id,
                detection: det,
            });
        }

        let max_age = self.max_age;
        let evicted: Vec<TrackId> = self
            .tracks
            .values()
            .filter(|t| t.age >= max_age)
            .map(|t| t.id)
            .collect();
        for id in &evicted {
            self.tracks.remove(id);
            trace!(track_id = %id, "track evicted");
        }

        TrackUpdate { tracked, evicted }
    }

    fn spawn(&mut self, bbox: BBox) -> TrackId {
        let id = TrackId(self.next_id);
        self.next_id += 1;
        self.tracks.insert(
            id,
            Track {
                id,
                bbox,
                age: 0,
            },
        );
        trace!(track_id = %id, "track created");
        id
    }

    /// Drops every live track. The id counter keeps counting.
    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn live_ids(&self) -> HashSet<TrackId> {
        self.tracks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_AGE)
    }
}
