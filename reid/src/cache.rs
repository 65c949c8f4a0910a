//! Process-local state shared between the frame path and resolution workers.
//!
//! Each structure has its own lock and no method calls out while holding
//! it, so neither is ever held across a store call.

use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};

use crate::types::{Binding, ReidNum, TrackId};

/// Track → identity bindings for the current session.
#[derive(Debug, Default)]
pub struct IdentityCache {
    entries: RwLock<HashMap<TrackId, Binding>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, track: TrackId) -> Option<Binding> {
        self.entries.read().get(&track).cloned()
    }

    pub fn contains(&self, track: TrackId) -> bool {
        self.entries.read().contains_key(&track)
    }

    /// Binds `track`, replacing any previous binding, which is returned.
    pub fn bind(&self, track: TrackId, binding: Binding) -> Option<Binding> {
        self.entries.write().insert(track, binding)
    }

    /// Renames every entry bound to `reid`. Returns how many changed.
    pub fn rename_identity(&self, reid: ReidNum, name: &str) -> usize {
        let mut entries = self.entries.write();
        let mut n = 0;
        for b in entries.values_mut().filter(|b| b.reid == reid) {
            b.name = name.to_string();
            n += 1;
        }
        n
    }

    /// Points every entry bound to `from` at `to`. Returns how many changed.
    pub fn rebind_identity(&self, from: ReidNum, to: &Binding) -> usize {
        let mut entries = self.entries.write();
        let mut n = 0;
        for b in entries.values_mut().filter(|b| b.reid == from) {
            *b = to.clone();
            n += 1;
        }
        n
    }

    /// Tracks currently bound to `reid`, ascending.
    pub fn tracks_bound_to(&self, reid: ReidNum) -> Vec<TrackId> {
        let mut ids: Vec<TrackId> = self
            .entries
            .read()
            .iter()
            .filter(|(_, b)| b.reid == reid)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Drops entries whose track is not in `live`. Returns how many.
    pub fn retain_live(&self, live: &HashSet<TrackId>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|id, _| live.contains(id));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tracks with a resolution attempt queued or running.
#[derive(Debug, Default)]
pub struct InFlight {
    tracks: Mutex<HashSet<TrackId>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `track` in flight. Returns false if it already was.
    pub fn try_claim(&self, track: TrackId) -> bool {
        self.tracks.lock().insert(track)
    }

    /// Clears the mark. Returns false if it was not set.
    pub fn release(&self, track: TrackId) -> bool {
        self.tracks.lock().remove(&track)
    }

    pub fn contains(&self, track: TrackId) -> bool {
        self.tracks.lock().contains(&track)
    }

    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
