use crate::error::VecError;

/// Match is a single result from a nearest-neighbor search.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// Identifier of the matched vector.
    pub id: String,

    /// L2 distance between the normalized query and the matched vector.
    /// Lower values indicate higher similarity; range `[0, 2]`.
    pub distance: f32,
}

/// VecIndex is the interface for nearest-neighbor search over dense
/// float32 vectors of a fixed dimension.
///
/// All implementations must be safe for concurrent use (Send + Sync).
pub trait VecIndex: Send + Sync {
    /// Add or replace the vector stored under `id`.
    fn insert(&self, id: &str, vector: &[f32]) -> Result<(), VecError>;

    /// Return the top-k nearest vectors to the query, ordered by ascending
    /// distance (closest first).
    fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Match>, VecError>;

    /// Return the stored (normalized) vector for `id`.
    fn get(&self, id: &str) -> Option<Vec<f32>>;

    /// Remove a vector by ID. No error if ID does not exist.
    fn delete(&self, id: &str);

    /// Return every stored `(id, vector)` pair, ordered by id.
    fn entries(&self) -> Vec<(String, Vec<f32>)>;

    /// Return the number of vectors in the index.
    fn len(&self) -> usize;

    /// Return true if the index contains no vectors.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fixed dimension, or `None` until the first insert fixes it.
    fn dimension(&self) -> Option<usize>;
}
