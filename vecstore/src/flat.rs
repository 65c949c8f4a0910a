use std::cmp::Ordering;
use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::distance::{l2_distance, l2_normalize};
use crate::error::VecError;
use crate::vecstore::{Match, VecIndex};

/// Brute-force [`VecIndex`] over unit vectors.
///
/// The dimension is either fixed at construction or taken from the first
/// insert. Equal distances are ordered by id so results are deterministic.
pub struct FlatIndex {
    inner: RwLock<FlatInner>,
}

struct FlatInner {
    dim: Option<usize>,
    vectors: BTreeMap<String, Vec<f32>>,
}

impl FlatIndex {
    /// Creates an index whose dimension is fixed by the first insert.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(FlatInner {
                dim: None,
                vectors: BTreeMap::new(),
            }),
        }
    }

    /// Creates an index that only accepts `dim`-dimensional vectors.
    pub fn with_dimension(dim: usize) -> Self {
        Self {
            inner: RwLock::new(FlatInner {
                dim: (dim > 0).then_some(dim),
                vectors: BTreeMap::new(),
            }),
        }
    }
}

impl Default for FlatIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VecIndex for FlatIndex {
    fn insert(&self, id: &str, vector: &[f32]) -> Result<(), VecError> {
        let mut inner = self.inner.write();
        if let Some(want) = inner.dim
            && vector.len() != want
        {
            return Err(VecError::DimensionMismatch {
                got: vector.len(),
                want,
            });
        }

        let mut normed = vector.to_vec();
        if !l2_normalize(&mut normed) {
            return Err(VecError::ZeroVector(id.to_string()));
        }
        inner.dim = Some(normed.len());
        inner.vectors.insert(id.to_string(), normed);
        Ok(())
    }

    fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Match>, VecError> {
        let inner = self.inner.read();
        if inner.vectors.is_empty() || top_k == 0 {
            return Ok(vec![]);
        }
        if let Some(want) = inner.dim
            && query.len() != want
        {
            return Err(VecError::DimensionMismatch {
                got: query.len(),
                want,
            });
        }

        let mut q = query.to_vec();
        if !l2_normalize(&mut q) {
            return Ok(vec![]);
        }

        let mut results: Vec<Match> = inner
            .vectors
            .iter()
            .map(|(id, v)| Match {
                id: id.clone(),
                distance: l2_distance(&q, v),
            })
            .collect();

        // BTreeMap iteration is id-ordered and sort_by is stable, so ties
        // keep the lower id first.
        results.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    fn get(&self, id: &str) -> Option<Vec<f32>> {
        self.inner.read().vectors.get(id).cloned()
    }

    fn delete(&self, id: &str) {
        self.inner.write().vectors.remove(id);
    }

    fn entries(&self) -> Vec<(String, Vec<f32>)> {
        self.inner
            .read()
            .vectors
            .iter()
            .map(|(id, v)| (id.clone(), v.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.inner.read().vectors.len()
    }

    fn dimension(&self) -> Option<usize> {
        self.inner.read().dim
    }
}
