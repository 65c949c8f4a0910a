//! Durable identities: matching, allocation, and operator edits.
//!
//! Every write to the store, and every publish of a binding into the
//! [`IdentityCache`], happens under one write lock. A worker that resolved
//! a track therefore either publishes before a rename or merge (and the
//! edit then rewrites its cache entry) or after it (and reads the edited
//! metadata). Lookups run without the lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use gazer_vecstore::cosine_similarity;
use image::RgbImage;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::IdentityCache;
use crate::error::ReidError;
use crate::snapshot::ImageStore;
use crate::store::{Metadata, SimilarityStore, StoredIdentity};
use crate::types::{Binding, Identity, ReidNum, TrackId, merged_name, placeholder_name};

/// Redirect chains longer than this are treated as broken.
const MAX_REDIRECTS: usize = 16;

/// Outcome of [`IdentityRegistry::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub binding: Binding,

    /// Similarity of the accepted match; `None` for a new identity.
    pub similarity: Option<f32>,

    /// True when a new identity was allocated.
    pub created: bool,
}

/// Two resident identities that look alike.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicatePair {
    pub reid1: ReidNum,
    pub name1: String,
    pub reid2: ReidNum,
    pub name2: String,
    pub similarity: f32,
}

/// Matches embeddings against the store and owns identity allocation.
pub struct IdentityRegistry {
    store: Arc<dyn SimilarityStore>,
    images: Option<ImageStore>,
    threshold: f32,
    query_k: usize,
    next_id: AtomicU64,
    write: Mutex<()>,

    /// Embeddings of identities that take part in duplicate scans.
    /// Merged identities leave this set.
    resident: RwLock<BTreeMap<ReidNum, Vec<f32>>>,
}

impl IdentityRegistry {
    /// Loads the resident set from `store` and continues numbering after
    /// the highest stored ReID.
    pub fn open(
        store: Arc<dyn SimilarityStore>,
        images: Option<ImageStore>,
        threshold: f32,
        query_k: usize,
    ) -> Result<Self, ReidError> {
        let mut resident = BTreeMap::new();
        let mut max_id = 0;
        for entry in store.entries()? {
            let Some(reid) = ReidNum::from_key(&entry.key) else {
                warn!(key = %entry.key, "ignoring stored entry with foreign key");
                continue;
            };
            max_id = max_id.max(reid.get());
            if entry.metadata.merged_into.is_none() {
                resident.insert(reid, entry.embedding);
            }
        }
        info!(
            resident = resident.len(),
            next_id = max_id + 1,
            "identity registry loaded"
        );
        Ok(Self {
            store,
            images,
            threshold,
            query_k: query_k.max(1),
            next_id: AtomicU64::new(max_id),
            write: Mutex::new(()),
            resident: RwLock::new(resident),
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn images(&self) -> Option<&ImageStore> {
        self.images.as_ref()
    }

    /// Best stored identity strictly above the threshold, following merge
    /// redirects to the survivor.
    pub fn lookup(&self, embedding: &[f32]) -> Result<Option<(Binding, f32)>, ReidError> {
        let hits = self.store.query(embedding, self.query_k)?;
        let Some(best) = hits.into_iter().next() else {
            return Ok(None);
        };
        let similarity = best.similarity();
        if similarity <= self.threshold {
            return Ok(None);
        }
        let Some(reid) = ReidNum::from_key(&best.key) else {
            warn!(key = %best.key, "nearest entry has a foreign key");
            return Ok(None);
        };
        let binding = self.follow(reid, best.metadata)?;
        Ok(Some((binding, similarity)))
    }

    /// Matches `embedding` (unit length) or allocates a new identity for it.
    ///
    /// A miss is re-checked under the write lock, so concurrent misses on
    /// the same subject produce one identity. `crop`, when given, becomes
    /// the new identity's image.
    pub fn resolve(
        &self,
        embedding: &[f32],
        crop: Option<&RgbImage>,
    ) -> Result<Resolution, ReidError> {
        if let Some((binding, similarity)) = self.lookup(embedding)? {
            return Ok(Resolution {
                binding,
                similarity: Some(similarity),
                created: false,
            });
        }

        let binding = {
            let _guard = self.write.lock();
            if let Some((binding, similarity)) = self.lookup(embedding)? {
                return Ok(Resolution {
                    binding,
                    similarity: Some(similarity),
                    created: false,
                });
            }

            let id = self.next_id.load(Ordering::SeqCst) + 1;
            let reid = ReidNum::new(id)
                .ok_or_else(|| ReidError::InvalidInput("identity counter overflow".into()))?;
            let name = placeholder_name(reid);
            self.store
                .insert(&reid.key(), embedding, Metadata::named(&name))?;
            self.next_id.store(id, Ordering::SeqCst);

            let stored = self
                .store
                .get(&reid.key())?
                .map(|e| e.embedding)
                .unwrap_or_else(|| embedding.to_vec());
            self.resident.write().insert(reid, stored);
            info!(reid = %reid, name = %name, "new identity");
            Binding { reid, name }
        };

        if let (Some(images), Some(crop)) = (&self.images, crop)
            && let Err(e) = images.save(binding.reid, crop)
        {
            warn!(reid = %binding.reid, error = %e, "snapshot failed");
        }

        Ok(Resolution {
            binding,
            similarity: None,
            created: true,
        })
    }

    /// Binds `track` to the current state of `reid` in `cache`.
    ///
    /// Re-reads the identity under the write lock, so a rename or merge
    /// that landed after resolution is not overwritten with stale data.
    /// Gives up with [`ReidError::Timeout`] if the lock is not free within
    /// `wait`; nothing is bound then.
    pub fn publish(
        &self,
        cache: &IdentityCache,
        track: TrackId,
        reid: ReidNum,
        wait: Duration,
    ) -> Result<Binding, ReidError> {
        let Some(_guard) = self.write.try_lock_for(wait) else {
            return Err(ReidError::Timeout(format!("publishing track {track}")));
        };
        let entry = self.fetch(reid)?;
        let binding = self.follow(reid, entry.metadata)?;
        cache.bind(track, binding.clone());
        debug!(track_id = %track, reid = %binding.reid, name = %binding.name, "binding published");
        Ok(binding)
    }

    /// Renames `reid` in the store and in every cache entry bound to it.
    pub fn rename(
        &self,
        cache: &IdentityCache,
        reid: ReidNum,
        name: &str,
    ) -> Result<Binding, ReidError> {
        let _guard = self.write.lock();
        let entry = self.fetch(reid)?;
        if let Some(into) = entry.metadata.merged_into {
            return Err(ReidError::InvalidInput(format!(
                "ReID {reid} was merged into ReID {into}"
            )));
        }
        self.store.update_metadata(
            &entry.key,
            Metadata {
                name: name.to_string(),
                merged_into: None,
            },
        )?;
        let touched = cache.rename_identity(reid, name);
        info!(reid = %reid, name = %name, cached = touched, "identity renamed");
        Ok(Binding {
            reid,
            name: name.to_string(),
        })
    }

    /// Folds `source` into `target`.
    ///
    /// The source keeps its embedding but is renamed `Merged_to_<target>`,
    /// points at the target, and leaves the resident set. Cache entries
    /// bound to the source now carry the target's binding.
    pub fn merge(
        &self,
        cache: &IdentityCache,
        source: ReidNum,
        target: ReidNum,
    ) -> Result<Binding, ReidError> {
        if source == target {
            return Err(ReidError::InvalidInput(
                "Source and target ReID cannot be the same".into(),
            ));
        }

        let _guard = self.write.lock();
        let src = self
            .store
            .get(&source.key())?
            .ok_or_else(|| ReidError::NotFound(format!("Source ReID {source}")))?;
        let dst = self
            .store
            .get(&target.key())?
            .ok_or_else(|| ReidError::NotFound(format!("Target ReID {target}")))?;
        if let Some(into) = src.metadata.merged_into {
            return Err(ReidError::InvalidInput(format!(
                "Source ReID {source} was already merged into ReID {into}"
            )));
        }
        if let Some(into) = dst.metadata.merged_into {
            return Err(ReidError::InvalidInput(format!(
                "Target ReID {target} was merged into ReID {into}"
            )));
        }

        self.store.update_metadata(
            &src.key,
            Metadata {
                name: merged_name(target),
                merged_into: Some(target.get()),
            },
        )?;
        self.resident.write().remove(&source);

        let survivor = Binding {
            reid: target,
            name: dst.metadata.name,
        };
        let touched = cache.rebind_identity(source, &survivor);
        info!(source = %source, target = %target, cached = touched, "identities merged");
        Ok(survivor)
    }

    pub fn get(&self, reid: ReidNum) -> Result<Option<Identity>, ReidError> {
        Ok(self.store.get(&reid.key())?.and_then(to_identity))
    }

    /// Every stored identity, ascending ReID.
    pub fn identities(&self) -> Result<Vec<Identity>, ReidError> {
        let mut all: Vec<Identity> = self
            .store
            .entries()?
            .into_iter()
            .filter_map(to_identity)
            .collect();
        all.sort_by_key(|i| i.reid);
        Ok(all)
    }

    /// Resident pairs with similarity strictly above `threshold`, most
    /// similar first.
    pub fn find_duplicates(&self, threshold: f32) -> Result<Vec<DuplicatePair>, ReidError> {
        let members: Vec<(ReidNum, Vec<f32>)> = self
            .resident
            .read()
            .iter()
            .map(|(r, v)| (*r, v.clone()))
            .collect();

        let pairs = scan_pairs(members.len(), threshold, |i, j| {
            cosine_similarity(&members[i].1, &members[j].1)
        });
        if pairs.is_empty() {
            return Ok(vec![]);
        }

        let names: BTreeMap<ReidNum, String> = self
            .identities()?
            .into_iter()
            .map(|i| (i.reid, i.name))
            .collect();
        let name_of = |r: ReidNum| names.get(&r).cloned().unwrap_or_else(|| placeholder_name(r));

        Ok(pairs
            .into_iter()
            .map(|(i, j, similarity)| {
                let (reid1, reid2) = (members[i].0, members[j].0);
                DuplicatePair {
                    reid1,
                    name1: name_of(reid1),
                    reid2,
                    name2: name_of(reid2),
                    similarity,
                }
            })
            .collect())
    }

    pub fn resident_len(&self) -> usize {
        self.resident.read().len()
    }

    pub fn stored_len(&self) -> Result<usize, ReidError> {
        Ok(self.store.count()?)
    }

    fn fetch(&self, reid: ReidNum) -> Result<StoredIdentity, ReidError> {
        self.store
            .get(&reid.key())?
            .ok_or_else(|| ReidError::NotFound(format!("ReID {reid}")))
    }

    /// Walks `merged_into` pointers from `reid` to the surviving identity.
    fn follow(&self, reid: ReidNum, metadata: Metadata) -> Result<Binding, ReidError> {
        let mut current = Binding {
            reid,
            name: metadata.name,
        };
        let mut next = metadata.merged_into;
        for _ in 0..MAX_REDIRECTS {
            let Some(to) = next.and_then(ReidNum::new) else {
                return Ok(current);
            };
            match self.store.get(&to.key())? {
                Some(entry) => {
                    current = Binding {
                        reid: to,
                        name: entry.metadata.name,
                    };
                    next = entry.metadata.merged_into;
                }
                None => {
                    warn!(from = %current.reid, to = %to, "merge target missing");
                    return Ok(current);
                }
            }
        }
        warn!(reid = %reid, "merge redirect chain too long");
        Ok(current)
    }
}

fn to_identity(entry: StoredIdentity) -> Option<Identity> {
    let reid = ReidNum::from_key(&entry.key)?;
    Some(Identity {
        reid,
        name: entry.metadata.name,
        merged_into: entry.metadata.merged_into.and_then(ReidNum::new),
    })
}

/// All index pairs `(i, j)`, `i < j < n`, whose similarity is strictly
/// above `threshold`, sorted by descending similarity.
pub fn scan_pairs<F>(n: usize, threshold: f32, similarity: F) -> Vec<(usize, usize, f32)>
where
    F: Fn(usize, usize) -> f32,
{
    let mut pairs = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            let sim = similarity(i, j);
            if sim > threshold {
                pairs.push((i, j, sim));
            }
        }
    }
    pairs.sort_by(|a, b| b.2.total_cmp(&a.2));
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VectorStore;

    const WAIT: Duration = Duration::from_secs(1);

    fn reid(n: u64) -> ReidNum {
        ReidNum::new(n).unwrap()
    }

    fn registry() -> IdentityRegistry {
        IdentityRegistry::open(Arc::new(VectorStore::in_memory()), None, 0.4, 1).unwrap()
    }

    fn unit(v: &[f32]) -> Vec<f32> {
        let mut v = v.to_vec();
        gazer_vecstore::l2_normalize(&mut v);
        v
    }

    #[test]
    fn first_embedding_creates_reid_1() {
        let reg = registry();
        let e = unit(&[1.0, 0.0, 0.0]);
        let r = reg.resolve(&e, None).unwrap();
        assert!(r.created);
        assert_eq!(r.binding.reid, reid(1));
        assert_eq!(r.binding.name, "Unknown_1");
        assert_eq!(reg.stored_len().unwrap(), 1);

        let again = reg.resolve(&e, None).unwrap();
        assert!(!again.created);
        assert_eq!(again.binding.reid, reid(1));
        assert!(again.similarity.unwrap() > 0.99);
        assert_eq!(reg.stored_len().unwrap(), 1);
    }

    #[test]
    fn dissimilar_embedding_creates_new_identity() {
        let reg = registry();
        reg.resolve(&unit(&[1.0, 0.0]), None).unwrap();
        // cos = 0.3, below 0.4.
        let r = reg.resolve(&unit(&[0.3, 0.9539392]), None).unwrap();
        assert!(r.created);
        assert_eq!(r.binding.reid, reid(2));
    }

    #[test]
    fn match_needs_similarity_above_threshold() {
        let reg = IdentityRegistry::open(Arc::new(VectorStore::in_memory()), None, 0.6, 1).unwrap();
        reg.resolve(&[1.0, 0.0], None).unwrap();
        let r = reg.resolve(&unit(&[0.65, 0.76]), None).unwrap();
        assert!(!r.created);
        assert_eq!(r.binding.reid, reid(1));
        let r = reg.resolve(&unit(&[0.55, -0.835]), None).unwrap();
        assert!(r.created);
        assert_eq!(r.binding.reid, reid(2));
    }

    #[test]
    fn numbering_continues_after_reopen() {
        let store: Arc<dyn SimilarityStore> = Arc::new(VectorStore::in_memory());
        store
            .insert("reid_7", &[1.0, 0.0], Metadata::named("Alice"))
            .unwrap();
        let reg = IdentityRegistry::open(Arc::clone(&store), None, 0.4, 1).unwrap();
        let r = reg.resolve(&[0.0, 1.0], None).unwrap();
        assert_eq!(r.binding.reid, reid(8));
        assert_eq!(reg.resident_len(), 2);
    }

    #[test]
    fn rename_updates_store_and_cache() {
        let reg = registry();
        let cache = IdentityCache::new();
        let r = reg.resolve(&[1.0, 0.0], None).unwrap();
        reg.publish(&cache, TrackId(4), r.binding.reid, WAIT).unwrap();

        reg.rename(&cache, reid(1), "Alice").unwrap();
        assert_eq!(reg.get(reid(1)).unwrap().unwrap().name, "Alice");
        assert_eq!(cache.get(TrackId(4)).unwrap().name, "Alice");

        let err = reg.rename(&cache, reid(5), "Bob").unwrap_err();
        assert_eq!(err.to_string(), "ReID 5 not found");
        assert_eq!(cache.get(TrackId(4)).unwrap().name, "Alice");
    }

    #[test]
    fn publish_gives_up_while_writer_holds_lock() {
        let reg = registry();
        let cache = IdentityCache::new();
        reg.resolve(&[1.0, 0.0], None).unwrap();

        let guard = reg.write.lock();
        let err = reg
            .publish(&cache, TrackId(2), reid(1), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, ReidError::Timeout(_)));
        assert!(cache.is_empty());
        drop(guard);

        reg.publish(&cache, TrackId(2), reid(1), WAIT).unwrap();
        assert_eq!(cache.get(TrackId(2)).unwrap().reid, reid(1));
    }

    #[test]
    fn merge_redirects_and_leaves_resident_set() {
        let reg = registry();
        let cache = IdentityCache::new();
        let a = unit(&[1.0, 0.0, 0.0]);
        let b = unit(&[0.0, 1.0, 0.0]);
        reg.resolve(&a, None).unwrap();
        reg.resolve(&b, None).unwrap();
        reg.rename(&cache, reid(2), "Bob").unwrap();
        reg.publish(&cache, TrackId(1), reid(1), WAIT).unwrap();

        let survivor = reg.merge(&cache, reid(1), reid(2)).unwrap();
        assert_eq!(survivor.name, "Bob");
        assert_eq!(cache.get(TrackId(1)).unwrap(), survivor);

        let src = reg.get(reid(1)).unwrap().unwrap();
        assert_eq!(src.name, "Merged_to_2");
        assert_eq!(src.merged_into, Some(reid(2)));
        assert_eq!(reg.resident_len(), 1);

        // Matching the donor's embedding now lands on the survivor.
        let r = reg.resolve(&a, None).unwrap();
        assert!(!r.created);
        assert_eq!(r.binding, survivor);

        // Publishing a stale resolution for the donor also redirects.
        let b = reg.publish(&cache, TrackId(9), reid(1), WAIT).unwrap();
        assert_eq!(b.reid, reid(2));
    }

    #[test]
    fn merge_rejections() {
        let reg = registry();
        let cache = IdentityCache::new();
        reg.resolve(&[1.0, 0.0, 0.0], None).unwrap();
        reg.resolve(&[0.0, 1.0, 0.0], None).unwrap();
        reg.resolve(&[0.0, 0.0, 1.0], None).unwrap();

        let same = reg.merge(&cache, reid(1), reid(1)).unwrap_err();
        assert_eq!(same.to_string(), "Source and target ReID cannot be the same");
        let missing_src = reg.merge(&cache, reid(9), reid(1)).unwrap_err();
        assert_eq!(missing_src.to_string(), "Source ReID 9 not found");
        let missing_dst = reg.merge(&cache, reid(1), reid(9)).unwrap_err();
        assert_eq!(missing_dst.to_string(), "Target ReID 9 not found");

        reg.merge(&cache, reid(1), reid(2)).unwrap();
        assert!(reg.merge(&cache, reid(3), reid(1)).is_err());
        assert!(reg.merge(&cache, reid(1), reid(3)).is_err());
        assert!(reg.rename(&cache, reid(1), "x").is_err());
    }

    #[test]
    fn scan_pairs_orders_by_similarity() {
        // Pairwise similarities (0,1)=0.9, (0,2)=0.2, (1,2)=0.95.
        let table = |i: usize, j: usize| match (i, j) {
            (0, 1) => 0.9,
            (0, 2) => 0.2,
            (1, 2) => 0.95,
            _ => unreachable!(),
        };
        let pairs = scan_pairs(3, 0.5, table);
        assert_eq!(pairs, vec![(1, 2, 0.95), (0, 1, 0.9)]);
        assert!(scan_pairs(3, 0.95, table).is_empty());
        assert!(scan_pairs(1, 0.0, |_, _| 1.0).is_empty());
    }

    #[test]
    fn find_duplicates_skips_merged() {
        let store: Arc<dyn SimilarityStore> = Arc::new(VectorStore::in_memory());
        store.insert("reid_1", &[1.0, 0.0, 0.0], Metadata::named("a")).unwrap();
        store.insert("reid_2", &[0.95, 0.3122499, 0.0], Metadata::named("b")).unwrap();
        store.insert("reid_3", &[0.9, 0.0, 0.4358899], Metadata::named("c")).unwrap();
        let reg = IdentityRegistry::open(store, None, 0.4, 1).unwrap();

        let dups = reg.find_duplicates(0.5).unwrap();
        assert_eq!(dups.len(), 3);
        assert_eq!((dups[0].reid1, dups[0].reid2), (reid(1), reid(2)));
        assert_eq!(dups[0].name2, "b");
        assert!((dups[0].similarity - 0.95).abs() < 1e-4);
        assert!(dups.windows(2).all(|w| w[0].similarity >= w[1].similarity));

        reg.merge(&IdentityCache::new(), reid(2), reid(1)).unwrap();
        let dups = reg.find_duplicates(0.5).unwrap();
        assert_eq!(dups.len(), 1);
        assert_eq!((dups[0].reid1, dups[0].reid2), (reid(1), reid(3)));
    }

    #[test]
    fn concurrent_misses_create_one_identity() {
        let reg = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || reg.resolve(&[0.0, 0.0, 1.0], None).unwrap())
            })
            .collect();
        let reids: Vec<ReidNum> = handles
            .into_iter()
            .map(|h| h.join().unwrap().binding.reid)
            .collect();
        assert!(reids.iter().all(|r| *r == reid(1)));
        assert_eq!(reg.stored_len().unwrap(), 1);
    }

    #[test]
    fn identities_sorted_numerically() {
        let reg = registry();
        for i in 0..11 {
            let mut v = vec![0.0; 11];
            v[i] = 1.0;
            reg.resolve(&v, None).unwrap();
        }
        let ids: Vec<u64> = reg.identities().unwrap().iter().map(|i| i.reid.get()).collect();
        assert_eq!(ids, (1..=11).collect::<Vec<_>>());
    }
}
