//! Nearest-neighbor search over dense float32 embeddings.
//!
//! Vectors are L2-normalized on insert, so the reported distance is the
//! Euclidean distance between unit vectors. It converts to cosine
//! similarity with [`similarity_from_l2`]:
//!
//! ```text
//! similarity = 1 - distance² / 2
//! ```
//!
//! [`FlatIndex`] is a brute-force scan intended for small identity
//! galleries (a few thousand entries).

pub mod distance;
pub mod error;
pub mod flat;
pub mod vecstore;

pub use distance::{cosine_similarity, l2_distance, l2_normalize, similarity_from_l2};
pub use error::VecError;
pub use flat::FlatIndex;
pub use vecstore::{Match, VecIndex};
