//! Document and Embedding Types
//!
//! A `Document` is the unit of storage and search: a string-identified
//! body of text plus a fixed-dimension embedding vector. Embeddings are
//! semantically unit vectors; the store does not enforce unit norm, and
//! similarity is computed as a dot product (equal to cosine similarity
//! when both operands are normalized).
//!
//! ## Design Decisions
//! - `Embedding` is a newtype over `[f32; 128]` so the dimension is fixed
//!   by the type system and the wire codec can rely on it
//! - The embedding is skipped by serde: JSON carries metadata only, the
//!   vector travels as raw little-endian `f32`s inside the binary payload
//! - `deterministic()` produces a reproducible unit vector from text; it
//!   is not a semantic embedding, but gives tests and demos stable inputs

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed dimension for all embeddings.
pub const EMBEDDING_DIM: usize = 128;

/// A fixed-dimension vector, stored and transmitted as little-endian f32.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Embedding(pub [f32; EMBEDDING_DIM]);

impl Default for Embedding {
    fn default() -> Self {
        Embedding([0.0; EMBEDDING_DIM])
    }
}

impl Embedding {
    /// The all-zeros vector.
    pub fn zeroed() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Dot product with another embedding. Equal to cosine similarity
    /// when both vectors are unit-norm.
    pub fn dot(&self, other: &Embedding) -> f32 {
        let mut sum = 0.0f32;
        for i in 0..EMBEDDING_DIM {
            sum += self.0[i] * other.0[i];
        }
        sum
    }

    pub fn l2_norm(&self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Scale to unit length. The zero vector is returned unchanged.
    pub fn l2_normalize(mut self) -> Self {
        let norm = self.l2_norm();
        if norm > 0.0 {
            for v in self.0.iter_mut() {
                *v /= norm;
            }
        }
        self
    }

    /// Build a reproducible unit vector from text.
    ///
    /// Hashes the text with FNV-1a, then expands the seed with a
    /// splitmix64 sequence to fill all 128 components in [-1, 1] before
    /// normalizing. Deterministic across platforms; not semantic.
    pub fn deterministic(text: &str) -> Self {
        // FNV-1a over the input bytes.
        let mut seed: u64 = 0xcbf2_9ce4_8422_2325;
        for b in text.as_bytes() {
            seed ^= u64::from(*b);
            seed = seed.wrapping_mul(0x0000_0100_0000_01b3);
        }

        let mut out = [0.0f32; EMBEDDING_DIM];
        for v in out.iter_mut() {
            seed = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut z = seed;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            z ^= z >> 31;
            // Map the top 32 bits to [-1, 1].
            *v = ((z >> 32) as f32) / (u32::MAX as f32) * 2.0 - 1.0;
        }
        Embedding(out).l2_normalize()
    }
}

/// A stored document.
///
/// Each live document is exclusively owned by the in-memory index;
/// writers submit by value and the index keeps its own copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source: String,
    pub title: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub embedding: Embedding,
}
