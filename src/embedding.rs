//! Text embeddings.
//!
//! [`EmbeddingGenerator`] is the seam to an embedding model; inference
//! itself lives outside this crate. [`LexicalEmbedding`] is an offline,
//! deterministic stand-in: feature hashing over lowercase tokens with
//! `blake3`, L2-normalized. It is not a neural model, but similar token bags
//! land close together, which is enough for embedded top-k search and tests.

use async_trait::async_trait;
use blake3::Hasher;

use crate::error::{StorageResult, ValidationError};

/// Default dimensionality of [`LexicalEmbedding`].
pub const DEFAULT_EMBEDDING_DIM: usize = 64;

/// Turns text into a fixed-size vector.
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    /// Identifier stored alongside generated vectors.
    fn model(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> StorageResult<Vec<f32>>;
}

/// Deterministic feature-hashing embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexicalEmbedding {
    dimensions: usize,
    model: String,
}

impl LexicalEmbedding {
    /// # Errors
    ///
    /// Returns `InvalidConfig` for zero dimensions.
    pub fn new(dimensions: usize) -> Result<Self, ValidationError> {
        if dimensions == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "embedding dimensions must be positive".to_string(),
            });
        }
        Ok(Self {
            dimensions,
            model: format!("lexical-blake3-{dimensions}"),
        })
    }

    /// Embeds `text` synchronously.
    #[must_use]
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let tokens = lowered.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty());

        let mut seen = false;
        for token in tokens {
            let mut hasher = Hasher::new();
            hasher.update(token.as_bytes());
            let hash = hasher.finalize();
            let bytes = hash.as_bytes();

            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&bytes[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
            vec[idx] += if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            seen = true;
        }
        if !seen {
            return vec;
        }

        let norm = vec.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
        if norm > 0.0 {
            #[allow(clippy::cast_possible_truncation)]
            let inv = norm.recip() as f32;
            vec.iter_mut().for_each(|x| *x *= inv);
        }
        vec
    }
}

impl Default for LexicalEmbedding {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIM,
            model: format!("lexical-blake3-{DEFAULT_EMBEDDING_DIM}"),
        }
    }
}

#[async_trait]
impl EmbeddingGenerator for LexicalEmbedding {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> StorageResult<Vec<f32>> {
        Ok(self.embed_text(text))
    }
}
