//! Embedding generation.
//!
//! Titles are embedded outside the exclusion gate, so embedders must be safe
//! to call concurrently from many pipeline tasks.

// Allow cast precision loss for hash-based embedding calculations.
#![allow(clippy::cast_precision_loss)]
// Allow cast possible truncation for hash index calculations on 32-bit platforms.
#![allow(clippy::cast_possible_truncation)]

#[cfg(feature = "fastembed-embeddings")]
mod fastembed;
mod hash;

#[cfg(feature = "fastembed-embeddings")]
pub use fastembed::FastEmbedEmbedder;
pub use hash::HashEmbedder;

use crate::Result;
use async_trait::async_trait;

/// Default embedding dimensions for all-MiniLM-L6-v2.
pub const DEFAULT_DIMENSIONS: usize = 384;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the embedding dimensions.
    fn dimensions(&self) -> usize;

    /// Generates an embedding for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
