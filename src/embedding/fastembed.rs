//! FastEmbed-based embedder.
//!
//! Provides semantic embeddings using the all-MiniLM-L6-v2 model via fastembed-rs.
//! ONNX inference is CPU-bound, so every call runs on the blocking pool.

use super::{DEFAULT_DIMENSIONS, Embedder};
use crate::{Error, Result};
use async_trait::async_trait;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// `FastEmbed` embedder using all-MiniLM-L6-v2.
///
/// The model is lazily loaded on first embed call to preserve cold start time.
#[derive(Clone, Default)]
pub struct FastEmbedEmbedder {
    model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
}

impl FastEmbedEmbedder {
    /// Default embedding dimensions for all-MiniLM-L6-v2.
    pub const DEFAULT_DIMENSIONS: usize = DEFAULT_DIMENSIONS;

    /// Creates a new `FastEmbed` embedder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn load_model() -> Result<fastembed::TextEmbedding> {
        tracing::info!("Loading embedding model (first use)...");
        let start = Instant::now();

        let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
            .with_show_download_progress(false);
        let model = fastembed::TextEmbedding::try_new(options)
            .map_err(|e| Error::operation("load_embedding_model", e))?;

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            model = "all-MiniLM-L6-v2",
            "Embedding model loaded successfully"
        );
        Ok(model)
    }

    fn embed_blocking(
        model: &Mutex<Option<fastembed::TextEmbedding>>,
        text: String,
    ) -> Result<Vec<f32>> {
        let mut slot = model.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(Self::load_model()?);
        }
        let Some(model) = slot.as_mut() else {
            return Err(Error::operation("embed", "embedding model unavailable"));
        };

        // ONNX runtime can panic on malformed inputs.
        let result = catch_unwind(AssertUnwindSafe(|| model.embed(vec![text], None)));
        let embeddings = result
            .map_err(|_| Error::operation("embed", "ONNX runtime panic"))?
            .map_err(|e| Error::operation("embed", e))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::operation("embed", "No embedding returned from model"))
    }
}

#[async_trait]
impl Embedder for FastEmbedEmbedder {
    fn dimensions(&self) -> usize {
        Self::DEFAULT_DIMENSIONS
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("Cannot embed empty text".to_string()));
        }

        let model = Arc::clone(&self.model);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || Self::embed_blocking(&model, text))
            .await
            .map_err(|e| Error::operation("embed_join", e))?
    }
}
