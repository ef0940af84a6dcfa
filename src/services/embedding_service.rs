//! Embedding provider seam.
//!
//! The trait keeps ingestion and retrieval independent of the concrete
//! embedding backend; the production implementation calls the Google AI
//! embedContent endpoint.

use async_trait::async_trait;

use super::google_ai::GoogleAiClient;
use crate::error::{FaqBotError, Result};

/// Dimensionality of vectors produced by the embedding-001 model.
pub const EMBEDDING_DIM: usize = 768;

/// Converts text into a fixed-length embedding vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text.
    ///
    /// Failure means "no vector available" -- callers must degrade, never
    /// substitute a zero vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Dimensionality of embeddings produced.
    fn dimensions(&self) -> usize;
}

/// Embedding provider backed by the Google AI API.
pub struct GoogleAiEmbedder {
    client: GoogleAiClient,
    dimensions: usize,
}

impl GoogleAiEmbedder {
    pub fn new(client: GoogleAiClient, dimensions: usize) -> Self {
        Self { client, dimensions }
    }

    pub fn with_default_dimensions(client: GoogleAiClient) -> Self {
        Self::new(client, EMBEDDING_DIM)
    }
}

#[async_trait]
impl EmbeddingProvider for GoogleAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let values = self.client.embed_content(text).await?;

        if values.len() != self.dimensions {
            return Err(FaqBotError::embedding(format!(
                "Embedding has {} dimensions, expected {}",
                values.len(),
                self.dimensions
            )));
        }

        Ok(values)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
