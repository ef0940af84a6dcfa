//! Nearest-neighbor retrieval with a relevance threshold.

use tracing::debug;

use super::embedding_service::EmbeddingProvider;
use crate::error::Result;
use crate::vector_store::VectorStore;

/// Result of a retrieval attempt. `NoMatch` is an outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalOutcome {
    /// The nearest stored question was close enough; here is its answer.
    Match {
        question: String,
        answer: String,
        distance: f32,
    },

    /// Nothing stored, or the nearest record was too dissimilar.
    NoMatch { nearest_distance: Option<f32> },
}

/// Retrieves the best stored answer for a user query.
pub struct QueryService<'a> {
    embedder: &'a dyn EmbeddingProvider,
    store: &'a VectorStore,
    threshold: f32,
}

impl<'a> QueryService<'a> {
    pub fn new(
        embedder: &'a dyn EmbeddingProvider,
        store: &'a VectorStore,
        threshold: f32,
    ) -> Self {
        Self {
            embedder,
            store,
            threshold,
        }
    }

    /// Embed the query and look up the single nearest stored question.
    ///
    /// An embedding failure is an error result; the caller decides how to
    /// surface it. An empty store or an over-threshold nearest hit is a
    /// `NoMatch` outcome.
    pub async fn retrieve(&self, query: &str) -> Result<RetrievalOutcome> {
        let query_embedding = self.embedder.embed(query).await?;

        let hits = self.store.search(&query_embedding, 1).await?;

        let Some(hit) = hits.into_iter().next() else {
            debug!("Vector store returned no hits");
            return Ok(RetrievalOutcome::NoMatch {
                nearest_distance: None,
            });
        };

        if !within_threshold(hit.distance, self.threshold) {
            debug!(
                distance = hit.distance,
                threshold = self.threshold,
                "Nearest record too dissimilar"
            );
            return Ok(RetrievalOutcome::NoMatch {
                nearest_distance: Some(hit.distance),
            });
        }

        Ok(RetrievalOutcome::Match {
            question: hit.question,
            answer: hit.answer,
            distance: hit.distance,
        })
    }
}

/// The relevance decision rule. The boundary is inclusive: a hit exactly
/// at the threshold still counts as a match.
fn within_threshold(distance: f32, threshold: f32) -> bool {
    distance <= threshold
}
