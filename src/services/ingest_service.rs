//! Idempotent one-time population of the vector store.

use tracing::{info, warn};

use super::embedding_service::EmbeddingProvider;
use crate::dataset::QaPair;
use crate::error::Result;
use crate::vector_store::{QaRecord, VectorStore};

/// Outcome of an ingestion pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// Rows embedded and stored in this pass.
    pub stored: usize,

    /// Rows skipped because their embedding failed.
    pub skipped: usize,

    /// The store already held records, so nothing was written.
    pub already_populated: bool,
}

/// Populates the vector store from the QA dataset, exactly once.
pub struct IngestService<'a> {
    embedder: &'a dyn EmbeddingProvider,
    store: &'a VectorStore,
}

impl<'a> IngestService<'a> {
    pub fn new(embedder: &'a dyn EmbeddingProvider, store: &'a VectorStore) -> Self {
        Self { embedder, store }
    }

    /// Run the ingestion pass.
    ///
    /// A populated store is left untouched, so repeated application starts
    /// never duplicate records. Within a pass, each row is best-effort: a
    /// failed embedding skips that row and the pass continues. There is no
    /// rollback; a partially populated store is accepted.
    pub async fn run(&self, pairs: &[QaPair]) -> Result<IngestReport> {
        let existing = self.store.count().await?;
        if existing > 0 {
            info!(
                records = existing,
                "Vector store already populated, skipping ingestion"
            );
            return Ok(IngestReport {
                stored: 0,
                skipped: 0,
                already_populated: true,
            });
        }

        info!(rows = pairs.len(), "Generating embeddings and storing QA pairs");

        let mut stored = 0;
        let mut skipped = 0;

        for (index, pair) in pairs.iter().enumerate() {
            match self.embedder.embed(&pair.question).await {
                Ok(embedding) => {
                    self.store
                        .add(&[QaRecord {
                            id: index.to_string(),
                            question: pair.question.clone(),
                            answer: pair.answer.clone(),
                            embedding,
                        }])
                        .await?;
                    stored += 1;
                }
                Err(error) => {
                    warn!(row = index, error = %error, "Embedding failed, skipping row");
                    skipped += 1;
                }
            }
        }

        info!(stored, skipped, "Ingestion complete");

        Ok(IngestReport {
            stored,
            skipped,
            already_populated: false,
        })
    }
}
