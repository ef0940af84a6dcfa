//! LanceDB vector store for question/answer embeddings.
//!
//! Records survive process restarts; reopening the same directory
//! reconstructs the same collection.

use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    types::Float32Type, Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, Table};

use super::models::{QaRecord, SearchHit};
use super::schemas::qa_records_schema;
use crate::error::{FaqBotError, Result};

const TABLE_NAME: &str = "qa_records";

/// LanceDB-backed store of embedded question/answer records.
pub struct VectorStore {
    connection: Connection,
    dimensions: usize,
}

impl VectorStore {
    /// Open or create a vector store at the given directory path.
    pub async fn open(path: impl AsRef<Path>, dimensions: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let path_str = path.to_string_lossy().to_string();
        let connection = connect(&path_str).execute().await?;

        let store = Self {
            connection,
            dimensions,
        };
        store.ensure_table().await?;

        Ok(store)
    }

    fn schema(&self) -> Arc<arrow_schema::Schema> {
        Arc::new(qa_records_schema(self.dimensions))
    }

    /// Ensure the qa_records table exists, creating it empty if necessary.
    async fn ensure_table(&self) -> Result<()> {
        let tables = self.connection.table_names().execute().await?;
        if !tables.contains(&TABLE_NAME.to_string()) {
            let schema = self.schema();
            let empty_batch = RecordBatch::new_empty(schema.clone());
            let batches = RecordBatchIterator::new(vec![Ok(empty_batch)], schema);
            self.connection
                .create_table(TABLE_NAME, batches)
                .execute()
                .await?;
        }
        Ok(())
    }

    async fn table(&self) -> Result<Table> {
        Ok(self.connection.open_table(TABLE_NAME).execute().await?)
    }

    /// Number of records currently stored.
    pub async fn count(&self) -> Result<usize> {
        let table = self.table().await?;
        Ok(table.count_rows(None).await?)
    }

    /// Append records. No internal deduplication; idempotency of the
    /// ingestion pass is enforced by the caller's count check.
    pub async fn add(&self, records: &[QaRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        for record in records {
            if record.embedding.len() != self.dimensions {
                return Err(FaqBotError::store(format!(
                    "Record '{}' has {} dimensions, expected {}",
                    record.id,
                    record.embedding.len(),
                    self.dimensions
                )));
            }
        }

        let schema = self.schema();

        let ids = StringArray::from_iter_values(records.iter().map(|r| r.id.as_str()));
        let questions = StringArray::from_iter_values(records.iter().map(|r| r.question.as_str()));
        let answers = StringArray::from_iter_values(records.iter().map(|r| r.answer.as_str()));
        let vectors = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
            records
                .iter()
                .map(|r| Some(r.embedding.iter().copied().map(Some).collect::<Vec<_>>())),
            self.dimensions as i32,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(ids),
                Arc::new(questions),
                Arc::new(answers),
                Arc::new(vectors) as Arc<dyn Array>,
            ],
        )
        .map_err(|e| FaqBotError::store(format!("Failed to create record batch: {e}")))?;

        let table = self.table().await?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table.add(batches).execute().await?;

        Ok(())
    }

    /// Return the `top_k` nearest records to the query vector, nearest
    /// first. The distance metric is LanceDB's default L2, identical at
    /// ingestion and query time.
    pub async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
        let table = self.table().await?;

        let query = table
            .vector_search(query)
            .map_err(|e| FaqBotError::store(format!("Failed to build search query: {e}")))?
            .limit(top_k);

        let batches: Vec<RecordBatch> = query
            .execute()
            .await?
            .try_collect()
            .await
            .map_err(|e| FaqBotError::store(format!("Failed to execute search: {e}")))?;

        let mut hits = Vec::new();
        for batch in &batches {
            let questions = batch
                .column_by_name("question")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let answers = batch
                .column_by_name("answer")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

            let (Some(questions), Some(answers)) = (questions, answers) else {
                continue;
            };

            for i in 0..batch.num_rows() {
                hits.push(SearchHit {
                    question: questions.value(i).to_string(),
                    answer: answers.value(i).to_string(),
                    distance: distances.map(|d| d.value(i)).unwrap_or(0.0),
                });
            }
        }

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, question: &str, answer: &str, embedding: Vec<f32>) -> QaRecord {
        QaRecord {
            id: id.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            embedding,
        }
    }

    async fn create_test_store() -> (VectorStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = VectorStore::open(temp_dir.path(), 4).await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_open_creates_empty_table() {
        let (store, _temp_dir) = create_test_store().await;
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_and_count() {
        let (store, _temp_dir) = create_test_store().await;

        store
            .add(&[
                record("0", "q one", "a one", vec![1.0, 0.0, 0.0, 0.0]),
                record("1", "q two", "a two", vec![0.0, 1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_search_returns_nearest_first() {
        let (store, _temp_dir) = create_test_store().await;

        store
            .add(&[
                record("0", "returns", "30 days", vec![1.0, 0.0, 0.0, 0.0]),
                record("1", "shipping", "next day", vec![0.0, 1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store.search(&[0.9, 0.1, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].question, "returns");
        assert_eq!(hits[0].answer, "30 days");
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn test_search_empty_store() {
        let (store, _temp_dir) = create_test_store().await;
        let hits = store.search(&[1.0, 0.0, 0.0, 0.0], 1).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_rejected() {
        let (store, _temp_dir) = create_test_store().await;
        let result = store
            .add(&[record("0", "q", "a", vec![1.0, 0.0])])
            .await;
        assert!(result.is_err());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reopen_preserves_records() {
        let temp_dir = TempDir::new().unwrap();

        {
            let store = VectorStore::open(temp_dir.path(), 4).await.unwrap();
            store
                .add(&[record("0", "q", "a", vec![0.5, 0.5, 0.5, 0.5])])
                .await
                .unwrap();
            assert_eq!(store.count().await.unwrap(), 1);
        }

        let reopened = VectorStore::open(temp_dir.path(), 4).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);

        let hits = reopened.search(&[0.5, 0.5, 0.5, 0.5], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].answer, "a");
    }
}
