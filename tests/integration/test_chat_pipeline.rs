//! End-to-end pipeline tests: ingest a QA dataset into a real on-disk
//! vector store with a deterministic embedding stub, then exercise
//! retrieval and refinement the way the chat loop does.

use async_trait::async_trait;

use faqbot::dataset::QaPair;
use faqbot::error::{FaqBotError, Result as FaqResult};
use faqbot::services::google_ai::GoogleAiError;
use faqbot::services::{
    EmbeddingProvider, IngestService, QueryService, RefineService, RetrievalOutcome, TextGenerator,
};
use faqbot::vector_store::VectorStore;
use tempfile::TempDir;

const DIMS: usize = 4;
const THRESHOLD: f32 = 0.3;

/// Deterministic embedder: one axis per known topic keyword, a spare axis
/// for everything else, L2-normalized. Paraphrases that share a keyword
/// land on the same unit vector.
struct KeywordEmbedder;

const AXES: [&str; 3] = ["return", "weather", "ship"];

impl KeywordEmbedder {
    fn vectorize(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut vector = vec![0.0f32; DIMS];
        for (i, keyword) in AXES.iter().enumerate() {
            vector[i] = lower.matches(keyword).count() as f32;
        }
        if vector.iter().all(|v| *v == 0.0) {
            vector[DIMS - 1] = 1.0;
        }
        let magnitude: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        vector.iter_mut().for_each(|v| *v /= magnitude);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed(&self, text: &str) -> FaqResult<Vec<f32>> {
        Ok(Self::vectorize(text))
    }

    fn dimensions(&self) -> usize {
        DIMS
    }
}

/// Embedder that fails for one specific text, for partial-ingestion tests.
struct FlakyEmbedder {
    fail_on: String,
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    async fn embed(&self, text: &str) -> FaqResult<Vec<f32>> {
        if text == self.fail_on {
            return Err(FaqBotError::embedding("service unreachable"));
        }
        Ok(KeywordEmbedder::vectorize(text))
    }

    fn dimensions(&self) -> usize {
        DIMS
    }
}

/// Generator stub returning a canned reply.
struct StubGenerator {
    reply: String,
}

#[async_trait]
impl TextGenerator for StubGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GoogleAiError> {
        Ok(self.reply.clone())
    }
}

fn qa(question: &str, answer: &str) -> QaPair {
    QaPair {
        question: question.to_string(),
        answer: answer.to_string(),
    }
}

fn return_policy_dataset() -> Vec<QaPair> {
    vec![qa(
        "What is your return policy?",
        "30 days, no questions asked.",
    )]
}

#[tokio::test]
async fn test_end_to_end_retrieval_and_refinement() {
    let dir = TempDir::new().unwrap();
    let store = VectorStore::open(dir.path(), DIMS).await.unwrap();
    let embedder = KeywordEmbedder;

    let report = IngestService::new(&embedder, &store)
        .run(&return_policy_dataset())
        .await
        .unwrap();
    assert_eq!(report.stored, 1);

    let query_service = QueryService::new(&embedder, &store, THRESHOLD);

    // A paraphrase of the stored question clears the threshold
    let outcome = query_service
        .retrieve("what's your return policy?")
        .await
        .unwrap();
    let RetrievalOutcome::Match {
        answer, distance, ..
    } = outcome
    else {
        panic!("expected a match for the paraphrased query");
    };
    assert_eq!(answer, "30 days, no questions asked.");
    assert!(distance <= THRESHOLD);

    // An off-topic query does not
    let outcome = query_service
        .retrieve("what is the weather today?")
        .await
        .unwrap();
    assert!(matches!(outcome, RetrievalOutcome::NoMatch { .. }));

    // The empty-output fallback keeps the stored answer intact
    let empty_generator = StubGenerator {
        reply: String::new(),
    };
    let refine_service = RefineService::new(&empty_generator);
    assert_eq!(refine_service.refine(&answer).await, answer);

    // A real reply from the generator replaces the stored answer
    let generator = StubGenerator {
        reply: "You can return items within 30 days.".to_string(),
    };
    let refine_service = RefineService::new(&generator);
    assert_eq!(
        refine_service.refine(&answer).await,
        "You can return items within 30 days."
    );
}

#[tokio::test]
async fn test_ingestion_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = VectorStore::open(dir.path(), DIMS).await.unwrap();
    let embedder = KeywordEmbedder;

    let pairs = vec![
        qa("What is your return policy?", "30 days, no questions asked."),
        qa("Do you ship overseas?", "Yes, to most countries."),
    ];

    let ingest = IngestService::new(&embedder, &store);

    let first = ingest.run(&pairs).await.unwrap();
    assert_eq!(first.stored, 2);
    assert!(!first.already_populated);
    assert_eq!(store.count().await.unwrap(), 2);

    let second = ingest.run(&pairs).await.unwrap();
    assert!(second.already_populated);
    assert_eq!(second.stored, 0);
    assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_ingestion_skips_populated_store_across_reopen() {
    let dir = TempDir::new().unwrap();
    let embedder = KeywordEmbedder;
    let pairs = return_policy_dataset();

    {
        let store = VectorStore::open(dir.path(), DIMS).await.unwrap();
        IngestService::new(&embedder, &store)
            .run(&pairs)
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    // A fresh process start sees the persisted records and does not re-ingest
    let store = VectorStore::open(dir.path(), DIMS).await.unwrap();
    let report = IngestService::new(&embedder, &store)
        .run(&pairs)
        .await
        .unwrap();
    assert!(report.already_populated);
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_query_before_ingestion_returns_no_match() {
    let dir = TempDir::new().unwrap();
    let store = VectorStore::open(dir.path(), DIMS).await.unwrap();
    let embedder = KeywordEmbedder;

    let query_service = QueryService::new(&embedder, &store, THRESHOLD);
    let outcome = query_service
        .retrieve("what's your return policy?")
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RetrievalOutcome::NoMatch {
            nearest_distance: None
        }
    );
}

#[tokio::test]
async fn test_partial_ingestion_keeps_other_rows() {
    let dir = TempDir::new().unwrap();
    let store = VectorStore::open(dir.path(), DIMS).await.unwrap();

    let pairs = vec![
        qa("What is your return policy?", "30 days."),
        qa("Do you ship overseas?", "Yes."),
        qa("How do I track my shipment?", "Use the tracking link."),
        qa("Is the weather forecast shown?", "No."),
        qa("Can I return sale items?", "Only unopened ones."),
    ];

    let embedder = FlakyEmbedder {
        fail_on: "How do I track my shipment?".to_string(),
    };

    let report = IngestService::new(&embedder, &store)
        .run(&pairs)
        .await
        .unwrap();

    assert_eq!(report.stored, 4);
    assert_eq!(report.skipped, 1);
    assert!(!report.already_populated);
    assert_eq!(store.count().await.unwrap(), 4);

    // The surviving rows are still retrievable
    let query_service = QueryService::new(&embedder, &store, THRESHOLD);
    let outcome = query_service
        .retrieve("can I return something?")
        .await
        .unwrap();
    assert!(matches!(outcome, RetrievalOutcome::Match { .. }));
}
