pub mod google_ai;

pub mod embedding_service;
pub mod ingest_service;
pub mod query_service;
pub mod refine_service;

pub use embedding_service::{EmbeddingProvider, GoogleAiEmbedder, EMBEDDING_DIM};
pub use ingest_service::{IngestReport, IngestService};
pub use query_service::{QueryService, RetrievalOutcome};
pub use refine_service::{RefineService, TextGenerator};
