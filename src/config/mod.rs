//! Application configuration.
//!
//! One `AppConfig` is constructed at process start (environment variables,
//! with `.env` support at the binary entry) and passed by reference into
//! the services. There is no global client or store handle.

use std::env;
use std::path::PathBuf;

use crate::env::data as env_vars;
use crate::error::Result;
use crate::services::google_ai::GoogleAiConfig;
use crate::services::EMBEDDING_DIM;

/// Default nearest-neighbor relevance threshold. Calibrated against the
/// store's L2 distance; a nearest hit farther than this is a no-match.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.3;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Google AI client configuration (API key, models, timeout).
    pub google_ai: GoogleAiConfig,

    /// Path to the question/answer CSV dataset.
    pub dataset_path: PathBuf,

    /// Directory for the persistent vector store.
    pub store_dir: PathBuf,

    /// Embedding dimensionality, fixed by the embedding model.
    pub dimensions: usize,

    /// Relevance threshold for retrieval.
    pub distance_threshold: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            google_ai: GoogleAiConfig::default(),
            dataset_path: PathBuf::from("datafile.csv"),
            store_dir: PathBuf::from("./qa_db"),
            dimensions: EMBEDDING_DIM,
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
        }
    }
}

impl AppConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var(env_vars::DATASET_FILE) {
            config.dataset_path = PathBuf::from(path);
        }

        if let Ok(dir) = env::var(env_vars::STORE_DIR) {
            config.store_dir = PathBuf::from(dir);
        }

        config
    }

    pub fn with_dataset_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dataset_path = path.into();
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = dir.into();
        self
    }

    pub fn with_distance_threshold(mut self, threshold: f32) -> Self {
        self.distance_threshold = threshold;
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.google_ai.validate()?;

        if self.dimensions == 0 {
            return Err(crate::error::FaqBotError::invalid_config(
                "Embedding dimensions must be non-zero",
            ));
        }

        if !self.distance_threshold.is_finite() || self.distance_threshold < 0.0 {
            return Err(crate::error::FaqBotError::invalid_config(
                "Distance threshold must be a non-negative number",
            ));
        }

        Ok(())
    }
}
