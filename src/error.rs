use thiserror::Error;

use crate::services::google_ai::GoogleAiError;

/// Custom error types for the FAQ chatbot
#[derive(Error, Debug)]
pub enum FaqBotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Google AI error: {0}")]
    GoogleAi(#[from] GoogleAiError),

    #[error("Dataset error: {message}")]
    Dataset { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Vector store error: {message}")]
    Store { message: String },

    #[error("Embedding error: {message}")]
    Embedding { message: String },
}

impl FaqBotError {
    /// Create a dataset error
    pub fn dataset<S: Into<String>>(message: S) -> Self {
        Self::Dataset {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a vector store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create an embedding error
    pub fn embedding<S: Into<String>>(message: S) -> Self {
        Self::Embedding {
            message: message.into(),
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            FaqBotError::Io(_) => "io",
            FaqBotError::Json(_) => "json",
            FaqBotError::Csv(_) => "csv",
            FaqBotError::Network(_) => "network",
            FaqBotError::GoogleAi(_) => "google_ai",
            FaqBotError::Dataset { .. } => "dataset",
            FaqBotError::InvalidConfig { .. } => "config",
            FaqBotError::Store { .. } => "store",
            FaqBotError::Embedding { .. } => "embedding",
        }
    }
}

impl From<lancedb::Error> for FaqBotError {
    fn from(e: lancedb::Error) -> Self {
        FaqBotError::Store {
            message: e.to_string(),
        }
    }
}

/// Result type alias for the FAQ chatbot
pub type Result<T> = std::result::Result<T, FaqBotError>;
