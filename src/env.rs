//! Environment variable constants used throughout the application
//!
//! This module centralizes all environment variable names to ensure consistency
//! and make it easier to manage configuration across the codebase.

/// Logging configuration
pub mod logging {
    /// Log level configuration (e.g., "debug", "info", "warn", "error")
    pub const LOG_LEVEL: &str = "FAQBOT_LOG_LEVEL";

    /// Disable colored output (follows the NO_COLOR standard)
    pub const NO_COLOR: &str = "NO_COLOR";
}

/// External API configuration
pub mod apis {
    /// Google Generative Language API key for embeddings and refinement
    pub const GENAI_API_KEY: &str = "GENAI_API_KEY";
}

/// Data locations
pub mod data {
    /// Path to the question/answer CSV dataset
    pub const DATASET_FILE: &str = "FAQBOT_DATASET_FILE";

    /// Directory holding the persistent vector store
    pub const STORE_DIR: &str = "FAQBOT_STORE_DIR";
}
