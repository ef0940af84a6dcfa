//! Question/answer dataset loading.
//!
//! The dataset is a headered CSV file with `question` and `answer`
//! columns. Row order defines record ids, so the loader preserves it.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FaqBotError, Result};

/// A single question/answer pair from the dataset. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

/// Load all question/answer pairs from a CSV file, in row order.
pub fn load_qa_pairs(path: impl AsRef<Path>) -> Result<Vec<QaPair>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| FaqBotError::dataset(format!("Failed to open {}: {e}", path.display())))?;

    let headers = reader
        .headers()
        .map_err(|e| FaqBotError::dataset(format!("Failed to read CSV headers: {e}")))?;
    for required in ["question", "answer"] {
        if !headers.iter().any(|h| h == required) {
            return Err(FaqBotError::dataset(format!(
                "CSV must have a '{required}' column"
            )));
        }
    }

    let mut pairs = Vec::new();
    for (row, result) in reader.deserialize::<QaPair>().enumerate() {
        let pair = result
            .map_err(|e| FaqBotError::dataset(format!("Failed to read CSV row {}: {e}", row + 1)))?;
        pairs.push(pair);
    }

    info!(pairs = pairs.len(), path = %path.display(), "Loaded QA dataset");

    Ok(pairs)
}
