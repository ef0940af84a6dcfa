//! Arrow schema definitions for the LanceDB table.

use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};

/// Get the Arrow schema for the qa_records table.
///
/// # Arguments
/// * `dimensions` - Number of dimensions in the embedding vector (e.g., 768)
pub fn qa_records_schema(dimensions: usize) -> Schema {
    Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("question", DataType::Utf8, false),
        Field::new("answer", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                dimensions as i32,
            ),
            false,
        ),
    ])
}
