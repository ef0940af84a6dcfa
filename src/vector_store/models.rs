//! Data models for vector storage.

/// A question/answer record persisted in the vector store.
#[derive(Debug, Clone)]
pub struct QaRecord {
    /// Record id, the dataset row index rendered as a string.
    pub id: String,

    /// The question that was embedded.
    pub question: String,

    /// The stored answer returned on a match.
    pub answer: String,

    /// The embedding vector for the question.
    pub embedding: Vec<f32>,
}

/// A single nearest-neighbor search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// The stored question of the matched record.
    pub question: String,

    /// The stored answer of the matched record.
    pub answer: String,

    /// Distance to the query vector; lower is more similar.
    pub distance: f32,
}
