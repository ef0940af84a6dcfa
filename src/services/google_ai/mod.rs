pub mod client;
pub mod errors;
pub mod models;

pub use client::{GoogleAiClient, GoogleAiConfig};
pub use errors::GoogleAiError;
pub use models::{
    Candidate, Content, ContentEmbedding, EmbedContentRequest, EmbedContentResponse,
    GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part,
};
