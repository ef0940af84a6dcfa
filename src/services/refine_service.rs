//! Answer refinement through the generation model.
//!
//! Refinement can only improve an answer, never lose it: empty output and
//! service errors both fall back to the unrefined text.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::google_ai::{GenerateContentRequest, GoogleAiClient, GoogleAiError};

const REFINE_PROMPT_PREFIX: &str = "Refine and simplify this response:";

/// Generates free text from a prompt.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate text for the prompt. An empty string is a valid (if
    /// useless) response and is not an error.
    async fn generate(&self, prompt: &str) -> Result<String, GoogleAiError>;
}

#[async_trait]
impl TextGenerator for GoogleAiClient {
    async fn generate(&self, prompt: &str) -> Result<String, GoogleAiError> {
        let request = GenerateContentRequest::new(prompt.to_string());
        let response = self.generate_content(request).await?;
        Ok(response.extract_text().unwrap_or_default())
    }
}

/// Rewrites a retrieved answer in simpler language.
pub struct RefineService<'a> {
    generator: &'a dyn TextGenerator,
}

impl<'a> RefineService<'a> {
    pub fn new(generator: &'a dyn TextGenerator) -> Self {
        Self { generator }
    }

    /// Ask the generation model to rewrite `text`.
    ///
    /// Returns the rewritten text when the service produced any, and the
    /// original text otherwise. Never returns an empty string for
    /// non-empty input, and never fails the surrounding turn.
    pub async fn refine(&self, text: &str) -> String {
        let prompt = format!("{REFINE_PROMPT_PREFIX} {text}");

        match self.generator.generate(&prompt).await {
            Ok(refined) if !refined.trim().is_empty() => refined,
            Ok(_) => {
                debug!("Generation returned empty text, keeping original answer");
                text.to_string()
            }
            Err(error) => {
                warn!(error = %error, "Refinement failed, keeping original answer");
                text.to_string()
            }
        }
    }
}
