use reqwest::{Client, Response};
use std::time::Duration;

use super::errors::GoogleAiError;
use super::models::{
    EmbedContentRequest, EmbedContentResponse, GenerateContentRequest, GenerateContentResponse,
};
use crate::env::apis as env_vars;

/// Task type sent with every embedding request. Documents and queries use
/// the same mode, so stored and query vectors stay comparable.
const EMBEDDING_TASK_TYPE: &str = "RETRIEVAL_DOCUMENT";

#[derive(Debug, Clone)]
pub struct GoogleAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub generation_model: String,
    pub embedding_model: String,
    pub timeout: Duration,
}

impl Default for GoogleAiConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var(env_vars::GENAI_API_KEY).unwrap_or_default(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            generation_model: "gemini-1.5-pro-latest".to_string(),
            embedding_model: "embedding-001".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl GoogleAiConfig {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            ..Default::default()
        }
    }

    pub fn with_generation_model(mut self, model: String) -> Self {
        self.generation_model = model;
        self
    }

    pub fn with_embedding_model(mut self, model: String) -> Self {
        self.embedding_model = model;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), GoogleAiError> {
        if self.api_key.is_empty() {
            return Err(GoogleAiError::ConfigurationError {
                message: "Google AI API key is required".to_string(),
            });
        }

        if self.base_url.is_empty() {
            return Err(GoogleAiError::ConfigurationError {
                message: "Base URL cannot be empty".to_string(),
            });
        }

        if self.generation_model.is_empty() || self.embedding_model.is_empty() {
            return Err(GoogleAiError::ConfigurationError {
                message: "Model names cannot be empty".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Clone)]
pub struct GoogleAiClient {
    config: GoogleAiConfig,
    client: Client,
}

impl GoogleAiClient {
    pub fn new(config: GoogleAiConfig) -> Result<Self, GoogleAiError> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GoogleAiError::ConfigurationError {
                message: format!("Failed to create HTTP client: {e}"),
            })?;

        Ok(Self { config, client })
    }

    /// Embed a piece of text into a fixed-length vector.
    ///
    /// A single failed call propagates immediately; there is no retry.
    /// A missing or empty embedding in the response is an error, never a
    /// zero vector.
    pub async fn embed_content(&self, text: &str) -> Result<Vec<f32>, GoogleAiError> {
        let url = format!(
            "{}/models/{}:embedContent",
            self.config.base_url, self.config.embedding_model
        );

        let request = EmbedContentRequest::new(
            format!("models/{}", self.config.embedding_model),
            text.to_string(),
            EMBEDDING_TASK_TYPE.to_string(),
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(GoogleAiError::from_reqwest_error)?;

        let parsed: EmbedContentResponse = self.handle_response(response).await?;

        match parsed.embedding {
            Some(embedding) if !embedding.values.is_empty() => Ok(embedding.values),
            _ => Err(GoogleAiError::InvalidResponse {
                message: "No embedding values in response".to_string(),
            }),
        }
    }

    /// Send a generateContent request to the configured generation model.
    pub async fn generate_content(
        &self,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, GoogleAiError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url, self.config.generation_model
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(GoogleAiError::from_reqwest_error)?;

        self.handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: Response,
    ) -> Result<T, GoogleAiError> {
        let status = response.status();

        if status.is_success() {
            let response_text = response
                .text()
                .await
                .map_err(GoogleAiError::from_reqwest_error)?;

            serde_json::from_str(&response_text).map_err(|e| GoogleAiError::ParseError {
                message: format!("Failed to parse response: {e}"),
            })
        } else {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());

            Err(GoogleAiError::from_status_and_body(status, &error_body))
        }
    }

    pub fn config(&self) -> &GoogleAiConfig {
        &self.config
    }
}
