//! The Provider Abstraction.
//!
//! The relay only ever needs one thing from a model backend: turn an ordered
//! prompt into a stream of text fragments, or fail.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::types::{GenerationParams, Message};

/// Errors from model invocation.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("missing API key: set {0}")]
    MissingApiKey(String),
}

/// Incremental model output. Ends with `None` on success; an `Err` item is
/// terminal.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Metadata about the backing model.
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub id: String,
    pub endpoint: String,
}

/// The core trait for LLM interactions.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Get the model's metadata.
    fn metadata(&self) -> ModelMetadata;

    /// Start a streaming chat completion.
    ///
    /// Failures before the first fragment are returned directly; failures
    /// after that surface as an `Err` item in the stream.
    async fn stream(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<FragmentStream, LlmError>;
}
