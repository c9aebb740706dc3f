//! OpenAI-compatible streaming provider.
//!
//! Implements the `LLMProvider` trait for any Chat Completions endpoint that
//! speaks server-sent events (OpenAI, Workers AI's `/ai/v1` surface, vLLM...).

use super::provider::{FragmentStream, LLMProvider, LlmError, ModelMetadata};
use super::types::{GenerationParams, Message};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tracing::debug;

const DONE_SENTINEL: &str = "[DONE]";

/// Provider configuration and state.
pub struct OpenAICompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAICompatibleProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Build a provider, reading the API key from the named environment variable.
    pub fn from_env(base_url: &str, api_key_env: &str, model: &str) -> Result<Self, LlmError> {
        let api_key = std::env::var(api_key_env)
            .map_err(|_| LlmError::MissingApiKey(api_key_env.to_string()))?;
        Ok(Self::new(base_url, api_key, model))
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl LLMProvider for OpenAICompatibleProvider {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            id: self.model.clone(),
            endpoint: self.completions_url(),
        }
    }

    async fn stream(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<FragmentStream, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: messages.iter().map(ApiMessage::from).collect(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stream: true,
        };

        let builder = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request);

        let mut event_source = EventSource::new(builder)
            .map_err(|e| LlmError::InvalidResponse(format!("request not streamable: {}", e)))?;

        let stream = async_stream::stream! {
            while let Some(event) = event_source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => {
                        if message.data == DONE_SENTINEL {
                            break;
                        }
                        match fragment_from_data(&message.data) {
                            Ok(Some(fragment)) => yield Ok(fragment),
                            Ok(None) => continue,
                            Err(e) => {
                                yield Err(e);
                                break;
                            }
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                        let body = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "(no body)".to_string());
                        yield Err(LlmError::Api { status: status.as_u16(), message: body });
                        break;
                    }
                    Err(reqwest_eventsource::Error::Transport(e)) => {
                        yield Err(LlmError::Http(e));
                        break;
                    }
                    Err(e) => {
                        yield Err(LlmError::Stream(e.to_string()));
                        break;
                    }
                }
            }
            // EventSource reconnects on its own unless closed.
            event_source.close();
            debug!("model stream closed");
        };

        Ok(Box::pin(stream))
    }
}

/// Extract the text delta from one SSE `data:` payload.
///
/// Returns `Ok(None)` for keep-alive or role-only chunks.
fn fragment_from_data(data: &str) -> Result<Option<String>, LlmError> {
    let chunk: ChatChunk = serde_json::from_str(data)
        .map_err(|e| LlmError::InvalidResponse(format!("failed to parse chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(LlmError::Stream(error.message));
    }

    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|text| !text.is_empty());

    Ok(content)
}

// -----------------------------------------------------------------------------
// Wire DTOs
// -----------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> From<&'a Message> for ApiMessage<'a> {
    fn from(msg: &'a Message) -> Self {
        Self {
            role: msg.role.as_str(),
            content: &msg.content,
        }
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}
