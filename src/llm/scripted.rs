//! Scripted provider for tests: replays fixed fragments and records prompts.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;

use super::provider::{FragmentStream, LLMProvider, LlmError, ModelMetadata};
use super::types::{GenerationParams, Message};

#[derive(Clone)]
enum Script {
    Reply(Vec<String>),
    /// Emit these fragments, then fail.
    FailAfter(Vec<String>, String),
    /// Fail before any fragment is produced.
    Refuse(String),
    /// Emit these fragments, then never finish.
    Hang(Vec<String>),
}

#[derive(Clone)]
pub(crate) struct ScriptedProvider {
    script: Script,
    calls: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl ScriptedProvider {
    pub fn replying(fragments: &[&str]) -> Self {
        Self::with(Script::Reply(owned(fragments)))
    }

    pub fn failing_after(fragments: &[&str], error: &str) -> Self {
        Self::with(Script::FailAfter(owned(fragments), error.to_string()))
    }

    pub fn refusing(error: &str) -> Self {
        Self::with(Script::Refuse(error.to_string()))
    }

    pub fn hanging_after(fragments: &[&str]) -> Self {
        Self::with(Script::Hang(owned(fragments)))
    }

    fn with(script: Script) -> Self {
        Self {
            script,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every prompt received, in call order.
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().clone()
    }
}

fn owned(fragments: &[&str]) -> Vec<String> {
    fragments.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            id: "scripted".to_string(),
            endpoint: "memory://scripted".to_string(),
        }
    }

    async fn stream(
        &self,
        messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<FragmentStream, LlmError> {
        self.calls.lock().unwrap().push(messages.to_vec());

        let items: Vec<Result<String, LlmError>> = match &self.script {
            Script::Reply(fragments) => fragments.iter().cloned().map(Ok).collect(),
            Script::FailAfter(fragments, error) => fragments
                .iter()
                .cloned()
                .map(Ok)
                .chain(std::iter::once(Err(LlmError::Stream(error.clone()))))
                .collect(),
            Script::Refuse(error) => {
                return Err(LlmError::Api {
                    status: 503,
                    message: error.clone(),
                })
            }
            Script::Hang(fragments) => {
                let head = futures::stream::iter(fragments.clone().into_iter().map(Ok));
                return Ok(Box::pin(head.chain(futures::stream::pending())));
            }
        };

        Ok(Box::pin(futures::stream::iter(items)))
    }
}
