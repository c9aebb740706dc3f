//! LLM Layer
//!
//! This module handles all interactions with the hosted model:
//! - Provider abstraction (a prompt in, a fragment stream out)
//! - The OpenAI-compatible streaming client

pub mod types;
pub mod provider;
pub mod openai;

#[cfg(test)]
pub(crate) mod scripted;

// Re-export key types
pub use types::{GenerationParams, Message, Role};
pub use provider::{FragmentStream, LLMProvider, LlmError, ModelMetadata};
pub use openai::OpenAICompatibleProvider;
