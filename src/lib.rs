//! Critic: a code-review chat relay.
//!
//! A client pastes code or asks about it over a per-session connection; each
//! message is classified, turned into a prompt, streamed through a hosted
//! model and answered token by token, while a short history per session is
//! kept in a durable store.

pub mod config;
pub mod handler;
pub mod llm;
pub mod prompt;
pub mod relay;
pub mod server;
pub mod session;

pub use config::Config;
pub use handler::{ConversationHandler, TurnReport, TurnState};
pub use llm::{GenerationParams, LLMProvider, LlmError, Message, OpenAICompatibleProvider, Role};
pub use prompt::{Intent, Prompt, PromptBuilder, PromptError};
pub use relay::{EventSender, RelayOutcome, ServerEvent, StreamingRelay};
pub use server::AppState;
pub use session::{ContextStore, Session, SessionSummary};
