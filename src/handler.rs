//! Session connection handler: the entry point for every inbound message.
//!
//! One call to [`ConversationHandler::handle`] is one turn. The session is
//! checked out of the store for the whole turn, so turns on the same session
//! never interleave.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::llm::Message;
use crate::prompt::{Intent, PromptBuilder, MISSING_SUBJECT_REPLY};
use crate::relay::{EventSender, RelayOutcome, ServerEvent, StreamingRelay};
use crate::session::ContextStore;

/// Where a turn is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Classifying,
    Building,
    Streaming,
    Completed,
    Failed,
}

/// Summary of a handled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    pub intent: Intent,
    /// Final state; `Idle` after a reset.
    pub state: TurnState,
    pub model_called: bool,
}

pub struct ConversationHandler {
    store: Arc<ContextStore>,
    builder: PromptBuilder,
    relay: StreamingRelay,
}

impl ConversationHandler {
    pub fn new(store: Arc<ContextStore>, builder: PromptBuilder, relay: StreamingRelay) -> Self {
        Self {
            store,
            builder,
            relay,
        }
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Process one inbound message for `session_id`, forwarding protocol
    /// events to `events` as they happen.
    ///
    /// The terminal event goes out only after the turn is persisted, so a
    /// client never sees more than one. Errors are store failures hit before
    /// any event was sent; later failures are reported to the client and end
    /// the turn as `Failed`.
    pub async fn handle(
        &self,
        session_id: &str,
        message: &str,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<TurnReport> {
        let mut session = self.store.checkout(session_id).await?;
        let mut state = TurnState::Idle;
        transition(session_id, &mut state, TurnState::Classifying);

        let intent = self.builder.classify(session.session(), message);
        info!(session = session_id, ?intent, len = message.len(), "turn started");

        let prompt = match (intent, session.session().subject.as_deref()) {
            (Intent::Reset, _) => {
                session.reset();
                session.commit()?;
                let _ = events.send(ServerEvent::Reset).await;
                transition(session_id, &mut state, TurnState::Idle);
                return Ok(TurnReport {
                    intent,
                    state,
                    model_called: false,
                });
            }
            (Intent::NewSubject, _) => {
                transition(session_id, &mut state, TurnState::Building);
                self.builder.new_subject(message)
            }
            (Intent::FollowUp, Some(subject)) => {
                transition(session_id, &mut state, TurnState::Building);
                self.builder.follow_up(subject, &session.session().history, message)
            }
            (Intent::FollowUp, None) | (Intent::MissingSubject, _) => {
                let _ = events.send(ServerEvent::error(MISSING_SUBJECT_REPLY)).await;
                transition(session_id, &mut state, TurnState::Failed);
                return Ok(TurnReport {
                    intent,
                    state,
                    model_called: false,
                });
            }
        };

        let before = session.session().clone();
        if prompt.is_new_subject {
            session.set_subject(message);
        }
        // The question is kept even if the model call fails.
        session.record(prompt.user_entry.clone());

        transition(session_id, &mut state, TurnState::Streaming);
        let outcome = self.relay.relay(&prompt.messages, events, cancel).await;

        let (terminal, next) = match outcome {
            RelayOutcome::Completed(reply) => {
                session.record(Message::assistant(reply));
                (Some(ServerEvent::Done), TurnState::Completed)
            }
            RelayOutcome::Failed(error) => {
                warn!(session = session_id, %error, "turn failed");
                (Some(ServerEvent::error(error)), TurnState::Failed)
            }
            RelayOutcome::Cancelled => {
                info!(session = session_id, "turn abandoned by client");
                (None, TurnState::Failed)
            }
        };

        let terminal = match session.commit() {
            Ok(()) => {
                transition(session_id, &mut state, next);
                terminal
            }
            Err(e) => {
                error!(session = session_id, error = %e, "failed to save turn");
                session.restore(before);
                transition(session_id, &mut state, TurnState::Failed);
                terminal.map(|_| ServerEvent::error(format!("Failed to save conversation: {}", e)))
            }
        };
        if let Some(event) = terminal {
            // the client may already be gone
            let _ = events.send(event).await;
        }

        Ok(TurnReport {
            intent,
            state,
            model_called: true,
        })
    }
}

fn transition(session_id: &str, state: &mut TurnState, next: TurnState) {
    debug!(session = session_id, from = ?*state, to = ?next, "turn state");
    *state = next;
}
