//! Per-session conversation state.
//!
//! A session holds the code currently under review and a short sliding
//! window of the conversation about it.

mod store;

pub use store::{ContextStore, SessionDb, SessionGuard, SessionSummary, SharedSessionDb};

use serde::{Deserialize, Serialize};

use crate::llm::Message;

/// One conversation's mutable record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Code snippet under discussion; `None` until the first paste.
    pub subject: Option<String>,
    /// Oldest first, never longer than the store's cap.
    pub history: Vec<Message>,
}

impl Session {
    /// Back to the initial empty state.
    pub fn clear(&mut self) {
        self.subject = None;
        self.history.clear();
    }

    /// Replace the subject. History about the old subject is dropped.
    pub fn set_subject(&mut self, text: impl Into<String>) {
        self.subject = Some(text.into());
        self.history.clear();
    }

    /// Append one entry, then drop from the front down to `cap`.
    pub fn push(&mut self, message: Message, cap: usize) {
        self.history.push(message);
        if self.history.len() > cap {
            let excess = self.history.len() - cap;
            self.history.drain(..excess);
        }
    }

    pub fn append_turn(&mut self, user: Message, assistant: Message, cap: usize) {
        self.push(user, cap);
        self.push(assistant, cap);
    }

    pub fn is_empty(&self) -> bool {
        self.subject.is_none() && self.history.is_empty()
    }
}
