//! Prompt construction.
//!
//! Decides whether an inbound message starts a new review or continues the
//! current one, and lays out the messages sent to the model.

use crate::config::SessionConfig;
use crate::llm::Message;
use crate::session::Session;

/// Literal command that clears a session.
pub const RESET_COMMAND: &str = "/reset";

/// Shown when a question arrives before any code.
pub const MISSING_SUBJECT_REPLY: &str = "Please paste the code you want me to review first.";

/// Substrings that mark a message as source code.
pub const CODE_MARKERS: [char; 2] = ['\n', '{'];

const NEW_SUBJECT_PREFIX: &str = "Please review this code:\n\n";
const CONTEXT_PREFIX: &str = "Context - The code we are discussing:\n";

/// What an inbound message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Reset,
    /// Replace the subject with this message and review it.
    NewSubject,
    /// Ask about the current subject.
    FollowUp,
    /// A follow-up with nothing to follow up on.
    MissingSubject,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    #[error("{}", MISSING_SUBJECT_REPLY)]
    MissingSubject,

    #[error("`{0}` is a command, not a prompt")]
    Command(String),
}

/// The outbound request for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Ordered messages for the model, system message first.
    pub messages: Vec<Message>,
    pub is_new_subject: bool,
    /// What to record in history for the user's side of the turn.
    pub user_entry: Message,
}

pub struct PromptBuilder {
    system_prompt: String,
    subject_threshold: usize,
}

impl PromptBuilder {
    pub fn new(system_prompt: impl Into<String>, subject_threshold: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            subject_threshold,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.system_prompt(), config.subject_threshold)
    }

    /// Classify `message` against the current session state.
    ///
    /// A message becomes the new subject when it carries a code marker and
    /// either no subject exists yet or it is longer than the threshold.
    pub fn classify(&self, session: &Session, message: &str) -> Intent {
        if message == RESET_COMMAND {
            return Intent::Reset;
        }

        let has_marker = message.contains(CODE_MARKERS);
        let long = message.chars().count() > self.subject_threshold;

        match (&session.subject, has_marker) {
            (None, true) => Intent::NewSubject,
            (Some(_), true) if long => Intent::NewSubject,
            (Some(_), _) => Intent::FollowUp,
            (None, false) => Intent::MissingSubject,
        }
    }

    /// Build the prompt for `message`. Does not touch the session.
    pub fn build(&self, session: &Session, message: &str) -> Result<Prompt, PromptError> {
        match (self.classify(session, message), session.subject.as_deref()) {
            (Intent::Reset, _) => Err(PromptError::Command(message.to_string())),
            (Intent::NewSubject, _) => Ok(self.new_subject(message)),
            (Intent::FollowUp, Some(subject)) => Ok(self.follow_up(subject, &session.history, message)),
            (Intent::FollowUp, None) | (Intent::MissingSubject, _) => Err(PromptError::MissingSubject),
        }
    }

    /// Prompt that asks for a review of `code`, which becomes the subject.
    pub fn new_subject(&self, code: &str) -> Prompt {
        let framed = Message::user(format!("{}{}", NEW_SUBJECT_PREFIX, code));
        Prompt {
            messages: vec![Message::system(&self.system_prompt), framed.clone()],
            is_new_subject: true,
            user_entry: framed,
        }
    }

    /// Prompt for a question about `subject`, replaying `history` in order.
    pub fn follow_up(&self, subject: &str, history: &[Message], question: &str) -> Prompt {
        let question = Message::user(question);

        let mut messages = Vec::with_capacity(history.len() + 3);
        messages.push(Message::system(&self.system_prompt));
        messages.push(Message::user(format!("{}{}", CONTEXT_PREFIX, subject)));
        messages.extend(history.iter().cloned());
        messages.push(question.clone());

        Prompt {
            messages,
            is_new_subject: false,
            user_entry: question,
        }
    }
}
