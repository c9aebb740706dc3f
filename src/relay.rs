//! Streaming relay: drives one model call and turns its output into
//! protocol events for the client.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::{GenerationParams, LLMProvider, Message};

/// Outbound event, JSON-encoded as `{"type": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    /// A new assistant turn is beginning.
    Start,
    /// Incremental fragment; append to the current assistant turn.
    Chunk { text: String },
    /// Turn complete.
    Done,
    /// Turn failed. Never followed by `Done`.
    Error { text: String },
    /// Session history cleared.
    Reset,
}

impl ServerEvent {
    pub fn chunk(text: impl Into<String>) -> Self {
        Self::Chunk { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { text: text.into() }
    }
}

pub type EventSender = mpsc::Sender<ServerEvent>;

/// How a relayed turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The model finished; holds the concatenated reply.
    Completed(String),
    /// The model call failed; holds the error text for the client.
    Failed(String),
    /// The connection went away before the model finished.
    Cancelled,
}

pub struct StreamingRelay {
    provider: Arc<dyn LLMProvider>,
    params: GenerationParams,
}

impl StreamingRelay {
    pub fn new(provider: Arc<dyn LLMProvider>, params: GenerationParams) -> Self {
        Self { provider, params }
    }

    /// Run `prompt` through the model, emitting `start` and then the chunks.
    ///
    /// The terminal `done` or `error` is left to the caller, which sends it
    /// once the turn has been persisted. Returns early with `Cancelled` if
    /// `cancel` fires or the event receiver is dropped.
    pub async fn relay(
        &self,
        prompt: &[Message],
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> RelayOutcome {
        if events.send(ServerEvent::Start).await.is_err() {
            return RelayOutcome::Cancelled;
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RelayOutcome::Cancelled,
            opened = self.provider.stream(prompt, &self.params) => opened,
        };

        let mut fragments = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "model call failed before streaming");
                return RelayOutcome::Failed(e.to_string());
            }
        };

        let mut reply = String::new();
        let mut chunk_count = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(chunks = chunk_count, "relay cancelled mid-stream");
                    return RelayOutcome::Cancelled;
                }
                next = fragments.next() => next,
            };

            match next {
                Some(Ok(fragment)) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    reply.push_str(&fragment);
                    chunk_count += 1;
                    if events.send(ServerEvent::chunk(fragment)).await.is_err() {
                        return RelayOutcome::Cancelled;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, chunks = chunk_count, "model stream failed");
                    return RelayOutcome::Failed(e.to_string());
                }
                None => break,
            }
        }

        debug!(chunks = chunk_count, bytes = reply.len(), "model stream finished");
        RelayOutcome::Completed(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedProvider;

    fn relay_with(provider: ScriptedProvider) -> StreamingRelay {
        StreamingRelay::new(Arc::new(provider), GenerationParams::default())
    }

    async fn drain(mut rx: mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_event_wire_format() {
        let json = |e: &ServerEvent| serde_json::to_string(e).unwrap();
        assert_eq!(json(&ServerEvent::Start), r#"{"type":"start"}"#);
        assert_eq!(json(&ServerEvent::chunk("hi")), r#"{"type":"chunk","text":"hi"}"#);
        assert_eq!(json(&ServerEvent::Done), r#"{"type":"done"}"#);
        assert_eq!(json(&ServerEvent::error("boom")), r#"{"type":"error","text":"boom"}"#);
        assert_eq!(json(&ServerEvent::Reset), r#"{"type":"reset"}"#);
    }

    #[tokio::test]
    async fn test_successful_stream_event_order() {
        let relay = relay_with(ScriptedProvider::replying(&["Looks ", "", "good", "."]));
        let (tx, rx) = mpsc::channel(16);

        let outcome = relay
            .relay(&[Message::user("x")], &tx, &CancellationToken::new())
            .await;
        drop(tx);

        assert_eq!(outcome, RelayOutcome::Completed("Looks good.".to_string()));
        assert_eq!(
            drain(rx).await,
            vec![
                ServerEvent::Start,
                ServerEvent::chunk("Looks "),
                ServerEvent::chunk("good"),
                ServerEvent::chunk("."),
            ]
        );
    }

    #[tokio::test]
    async fn test_chunks_concatenate_to_reply() {
        let relay = relay_with(ScriptedProvider::replying(&["a", "b", "c"]));
        let (tx, rx) = mpsc::channel(16);

        let outcome = relay
            .relay(&[Message::user("x")], &tx, &CancellationToken::new())
            .await;
        drop(tx);

        let joined: String = drain(rx)
            .await
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::Chunk { text } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(outcome, RelayOutcome::Completed(joined));
    }

    #[tokio::test]
    async fn test_failure_mid_stream() {
        let relay = relay_with(ScriptedProvider::failing_after(&["partial"], "upstream timeout"));
        let (tx, rx) = mpsc::channel(16);

        let outcome = relay
            .relay(&[Message::user("x")], &tx, &CancellationToken::new())
            .await;
        drop(tx);

        let events = drain(rx).await;
        assert!(matches!(outcome, RelayOutcome::Failed(ref t) if t.contains("upstream timeout")));
        assert_eq!(events, vec![ServerEvent::Start, ServerEvent::chunk("partial")]);
    }

    #[tokio::test]
    async fn test_failure_before_first_fragment() {
        let relay = relay_with(ScriptedProvider::refusing("quota"));
        let (tx, rx) = mpsc::channel(16);

        let outcome = relay
            .relay(&[Message::user("x")], &tx, &CancellationToken::new())
            .await;
        drop(tx);

        assert!(matches!(outcome, RelayOutcome::Failed(ref t) if t.contains("quota")));
        assert_eq!(drain(rx).await, vec![ServerEvent::Start]);
    }

    #[tokio::test]
    async fn test_cancel_stops_hanging_stream() {
        let relay = relay_with(ScriptedProvider::hanging_after(&["thinking"]));
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                // wait for the first chunk, then hang up
                assert_eq!(rx.recv().await, Some(ServerEvent::Start));
                assert_eq!(rx.recv().await, Some(ServerEvent::chunk("thinking")));
                cancel.cancel();
                rx
            })
        };

        let outcome = relay.relay(&[Message::user("x")], &tx, &cancel).await;
        drop(tx);
        assert_eq!(outcome, RelayOutcome::Cancelled);

        let rx = canceller.await.unwrap();
        assert!(drain(rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_receiver_cancels() {
        let relay = relay_with(ScriptedProvider::replying(&["a"]));
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let outcome = relay
            .relay(&[Message::user("x")], &tx, &CancellationToken::new())
            .await;
        assert_eq!(outcome, RelayOutcome::Cancelled);
    }
}
