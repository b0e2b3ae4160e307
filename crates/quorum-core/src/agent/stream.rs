//! Provider stream consumption for one round.
//!
//! Drains a provider receiver into an accumulated round outcome while
//! forwarding text deltas and tool-call notifications to session
//! subscribers immediately. Honors cancellation and an idle timeout.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::events::SessionEvent;
use crate::ai::streaming::StreamPart;
use crate::ai::types::{AiToolCall, FinishReason, Usage};

/// A stream that produces nothing for this long is treated as dead
/// (retryable), not waited on forever.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Accumulated result of one provider round.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub text: String,
    pub tool_calls: Vec<AiToolCall>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<FinishReason>,
    /// `(message, retryable)` if the stream itself failed.
    pub error: Option<(String, bool)>,
    pub cancelled: bool,
}

impl StreamOutcome {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Drain one provider stream to completion, cancellation, or timeout.
pub async fn process_stream(
    mut rx: mpsc::UnboundedReceiver<StreamPart>,
    events: &broadcast::Sender<SessionEvent>,
    cancel: &CancellationToken,
) -> StreamOutcome {
    let mut outcome = StreamOutcome::default();

    loop {
        let part = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("stream cancelled mid-round");
                outcome.cancelled = true;
                return outcome;
            }
            received = tokio::time::timeout(STREAM_IDLE_TIMEOUT, rx.recv()) => {
                match received {
                    Ok(Some(part)) => part,
                    Ok(None) => {
                        // Closed without a terminal marker: adapter bug or
                        // dropped sender. Treat as a retryable failure unless
                        // the round already concluded.
                        if outcome.finish_reason.is_none() && outcome.error.is_none() {
                            outcome.error =
                                Some(("stream closed unexpectedly".to_string(), true));
                        }
                        return outcome;
                    }
                    Err(_) => {
                        warn!("provider stream idle for {:?}", STREAM_IDLE_TIMEOUT);
                        outcome.error = Some(("stream idle timeout".to_string(), true));
                        return outcome;
                    }
                }
            }
        };

        match part {
            StreamPart::TextDelta { delta } => {
                outcome.text.push_str(&delta);
                let _ = events.send(SessionEvent::TextDelta { delta });
            }
            StreamPart::ToolCallStart { id, name } => {
                let _ = events.send(SessionEvent::ToolCallStart { id, name });
            }
            StreamPart::ToolCallComplete { tool_call } => {
                outcome.tool_calls.push(tool_call);
            }
            StreamPart::Usage { usage } => {
                outcome.usage = Some(usage);
                let _ = events.send(SessionEvent::Usage { usage });
            }
            StreamPart::TurnDone { finish_reason } => {
                outcome.finish_reason = Some(finish_reason);
                return outcome;
            }
            StreamPart::Error { error, retryable } => {
                outcome.error = Some((error, retryable));
                return outcome;
            }
        }
    }
}
