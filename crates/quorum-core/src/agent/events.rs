//! Session event stream.
//!
//! Everything observable about a running session is published as a
//! `SessionEvent` on the session's broadcast channel. Transports serialize
//! these as-is; nothing provider-shaped leaks through.

use serde::Serialize;
use serde_json::Value;

use crate::ai::types::Usage;

/// One observable event from a session, in emission order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A turn was picked up from the queue and started executing.
    TurnStarted { turn_id: String },

    /// Incremental assistant text, forwarded as it arrives.
    TextDelta { delta: String },

    /// The model started streaming a tool call.
    ToolCallStart { id: String, name: String },

    /// A completed tool call is about to be dispatched.
    ToolExecuting {
        id: String,
        name: String,
        arguments: Value,
    },

    /// Result of one tool call. `output` is truncated for transport;
    /// conversation history keeps the full value.
    ToolResult {
        id: String,
        name: String,
        output: Value,
        is_error: bool,
    },

    /// Provider-reported token usage for one round.
    Usage { usage: Usage },

    /// One provider round finished. `has_more` means tool results were
    /// appended and another round follows.
    RoundComplete { round: usize, has_more: bool },

    /// Terminal: the turn completed normally.
    Finished { turn_id: String, text: String },

    /// Terminal: a delegation report turn completed; `content` is the
    /// digest the origin produced for its own consumers.
    AutoReport { turn_id: String, content: String },

    /// Terminal: the turn was cancelled before completion.
    Cancelled { turn_id: String },

    /// Terminal: the turn failed. `kind` is the stable error code.
    Error {
        turn_id: String,
        message: String,
        kind: String,
    },
}

impl SessionEvent {
    /// Whether this event ends a turn. Every turn emits exactly one
    /// terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. }
                | Self::AutoReport { .. }
                | Self::Cancelled { .. }
                | Self::Error { .. }
        )
    }
}
