//! Canonical provider stream events.
//!
//! Every provider adapter translates its vendor-specific streaming chunk
//! format into exactly this event set; nothing vendor-shaped crosses this
//! boundary. One receiver per turn, restartable by calling
//! [`Provider::stream_turn`](crate::ai::client::Provider::stream_turn) again.

use crate::ai::types::{AiToolCall, FinishReason, Usage};

/// One event from a provider stream.
#[derive(Debug, Clone)]
pub enum StreamPart {
    /// Incremental assistant text.
    TextDelta { delta: String },

    /// The model started streaming a tool call (arguments incomplete).
    ToolCallStart { id: String, name: String },

    /// Tool call fully received, arguments parsed.
    ToolCallComplete { tool_call: AiToolCall },

    /// Token usage reported by the provider.
    Usage { usage: Usage },

    /// The provider finished this round.
    TurnDone { finish_reason: FinishReason },

    /// Transport or API failure. `retryable` distinguishes network-class
    /// failures from auth/malformed-request failures.
    Error { error: String, retryable: bool },
}
