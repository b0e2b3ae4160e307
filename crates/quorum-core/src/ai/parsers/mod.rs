//! Per-format SSE payload parsers.

mod anthropic;
mod openai;

pub use anthropic::AnthropicParser;
pub use openai::OpenAIParser;

use crate::ai::streaming::StreamPart;
use crate::ai::types::AiToolCall;

/// Translates one format's SSE payloads into canonical stream parts.
///
/// A parser instance is owned exclusively by one stream-reader task, so it
/// keeps its accumulation state inline rather than behind locks.
pub trait SseParser: Send {
    /// Parse one `data:` payload, returning zero or more stream parts.
    fn parse_data(&mut self, data: &str) -> Vec<StreamPart>;

    /// Called when the byte stream ends without an explicit done marker.
    /// Returns any parts needed to close out the turn.
    fn finish(&mut self) -> Vec<StreamPart> {
        Vec::new()
    }
}

/// Accumulates a streamed tool call's argument fragments.
pub(crate) struct ToolCallAccumulator {
    pub id: String,
    pub name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    pub fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            arguments: String::new(),
        }
    }

    pub fn push_arguments(&mut self, fragment: &str) {
        self.arguments.push_str(fragment);
    }

    /// Finalize into a tool call. Empty or malformed argument JSON becomes
    /// an empty object so validation can report it uniformly downstream.
    pub fn finish(self) -> AiToolCall {
        let arguments = if self.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&self.arguments).unwrap_or_else(|_| serde_json::json!({}))
        };
        AiToolCall {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}
