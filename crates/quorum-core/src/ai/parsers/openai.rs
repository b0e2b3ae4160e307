//! OpenAI chat-completions SSE parser.

use std::collections::BTreeMap;

use serde_json::Value;

use super::{SseParser, ToolCallAccumulator};
use crate::ai::streaming::StreamPart;
use crate::ai::types::{FinishReason, Usage};

/// Parser for the OpenAI `chat/completions` streaming protocol
/// (`choices[].delta` chunks terminated by `[DONE]`).
///
/// Tool-call fragments arrive keyed by array index; a BTreeMap keeps flush
/// order equal to issuance order.
#[derive(Default)]
pub struct OpenAIParser {
    tool_accumulators: BTreeMap<usize, ToolCallAccumulator>,
    started: Vec<usize>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    done: bool,
}

impl OpenAIParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `ToolCallComplete` for every accumulated call, in index order.
    fn flush_tool_calls(&mut self) -> Vec<StreamPart> {
        std::mem::take(&mut self.tool_accumulators)
            .into_values()
            .map(|acc| StreamPart::ToolCallComplete {
                tool_call: acc.finish(),
            })
            .collect()
    }
}

impl SseParser for OpenAIParser {
    fn parse_data(&mut self, data: &str) -> Vec<StreamPart> {
        if data == "[DONE]" {
            self.done = true;
            let mut parts = self.flush_tool_calls();
            if let Some(usage) = self.usage.take() {
                parts.push(StreamPart::Usage { usage });
            }
            parts.push(StreamPart::TurnDone {
                finish_reason: self.finish_reason.take().unwrap_or(FinishReason::Stop),
            });
            return parts;
        }

        let Ok(json) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };

        if let Some(error) = json.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown provider error")
                .to_string();
            return vec![StreamPart::Error {
                error: message,
                retryable: false,
            }];
        }

        if let Some(usage) = json.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(Usage {
                prompt_tokens: usage
                    .get("prompt_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize,
                completion_tokens: usage
                    .get("completion_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize,
            });
        }

        let Some(choice) = json.pointer("/choices/0") else {
            return Vec::new();
        };

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(match reason {
                "tool_calls" => FinishReason::ToolCalls,
                "length" => FinishReason::Length,
                "stop" => FinishReason::Stop,
                _ => FinishReason::Other,
            });
        }

        let mut parts = Vec::new();
        let Some(delta) = choice.get("delta") else {
            return parts;
        };

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                parts.push(StreamPart::TextDelta {
                    delta: text.to_string(),
                });
            }
        }

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let entry = self.tool_accumulators.entry(index).or_insert_with(|| {
                    ToolCallAccumulator::new(String::new(), String::new())
                });

                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    entry.id = id.to_string();
                }
                if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                    entry.name = name.to_string();
                }
                if let Some(args) = call
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                {
                    entry.push_arguments(args);
                }

                if !self.started.contains(&index) && !entry.id.is_empty() && !entry.name.is_empty()
                {
                    self.started.push(index);
                    parts.push(StreamPart::ToolCallStart {
                        id: entry.id.clone(),
                        name: entry.name.clone(),
                    });
                }
            }
        }

        parts
    }

    fn finish(&mut self) -> Vec<StreamPart> {
        if self.done {
            return Vec::new();
        }
        vec![StreamPart::Error {
            error: "provider stream ended before [DONE]".to_string(),
            retryable: true,
        }]
    }
}
