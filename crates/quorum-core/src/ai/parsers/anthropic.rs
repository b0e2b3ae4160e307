//! Anthropic Messages API SSE parser.

use std::collections::HashMap;

use serde_json::Value;

use super::{SseParser, ToolCallAccumulator};
use crate::ai::streaming::StreamPart;
use crate::ai::types::{FinishReason, Usage};

/// Parser for the Anthropic streaming event protocol
/// (`message_start` / `content_block_*` / `message_delta` / `message_stop`).
#[derive(Default)]
pub struct AnthropicParser {
    /// Tool calls in flight, keyed by content block index.
    tool_accumulators: HashMap<usize, ToolCallAccumulator>,
    stop_reason: Option<String>,
    usage: Usage,
    done: bool,
}

impl AnthropicParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish_reason(&self) -> FinishReason {
        match self.stop_reason.as_deref() {
            Some("tool_use") => FinishReason::ToolCalls,
            Some("max_tokens") => FinishReason::Length,
            Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
            _ => FinishReason::Other,
        }
    }
}

impl SseParser for AnthropicParser {
    fn parse_data(&mut self, data: &str) -> Vec<StreamPart> {
        let Ok(json) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let event_type = json.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match event_type {
            "message_start" => {
                if let Some(usage) = json.pointer("/message/usage") {
                    self.usage.prompt_tokens = usage
                        .get("input_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as usize;
                }
                Vec::new()
            }

            "content_block_start" => {
                let index = json.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let Some(block) = json.get("content_block") else {
                    return Vec::new();
                };
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let id = block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    self.tool_accumulators
                        .insert(index, ToolCallAccumulator::new(id.clone(), name.clone()));
                    return vec![StreamPart::ToolCallStart { id, name }];
                }
                Vec::new()
            }

            "content_block_delta" => {
                let index = json.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let Some(delta) = json.get("delta") else {
                    return Vec::new();
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta
                            .get("text")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        vec![StreamPart::TextDelta {
                            delta: text.to_string(),
                        }]
                    }
                    Some("input_json_delta") => {
                        if let Some(acc) = self.tool_accumulators.get_mut(&index) {
                            let fragment = delta
                                .get("partial_json")
                                .and_then(Value::as_str)
                                .unwrap_or_default();
                            acc.push_arguments(fragment);
                        }
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }

            "content_block_stop" => {
                let index = json.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                if let Some(acc) = self.tool_accumulators.remove(&index) {
                    return vec![StreamPart::ToolCallComplete {
                        tool_call: acc.finish(),
                    }];
                }
                Vec::new()
            }

            "message_delta" => {
                if let Some(reason) = json
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str)
                {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(output) = json
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)
                {
                    self.usage.completion_tokens = output as usize;
                }
                Vec::new()
            }

            "message_stop" => {
                self.done = true;
                vec![
                    StreamPart::Usage { usage: self.usage },
                    StreamPart::TurnDone {
                        finish_reason: self.finish_reason(),
                    },
                ]
            }

            "error" => {
                let message = json
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown provider error")
                    .to_string();
                // Overload errors are transient; everything else is not.
                let retryable = json
                    .pointer("/error/type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t == "overloaded_error" || t == "api_error");
                vec![StreamPart::Error {
                    error: message,
                    retryable,
                }]
            }

            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<StreamPart> {
        if self.done {
            return Vec::new();
        }
        vec![StreamPart::Error {
            error: "provider stream ended before message_stop".to_string(),
            retryable: true,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut AnthropicParser, events: &[&str]) -> Vec<StreamPart> {
        events
            .iter()
            .flat_map(|e| parser.parse_data(e))
            .collect()
    }

    #[test]
    fn text_and_tool_call_sequence() {
        let mut parser = AnthropicParser::new();
        let parts = feed(
            &mut parser,
            &[
                r#"{"type":"message_start","message":{"usage":{"input_tokens":12}}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tc_1","name":"math__eval"}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"expr\":"}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"1+1\"}"}}"#,
                r#"{"type":"content_block_stop","index":1}"#,
                r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":5}}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );

        assert!(matches!(&parts[0], StreamPart::TextDelta { delta } if delta == "hi"));
        assert!(matches!(&parts[1], StreamPart::ToolCallStart { name, .. } if name == "math__eval"));
        match &parts[2] {
            StreamPart::ToolCallComplete { tool_call } => {
                assert_eq!(tool_call.id, "tc_1");
                assert_eq!(tool_call.arguments["expr"], "1+1");
            }
            other => panic!("expected ToolCallComplete, got {:?}", other),
        }
        match &parts[3] {
            StreamPart::Usage { usage } => {
                assert_eq!(usage.prompt_tokens, 12);
                assert_eq!(usage.completion_tokens, 5);
            }
            other => panic!("expected Usage, got {:?}", other),
        }
        assert!(matches!(
            &parts[4],
            StreamPart::TurnDone {
                finish_reason: FinishReason::ToolCalls
            }
        ));
    }

    #[test]
    fn overload_error_is_retryable() {
        let mut parser = AnthropicParser::new();
        let parts = parser.parse_data(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert!(matches!(
            &parts[0],
            StreamPart::Error { retryable: true, .. }
        ));
    }

    #[test]
    fn auth_error_is_not_retryable() {
        let mut parser = AnthropicParser::new();
        let parts = parser.parse_data(
            r#"{"type":"error","error":{"type":"authentication_error","message":"bad key"}}"#,
        );
        assert!(matches!(
            &parts[0],
            StreamPart::Error {
                retryable: false,
                ..
            }
        ));
    }

    #[test]
    fn truncated_stream_reports_retryable_error() {
        let mut parser = AnthropicParser::new();
        parser.parse_data(r#"{"type":"message_start","message":{"usage":{"input_tokens":1}}}"#);
        let parts = parser.finish();
        assert!(matches!(
            &parts[0],
            StreamPart::Error { retryable: true, .. }
        ));
    }
}
