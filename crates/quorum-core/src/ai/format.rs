//! Request-body construction for each provider wire format.
//!
//! Converts the engine's unified `ModelMessage` history and tool schema
//! into the JSON each format expects.

use serde_json::{json, Value};

use crate::ai::config::{CallOptions, ProviderConfig};
use crate::ai::types::{Content, ModelMessage, Role};

/// Build an Anthropic Messages API streaming request body.
pub fn anthropic_request_body(
    config: &ProviderConfig,
    messages: &[ModelMessage],
    options: &CallOptions,
) -> Value {
    let converted: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let content: Vec<Value> = m
                .content
                .iter()
                .map(|c| match c {
                    Content::Text { text } => json!({"type": "text", "text": text}),
                    Content::ToolUse { id, name, input } => {
                        json!({"type": "tool_use", "id": id, "name": name, "input": input})
                    }
                    Content::ToolResult {
                        tool_use_id,
                        output,
                        is_error,
                    } => {
                        let mut block = json!({
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": output_as_string(output),
                        });
                        if is_error.unwrap_or(false) {
                            block["is_error"] = json!(true);
                        }
                        block
                    }
                })
                .collect();
            json!({"role": role_str(m.role), "content": content})
        })
        .collect();

    let mut body = json!({
        "model": config.model,
        "messages": converted,
        "max_tokens": options.max_tokens.unwrap_or(config.max_tokens),
        "stream": true,
    });

    if let Some(system) = &options.system_prompt {
        body["system"] = json!(system);
    }
    if let Some(temperature) = options.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(tools) = &options.tools {
        if !tools.is_empty() {
            let tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
    }

    body
}

/// Build an OpenAI chat-completions streaming request body.
pub fn openai_request_body(
    config: &ProviderConfig,
    messages: &[ModelMessage],
    options: &CallOptions,
) -> Value {
    let mut converted: Vec<Value> = Vec::new();

    if let Some(system) = &options.system_prompt {
        converted.push(json!({"role": "system", "content": system}));
    }

    for message in messages.iter().filter(|m| m.role != Role::System) {
        match message.role {
            Role::Assistant => {
                let mut text = String::new();
                let mut tool_calls: Vec<Value> = Vec::new();
                for block in &message.content {
                    match block {
                        Content::Text { text: t } => text.push_str(t),
                        Content::ToolUse { id, name, input } => tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        })),
                        Content::ToolResult { .. } => {}
                    }
                }
                let mut msg = json!({"role": "assistant"});
                msg["content"] = if text.is_empty() {
                    Value::Null
                } else {
                    json!(text)
                };
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = json!(tool_calls);
                }
                converted.push(msg);
            }
            Role::User | Role::System => {
                // Tool results travel as their own `tool` role messages;
                // plain text stays a user message.
                let mut text = String::new();
                for block in &message.content {
                    match block {
                        Content::Text { text: t } => text.push_str(t),
                        Content::ToolResult {
                            tool_use_id,
                            output,
                            ..
                        } => converted.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": output_as_string(output),
                        })),
                        Content::ToolUse { .. } => {}
                    }
                }
                if !text.is_empty() {
                    converted.push(json!({"role": "user", "content": text}));
                }
            }
        }
    }

    let mut body = json!({
        "model": config.model,
        "messages": converted,
        "max_completion_tokens": options.max_tokens.unwrap_or(config.max_tokens),
        "stream": true,
        "stream_options": {"include_usage": true},
    });

    if let Some(temperature) = options.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(tools) = &options.tools {
        if !tools.is_empty() {
            let tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
    }

    body
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User | Role::System => "user",
        Role::Assistant => "assistant",
    }
}

fn output_as_string(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::AiTool;

    fn history() -> Vec<ModelMessage> {
        vec![
            ModelMessage::user_text("1+1"),
            ModelMessage {
                role: Role::Assistant,
                content: vec![Content::ToolUse {
                    id: "tc_1".into(),
                    name: "math__eval".into(),
                    input: json!({"expr": "1+1"}),
                }],
            },
            ModelMessage {
                role: Role::User,
                content: vec![Content::ToolResult {
                    tool_use_id: "tc_1".into(),
                    output: json!({"result": 2}),
                    is_error: None,
                }],
            },
        ]
    }

    fn options() -> CallOptions {
        CallOptions {
            tools: Some(vec![AiTool {
                name: "math__eval".into(),
                description: "Evaluate".into(),
                input_schema: json!({"type": "object"}),
            }]),
            system_prompt: Some("be brief".into()),
            ..Default::default()
        }
    }

    #[test]
    fn anthropic_body_shape() {
        let config = ProviderConfig {
            model: "test-model".into(),
            ..Default::default()
        };
        let body = anthropic_request_body(&config, &history(), &options());

        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"][1]["content"][0]["type"], "tool_use");
        assert_eq!(
            body["messages"][2]["content"][0]["tool_use_id"],
            "tc_1"
        );
        assert_eq!(body["tools"][0]["name"], "math__eval");
    }

    #[test]
    fn openai_body_shape() {
        let config = ProviderConfig {
            model: "test-model".into(),
            ..Default::default()
        };
        let body = openai_request_body(&config, &history(), &options());

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["name"],
            "math__eval"
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "tc_1");
        assert_eq!(body["tools"][0]["type"], "function");
    }
}
