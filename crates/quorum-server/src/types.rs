//! Wire types for the WebSocket chat protocol and the HTTP control API.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use quorum_core::{Scope, SessionEvent, SessionKey};

/// Addressing for one agent session. Exactly one of `project_id` and
/// `room_id` selects the scope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub agent_id: String,
}

impl AgentRef {
    pub fn session_key(&self) -> Result<SessionKey, String> {
        let scope = match (&self.project_id, &self.room_id) {
            (Some(project), None) => Scope::project(project.clone()),
            (None, Some(room)) => Scope::room(room.clone()),
            _ => return Err("exactly one of project_id or room_id is required".to_string()),
        };
        Ok(SessionKey::new(scope, self.agent_id.clone()))
    }
}

/// Inbound WebSocket commands.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireCommand {
    /// Queue a turn on the addressed session and stream its events back.
    Chat { message: String, agent_ref: AgentRef },
    /// Cancel the active turn of the current session.
    Stop,
}

/// Map a session event to its outbound wire frame.
pub fn map_event(event: &SessionEvent) -> Value {
    match event {
        SessionEvent::TurnStarted { turn_id } => json!({"type": "start", "turn_id": turn_id}),
        SessionEvent::TextDelta { delta } => json!({"type": "response", "content": delta}),
        SessionEvent::ToolCallStart { id, name } => {
            json!({"type": "tool_start", "id": id, "name": name})
        }
        SessionEvent::ToolExecuting { id, name, .. } => {
            json!({"type": "tool_executing", "id": id, "name": name})
        }
        SessionEvent::ToolResult {
            id,
            name,
            output,
            is_error,
        } => json!({
            "type": "tool_result",
            "id": id,
            "name": name,
            "output": output,
            "is_error": is_error,
        }),
        SessionEvent::Usage { usage } => json!({
            "type": "usage",
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
        }),
        SessionEvent::RoundComplete { round, has_more } => {
            json!({"type": "round", "round": round, "has_more": has_more})
        }
        SessionEvent::Finished { turn_id, text } => {
            json!({"type": "end", "turn_id": turn_id, "text": text})
        }
        SessionEvent::AutoReport { turn_id, content } => {
            json!({"type": "auto_report", "turn_id": turn_id, "content": content})
        }
        SessionEvent::Cancelled { turn_id } => json!({"type": "cancelled", "turn_id": turn_id}),
        SessionEvent::Error {
            turn_id,
            message,
            kind,
        } => json!({
            "type": "error",
            "turn_id": turn_id,
            "error": message,
            "code": kind,
        }),
    }
}
