//! Action router.
//!
//! Resolves a model-issued tool call to its registered action and executes
//! it: access control, schema validation, then the direct-call or handler
//! path. Validation and access errors are returned as error outcomes (fed
//! back to the model), never panics or turn aborts.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::actions::registry::{
    ActionPath, ActionRegistry, DirectCallSpec, DispatchContext, HttpMethod,
};
use crate::ai::retry::{with_retry, RetryConfig};
use crate::ai::types::{AiToolCall, Content};
use crate::error::EngineError;

const UPSTREAM_BODY_EXCERPT: usize = 500;
const MAX_RESULT_CHARS: usize = 30_000;
/// Per-request cap on direct calls; a silent upstream must not pin the
/// turn in `Running`.
const DIRECT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// The single result of one tool call.
#[derive(Debug)]
pub struct ToolOutcome {
    pub tool_call_id: String,
    pub payload: Result<Value, EngineError>,
}

impl ToolOutcome {
    /// Structured envelope appended to conversation history:
    /// `{ok:true, data}` or `{ok:false, error:{code, message}}`.
    pub fn envelope(&self) -> Value {
        match &self.payload {
            Ok(data) => serde_json::json!({"ok": true, "data": data}),
            Err(e) => serde_json::json!({
                "ok": false,
                "error": {"code": e.code(), "message": e.to_string()},
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.payload.is_err()
    }

    /// History content block for this outcome.
    pub fn into_content(self) -> Content {
        let is_error = self.is_error();
        Content::ToolResult {
            tool_use_id: self.tool_call_id.clone(),
            output: self.envelope(),
            is_error: if is_error { Some(true) } else { None },
        }
    }
}

/// Dispatches validated tool calls along the direct-call or handler path.
pub struct ActionRouter {
    registry: Arc<ActionRegistry>,
    http: reqwest::Client,
    retry: RetryConfig,
}

impl ActionRouter {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self::with_http_timeout(registry, DIRECT_CALL_TIMEOUT)
    }

    pub fn with_http_timeout(registry: Arc<ActionRegistry>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            registry,
            http,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    /// Execute one tool call. Consumes the call exactly once and always
    /// produces exactly one outcome.
    pub async fn dispatch(&self, call: &AiToolCall, ctx: &DispatchContext) -> ToolOutcome {
        let payload = self.dispatch_inner(call, ctx).await;
        if let Err(e) = &payload {
            debug!(tool = %call.name, code = e.code(), "tool call failed: {}", e);
        }
        ToolOutcome {
            tool_call_id: call.id.clone(),
            payload,
        }
    }

    async fn dispatch_inner(
        &self,
        call: &AiToolCall,
        ctx: &DispatchContext,
    ) -> Result<Value, EngineError> {
        let Some((node, action)) = ActionRegistry::parse_tool_name(&call.name) else {
            return Err(EngineError::InvalidInput(format!(
                "unregistered action '{}'",
                call.name
            )));
        };

        let Some(definition) = self.registry.get(node, action) else {
            return Err(EngineError::InvalidInput(format!(
                "unregistered action '{}__{}'",
                node, action
            )));
        };

        // Access control before anything with side effects.
        if !self.registry.is_infra_node(node) && !ctx.allowed_nodes.contains(node) {
            warn!(session = %ctx.session, node, action, "action not allowed");
            return Err(EngineError::ActionNotAllowed {
                node: node.to_string(),
                action: action.to_string(),
            });
        }

        ActionRegistry::validate_params(&definition.input_schema, &call.arguments)?;

        info!(session = %ctx.session, node, action, "dispatching action");
        match &definition.path {
            ActionPath::Handler(handler) => handler.handle(call.arguments.clone(), ctx).await,
            ActionPath::Direct(spec) => self.execute_direct(spec, &call.arguments).await,
        }
    }

    /// Direct path: render the endpoint, perform the call with bounded
    /// retries, then apply the transform.
    async fn execute_direct(
        &self,
        spec: &DirectCallSpec,
        params: &Value,
    ) -> Result<Value, EngineError> {
        let (url, leftover) = render_endpoint(&spec.endpoint_template, params)?;

        let body = with_retry(&self.retry, "direct_call", || {
            let url = url.clone();
            let leftover = leftover.clone();
            async move {
                let mut request = match spec.method {
                    HttpMethod::Get => {
                        let mut req = self.http.get(&url);
                        if !leftover.is_empty() {
                            let query: Vec<(String, String)> = leftover
                                .iter()
                                .map(|(k, v)| (k.clone(), value_to_param(v)))
                                .collect();
                            req = req.query(&query);
                        }
                        req
                    }
                    HttpMethod::Post => self.http.post(&url).json(&Value::Object(leftover)),
                };
                for (name, value) in &spec.headers {
                    request = request.header(name, value);
                }

                let response = request.send().await.map_err(|e| {
                    EngineError::provider(format!("direct call failed: {}", e), true)
                })?;

                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                if !(200..300).contains(&status) {
                    let excerpt: String = text.chars().take(UPSTREAM_BODY_EXCERPT).collect();
                    // 429/5xx are retryable by classification, so they loop
                    // inside with_retry; the rest surface immediately.
                    return Err(EngineError::UpstreamRejected {
                        status,
                        body: excerpt,
                    });
                }

                Ok(serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text)))
            }
        })
        .await?;

        match &spec.transform {
            Some(transform) if !transform.is_identity() => Ok(transform.apply(&body)),
            _ => Ok(body),
        }
    }
}

/// Substitute `{param}` placeholders (percent-encoded) and return the URL
/// plus the params not consumed by the template.
pub fn render_endpoint(
    template: &str,
    params: &Value,
) -> Result<(String, Map<String, Value>), EngineError> {
    let empty = Map::new();
    let obj = params.as_object().unwrap_or(&empty);
    let mut url = String::with_capacity(template.len());
    let mut used: Vec<&str> = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let Some(close_rel) = rest[open..].find('}') else {
            return Err(EngineError::InvalidInput(format!(
                "unbalanced placeholder in endpoint template '{}'",
                template
            )));
        };
        let close = open + close_rel;
        url.push_str(&rest[..open]);
        let name = &rest[open + 1..close];
        let Some(value) = obj.get(name) else {
            return Err(EngineError::InvalidInput(format!(
                "missing template param '{}'",
                name
            )));
        };
        url.push_str(&urlencoding::encode(&value_to_param(value)));
        used.push(name);
        rest = &rest[close + 1..];
    }
    url.push_str(rest);

    let leftover: Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| !used.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok((url, leftover))
}

fn value_to_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truncate oversized result text at a char boundary, keeping the head.
pub fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_RESULT_CHARS {
        return output.to_string();
    }
    let mut boundary = MAX_RESULT_CHARS;
    while boundary > 0 && !output.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!(
        "{}\n[... output truncated: {} chars -> {} chars ...]",
        &output[..boundary],
        output.len(),
        boundary
    )
}
