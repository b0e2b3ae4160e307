//! Shared test fixtures: a scriptable provider, a tiny arithmetic handler,
//! and event-collection helpers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use crate::actions::{ActionHandler, ActionRegistry, ActionRouter, DispatchContext};
use crate::agent::events::SessionEvent;
use crate::agent::session::SessionServices;
use crate::ai::client::Provider;
use crate::ai::config::CallOptions;
use crate::ai::retry::RetryConfig;
use crate::ai::streaming::StreamPart;
use crate::ai::types::{AiToolCall, FinishReason, ModelMessage};
use crate::error::EngineError;

/// What the scripted provider does for one call.
pub enum Script {
    /// Emit these parts, then close.
    Parts(Vec<StreamPart>),
    /// Pause, then emit. Scripts completion order in concurrent tests.
    DelayedParts(Duration, Vec<StreamPart>),
    /// Never emit anything; the stream stays open until the receiver drops.
    Hang,
}

type Responder = dyn Fn(&[ModelMessage]) -> Script + Send + Sync;

/// Deterministic in-memory provider driven by a responder over the full
/// message history.
pub struct ScriptedProvider {
    responder: Arc<Responder>,
    fail_first: usize,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(responder: impl Fn(&[ModelMessage]) -> Script + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            fail_first: 0,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the first `failures` calls with a retryable provider error,
    /// then behave like `responder`.
    pub fn flaky_then(
        failures: usize,
        responder: impl Fn(&[ModelMessage]) -> Script + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Arc::new(responder),
            fail_first: failures,
            calls: AtomicUsize::new(0),
        }
    }

    /// Plain text answer ending the round.
    pub fn text_round(text: impl Into<String>) -> Script {
        Script::Parts(vec![
            StreamPart::TextDelta { delta: text.into() },
            StreamPart::TurnDone {
                finish_reason: FinishReason::Stop,
            },
        ])
    }

    /// Text answer delivered after a pause.
    pub fn delayed_text_round(delay: Duration, text: impl Into<String>) -> Script {
        let Script::Parts(parts) = Self::text_round(text) else {
            unreachable!()
        };
        Script::DelayedParts(delay, parts)
    }

    /// One tool call ending the round.
    pub fn tool_call_round(id: &str, name: &str, arguments: Value) -> Script {
        Script::Parts(vec![
            StreamPart::ToolCallStart {
                id: id.to_string(),
                name: name.to_string(),
            },
            StreamPart::ToolCallComplete {
                tool_call: AiToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments,
                },
            },
            StreamPart::TurnDone {
                finish_reason: FinishReason::ToolCalls,
            },
        ])
    }

    /// Stream-level failure.
    pub fn error_round(message: &str, retryable: bool) -> Script {
        Script::Parts(vec![StreamPart::Error {
            error: message.to_string(),
            retryable,
        }])
    }

    /// Stream that never produces output.
    pub fn hang() -> Script {
        Script::Hang
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn stream_turn(
        &self,
        messages: Vec<ModelMessage>,
        _options: &CallOptions,
    ) -> Result<mpsc::UnboundedReceiver<StreamPart>, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(EngineError::provider("scripted transient failure", true));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match (self.responder)(&messages) {
            Script::Parts(parts) => {
                for part in parts {
                    let _ = tx.send(part);
                }
            }
            Script::DelayedParts(delay, parts) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for part in parts {
                        let _ = tx.send(part);
                    }
                });
            }
            Script::Hang => {
                // Keep the sender alive until the receiver goes away.
                tokio::spawn(async move { tx.closed().await });
            }
        }
        Ok(rx)
    }
}

/// Handler evaluating `"a+b"` integer sums.
pub struct EvalHandler;

impl EvalHandler {
    /// Registry with `math__eval` bound to this handler and `agents`
    /// marked as an infra node.
    pub fn registry() -> Arc<ActionRegistry> {
        Arc::new(
            ActionRegistry::builder()
                .infra_node("agents")
                .register_handler(
                    "math",
                    "eval",
                    "Evaluate an integer sum like 2+3",
                    json!({
                        "type": "object",
                        "properties": {"expr": {"type": "string"}},
                        "required": ["expr"]
                    }),
                    Arc::new(EvalHandler),
                )
                .build(),
        )
    }
}

#[async_trait]
impl ActionHandler for EvalHandler {
    async fn handle(&self, params: Value, _ctx: &DispatchContext) -> Result<Value, EngineError> {
        let expr = params
            .get("expr")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::InvalidInput("expr must be a string".to_string()))?;
        let mut sum: i64 = 0;
        for term in expr.split('+') {
            let n: i64 = term.trim().parse().map_err(|_| {
                EngineError::InvalidInput(format!("not an integer term: '{}'", term.trim()))
            })?;
            sum += n;
        }
        Ok(json!({"result": sum}))
    }
}

/// Session services over a scripted provider with fast retries.
pub fn scripted_services(provider: ScriptedProvider, registry: Arc<ActionRegistry>) -> SessionServices {
    SessionServices {
        provider: Arc::new(provider),
        router: Arc::new(ActionRouter::new(registry)),
        retry: RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        },
    }
}

/// Drain a subscription until (and including) the first terminal event.
pub async fn collect_until_terminal(
    sub: &mut broadcast::Receiver<SessionEvent>,
) -> Vec<SessionEvent> {
    let mut collected = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for terminal event")
            .expect("event channel closed before terminal event");
        let terminal = event.is_terminal();
        collected.push(event);
        if terminal {
            return collected;
        }
    }
}
