//! Agent session.
//!
//! One session owns one conversation history and processes turns strictly
//! serially: commands queue on the session's channel and each turn runs the
//! provider round loop to a terminal event before the next is picked up.
//! The session task is the only writer of its history.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::actions::router::{truncate_output, ActionRouter, ToolOutcome};
use crate::actions::DispatchContext;
use crate::agent::events::SessionEvent;
use crate::agent::stream::{process_stream, StreamOutcome};
use crate::ai::client::Provider;
use crate::ai::config::CallOptions;
use crate::ai::retry::RetryConfig;
use crate::ai::types::{Content, ModelMessage, Role};
use crate::error::EngineError;
use crate::supervisor::{SessionKey, SessionState};

pub const DEFAULT_MAX_ROUNDS: usize = 50;

/// Per-session behavior knobs, fixed at session start.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Nodes this session may dispatch into. Infra nodes are always
    /// available on top of these.
    pub allowed_nodes: HashSet<String>,
    pub system_prompt: Option<String>,
    /// Hard cap on provider rounds within one turn.
    pub max_rounds: usize,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            allowed_nodes: HashSet::new(),
            system_prompt: None,
            max_rounds: DEFAULT_MAX_ROUNDS,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Shared services every session drives.
#[derive(Clone)]
pub struct SessionServices {
    pub provider: Arc<dyn Provider>,
    pub router: Arc<ActionRouter>,
    pub retry: RetryConfig,
}

/// Where a turn request came from. Controls the terminal event shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOrigin {
    /// An end user over a transport.
    User,
    /// A delegation request from another session.
    Delegation,
    /// A delegation completion report injected back into the origin
    /// session; terminates with `AutoReport` instead of `Finished`.
    DelegationReport,
}

/// One queued unit of work for a session.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub text: String,
    pub origin: TurnOrigin,
}

impl TurnInput {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: TurnOrigin::User,
        }
    }

    pub fn delegation(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: TurnOrigin::Delegation,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnStatus {
    Completed,
    Cancelled,
    Failed(EngineError),
}

/// Terminal result of one turn, delivered on the turn's ack channel.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    pub text: String,
}

/// Commands accepted by a session task.
pub enum SessionCommand {
    Turn {
        input: TurnInput,
        /// Optional completion signal, used by the delegation coordinator.
        ack: Option<oneshot::Sender<TurnOutcome>>,
    },
}

/// Session task entry point. Runs until the command channel closes or the
/// session token is cancelled; processes commands one at a time.
#[instrument(skip_all, fields(session = %key))]
pub async fn session_task(
    key: SessionKey,
    config: SessionConfig,
    services: SessionServices,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<SessionState>,
    session_cancel: CancellationToken,
    turn_cancel: Arc<parking_lot::Mutex<CancellationToken>>,
) {
    info!("session started");
    let mut history: Vec<ModelMessage> = Vec::new();

    loop {
        let command = tokio::select! {
            _ = session_cancel.cancelled() => break,
            received = commands.recv() => match received {
                Some(command) => command,
                None => break,
            },
        };

        let SessionCommand::Turn { input, ack } = command;

        // Fresh per-turn token, child of the session token so session stop
        // also cancels the active turn.
        let cancel = session_cancel.child_token();
        *turn_cancel.lock() = cancel.clone();

        let _ = state.send(SessionState::Running);
        // Reflect cancellation in the observable state while the turn
        // winds down.
        let cancel_watch = tokio::spawn({
            let cancel = cancel.clone();
            let state = state.clone();
            async move {
                cancel.cancelled().await;
                let _ = state.send(SessionState::Cancelling);
            }
        });
        let outcome = run_turn(
            &key,
            &config,
            &services,
            &events,
            &cancel,
            &mut history,
            input,
        )
        .await;
        cancel_watch.abort();
        let _ = cancel_watch.await;
        let _ = state.send(SessionState::Idle);

        if let Some(ack) = ack {
            let _ = ack.send(outcome);
        }
    }

    let _ = state.send(SessionState::Idle);
    info!("session stopped");
}

/// Run one turn: append the input to history, then loop provider rounds
/// until a round produces no tool calls, the round cap is hit, the turn is
/// cancelled, or an error exhausts its retries. Exactly one terminal event
/// is emitted on every path.
async fn run_turn(
    key: &SessionKey,
    config: &SessionConfig,
    services: &SessionServices,
    events: &broadcast::Sender<SessionEvent>,
    cancel: &CancellationToken,
    history: &mut Vec<ModelMessage>,
    input: TurnInput,
) -> TurnOutcome {
    let turn_id = Uuid::new_v4().to_string();
    let origin = input.origin;
    let _ = events.send(SessionEvent::TurnStarted {
        turn_id: turn_id.clone(),
    });

    if cancel.is_cancelled() {
        let _ = events.send(SessionEvent::Cancelled {
            turn_id: turn_id.clone(),
        });
        return TurnOutcome {
            status: TurnStatus::Cancelled,
            text: String::new(),
        };
    }

    history.push(ModelMessage::user_text(input.text));

    let tools = services
        .router
        .registry()
        .ai_tools_for(&config.allowed_nodes);
    let options = CallOptions {
        max_tokens: config.max_tokens,
        temperature: config.temperature,
        tools: if tools.is_empty() { None } else { Some(tools) },
        system_prompt: config.system_prompt.clone(),
    };

    let mut turn_text = String::new();

    for round in 1..=config.max_rounds {
        let round_outcome =
            match stream_round(services, events, cancel, history, &options).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(round, code = e.code(), "turn failed: {}", e);
                    let _ = events.send(SessionEvent::Error {
                        turn_id: turn_id.clone(),
                        message: e.to_string(),
                        kind: e.code().to_string(),
                    });
                    return TurnOutcome {
                        status: TurnStatus::Failed(e),
                        text: turn_text,
                    };
                }
            };

        if !turn_text.is_empty() && !round_outcome.text.is_empty() {
            turn_text.push('\n');
        }
        turn_text.push_str(&round_outcome.text);

        // Assistant message for this round, tool_use blocks included, so
        // history stays well-formed even across cancellation.
        let mut assistant_content: Vec<Content> = Vec::new();
        if !round_outcome.text.is_empty() {
            assistant_content.push(Content::Text {
                text: round_outcome.text.clone(),
            });
        }
        for call in &round_outcome.tool_calls {
            assistant_content.push(Content::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.arguments.clone(),
            });
        }
        if !assistant_content.is_empty() {
            history.push(ModelMessage {
                role: Role::Assistant,
                content: assistant_content,
            });
        }

        let cancelled = round_outcome.cancelled || cancel.is_cancelled();
        if cancelled {
            // Any tool_use already in history must get a matching result or
            // the next provider call rejects the conversation.
            if round_outcome.has_tool_calls() {
                history.push(cancelled_tool_results(&round_outcome));
            }
            info!(round, "turn cancelled");
            let _ = events.send(SessionEvent::Cancelled {
                turn_id: turn_id.clone(),
            });
            return TurnOutcome {
                status: TurnStatus::Cancelled,
                text: turn_text,
            };
        }

        if !round_outcome.has_tool_calls() {
            let _ = events.send(SessionEvent::RoundComplete {
                round,
                has_more: false,
            });
            let terminal = match origin {
                TurnOrigin::DelegationReport => SessionEvent::AutoReport {
                    turn_id: turn_id.clone(),
                    content: turn_text.clone(),
                },
                _ => SessionEvent::Finished {
                    turn_id: turn_id.clone(),
                    text: turn_text.clone(),
                },
            };
            let _ = events.send(terminal);
            return TurnOutcome {
                status: TurnStatus::Completed,
                text: turn_text,
            };
        }

        // Fan out tool calls concurrently; results land in issue order.
        let ctx = DispatchContext {
            session: key.clone(),
            allowed_nodes: config.allowed_nodes.clone(),
        };
        for call in &round_outcome.tool_calls {
            let _ = events.send(SessionEvent::ToolExecuting {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
        }
        let dispatches = round_outcome
            .tool_calls
            .iter()
            .map(|call| services.router.dispatch(call, &ctx));
        let outcomes: Vec<ToolOutcome> = futures::future::join_all(dispatches).await;

        let mut results: Vec<Content> = Vec::with_capacity(outcomes.len());
        for (call, outcome) in round_outcome.tool_calls.iter().zip(outcomes) {
            let _ = events.send(SessionEvent::ToolResult {
                id: outcome.tool_call_id.clone(),
                name: call.name.clone(),
                output: truncated_event_output(&outcome.envelope()),
                is_error: outcome.is_error(),
            });
            results.push(outcome.into_content());
        }
        history.push(ModelMessage {
            role: Role::User,
            content: results,
        });

        // Cancellation during dispatch: the results above stay in history,
        // but no further provider call starts.
        if cancel.is_cancelled() {
            info!(round, "turn cancelled after tool dispatch");
            let _ = events.send(SessionEvent::Cancelled {
                turn_id: turn_id.clone(),
            });
            return TurnOutcome {
                status: TurnStatus::Cancelled,
                text: turn_text,
            };
        }

        let _ = events.send(SessionEvent::RoundComplete {
            round,
            has_more: true,
        });
    }

    let e = EngineError::RoundLimitExceeded(config.max_rounds);
    warn!(max_rounds = config.max_rounds, "round limit exceeded");
    let _ = events.send(SessionEvent::Error {
        turn_id,
        message: e.to_string(),
        kind: e.code().to_string(),
    });
    TurnOutcome {
        status: TurnStatus::Failed(e),
        text: turn_text,
    }
}

/// One provider round with bounded retries for retryable failures. Returns
/// the first non-retryable error, or the last error once attempts run out.
async fn stream_round(
    services: &SessionServices,
    events: &broadcast::Sender<SessionEvent>,
    cancel: &CancellationToken,
    history: &[ModelMessage],
    options: &CallOptions,
) -> Result<StreamOutcome, EngineError> {
    let retry = &services.retry;
    let mut attempt = 1;

    loop {
        let result = services
            .provider
            .stream_turn(history.to_vec(), options)
            .await;

        let error = match result {
            Ok(rx) => {
                let outcome = process_stream(rx, events, cancel).await;
                if outcome.cancelled {
                    return Ok(outcome);
                }
                match &outcome.error {
                    None => return Ok(outcome),
                    Some((message, retryable)) => {
                        EngineError::provider(message.clone(), *retryable)
                    }
                }
            }
            Err(e) => e,
        };

        if !error.is_retryable() || attempt >= retry.max_attempts {
            return Err(error);
        }

        let delay = retry.delay_for_attempt(attempt);
        debug!(attempt, ?delay, "retrying provider round: {}", error);
        tokio::select! {
            _ = cancel.cancelled() => {
                let mut outcome = StreamOutcome::default();
                outcome.cancelled = true;
                return Ok(outcome);
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Synthetic error results for tool calls that will never be dispatched
/// because the turn was cancelled first.
fn cancelled_tool_results(outcome: &StreamOutcome) -> ModelMessage {
    let results = outcome
        .tool_calls
        .iter()
        .map(|call| Content::ToolResult {
            tool_use_id: call.id.clone(),
            output: serde_json::json!({
                "ok": false,
                "error": {
                    "code": "cancelled",
                    "message": "turn cancelled before dispatch",
                },
            }),
            is_error: Some(true),
        })
        .collect();
    ModelMessage {
        role: Role::User,
        content: results,
    }
}

/// Event payloads carry at most the truncation cap; full values stay in
/// history only.
fn truncated_event_output(envelope: &Value) -> Value {
    let serialized = envelope.to_string();
    let truncated = truncate_output(&serialized);
    if truncated.len() == serialized.len() {
        envelope.clone()
    } else {
        Value::String(truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{collect_until_terminal, scripted_services, EvalHandler, ScriptedProvider};
    use crate::supervisor::Scope;
    use serde_json::json;

    fn run_session_for_test(
        config: SessionConfig,
        services: SessionServices,
    ) -> (
        mpsc::UnboundedSender<SessionCommand>,
        broadcast::Sender<SessionEvent>,
        watch::Receiver<SessionState>,
        CancellationToken,
        Arc<parking_lot::Mutex<CancellationToken>>,
    ) {
        let key = SessionKey::new(Scope::project("p1"), "agent-a");
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let session_cancel = CancellationToken::new();
        let turn_cancel = Arc::new(parking_lot::Mutex::new(session_cancel.child_token()));

        tokio::spawn(session_task(
            key,
            config,
            services,
            command_rx,
            events.clone(),
            state_tx,
            session_cancel.clone(),
            Arc::clone(&turn_cancel),
        ));

        (command_tx, events, state_rx, session_cancel, turn_cancel)
    }

    fn math_config() -> SessionConfig {
        SessionConfig {
            allowed_nodes: ["math".to_string()].into(),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn tool_round_trip_emits_expected_event_sequence() {
        // Round 1: model asks for math__eval("2+3"); round 2: final text.
        let provider = ScriptedProvider::new(|messages| {
            let rounds = messages
                .iter()
                .filter(|m| matches!(m.role, Role::Assistant))
                .count();
            if rounds == 0 {
                ScriptedProvider::tool_call_round("tc_1", "math__eval", json!({"expr": "2+3"}))
            } else {
                ScriptedProvider::text_round("The answer is 5.")
            }
        });
        let services = scripted_services(provider, EvalHandler::registry());
        let (commands, events, _, _, _) = run_session_for_test(math_config(), services);

        let mut sub = events.subscribe();
        let (ack_tx, ack_rx) = oneshot::channel();
        commands
            .send(SessionCommand::Turn {
                input: TurnInput::user("what is 2+3?"),
                ack: Some(ack_tx),
            })
            .unwrap();

        let outcome = ack_rx.await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.text, "The answer is 5.");

        let collected = collect_until_terminal(&mut sub).await;
        let kinds: Vec<&str> = collected
            .iter()
            .map(|e| match e {
                SessionEvent::TurnStarted { .. } => "turn_started",
                SessionEvent::TextDelta { .. } => "text_delta",
                SessionEvent::ToolCallStart { .. } => "tool_call_start",
                SessionEvent::ToolExecuting { .. } => "tool_executing",
                SessionEvent::ToolResult { .. } => "tool_result",
                SessionEvent::Usage { .. } => "usage",
                SessionEvent::RoundComplete { .. } => "round_complete",
                SessionEvent::Finished { .. } => "finished",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "turn_started",
                "tool_call_start",
                "tool_executing",
                "tool_result",
                "round_complete",
                "text_delta",
                "round_complete",
                "finished",
            ]
        );

        // The tool result fed back carries the structured envelope.
        let result = collected
            .iter()
            .find_map(|e| match e {
                SessionEvent::ToolResult { output, is_error, .. } => {
                    Some((output.clone(), *is_error))
                }
                _ => None,
            })
            .unwrap();
        assert!(!result.1);
        assert_eq!(result.0["data"]["result"], 5);
    }

    #[tokio::test]
    async fn turns_queue_and_run_serially() {
        let provider = ScriptedProvider::new(|messages| {
            // Echo the latest user text so responses are attributable.
            let last = messages
                .iter()
                .rev()
                .find_map(|m| {
                    if matches!(m.role, Role::User) {
                        m.text().map(str::to_string)
                    } else {
                        None
                    }
                })
                .unwrap_or_default();
            ScriptedProvider::text_round(&format!("re: {}", last))
        });
        let services = scripted_services(provider, EvalHandler::registry());
        let (commands, _, _, _, _) = run_session_for_test(SessionConfig::default(), services);

        let (ack1_tx, ack1_rx) = oneshot::channel();
        let (ack2_tx, ack2_rx) = oneshot::channel();
        commands
            .send(SessionCommand::Turn {
                input: TurnInput::user("first"),
                ack: Some(ack1_tx),
            })
            .unwrap();
        commands
            .send(SessionCommand::Turn {
                input: TurnInput::user("second"),
                ack: Some(ack2_tx),
            })
            .unwrap();

        let first = ack1_rx.await.unwrap();
        let second = ack2_rx.await.unwrap();
        assert_eq!(first.text, "re: first");
        assert_eq!(second.text, "re: second");
    }

    #[tokio::test]
    async fn round_limit_fails_the_turn() {
        // Model never stops asking for tools.
        let provider = ScriptedProvider::new(|_| {
            ScriptedProvider::tool_call_round("tc_x", "math__eval", json!({"expr": "1+1"}))
        });
        let services = scripted_services(provider, EvalHandler::registry());
        let config = SessionConfig {
            max_rounds: 3,
            ..math_config()
        };
        let (commands, _, _, _, _) = run_session_for_test(config, services);

        let (ack_tx, ack_rx) = oneshot::channel();
        commands
            .send(SessionCommand::Turn {
                input: TurnInput::user("loop forever"),
                ack: Some(ack_tx),
            })
            .unwrap();

        let outcome = ack_rx.await.unwrap();
        assert_eq!(
            outcome.status,
            TurnStatus::Failed(EngineError::RoundLimitExceeded(3))
        );
    }

    #[tokio::test]
    async fn delegation_report_turn_ends_with_auto_report() {
        let provider =
            ScriptedProvider::new(|_| ScriptedProvider::text_round("digest of the report"));
        let services = scripted_services(provider, EvalHandler::registry());
        let (commands, events, _, _, _) =
            run_session_for_test(SessionConfig::default(), services);

        let mut sub = events.subscribe();
        let (ack_tx, ack_rx) = oneshot::channel();
        commands
            .send(SessionCommand::Turn {
                input: TurnInput {
                    text: "delegation finished: ...".to_string(),
                    origin: TurnOrigin::DelegationReport,
                },
                ack: Some(ack_tx),
            })
            .unwrap();

        assert_eq!(ack_rx.await.unwrap().status, TurnStatus::Completed);
        let collected = collect_until_terminal(&mut sub).await;
        assert!(matches!(
            collected.last().unwrap(),
            SessionEvent::AutoReport { content, .. } if content == "digest of the report"
        ));
    }

    #[tokio::test]
    async fn cancelling_mid_turn_emits_cancelled_and_keeps_session_alive() {
        // Provider hangs until cancelled.
        let provider = ScriptedProvider::new(|_| ScriptedProvider::hang());
        let services = scripted_services(provider, EvalHandler::registry());
        let (commands, events, _, _, turn_cancel) =
            run_session_for_test(SessionConfig::default(), services);

        let mut sub = events.subscribe();
        let (ack_tx, ack_rx) = oneshot::channel();
        commands
            .send(SessionCommand::Turn {
                input: TurnInput::user("never finishes"),
                ack: Some(ack_tx),
            })
            .unwrap();

        // Wait for the turn to actually start before cancelling.
        loop {
            if let SessionEvent::TurnStarted { .. } = sub.recv().await.unwrap() {
                break;
            }
        }
        turn_cancel.lock().cancel();

        let outcome = ack_rx.await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Cancelled);

        // The session still accepts new turns.
        let (ack2_tx, _ack2_rx) = oneshot::channel();
        assert!(commands
            .send(SessionCommand::Turn {
                input: TurnInput::user("still here?"),
                ack: Some(ack2_tx),
            })
            .is_ok());
    }

    #[tokio::test]
    async fn cancel_during_tool_dispatch_skips_the_next_provider_call() {
        use crate::actions::{ActionHandler, ActionRegistry, DispatchContext};
        use async_trait::async_trait;
        use std::sync::atomic::{AtomicUsize, Ordering};

        // Cancels the active turn from inside a tool dispatch.
        struct CancelWhileRunning {
            turn_cancel: Arc<parking_lot::Mutex<CancellationToken>>,
        }

        #[async_trait]
        impl ActionHandler for CancelWhileRunning {
            async fn handle(
                &self,
                _params: serde_json::Value,
                _ctx: &DispatchContext,
            ) -> Result<serde_json::Value, EngineError> {
                self.turn_cancel.lock().cancel();
                Ok(json!({"halted": true}))
            }
        }

        let provider_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&provider_calls);
        // Always asks for another tool, so a second provider call would
        // happen unless cancellation stops the loop after dispatch.
        let provider = ScriptedProvider::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            ScriptedProvider::tool_call_round("tc_1", "sys__halt", json!({}))
        });

        let session_cancel = CancellationToken::new();
        let turn_cancel = Arc::new(parking_lot::Mutex::new(session_cancel.child_token()));
        let registry = Arc::new(
            ActionRegistry::builder()
                .register_handler(
                    "sys",
                    "halt",
                    "Stop the current turn",
                    json!({"type": "object"}),
                    Arc::new(CancelWhileRunning {
                        turn_cancel: Arc::clone(&turn_cancel),
                    }),
                )
                .build(),
        );
        let services = scripted_services(provider, registry);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (state_tx, _state_rx) = watch::channel(SessionState::Idle);
        tokio::spawn(session_task(
            SessionKey::new(Scope::project("p1"), "agent-a"),
            SessionConfig {
                allowed_nodes: ["sys".to_string()].into(),
                ..SessionConfig::default()
            },
            services,
            command_rx,
            events.clone(),
            state_tx,
            session_cancel.clone(),
            Arc::clone(&turn_cancel),
        ));

        let mut sub = events.subscribe();
        let (ack_tx, ack_rx) = oneshot::channel();
        command_tx
            .send(SessionCommand::Turn {
                input: TurnInput::user("halt yourself"),
                ack: Some(ack_tx),
            })
            .unwrap();

        let outcome = ack_rx.await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Cancelled);
        assert_eq!(provider_calls.load(Ordering::SeqCst), 1);

        let collected = collect_until_terminal(&mut sub).await;
        assert!(matches!(
            collected.last().unwrap(),
            SessionEvent::Cancelled { .. }
        ));
    }

    #[tokio::test]
    async fn retryable_provider_error_is_retried_to_success() {
        let provider = ScriptedProvider::flaky_then(
            2, // first two calls fail retryably
            |_| ScriptedProvider::text_round("recovered"),
        );
        let services = scripted_services(provider, EvalHandler::registry());
        let (commands, _, _, _, _) = run_session_for_test(SessionConfig::default(), services);

        let (ack_tx, ack_rx) = oneshot::channel();
        commands
            .send(SessionCommand::Turn {
                input: TurnInput::user("flaky"),
                ack: Some(ack_tx),
            })
            .unwrap();

        let outcome = ack_rx.await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.text, "recovered");
    }
}
