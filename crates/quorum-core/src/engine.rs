//! Engine facade.
//!
//! Wires the provider, action registry, supervisor, and delegation
//! coordinator together. The delegate handler is registered before the
//! coordinator exists and bound afterwards, which breaks the construction
//! cycle between the registry and the supervisor.

use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};

use crate::actions::{ActionHandler, ActionRegistry, ActionRegistryBuilder, ActionRouter};
use crate::agent::events::SessionEvent;
use crate::agent::session::{SessionConfig, SessionServices, TurnInput, TurnOutcome};
use crate::ai::client::Provider;
use crate::ai::retry::RetryConfig;
use crate::delegation::{DelegateHandler, DelegationConfig, DelegationCoordinator};
use crate::error::EngineError;
use crate::supervisor::{Scope, SessionKey, Supervisor};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Config applied to sessions created by routing.
    pub session: SessionConfig,
    pub delegation: DelegationConfig,
    pub retry: RetryConfig,
}

/// One fully wired runtime. Cheap to share; owns no background work of its
/// own beyond the session tasks it spawns.
pub struct Engine {
    supervisor: Arc<Supervisor>,
    coordinator: Arc<DelegationCoordinator>,
    registry: Arc<ActionRegistry>,
}

impl Engine {
    /// Build the runtime around a provider and a registry of actions. The
    /// `agents__delegate` infra action is always registered on top of the
    /// caller's builder.
    pub fn new(
        provider: Arc<dyn Provider>,
        actions: ActionRegistryBuilder,
        config: EngineConfig,
    ) -> Arc<Self> {
        let delegate = DelegateHandler::new();
        let registry = Arc::new(
            actions
                .infra_node(DelegateHandler::NODE)
                .register_handler(
                    DelegateHandler::NODE,
                    DelegateHandler::ACTION,
                    DelegateHandler::description(),
                    DelegateHandler::input_schema(),
                    Arc::clone(&delegate) as Arc<dyn ActionHandler>,
                )
                .build(),
        );
        let router = Arc::new(
            ActionRouter::new(Arc::clone(&registry)).with_retry_config(config.retry.clone()),
        );
        let services = SessionServices {
            provider,
            router,
            retry: config.retry,
        };
        let supervisor = Arc::new(Supervisor::new(services, config.session));
        let coordinator = DelegationCoordinator::new(Arc::clone(&supervisor), config.delegation);
        delegate.bind(Arc::clone(&coordinator));

        Arc::new(Self {
            supervisor,
            coordinator,
            registry,
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn coordinator(&self) -> &Arc<DelegationCoordinator> {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    /// Queue a user turn, creating the session if needed.
    pub fn route(&self, key: SessionKey, text: impl Into<String>) -> Result<(), EngineError> {
        self.supervisor.route(key, TurnInput::user(text))?;
        Ok(())
    }

    /// Queue a user turn and get the terminal outcome receiver.
    pub fn route_with_ack(
        &self,
        key: SessionKey,
        text: impl Into<String>,
    ) -> Result<oneshot::Receiver<TurnOutcome>, EngineError> {
        let (_, ack) = self.supervisor.route_with_ack(key, TurnInput::user(text))?;
        Ok(ack)
    }

    /// Subscribe to a session's events, creating the session if needed.
    pub fn subscribe(&self, key: SessionKey) -> broadcast::Receiver<SessionEvent> {
        self.supervisor.locate(key).subscribe()
    }

    /// Cancel the active turn of a session, if any. Queued turns still run.
    pub fn cancel_turn(&self, key: &SessionKey) {
        if let Some(handle) = self.supervisor.get(key) {
            handle.cancel_turn();
        }
    }

    pub async fn stop(&self, key: &SessionKey) {
        self.supervisor.stop(key).await;
    }

    /// Tear down a scope: settle its pending delegations, then stop every
    /// session in it.
    pub async fn stop_all(&self, scope: &Scope) -> Vec<SessionKey> {
        self.coordinator.fail_scope(scope);
        self.supervisor.stop_all(scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::SessionEvent;
    use crate::agent::session::TurnStatus;
    use crate::ai::types::Role;
    use crate::delegation::DelegateHandler;
    use crate::testutil::{collect_until_terminal, EvalHandler, ScriptedProvider};
    use serde_json::json;

    fn engine_with(provider: ScriptedProvider) -> Arc<Engine> {
        let actions = ActionRegistry::builder().register_handler(
            "math",
            "eval",
            "Evaluate an integer sum",
            json!({
                "type": "object",
                "properties": {"expr": {"type": "string"}},
                "required": ["expr"]
            }),
            Arc::new(EvalHandler),
        );
        let config = EngineConfig {
            session: SessionConfig {
                allowed_nodes: ["math".to_string()].into(),
                ..SessionConfig::default()
            },
            ..EngineConfig::default()
        };
        Engine::new(Arc::new(provider), actions, config)
    }

    #[tokio::test]
    async fn delegate_action_is_always_registered_as_infra() {
        let engine = engine_with(ScriptedProvider::new(|_| ScriptedProvider::text_round("ok")));
        assert!(engine
            .registry()
            .get(DelegateHandler::NODE, DelegateHandler::ACTION)
            .is_some());
        assert!(engine.registry().is_infra_node(DelegateHandler::NODE));
    }

    #[tokio::test]
    async fn math_turn_flows_end_to_end() {
        let provider = ScriptedProvider::new(|messages| {
            let rounds = messages
                .iter()
                .filter(|m| matches!(m.role, Role::Assistant))
                .count();
            if rounds == 0 {
                ScriptedProvider::tool_call_round("tc_1", "math__eval", json!({"expr": "40+2"}))
            } else {
                ScriptedProvider::text_round("It is 42.")
            }
        });
        let engine = engine_with(provider);
        let key = SessionKey::new(Scope::project("p1"), "assistant");

        let outcome = engine
            .route_with_ack(key, "add 40 and 2")
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.text, "It is 42.");
    }

    #[tokio::test]
    async fn model_driven_delegation_round_trips_to_auto_report() {
        // The origin's model delegates once, acknowledges, and later
        // digests the injected report. Workers just echo.
        let provider = ScriptedProvider::new(|messages| {
            // A tool_result as the latest message means the delegation was
            // just acknowledged; end that turn.
            let last = messages.last().unwrap();
            if last
                .content
                .iter()
                .any(|c| matches!(c, crate::ai::types::Content::ToolResult { .. }))
            {
                return ScriptedProvider::text_round("Delegated.");
            }

            let last_text = last.text().unwrap_or_default().to_string();
            if last_text.contains("Delegation chain") {
                ScriptedProvider::text_round("Worker finished the crunch.")
            } else if last_text.contains("hand this off") {
                ScriptedProvider::tool_call_round(
                    "tc_d",
                    "agents__delegate",
                    json!({
                        "mode": "single",
                        "agents": [{"agent_id": "worker", "task": "crunch numbers"}]
                    }),
                )
            } else {
                ScriptedProvider::text_round(format!("echo: {}", last_text))
            }
        });
        let engine = engine_with(provider);
        let key = SessionKey::new(Scope::project("p1"), "origin");

        let mut events = engine.subscribe(key.clone());
        let outcome = engine
            .route_with_ack(key, "please hand this off")
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);

        // First terminal: the origin turn that issued the delegation.
        let first = collect_until_terminal(&mut events).await;
        assert!(matches!(first.last().unwrap(), SessionEvent::Finished { .. }));

        // Second terminal: the auto report for the finished chain.
        let second = collect_until_terminal(&mut events).await;
        assert!(matches!(
            second.last().unwrap(),
            SessionEvent::AutoReport { content, .. } if content == "Worker finished the crunch."
        ));
    }

    #[tokio::test]
    async fn stop_all_settles_delegations_and_sessions() {
        let engine = engine_with(ScriptedProvider::new(|_| ScriptedProvider::hang()));
        let scope = Scope::project("p1");
        let key = SessionKey::new(scope.clone(), "origin");

        engine.route(key.clone(), "never finishes").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let stopped = engine.stop_all(&scope).await;
        assert_eq!(stopped.len(), 1);
        assert!(!engine.supervisor().is_running(&key));
    }
}
