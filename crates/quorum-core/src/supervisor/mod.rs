//! Concurrency supervisor.
//!
//! Owns the map of live sessions keyed by `(scope, agent_id)`. Starting is
//! idempotent, routing locates or creates, and stopping tears down the
//! session task and waits for it to go idle. Sessions in different scopes
//! never share state.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::events::SessionEvent;
use crate::agent::session::{
    session_task, SessionCommand, SessionConfig, SessionServices, TurnInput, TurnOutcome,
};
use crate::error::EngineError;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Isolation boundary for sessions and delegation chains.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Project(String),
    Room(String),
}

impl Scope {
    pub fn project(id: impl Into<String>) -> Self {
        Self::Project(id.into())
    }

    pub fn room(id: impl Into<String>) -> Self {
        Self::Room(id.into())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project(id) => write!(f, "project:{}", id),
            Self::Room(id) => write!(f, "room:{}", id),
        }
    }
}

/// Identity of one session. Same agent in two scopes is two sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub scope: Scope,
    pub agent_id: String,
}

impl SessionKey {
    pub fn new(scope: Scope, agent_id: impl Into<String>) -> Self {
        Self {
            scope,
            agent_id: agent_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.agent_id)
    }
}

/// Coarse lifecycle state, observable via the handle's watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    /// The active turn has been cancelled and is winding down.
    Cancelling,
}

/// Cheap cloneable handle to a live session task.
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    state_rx: watch::Receiver<SessionState>,
    session_cancel: CancellationToken,
    /// Slot holding the active turn's token; replaced each turn.
    turn_cancel: Arc<parking_lot::Mutex<CancellationToken>>,
}

impl SessionHandle {
    /// Queue a turn without waiting for its outcome.
    pub fn send_turn(&self, input: TurnInput) -> Result<(), EngineError> {
        self.command_tx
            .send(SessionCommand::Turn { input, ack: None })
            .map_err(|_| EngineError::ScopeTornDown)
    }

    /// Queue a turn and get a receiver for its terminal outcome.
    pub fn send_turn_with_ack(
        &self,
        input: TurnInput,
    ) -> Result<oneshot::Receiver<TurnOutcome>, EngineError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Turn {
                input,
                ack: Some(ack_tx),
            })
            .map_err(|_| EngineError::ScopeTornDown)?;
        Ok(ack_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Cancel the active turn only. Queued turns still run.
    pub fn cancel_turn(&self) {
        self.turn_cancel.lock().cancel();
    }
}

/// Registry of live sessions. Shared via `Arc`.
pub struct Supervisor {
    sessions: DashMap<SessionKey, SessionHandle>,
    services: SessionServices,
    default_config: SessionConfig,
}

impl Supervisor {
    pub fn new(services: SessionServices, default_config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            services,
            default_config,
        }
    }

    /// Start a session, or return the existing handle if the key is
    /// already live. The config argument only applies on actual creation.
    pub fn start(&self, key: SessionKey, config: SessionConfig) -> SessionHandle {
        self.sessions
            .entry(key.clone())
            .or_insert_with(|| {
                info!(session = %key, "starting session");
                let (command_tx, command_rx) = mpsc::unbounded_channel();
                let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
                let (state_tx, state_rx) = watch::channel(SessionState::Idle);
                let session_cancel = CancellationToken::new();
                let turn_cancel =
                    Arc::new(parking_lot::Mutex::new(session_cancel.child_token()));

                tokio::spawn(session_task(
                    key,
                    config,
                    self.services.clone(),
                    command_rx,
                    events.clone(),
                    state_tx,
                    session_cancel.clone(),
                    Arc::clone(&turn_cancel),
                ));

                SessionHandle {
                    command_tx,
                    events,
                    state_rx,
                    session_cancel,
                    turn_cancel,
                }
            })
            .clone()
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.sessions.get(key).map(|h| h.clone())
    }

    pub fn is_running(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Locate the session, creating it with the default config if needed.
    pub fn locate(&self, key: SessionKey) -> SessionHandle {
        self.start(key, self.default_config.clone())
    }

    /// Locate or create the target session and queue a turn on it.
    pub fn route(&self, key: SessionKey, input: TurnInput) -> Result<SessionHandle, EngineError> {
        let handle = self.locate(key);
        handle.send_turn(input)?;
        Ok(handle)
    }

    /// Like [`route`](Self::route), returning the turn's ack receiver.
    pub fn route_with_ack(
        &self,
        key: SessionKey,
        input: TurnInput,
    ) -> Result<(SessionHandle, oneshot::Receiver<TurnOutcome>), EngineError> {
        let handle = self.locate(key);
        let ack = handle.send_turn_with_ack(input)?;
        Ok((handle, ack))
    }

    /// Stop one session: cancel its token (which also cancels the active
    /// turn), remove it from the map, and wait until the task reports idle.
    pub async fn stop(&self, key: &SessionKey) {
        let Some((_, handle)) = self.sessions.remove(key) else {
            return;
        };
        info!(session = %key, "stopping session");
        handle.session_cancel.cancel();
        let mut state_rx = handle.state_rx.clone();
        // The task sends a final Idle on exit; an error here means it is
        // already gone, which is the state we want.
        let _ = state_rx.wait_for(|s| *s == SessionState::Idle).await;
        debug!(session = %key, "session stopped");
    }

    /// Stop every session in a scope. Returns the keys that were stopped.
    pub async fn stop_all(&self, scope: &Scope) -> Vec<SessionKey> {
        let keys: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|entry| &entry.key().scope == scope)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            self.stop(key).await;
        }
        info!(scope = %scope, stopped = keys.len(), "scope torn down");
        keys
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
