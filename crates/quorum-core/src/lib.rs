//! Agent runtime and delegation orchestration engine.
//!
//! Sessions run the provider round loop: stream a model response, dispatch
//! any tool calls through the action router, feed results back, repeat
//! until the model stops asking for tools. The supervisor keys sessions by
//! `(scope, agent_id)`; the delegation coordinator lets one session hand
//! work to others in its scope and get a report turn back.
//!
//! [`Engine`] wires the pieces together; transports consume
//! [`SessionEvent`] streams via [`Engine::subscribe`].

pub mod actions;
pub mod agent;
pub mod ai;
pub mod delegation;
pub mod engine;
pub mod error;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testutil;

pub use actions::{
    ActionHandler, ActionRegistry, ActionRegistryBuilder, ActionRouter, DispatchContext,
};
pub use agent::{SessionConfig, SessionEvent, TurnInput, TurnOrigin, TurnOutcome, TurnStatus};
pub use ai::{ApiFormat, AuthHeader, CallOptions, HttpProvider, Provider, ProviderConfig};
pub use delegation::{ChainKind, DelegationConfig, DelegationCoordinator, DelegationStatus};
pub use engine::{Engine, EngineConfig};
pub use error::EngineError;
pub use supervisor::{Scope, SessionKey, SessionState, Supervisor};
