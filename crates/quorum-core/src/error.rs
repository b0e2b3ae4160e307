//! Engine error taxonomy.
//!
//! A closed set of failure kinds shared by the router, sessions, delegation,
//! and the supervisor. Validation and access-control errors are recovered
//! locally (fed back to the model as error tool-results); round-limit and
//! teardown errors are always terminal.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Tool-call params failed schema validation, or the `(node, action)`
    /// pair is not registered.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The calling session's allowed-node set does not cover this action.
    #[error("action not allowed: {node}__{action}")]
    ActionNotAllowed { node: String, action: String },

    /// A direct-call upstream returned a non-2xx status.
    #[error("upstream rejected: status {status}: {body}")]
    UpstreamRejected { status: u16, body: String },

    /// Provider-level failure (transport, auth, malformed request).
    #[error("provider error: {message}")]
    Provider { message: String, retryable: bool },

    /// A turn exceeded the maximum number of provider rounds.
    #[error("round limit of {0} exceeded")]
    RoundLimitExceeded(usize),

    /// A delegation request saw no resolution within its deadline.
    #[error("delegation timed out after {0:?}")]
    DelegationTimeout(Duration),

    /// The session's scope was torn down while work was pending.
    #[error("scope torn down")]
    ScopeTornDown,
}

impl EngineError {
    /// Stable machine-readable code used in tool-result envelopes and
    /// wire-level error events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::ActionNotAllowed { .. } => "action_not_allowed",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::Provider { .. } => "provider_error",
            Self::RoundLimitExceeded(_) => "round_limit_exceeded",
            Self::DelegationTimeout(_) => "delegation_timeout",
            Self::ScopeTornDown => "scope_torn_down",
        }
    }

    /// Whether retrying the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::UpstreamRejected { status, .. } => {
                crate::ai::retry::is_retryable_status(*status)
            }
            _ => false,
        }
    }

    /// Whether this error must end the turn instead of being fed back to
    /// the model as a tool result.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RoundLimitExceeded(_) | Self::ScopeTornDown)
    }

    pub fn provider(message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            message: message.into(),
            retryable,
        }
    }
}
