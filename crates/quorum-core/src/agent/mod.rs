//! Agent sessions: the provider round loop and its observable event stream.

pub mod events;
pub mod session;
pub mod stream;

pub use events::SessionEvent;
pub use session::{
    SessionCommand, SessionConfig, SessionServices, TurnInput, TurnOrigin, TurnOutcome,
    TurnStatus, DEFAULT_MAX_ROUNDS,
};
pub use stream::{process_stream, StreamOutcome};
