//! Provider adapter layer.
//!
//! Normalizes vendor streaming chat-completion protocols into the common
//! `StreamPart` event set the agent session consumes.

pub mod client;
pub mod config;
pub mod format;
pub mod parsers;
pub mod retry;
pub mod sse;
pub mod streaming;
pub mod types;

pub use client::{HttpProvider, Provider};
pub use config::{ApiFormat, AuthHeader, CallOptions, ProviderConfig};
pub use streaming::StreamPart;
