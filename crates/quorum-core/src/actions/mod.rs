//! Action registry and router.
//!
//! The capability surface sessions dispatch into: a static registry of
//! `(node, action)` entries and the router that validates and executes
//! model-issued tool calls against it.

pub mod registry;
pub mod router;
pub mod transform;

pub use registry::{
    ActionDefinition, ActionHandler, ActionPath, ActionRegistry, ActionRegistryBuilder,
    DirectCallSpec, DispatchContext, HttpMethod, TOOL_NAME_SEPARATOR,
};
pub use router::{ActionRouter, ToolOutcome};
pub use transform::{FieldMap, ResponseTransform};
