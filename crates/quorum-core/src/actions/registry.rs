//! Action registry.
//!
//! A closed map from `(node, action)` to an executable capability, built
//! once at startup and read-only afterwards. Capabilities either describe a
//! declarative external call (direct path) or name a registered handler
//! (custom path). An explicit handler registration overrides a direct entry
//! for the same pair.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::actions::transform::ResponseTransform;
use crate::ai::types::AiTool;
use crate::error::EngineError;
use crate::supervisor::SessionKey;

/// Separator between node and action in the flat tool name shown to the
/// model. Double underscore keeps names within provider tool-name charsets.
pub const TOOL_NAME_SEPARATOR: &str = "__";

/// Context handed to handlers and used for access control.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// The session this tool call originated from.
    pub session: SessionKey,
    /// Nodes this session may dispatch into (infra nodes bypass this).
    pub allowed_nodes: HashSet<String>,
}

/// Stateful capability implementation (caching, ID remapping, composition,
/// delegation). Invoked with schema-validated input.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, params: Value, ctx: &DispatchContext) -> Result<Value, EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    Post,
}

/// Declarative external API call plus optional response transform.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectCallSpec {
    pub method: HttpMethod,
    /// URL with `{param}` placeholders substituted (percent-encoded) from
    /// the validated tool-call params.
    pub endpoint_template: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub transform: Option<ResponseTransform>,
}

/// How a registered action executes.
#[derive(Clone)]
pub enum ActionPath {
    Direct(DirectCallSpec),
    Handler(Arc<dyn ActionHandler>),
}

impl std::fmt::Debug for ActionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(spec) => f.debug_tuple("Direct").field(spec).finish(),
            Self::Handler(_) => f.debug_tuple("Handler").finish(),
        }
    }
}

/// The authoritative description of one `(node, action)` capability.
#[derive(Debug, Clone)]
pub struct ActionDefinition {
    /// Capability domain. Entries without a node load but are excluded
    /// from node-scoped dispatch.
    pub node: Option<String>,
    pub action: String,
    pub description: String,
    pub input_schema: Value,
    pub path: ActionPath,
}

impl ActionDefinition {
    /// Flat tool name shown to the model, `node__action`.
    pub fn tool_name(&self) -> Option<String> {
        self.node
            .as_ref()
            .map(|node| format!("{}{}{}", node, TOOL_NAME_SEPARATOR, self.action))
    }
}

/// One row of the static action table (YAML).
#[derive(Debug, Deserialize)]
pub struct ActionTableEntry {
    #[serde(default)]
    pub node: Option<String>,
    pub action: String,
    #[serde(default)]
    pub description: String,
    pub path: TablePath,
    pub input_schema: Value,
    #[serde(default)]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub endpoint_template: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub transform: Option<ResponseTransform>,
    #[serde(default)]
    pub handler_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TablePath {
    Direct,
    Handler,
}

/// Builds the registry at startup. Handler registrations win over direct
/// entries for the same `(node, action)`.
#[derive(Default)]
pub struct ActionRegistryBuilder {
    actions: HashMap<(String, String), ActionDefinition>,
    unscoped: Vec<ActionDefinition>,
    infra_nodes: HashSet<String>,
}

impl ActionRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a node as infrastructure: always allowed, bypasses the
    /// session's allowed-node check.
    pub fn infra_node(mut self, node: impl Into<String>) -> Self {
        self.infra_nodes.insert(node.into());
        self
    }

    /// Register a direct-call action. Does not replace an existing handler
    /// registration for the same pair.
    pub fn register_direct(
        mut self,
        node: impl Into<String>,
        action: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        spec: DirectCallSpec,
    ) -> Self {
        let node = node.into();
        let action = action.into();
        let key = (node.clone(), action.clone());
        if matches!(
            self.actions.get(&key).map(|d| &d.path),
            Some(ActionPath::Handler(_))
        ) {
            debug!(node = %node, action = %action, "handler already registered, keeping it");
            return self;
        }
        self.actions.insert(
            key,
            ActionDefinition {
                node: Some(node),
                action,
                description: description.into(),
                input_schema,
                path: ActionPath::Direct(spec),
            },
        );
        self
    }

    /// Register a custom handler. Replaces any existing registration for
    /// the same pair.
    pub fn register_handler(
        mut self,
        node: impl Into<String>,
        action: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        let node = node.into();
        let action = action.into();
        self.actions.insert(
            (node.clone(), action.clone()),
            ActionDefinition {
                node: Some(node),
                action,
                description: description.into(),
                input_schema,
                path: ActionPath::Handler(handler),
            },
        );
        self
    }

    /// Load entries from the static YAML action table. `handlers` resolves
    /// each `handler_ref` name to an implementation.
    pub fn load_table(
        mut self,
        yaml: &str,
        handlers: &HashMap<String, Arc<dyn ActionHandler>>,
    ) -> Result<Self, EngineError> {
        let entries: Vec<ActionTableEntry> = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::InvalidInput(format!("action table parse error: {}", e)))?;

        for entry in entries {
            let path = match entry.path {
                TablePath::Direct => {
                    let endpoint_template = entry.endpoint_template.ok_or_else(|| {
                        EngineError::InvalidInput(format!(
                            "direct action '{}' missing endpoint_template",
                            entry.action
                        ))
                    })?;
                    ActionPath::Direct(DirectCallSpec {
                        method: entry.method.unwrap_or(HttpMethod::Get),
                        endpoint_template,
                        headers: entry.headers,
                        transform: entry.transform,
                    })
                }
                TablePath::Handler => {
                    let handler_ref = entry.handler_ref.as_deref().ok_or_else(|| {
                        EngineError::InvalidInput(format!(
                            "handler action '{}' missing handler_ref",
                            entry.action
                        ))
                    })?;
                    let handler = handlers.get(handler_ref).ok_or_else(|| {
                        EngineError::InvalidInput(format!(
                            "unknown handler_ref '{}' for action '{}'",
                            handler_ref, entry.action
                        ))
                    })?;
                    ActionPath::Handler(Arc::clone(handler))
                }
            };

            let definition = ActionDefinition {
                node: entry.node.clone(),
                action: entry.action.clone(),
                description: entry.description,
                input_schema: entry.input_schema,
                path,
            };

            match entry.node {
                Some(node) => {
                    let key = (node, entry.action);
                    let keep_handler = matches!(entry.path, TablePath::Direct)
                        && matches!(
                            self.actions.get(&key).map(|d| &d.path),
                            Some(ActionPath::Handler(_))
                        );
                    if !keep_handler {
                        self.actions.insert(key, definition);
                    }
                }
                None => {
                    debug!(action = %definition.action, "table entry without node, excluded from dispatch");
                    self.unscoped.push(definition);
                }
            }
        }

        Ok(self)
    }

    pub fn build(self) -> ActionRegistry {
        ActionRegistry {
            actions: self.actions,
            infra_nodes: self.infra_nodes,
        }
    }
}

/// Read-only after startup; freely shared across sessions.
pub struct ActionRegistry {
    actions: HashMap<(String, String), ActionDefinition>,
    infra_nodes: HashSet<String>,
}

impl ActionRegistry {
    pub fn builder() -> ActionRegistryBuilder {
        ActionRegistryBuilder::new()
    }

    pub fn get(&self, node: &str, action: &str) -> Option<&ActionDefinition> {
        self.actions.get(&(node.to_string(), action.to_string()))
    }

    pub fn is_infra_node(&self, node: &str) -> bool {
        self.infra_nodes.contains(node)
    }

    /// Split a flat tool name back into its `(node, action)` pair.
    pub fn parse_tool_name(name: &str) -> Option<(&str, &str)> {
        name.split_once(TOOL_NAME_SEPARATOR)
            .filter(|(node, action)| !node.is_empty() && !action.is_empty())
    }

    /// Tool schema visible to a session: its allowed nodes plus every
    /// infra node. Sorted by name so the schema is stable across turns.
    pub fn ai_tools_for(&self, allowed_nodes: &HashSet<String>) -> Vec<AiTool> {
        let mut tools: Vec<AiTool> = self
            .actions
            .values()
            .filter_map(|def| {
                let node = def.node.as_deref()?;
                if !allowed_nodes.contains(node) && !self.infra_nodes.contains(node) {
                    return None;
                }
                Some(AiTool {
                    name: def.tool_name()?,
                    description: def.description.clone(),
                    input_schema: def.input_schema.clone(),
                })
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Validate params against an action's input schema: object shape,
    /// required keys, declared property types, `additionalProperties`.
    /// Fails fast with `InvalidInput` before any side effect.
    pub fn validate_params(schema: &Value, params: &Value) -> Result<(), EngineError> {
        let Some(obj) = params.as_object() else {
            return Err(EngineError::InvalidInput(
                "params must be a JSON object".to_string(),
            ));
        };

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(key) {
                    return Err(EngineError::InvalidInput(format!(
                        "missing required field '{}'",
                        key
                    )));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);

        if let Some(props) = properties {
            for (key, value) in obj {
                let Some(prop_schema) = props.get(key) else {
                    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                        return Err(EngineError::InvalidInput(format!(
                            "unknown field '{}'",
                            key
                        )));
                    }
                    continue;
                };
                if let Some(expected) = prop_schema.get("type").and_then(Value::as_str) {
                    if !type_matches(expected, value) {
                        return Err(EngineError::InvalidInput(format!(
                            "field '{}' must be of type {}",
                            key, expected
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}
