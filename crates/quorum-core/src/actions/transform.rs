//! Response transforms for direct-call actions.
//!
//! A transform is a pure function of the upstream response body: optional
//! pointer extraction followed by field mapping. Running the same transform
//! on the same body always yields the same value.

use serde_json::{Map, Value};
use serde::{Deserialize, Serialize};

/// Declarative post-processing applied to a direct-call response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResponseTransform {
    /// JSON pointer selecting a sub-tree of the body before field mapping
    /// (e.g. `/data/items/0`). Missing pointer yields `null`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract: Option<String>,

    /// Field projections applied to the (extracted) body. Empty means
    /// pass-through.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldMap>,
}

/// One field projection: JSON pointer source to output key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldMap {
    pub from: String,
    pub to: String,
}

impl ResponseTransform {
    /// Whether this transform changes anything.
    pub fn is_identity(&self) -> bool {
        self.extract.is_none() && self.fields.is_empty()
    }

    pub fn apply(&self, body: &Value) -> Value {
        let base = match &self.extract {
            Some(pointer) => body.pointer(pointer).cloned().unwrap_or(Value::Null),
            None => body.clone(),
        };

        if self.fields.is_empty() {
            return base;
        }

        let mut out = Map::new();
        for field in &self.fields {
            let value = base.pointer(&field.from).cloned().unwrap_or(Value::Null);
            out.insert(field.to.clone(), value);
        }
        Value::Object(out)
    }
}
