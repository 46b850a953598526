//! Machine-readable results of a successful apply.
//!
//! The external tool reports outputs as `{"name": {"value": ..., "sensitive": bool}}`.
//! They are flattened into a key → scalar map, and anything that carries secret
//! material is stripped before it can reach the tenant record.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Flat outputs map as persisted on a tenant record.
pub type Outputs = BTreeMap<String, Value>;

/// Output keys that always hold secret material, whatever the tool says.
pub const SECRET_OUTPUT_KEYS: &[&str] = &["db_password", "database_init_script"];

/// Outputs as reported by the tool, before redaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutputs {
    values: Outputs,
    sensitive: BTreeSet<String>,
}

impl ToolOutputs {
    /// Parse the JSON document printed by `<tool> output -json`.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        let raw: Map<String, Value> = serde_json::from_str(json)?;
        let mut outputs = ToolOutputs::default();

        for (key, entry) in raw {
            let (value, sensitive) = match entry {
                Value::Object(mut wrapped) if wrapped.contains_key("value") => {
                    let sensitive = wrapped
                        .get("sensitive")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    (wrapped.remove("value").unwrap_or(Value::Null), sensitive)
                }
                other => (other, false),
            };

            if value.is_null() {
                continue;
            }
            if sensitive {
                outputs.sensitive.insert(key.clone());
            }
            outputs.values.insert(key, scalarize(value));
        }

        Ok(outputs)
    }

    pub fn from_values(values: Outputs) -> Self {
        Self {
            values,
            sensitive: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        self.sensitive.contains(key) || SECRET_OUTPUT_KEYS.contains(&key)
    }

    /// Outputs safe to persist: known secret keys and tool-marked sensitive
    /// outputs removed.
    pub fn redacted(&self) -> Outputs {
        self.values
            .iter()
            .filter(|(key, _)| !self.is_sensitive(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Lists and maps are kept as their JSON text so the persisted map stays flat.
fn scalarize(value: Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        scalar => scalar,
    }
}

/// Read a string-ish output (numbers are rendered) from a persisted map.
pub fn output_str<'a>(outputs: &'a Outputs, key: &str) -> Option<std::borrow::Cow<'a, str>> {
    match outputs.get(key)? {
        Value::String(s) if !s.is_empty() => Some(std::borrow::Cow::Borrowed(s.as_str())),
        Value::Number(n) => Some(std::borrow::Cow::Owned(n.to_string())),
        _ => None,
    }
}
