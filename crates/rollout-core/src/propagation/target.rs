//! Propagation targets and the per-shape field adapters.

use crate::error::{Result, RolloutError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// Manifest side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// YAML or JSON file under the project root.
    #[default]
    File,
    /// Cluster object addressed as `apiVersion/Kind/namespace/name`.
    Object,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::File => write!(f, "file"),
            StoreKind::Object => write!(f, "object"),
        }
    }
}

/// One consumer of the discovered value, as declared in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSpec {
    pub id: String,
    #[serde(default)]
    pub store: StoreKind,
    pub record: String,
    /// JSON pointer to the field, e.g. `/spec/source/helm/parameters/0/value`.
    pub field: String,
    /// When set, `field` points at a list of `key=value` strings and only the
    /// entry for this key is rewritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl TargetSpec {
    pub fn locator(&self) -> Locator {
        Locator {
            store: self.store,
            record: self.record.clone(),
            field: self.field.clone(),
            shape: match &self.key {
                Some(key) => TargetShape::ListEntry { key: key.clone() },
                None => TargetShape::Scalar,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Locator / shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum TargetShape {
    Scalar,
    ListEntry { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub store: StoreKind,
    pub record: String,
    pub field: String,
    #[serde(flatten)]
    pub shape: TargetShape,
}

impl Locator {
    fn field_error(&self, reason: impl Into<String>) -> RolloutError {
        RolloutError::Field {
            record: self.record.clone(),
            field: self.field.clone(),
            reason: reason.into(),
        }
    }

    /// Read the value this locator addresses inside `document`.
    pub fn read_field(&self, document: &Value) -> Result<String> {
        let node = document
            .pointer(&self.field)
            .ok_or_else(|| self.field_error("field not present"))?;
        match &self.shape {
            TargetShape::Scalar => node
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| self.field_error("not a string")),
            TargetShape::ListEntry { key } => {
                let list = node
                    .as_array()
                    .ok_or_else(|| self.field_error("not a list"))?;
                let idx = entry_index(list, key)
                    .ok_or_else(|| self.field_error(format!("no entry '{key}=' in list")))?;
                let entry = list[idx].as_str().unwrap_or_default();
                Ok(entry[key.len() + 1..].to_string())
            }
        }
    }

    /// Replace the addressed value in place. Everything else in the document,
    /// including other list entries and their order, is left as it was.
    pub fn write_field(&self, document: &mut Value, value: &str) -> Result<()> {
        let field_error = |reason: &str| self.field_error(reason);
        let node = document
            .pointer_mut(&self.field)
            .ok_or_else(|| field_error("field not present"))?;
        match &self.shape {
            TargetShape::Scalar => {
                if !node.is_string() {
                    return Err(field_error("not a string"));
                }
                *node = Value::String(value.to_string());
            }
            TargetShape::ListEntry { key } => {
                let list = node
                    .as_array_mut()
                    .ok_or_else(|| field_error("not a list"))?;
                let idx = entry_index(list, key)
                    .ok_or_else(|| self.field_error(format!("no entry '{key}=' in list")))?;
                list[idx] = Value::String(format!("{key}={value}"));
            }
        }
        Ok(())
    }
}

fn entry_index(list: &[Value], key: &str) -> Option<usize> {
    let prefix = format!("{key}=");
    list.iter()
        .position(|v| v.as_str().is_some_and(|s| s.starts_with(&prefix)))
}

// ---------------------------------------------------------------------------
// PropagationTarget
// ---------------------------------------------------------------------------

/// A discovered target: where it lives, what it holds now, and the checksum
/// of the record as it was read during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropagationTarget {
    pub id: String,
    pub locator: Locator,
    pub current_value: String,
    pub last_write_checksum: String,
}
