//! Rows as they travel between the remote API, the local store and callers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A record of a named table. Fields are whatever the remote schema defines.
pub type Row = Map<String, Value>;

/// Name of the identifying field on every row.
pub const ID_FIELD: &str = "id";

/// Prefix marking client-generated identifiers for rows created offline.
pub const PENDING_PREFIX: &str = "local:";

/// Identifier of a row, either assigned by the server or generated locally
/// while the insert that created it is still queued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "lowercase")]
pub enum RowId {
  Confirmed(String),
  Pending(String),
}

impl RowId {
  /// Generate a fresh temporary id for an offline insert.
  pub fn new_pending() -> Self {
    RowId::Pending(format!(
      "{}{}",
      PENDING_PREFIX,
      uuid::Uuid::new_v4().simple()
    ))
  }

  /// Interpret an `id` field value. Strings carrying the pending prefix are
  /// temporary ids; numbers and other strings are server ids.
  pub fn from_value(value: &Value) -> Option<Self> {
    match value {
      Value::String(s) if s.starts_with(PENDING_PREFIX) => Some(RowId::Pending(s.clone())),
      Value::String(s) if !s.is_empty() => Some(RowId::Confirmed(s.clone())),
      Value::Number(n) => Some(RowId::Confirmed(n.to_string())),
      _ => None,
    }
  }

  /// Storage key for this id.
  pub fn key(&self) -> &str {
    match self {
      RowId::Confirmed(id) | RowId::Pending(id) => id,
    }
  }

  pub fn is_pending(&self) -> bool {
    matches!(self, RowId::Pending(_))
  }
}

impl fmt::Display for RowId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.key())
  }
}

/// Convenience accessors for rows.
pub trait RowExt {
  /// The row's identifier, if it has a usable `id` field.
  fn row_id(&self) -> Option<RowId>;

  /// Replace every field (or array element) equal to the string `from` with `to`.
  /// Returns true if anything changed.
  fn replace_reference(&mut self, from: &str, to: &Value) -> bool;
}

impl RowExt for Row {
  fn row_id(&self) -> Option<RowId> {
    self.get(ID_FIELD).and_then(RowId::from_value)
  }

  fn replace_reference(&mut self, from: &str, to: &Value) -> bool {
    let mut changed = false;
    for value in self.values_mut() {
      match value {
        Value::String(s) if s == from => {
          *value = to.clone();
          changed = true;
        }
        Value::Array(items) => {
          for item in items.iter_mut() {
            if matches!(item, Value::String(s) if s == from) {
              *item = to.clone();
              changed = true;
            }
          }
        }
        _ => {}
      }
    }
    changed
  }
}

/// Build a row from a JSON object literal. Non-objects yield an empty row.
pub fn row_from_value(value: Value) -> Row {
  match value {
    Value::Object(map) => map,
    _ => Row::new(),
  }
}
