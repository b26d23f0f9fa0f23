//! Record identity, snapshots, and the value types exchanged with an entity
//! store.
//!
//! A snapshot is a read-only projection of one record: the two baseline
//! attributes every caller needs (deletion flag, record kind) as struct
//! fields, plus whatever extra attributes the active resolvers requested.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

// ─── Identity ────────────────────────────────────────────────────────────────

/// Numeric identifier of an entity record.
///
/// Survivor selection relies on the natural ordering of identifiers (the
/// lowest id in a cluster is the default survivor), so this is a plain
/// integer newtype rather than an opaque handle.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<i64> for RecordId {
  fn from(raw: i64) -> Self { Self(raw) }
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Cached projection of one record's attributes.
///
/// Owned exclusively by the `RecordCache`; invalidated (removed, never
/// patched in place) whenever the underlying record is mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSnapshot {
  pub id:         RecordId,
  pub kind:       String,
  pub is_deleted: bool,
  /// Extra attributes requested by the active resolvers. `None` means the
  /// column exists but holds no value.
  pub attributes: BTreeMap<String, Option<String>>,
}

impl RecordSnapshot {
  /// A requested attribute's value, flattening absent and empty to `None`.
  pub fn attribute(&self, name: &str) -> Option<&str> {
    match self.attributes.get(name) {
      Some(Some(value)) if !value.is_empty() => Some(value),
      _ => None,
    }
  }
}

// ─── Sub-records ─────────────────────────────────────────────────────────────

/// Label marking a sub-record as parked conflicting data: instead of being
/// deleted during a merge, a conflicting sub-record is reassigned to this
/// label so its data survives for later review.
pub const CONFLICT_LABEL: &str = "conflict";

/// A dependent record attached to an entity (e.g. a postal address).
///
/// The `label` is the sub-record's type discriminator; resolvers reassign it
/// to a designated conflict marker to park conflicting data without losing
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubRecord {
  pub id:         i64,
  pub record_id:  RecordId,
  pub label:      String,
  pub is_primary: bool,
  pub fields:     BTreeMap<String, String>,
}

impl SubRecord {
  /// Field-level equality over the union of both field sets; a missing field
  /// and an empty one compare equal.
  pub fn fields_match(&self, other: &SubRecord) -> bool {
    let keys = self.fields.keys().chain(other.fields.keys());
    for key in keys {
      let mine   = self.fields.get(key).map(String::as_str).unwrap_or("");
      let theirs = other.fields.get(key).map(String::as_str).unwrap_or("");
      if mine != theirs {
        return false;
      }
    }
    true
  }
}

// ─── Merge primitive types ───────────────────────────────────────────────────

/// Conflict policy for the entity store's merge primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
  /// Refuse to merge when any field-level conflict remains.
  Safe,
  /// Resolve conflicts in the survivor's favour.
  Aggressive,
}

impl MergeMode {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Safe => "safe",
      Self::Aggressive => "aggressive",
    }
  }
}

/// Result of one merge-primitive invocation. A reported error is a normal
/// outcome at this layer; the engine decides whether it aborts the pair.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
  pub merged: bool,
  pub error:  Option<String>,
}

impl MergeOutcome {
  pub fn merged() -> Self {
    Self { merged: true, error: None }
  }

  pub fn rejected(message: impl Into<String>) -> Self {
    Self { merged: false, error: Some(message.into()) }
  }
}

/// Field-level conflicts between two records, keyed by entity kind and then
/// by field name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictReport {
  pub conflicts: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConflictReport {
  pub fn is_empty(&self) -> bool {
    self.conflicts.values().all(BTreeMap::is_empty)
  }

  /// One human-readable line per conflicting field, in stable order.
  pub fn describe(&self) -> Vec<String> {
    let mut lines = Vec::new();
    for (entity, fields) in &self.conflicts {
      for (field, description) in fields {
        lines.push(format!(
          "potential conflict in {entity}.{field}: {description}"
        ));
      }
    }
    lines
  }

  pub fn add(
    &mut self,
    entity: impl Into<String>,
    field: impl Into<String>,
    description: impl Into<String>,
  ) {
    self
      .conflicts
      .entry(entity.into())
      .or_default()
      .insert(field.into(), description.into());
  }
}

// ─── Raw SQL rows ────────────────────────────────────────────────────────────

/// A single column value from the arbitrary-statement query surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
  Null,
  Integer(i64),
  Text(String),
}

impl SqlValue {
  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Self::Integer(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_text(&self) -> Option<&str> {
    match self {
      Self::Text(s) => Some(s),
      _ => None,
    }
  }
}

/// One row returned by [`crate::store::EntityStore::query_rows`].
pub type SqlRow = Vec<SqlValue>;
