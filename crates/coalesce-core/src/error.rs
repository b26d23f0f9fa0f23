//! Error types shared across the coalesce crates.

use thiserror::Error;

use crate::record::RecordId;

#[derive(Debug, Error)]
pub enum Error {
  #[error("cannot merge record {0} into itself")]
  SelfMerge(RecordId),

  #[error("unknown resolver: {0:?}")]
  UnknownResolver(String),

  #[error("unknown match strategy: {0:?}")]
  UnknownMatchStrategy(String),

  #[error("unknown filter strategy: {0:?}")]
  UnknownFilterStrategy(String),

  #[error("unknown survivor picker: {0:?}")]
  UnknownSurvivorPicker(String),

  #[error("unknown record attribute: {0:?}")]
  UnknownAttribute(String),

  #[error("malformed run identifier: {0:?}")]
  MalformedRunId(String),

  #[error("malformed candidate tuple: {0}")]
  MalformedTuple(String),

  #[error("merge conflicts between {survivor} and {member}")]
  MergeConflicts { survivor: RecordId, member: RecordId },

  #[error("record {0} still exists after merge")]
  VerificationFailed(RecordId),

  #[error("resolver {name} failed: {message}")]
  Resolver { name: &'static str, message: String },

  #[error("merge rejected: {0}")]
  MergeRejected(String),

  #[error("audit log error: {0}")]
  AuditLog(#[from] std::io::Error),

  #[error("store error: {0}")]
  Store(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
