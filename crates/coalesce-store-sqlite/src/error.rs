//! Error type for `coalesce-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("unknown record attribute: {0:?}")]
  UnknownAttribute(String),
}

/// Fold backend failures into the engine-facing error currency at the trait
/// boundary; the attribute case keeps its identity because the engine
/// treats it as a configuration error.
impl From<Error> for coalesce_core::Error {
  fn from(e: Error) -> Self {
    match e {
      Error::UnknownAttribute(name) => Self::UnknownAttribute(name),
      other => Self::Store(other.to_string()),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
