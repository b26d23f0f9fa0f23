//! SQLite backend for the coalesce entity store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. This is the reference implementation
//! of [`coalesce_core::store::EntityStore`]: records, their sub-records, the
//! merge primitive, and the discovery working tables all live in one SQLite
//! file.

mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::{NewAddress, NewRecord, SqliteStore};
