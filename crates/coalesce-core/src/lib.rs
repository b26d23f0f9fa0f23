//! Core types and trait definitions for the coalesce dedupe engine.
//!
//! This crate is deliberately free of database dependencies.
//! All other crates depend on it; it depends on nothing proprietary.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Merge sessions are sequential single-task affairs, so the advisory lint
// about `Send` bounds on the returned futures does not apply here.
#![allow(async_fn_in_trait)]

pub mod error;
pub mod record;
pub mod run;
pub mod stats;
pub mod store;
pub mod tuple;

pub use error::{Error, Result};
