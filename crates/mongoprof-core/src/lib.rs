//! mongoprof-core: slow operation harvesting for MongoDB.
//!
//! Provides:
//! - `store`: store contract, MongoDB driver adapter, in-memory store, connect retry
//! - `profiler`: `system.profile` sizing, tailing state machine, entry dispatch
//! - `entry`: profiler document normalization and query shape resolution
//! - `murmur3`: MurmurHash3 x64 128-bit, fallback shape identifiers
//! - `persistence`: `slowops` / `slowops.examples` writers
//! - `config`: defaults and runtime settings
//! - `error`: error types shared by all of the above

pub mod config;
pub mod entry;
pub mod error;
pub mod murmur3;
pub mod persistence;
pub mod profiler;
pub mod store;

pub use entry::ProfileEntry;
pub use error::{ProfilerError, Result};
