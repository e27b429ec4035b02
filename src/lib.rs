//! Assessment Sync - PACS to CAMA data synchronization engine
//!
//! Detects changes in the appraisal system, maps and sanitizes them into the
//! assessment administration schema, validates them, resolves conflicts with
//! target-side edits and applies them transactionally, with an audit log that
//! supports rollback and a set of read-only exporters.

pub mod audit;
pub mod bus;
pub mod config;
pub mod connectors;
pub mod detect;
pub mod dlq;
pub mod error;
pub mod export;
pub mod model;
pub mod orchestration;
pub mod resolve;
pub mod schema;
pub mod storage;
pub mod transform;
pub mod utils;
pub mod validate;

pub use error::SyncError;
pub use orchestration::{Engine, EngineBuilder};
