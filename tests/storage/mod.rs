//! Shared storage integration tests.
//!
//! Tests the SyncStore contract against every backend. Each backend's test
//! binary imports these functions and runs them.

pub mod sync_store_tests;
