//! Shared test fixtures for the authorization workspace.
//!
//! - A single PostgreSQL testcontainer per test process, lazily started and
//!   skipped when Docker is unavailable
//! - Process-unique ids so tests can share one database
//! - Tracing initialization for test output

mod fixtures;

pub use fixtures::*;
