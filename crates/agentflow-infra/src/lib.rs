//! Infrastructure layer for agentflow.
//!
//! Implements the storage port from `agentflow-core` on SQLite and loads the
//! engine configuration from `agentflow.toml`.

pub mod config;
pub mod sqlite;
