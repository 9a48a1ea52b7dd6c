//! Shared domain types for agentflow.
//!
//! Workflow definitions, executions, checkpoints, batch and pagination types,
//! engine configuration and the storage/cache error types shared by every
//! layer.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror, schemars.

pub mod batch;
pub mod config;
pub mod error;
pub mod execution;
pub mod pagination;
pub mod workflow;
