//! Workflow orchestration core for agentflow.
//!
//! Defines the storage and cache ports (repository traits) that the
//! infrastructure layer implements, the workflow engine itself and the
//! circuit breakers that guard external dependencies. Depends only on
//! `agentflow-types`, never on `agentflow-infra` or a database crate.

pub mod repository;
pub mod resilience;
pub mod workflow;
