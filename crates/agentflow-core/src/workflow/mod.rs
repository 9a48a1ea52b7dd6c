//! Workflow engine: definitions, planning, scheduling and checkpointing.
//!
//! - `definition` -- YAML/JSON parsing, schema export, validation
//! - `dag` -- dependency graph, topological order, parallel levels
//! - `context` -- step input/output mapping over the execution context
//! - `expression` -- JEXL evaluator for transition conditions
//! - `step_executor` -- executor contract, registry and failure handlers
//! - `knowledge` -- optional context enrichment source
//! - `checkpoint` -- snapshot, restore and prune
//! - `control` -- channel between the engine and a running scheduler
//! - `scheduler` -- sequential and level-parallel step scheduling
//! - `engine` -- the public facade

pub mod checkpoint;
pub mod context;
pub mod control;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod expression;
pub mod knowledge;
pub mod scheduler;
pub mod step_executor;
