//! Failure isolation for external dependencies.
//!
//! - `circuit_breaker` -- consecutive-failure breaker with cooldown
//! - `guarded` -- repository and cache wrappers that call through a breaker

pub mod circuit_breaker;
pub mod guarded;

pub use circuit_breaker::{BreakerError, BreakerStatus, CircuitBreaker};
pub use guarded::{GuardedCache, GuardedRepository};
