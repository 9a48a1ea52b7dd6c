//! Cache trait definition.
//!
//! A byte-oriented key/value cache with per-entry TTL. The engine stores
//! serialized workflow definitions here, keyed `workflow:{workflow_id}`.

use std::time::Duration;

use agentflow_types::error::CacheError;

pub trait CacheStore: Send + Sync {
    /// Fetch a live entry. Expired entries are misses.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Vec<u8>>, CacheError>> + Send;

    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send;

    fn invalidate(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send;
}
