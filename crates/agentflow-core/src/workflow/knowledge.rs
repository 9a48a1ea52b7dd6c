//! Optional knowledge source used to enrich an execution's initial context.

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

/// Supplies background knowledge for a query (e.g. a graph or vector store).
///
/// The returned map is stored under `context.knowledge`. Errors are reported
/// as strings; the engine logs them and continues without enrichment.
pub trait KnowledgeSource: Send + Sync {
    fn enrich<'a>(
        &'a self,
        query: &'a str,
        context: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Map<String, Value>, String>>;
}
