use thiserror::Error;

/// Errors from repository operations (used by trait definitions in agentflow-core).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// The dependency's circuit breaker is open.
    #[error("{0} unavailable")]
    Unavailable(String),
}

/// Errors from cache operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache unavailable")]
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
        assert_eq!(
            RepositoryError::Unavailable("storage".to_string()).to_string(),
            "storage unavailable"
        );
    }

    #[test]
    fn test_cache_error_display() {
        let err = CacheError::Backend("connection reset".to_string());
        assert_eq!(err.to_string(), "cache backend error: connection reset");
    }
}
