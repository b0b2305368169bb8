//! Persistence configuration.

use relorm_core::Dialect;
use std::time::Duration;

/// Configuration for a [`Persistor`](crate::Persistor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistConfig {
    /// Wrap each save/remove call in its own transaction.
    pub transaction: bool,
    /// Upper bound on OR-ed pair groups in one batched relation statement.
    pub max_pairs_per_statement: usize,
    /// Statements running longer than this are reported as slow.
    pub slow_query_threshold: Option<Duration>,
    /// Dialect override; the connection's dialect is used otherwise.
    pub dialect: Option<Dialect>,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            transaction: true,
            max_pairs_per_statement: 500,
            slow_query_threshold: Some(Duration::from_secs(1)),
            dialect: None,
        }
    }
}

impl PersistConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether save/remove open their own transaction (builder pattern).
    #[must_use]
    pub fn transaction(mut self, value: bool) -> Self {
        self.transaction = value;
        self
    }

    /// Set the batching limit. Zero is treated as one.
    #[must_use]
    pub fn max_pairs_per_statement(mut self, value: usize) -> Self {
        self.max_pairs_per_statement = value.max(1);
        self
    }

    #[must_use]
    pub fn slow_query_threshold(mut self, value: Option<Duration>) -> Self {
        self.slow_query_threshold = value;
        self
    }

    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = Some(dialect);
        self
    }

    /// The dialect to use against a connection speaking `connection`.
    pub fn resolve_dialect(&self, connection: Dialect) -> Dialect {
        self.dialect.unwrap_or(connection)
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.max_pairs_per_statement.max(1)
    }
}
