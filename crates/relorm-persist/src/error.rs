//! Error types for the persistence engine.

use relorm_core::error::{QueryError, QueryErrorKind};
use relorm_core::{Error, Value};
use std::fmt;

/// Error raised by the dependency graph itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError<N> {
    /// An edge referenced a node that is not in the graph.
    NodeNotFound(N),
    /// A dependency cycle; the path starts and ends with the same node.
    Cycle(Vec<N>),
}

impl<N: fmt::Debug> fmt::Display for GraphError<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::NodeNotFound(node) => write!(f, "node not found: {:?}", node),
            GraphError::Cycle(path) => {
                let parts: Vec<String> = path.iter().map(|n| format!("{:?}", n)).collect();
                write!(f, "dependency cycle detected: {}", parts.join(" -> "))
            }
        }
    }
}

impl<N: fmt::Debug> std::error::Error for GraphError<N> {}

/// Error raised while building, ordering or executing a change set.
#[derive(Debug)]
pub enum PersistError {
    /// Subjects that need each other's ids to be written first.
    Cycle { path: Vec<String> },
    /// An edge referenced a subject missing from the graph.
    NodeNotFound { node: String },
    /// A non-nullable relation has no value and no cascade supplies one.
    CascadeRequired {
        table: &'static str,
        relation: &'static str,
    },
    /// A statement failed at the driver.
    StatementFailed {
        sql: String,
        params: Vec<Value>,
        source: Error,
    },
    /// The execution context was already used.
    AlreadyReleased,
    /// The same entity is scheduled for both save and removal.
    ConflictingOperation { table: &'static str },
    /// Entity metadata cannot support the requested operation.
    Metadata(String),
}

impl PersistError {
    pub(crate) fn statement(sql: &str, params: &[Value], source: Error) -> Self {
        PersistError::StatementFailed {
            sql: sql.to_string(),
            params: params.to_vec(),
            source,
        }
    }

    /// The SQL text of a failed statement.
    pub fn sql(&self) -> Option<&str> {
        match self {
            PersistError::StatementFailed { sql, .. } => Some(sql),
            _ => None,
        }
    }

    pub fn is_cycle(&self) -> bool {
        matches!(self, PersistError::Cycle { .. })
    }
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::Cycle { path } => {
                write!(f, "dependency cycle detected: {}", path.join(" -> "))
            }
            PersistError::NodeNotFound { node } => {
                write!(f, "subject {} is not part of the dependency graph", node)
            }
            PersistError::CascadeRequired { table, relation } => write!(
                f,
                "relation '{}.{}' is required but has no value and no cascade provides one",
                table, relation
            ),
            PersistError::StatementFailed {
                sql,
                params,
                source,
            } => write!(
                f,
                "statement failed: {} (sql: {}, {} params)",
                source,
                sql,
                params.len()
            ),
            PersistError::AlreadyReleased => {
                write!(f, "execution context was already released")
            }
            PersistError::ConflictingOperation { table } => write!(
                f,
                "an entity of '{}' is scheduled for both save and removal",
                table
            ),
            PersistError::Metadata(msg) => write!(f, "metadata error: {}", msg),
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistError::StatementFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<PersistError> for Error {
    fn from(err: PersistError) -> Self {
        match err {
            PersistError::StatementFailed {
                sql,
                source: Error::Query(mut q),
                ..
            } => {
                if q.sql.is_none() {
                    q.sql = Some(sql);
                }
                Error::Query(q)
            }
            PersistError::StatementFailed { source, .. } => source,
            PersistError::Metadata(msg) => Error::Metadata(msg),
            PersistError::ConflictingOperation { .. } | PersistError::CascadeRequired { .. } => {
                Error::Query(QueryError {
                    kind: QueryErrorKind::Constraint,
                    sql: None,
                    sqlstate: None,
                    message: err.to_string(),
                    source: None,
                })
            }
            other => Error::Custom(other.to_string()),
        }
    }
}
