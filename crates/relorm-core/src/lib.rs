//! Core types and traits for relorm.
//!
//! This crate provides the foundations the persistence engine builds on:
//!
//! - `Value` and `Row` for dynamic column data
//! - `FieldInfo`, `RelationshipInfo` and `EntityMetadata` for table metadata
//! - `Connection` / `TransactionOps` for the executable-query interface
//! - `Dialect` for identifier quoting, placeholders and literal escaping
//! - `RelationHandle` for lazily resolved relations
//! - `QueryLogger` for statement observability
//! - `Outcome` and `Cx` re-exported from asupersync

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod dialect;
pub mod error;
pub mod field;
pub mod logging;
pub mod metadata;
pub mod model;
pub mod relation_id;
pub mod relationship;
pub mod row;
pub mod types;
pub mod value;

pub use connection::{Connection, IsolationLevel, TransactionOps};
pub use dialect::Dialect;
pub use error::{Error, QueryError, QueryErrorKind, Result};
pub use field::{FieldInfo, ReferentialAction};
pub use logging::{NoopQueryLogger, QueryLogger, TracingQueryLogger};
pub use metadata::{EntityMetadata, IdMap, TreeInfo};
pub use model::Model;
pub use relation_id::{
    RelatedId, RelationIdAttribute, RelationIdEntry, RelationIdResult, RelationIdShape,
};
pub use relationship::{
    LinkTableInfo, RelationHandle, RelationLoader, RelationStatus, RelationshipInfo,
    RelationshipKind,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use types::{ColumnKind, SqlType};
pub use value::Value;
