//! relorm - change-set persistence for relational databases.
//!
//! relorm saves and removes graphs of related rows in one call:
//!
//! - Cascades expand a change set into every row it touches
//! - Inserts run parents first, removals run referencing rows first
//! - Generated ids flow into foreign keys of rows inserted later
//! - Junction rows and detached children are written in batched statements
//! - Materialized-path trees keep their path column consistent on insert
//!   and on subtree moves
//! - Relations load lazily through single-flight handles
//!
//! # Quick Start
//!
//! ```ignore
//! use relorm::prelude::*;
//!
//! async fn save_author(cx: &Cx, conn: &impl Connection, users: Arc<EntityMetadata>, posts: Arc<EntityMetadata>) {
//!     let mut set = EntitySet::new();
//!     let user = set.insert(Entity::new(users).with_value("name", "ada"));
//!     let post = set.insert(Entity::new(posts).with_value("title", "hello"));
//!     set.set_many(user, "posts", vec![post]).unwrap();
//!
//!     let result = Persistor::new().save(cx, conn, &mut set, &[user]).await;
//! }
//! ```

pub use asupersync::{Budget, RegionId, TaskId};

pub use relorm_core::{
    ColumnKind, Connection, Cx, Dialect, EntityMetadata, Error, FieldInfo, IsolationLevel,
    LinkTableInfo, Model, NoopQueryLogger, Outcome, QueryLogger, RelationHandle,
    RelationLoader, RelationStatus, RelationshipInfo, RelationshipKind, Result, Row, SqlType,
    TracingQueryLogger, TransactionOps, TreeInfo, Value,
};

pub use relorm_persist::{
    ChangeSet, Entity, EntityId, EntitySet, EntitySnapshot, PersistConfig, PersistError,
    PersistResult, Persistor, RelationQuery, RelationValue, RemovalKind,
};

/// The persistence engine with its individual stages.
pub mod persist {
    pub use relorm_persist::*;
}

pub mod prelude {
    pub use crate::{
        // Persistence
        ChangeSet,
        // Core traits and types
        Connection,
        Cx,
        Dialect,
        Entity,
        EntityId,
        EntityMetadata,
        EntitySet,
        EntitySnapshot,
        Error,
        FieldInfo,
        LinkTableInfo,
        Model,
        Outcome,
        PersistConfig,
        PersistError,
        PersistResult,
        Persistor,
        RelationHandle,
        RelationQuery,
        RelationshipInfo,
        RelationshipKind,
        Result,
        Row,
        SqlType,
        TransactionOps,
        TreeInfo,
        Value,
    };
    pub use std::sync::Arc;
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    fn categories() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("category")
                .field(FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true))
                .field(FieldInfo::new("parent_id", "parent_id", SqlType::BigInt).nullable(true))
                .field(FieldInfo::new("mpath", "mpath", SqlType::Text))
                .relation(
                    RelationshipInfo::new("parent", "category", RelationshipKind::ManyToOne)
                        .local_key("parent_id"),
                )
                .tree(TreeInfo::materialized_path("parent", "mpath")),
        )
    }

    #[test]
    fn test_prelude_builds_an_entity_graph() {
        let meta = categories();
        assert!(meta.validate().is_ok());

        let mut set = EntitySet::new();
        let root = set.insert(Entity::new(Arc::clone(&meta)).with_value("id", 1_i64));
        let child = set.insert(Entity::new(meta));
        set.set_one(child, "parent", Some(root)).unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.get(root).and_then(Entity::primary_key), Some(vec![Value::BigInt(1)]));
        assert!(set.get(child).and_then(Entity::primary_key).is_none());
        assert!(!ChangeSet::new().save(child).is_empty());
    }

    #[test]
    fn test_persistor_config_through_facade() {
        let persistor = Persistor::with_config(
            PersistConfig::default()
                .transaction(false)
                .dialect(Dialect::Sqlite),
        );
        assert!(!persistor.config().transaction);
        assert_eq!(persistor.config().resolve_dialect(Dialect::Postgres), Dialect::Sqlite);
        assert_eq!(crate::persist::rewrite_path("1.5.9.", "1.5.", "2.5."), Some("2.5.9.".into()));
    }
}
