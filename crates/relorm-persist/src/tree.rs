//! Materialized-path maintenance for tree entities.
//!
//! Every node stores the chain of its ancestors' ids plus its own, each
//! followed by `.`, e.g. `"1.4.9."`. A node's path is written right after
//! its insert; moving a node re-paths its whole subtree with a single
//! prefix-replacing UPDATE.

use crate::change_tracker::{EntitySnapshot, same_key};
use crate::entity::{Entity, EntityId, EntitySet};
use crate::error::PersistError;
use crate::statement::{ParamList, StatementRunner};
use relorm_core::{Cx, EntityMetadata, Outcome, TransactionOps, TreeInfo, Value};

const DELIMITER: &str = ".";

/// Replace `old_prefix` at the start of `path` with `new_prefix`.
///
/// `None` when `path` is not under `old_prefix`.
pub fn rewrite_path(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    path.strip_prefix(old_prefix)
        .map(|rest| format!("{}{}", new_prefix, rest))
}

/// Writes and rewrites materialized paths.
pub struct MaterializedPathMaintainer;

impl MaterializedPathMaintainer {
    /// Compute and store the path of a freshly inserted node.
    ///
    /// Returns the written path, or `None` when the entity is not a tree
    /// node.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %entity_id))]
    pub async fn on_insert<T: TransactionOps>(
        cx: &Cx,
        runner: &mut StatementRunner<'_, T>,
        set: &mut EntitySet,
        entity_id: EntityId,
    ) -> Outcome<Option<String>, PersistError> {
        let entity = crate::try_result!(set.entity(entity_id));
        let metadata = std::sync::Arc::clone(entity.metadata());
        let Some((tree, parent_relation)) = metadata.tree_parent() else {
            return Outcome::Ok(None);
        };
        let segment = crate::try_result!(own_segment(entity));
        let pk = crate::try_result!(primary_key(entity));
        let parent = entity.key_values(parent_relation.local_key_cols());

        let parent_path = match parent {
            Some(key) => {
                let found = crate::try_outcome!(lookup_path(cx, runner, &metadata, tree, key.clone()).await);
                let Some(path) = found else {
                    return Outcome::Err(PersistError::Metadata(format!(
                        "parent row {:?} of '{}' not found",
                        key, metadata.table_name
                    )));
                };
                path
            }
            None => String::new(),
        };
        let path = format!("{}{}{}", parent_path, segment, DELIMITER);

        let dialect = runner.dialect();
        let mut params = ParamList::new(dialect);
        let value = params.push(Value::Text(path.clone()));
        let condition = params.equals_all(metadata.primary_key_columns().into_iter().zip(pk));
        let sql = format!(
            "UPDATE {} SET {} = {} WHERE {}",
            dialect.escape_identifier(metadata.table_name),
            dialect.escape_identifier(tree.path_column),
            value,
            condition
        );
        crate::try_outcome!(runner.execute(cx, &sql, params.values()).await);

        crate::try_result!(set.entity_mut(entity_id)).set(tree.path_column, Value::Text(path.clone()));
        tracing::debug!(table = metadata.table_name, path = %path, "materialized path written");
        Outcome::Ok(Some(path))
    }

    /// Re-path the subtree of a node whose parent changed.
    ///
    /// `previous` is the node's database state. Returns the number of rows
    /// rewritten, `None` when the parent is unchanged or the entity is not a
    /// tree node.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %entity_id))]
    pub async fn on_move<T: TransactionOps>(
        cx: &Cx,
        runner: &mut StatementRunner<'_, T>,
        set: &mut EntitySet,
        entity_id: EntityId,
        previous: &EntitySnapshot,
    ) -> Outcome<Option<u64>, PersistError> {
        let entity = crate::try_result!(set.entity(entity_id));
        let metadata = std::sync::Arc::clone(entity.metadata());
        let Some((tree, parent_relation)) = metadata.tree_parent() else {
            return Outcome::Ok(None);
        };
        let fk = parent_relation.local_key_cols();
        let old_parent = previous.key_values(fk);
        let new_parent = entity.key_values(fk);
        let unchanged = match (&old_parent, &new_parent) {
            (None, None) => true,
            (Some(a), Some(b)) => same_key(a, b),
            _ => false,
        };
        if unchanged {
            return Outcome::Ok(None);
        }
        let segment = crate::try_result!(own_segment(entity));

        let old_parent_path = match old_parent {
            Some(key) => crate::try_outcome!(lookup_path(cx, runner, &metadata, tree, key).await)
                .unwrap_or_default(),
            None => String::new(),
        };
        let new_parent_path = match new_parent {
            Some(key) => crate::try_outcome!(lookup_path(cx, runner, &metadata, tree, key).await)
                .unwrap_or_default(),
            None => String::new(),
        };
        let old_prefix = format!("{}{}{}", old_parent_path, segment, DELIMITER);
        let new_prefix = format!("{}{}{}", new_parent_path, segment, DELIMITER);

        let dialect = runner.dialect();
        let column = dialect.escape_identifier(tree.path_column);
        let mut params = ParamList::new(dialect);
        let prefix = params.push(Value::Text(new_prefix.clone()));
        let offset = params.push(Value::BigInt(old_prefix.chars().count() as i64 + 1));
        let pattern = params.push(Value::Text(format!("{}%", dialect.escape_like(&old_prefix))));
        let sql = format!(
            "UPDATE {} SET {} = {} WHERE {} LIKE {} {}",
            dialect.escape_identifier(metadata.table_name),
            column,
            dialect.concat(&prefix, &format!("SUBSTR({}, {})", column, offset)),
            column,
            pattern,
            dialect.like_escape_clause()
        );
        let rewritten = crate::try_outcome!(runner.execute(cx, &sql, params.values()).await);

        rewrite_in_set(set, metadata.table_name, tree.path_column, &old_prefix, &new_prefix);
        tracing::debug!(
            table = metadata.table_name,
            from = %old_prefix,
            to = %new_prefix,
            rewritten,
            "subtree moved"
        );
        Outcome::Ok(Some(rewritten))
    }
}

/// The node's own path segment; composite keys join with `_`.
fn own_segment(entity: &Entity) -> Result<String, PersistError> {
    let pk = primary_key(entity)?;
    let mut parts = Vec::with_capacity(pk.len());
    for value in &pk {
        let Some(part) = value.to_path_segment() else {
            return Err(PersistError::Metadata(format!(
                "key {} of '{}' cannot appear in a path",
                value,
                entity.table()
            )));
        };
        parts.push(part);
    }
    Ok(parts.join("_"))
}

fn primary_key(entity: &Entity) -> Result<Vec<Value>, PersistError> {
    entity.primary_key().ok_or_else(|| {
        PersistError::Metadata(format!("tree node of '{}' has no identifier", entity.table()))
    })
}

async fn lookup_path<T: TransactionOps>(
    cx: &Cx,
    runner: &mut StatementRunner<'_, T>,
    metadata: &EntityMetadata,
    tree: &TreeInfo,
    key: Vec<Value>,
) -> Outcome<Option<String>, PersistError> {
    let dialect = runner.dialect();
    let mut params = ParamList::new(dialect);
    let condition = params.equals_all(metadata.primary_key_columns().into_iter().zip(key));
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        dialect.escape_identifier(tree.path_column),
        dialect.escape_identifier(metadata.table_name),
        condition
    );
    let row = crate::try_outcome!(runner.query_one(cx, &sql, params.values()).await);
    Outcome::Ok(row.map(|r| {
        r.get_by_name(tree.path_column)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }))
}

fn rewrite_in_set(
    set: &mut EntitySet,
    table: &str,
    column: &'static str,
    old_prefix: &str,
    new_prefix: &str,
) {
    let ids: Vec<EntityId> = set.ids().collect();
    for id in ids {
        let Some(entity) = set.get_mut(id) else {
            continue;
        };
        if entity.table() != table {
            continue;
        }
        let rewritten = entity
            .get(column)
            .and_then(Value::as_str)
            .and_then(|path| rewrite_path(path, old_prefix, new_prefix));
        if let Some(path) = rewritten {
            entity.set(column, Value::Text(path));
        }
    }
}
