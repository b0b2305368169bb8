//! Plan execution.
//!
//! Phases run strictly in sequence: inserts in dependency order, updates,
//! removals in reverse dependency order, junction and detach work, then
//! subtree moves of tree entities. The first failing statement aborts the
//! call; rolling back is up to the surrounding transaction.

use crate::change_tracker::{ChangeTracker, EntitySnapshot};
use crate::config::PersistConfig;
use crate::entity::{EntityId, EntitySet, RelationValue};
use crate::error::PersistError;
use crate::junction::JunctionWriter;
use crate::orderer::ExecutionPlan;
use crate::relation_remover::RelationRemover;
use crate::statement::{ParamList, StatementRunner};
use crate::subject::{
    JunctionInsert, RelationRemoval, RemovalKind, SubjectId, SubjectOperation, SubjectRegistry,
    SubjectState,
};
use crate::tree::MaterializedPathMaintainer;
use relorm_core::{
    Cx, Dialect, EntityMetadata, Outcome, QueryLogger, RelationshipKind, TransactionOps, Value,
};
use std::sync::Arc;

/// Final state of one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectReport {
    pub entity: EntityId,
    pub table: &'static str,
    pub operation: SubjectOperation,
    pub state: SubjectState,
}

/// What one persistence call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistResult {
    pub inserted: usize,
    pub updated: usize,
    /// Updates skipped because nothing changed.
    pub skipped_updates: usize,
    pub removed: usize,
    pub soft_removed: usize,
    pub junction_inserted: usize,
    pub junction_removed: u64,
    pub detached: u64,
    pub paths_written: usize,
    pub paths_rewritten: u64,
    /// Statements issued, lookups included.
    pub statements: usize,
    pub subjects: Vec<SubjectReport>,
}

impl PersistResult {
    /// Whether any row was written.
    pub fn wrote_anything(&self) -> bool {
        self.inserted
            + self.updated
            + self.removed
            + self.soft_removed
            + self.junction_inserted
            > 0
            || self.junction_removed + self.detached + self.paths_rewritten > 0
    }
}

/// Runs an [`ExecutionPlan`] against one transaction.
///
/// An executor is single-use: a second [`execute`](Self::execute) fails with
/// [`PersistError::AlreadyReleased`].
pub struct SubjectExecutor<'a> {
    config: &'a PersistConfig,
    logger: &'a dyn QueryLogger,
    released: bool,
}

impl<'a> SubjectExecutor<'a> {
    pub fn new(config: &'a PersistConfig, logger: &'a dyn QueryLogger) -> Self {
        Self {
            config,
            logger,
            released: false,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(
        inserts = plan.inserts.len(),
        updates = plan.updates.len(),
        removals = plan.removals.len(),
    ))]
    pub async fn execute<T: TransactionOps>(
        &mut self,
        cx: &Cx,
        tx: &T,
        set: &mut EntitySet,
        registry: &mut SubjectRegistry,
        plan: &ExecutionPlan,
    ) -> Outcome<PersistResult, PersistError> {
        if self.released {
            return Outcome::Err(PersistError::AlreadyReleased);
        }
        self.released = true;

        let dialect = self.config.resolve_dialect(tx.dialect());
        let mut runner =
            StatementRunner::new(tx, dialect, self.logger, self.config.slow_query_threshold);
        let mut report = PersistResult::default();

        for sid in &plan.inserts {
            registry.set_state(*sid, SubjectState::Executing);
            let outcome = insert(cx, &mut runner, set, registry, *sid, &mut report).await;
            crate::try_outcome!(settle(registry, *sid, outcome));
        }

        for sid in &plan.updates {
            registry.set_state(*sid, SubjectState::Executing);
            let outcome = update(cx, &mut runner, set, registry, *sid, &mut report).await;
            crate::try_outcome!(settle(registry, *sid, outcome));
        }

        let writer = JunctionWriter::new(self.config);
        for sid in &plan.removals {
            registry.set_state(*sid, SubjectState::Executing);
            let outcome = remove(cx, &mut runner, &writer, registry, *sid, &mut report).await;
            crate::try_outcome!(settle(registry, *sid, outcome));
        }

        let remover = RelationRemover::new(self.config);
        for sid in &plan.relation_owners {
            registry.set_state(*sid, SubjectState::Executing);
            let outcome = relations(
                cx,
                &mut runner,
                &writer,
                &remover,
                set,
                registry,
                *sid,
                &mut report,
            )
            .await;
            crate::try_outcome!(settle(registry, *sid, outcome));
        }

        for sid in &plan.updates {
            let outcome = move_subtree(cx, &mut runner, set, registry, *sid, &mut report).await;
            crate::try_outcome!(settle(registry, *sid, outcome));
        }

        let idle: Vec<SubjectId> = registry
            .iter()
            .filter(|s| s.operation == SubjectOperation::None && s.state == SubjectState::Pending)
            .map(|s| s.id)
            .collect();
        for sid in idle {
            registry.set_state(sid, SubjectState::Done);
        }

        report.statements = runner.issued();
        report.subjects = registry
            .iter()
            .map(|s| SubjectReport {
                entity: s.entity,
                table: s.table(),
                operation: s.operation,
                state: s.state,
            })
            .collect();

        tracing::debug!(
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped_updates,
            removed = report.removed + report.soft_removed,
            statements = report.statements,
            "plan executed"
        );
        Outcome::Ok(report)
    }
}

fn settle<R>(
    registry: &mut SubjectRegistry,
    sid: SubjectId,
    outcome: Outcome<R, PersistError>,
) -> Outcome<R, PersistError> {
    let state = if matches!(outcome, Outcome::Ok(_)) {
        SubjectState::Done
    } else {
        SubjectState::Failed
    };
    registry.set_state(sid, state);
    if state == SubjectState::Failed {
        if let Some(subject) = registry.get(sid) {
            tracing::warn!(subject = %subject.label(), "subject failed");
        }
    }
    outcome
}

fn subject_parts(
    registry: &SubjectRegistry,
    sid: SubjectId,
) -> Result<(EntityId, Arc<EntityMetadata>), PersistError> {
    registry
        .get(sid)
        .map(|s| (s.entity, Arc::clone(&s.metadata)))
        .ok_or_else(|| PersistError::NodeNotFound {
            node: sid.to_string(),
        })
}

/// Copy the keys of referenced rows into the entity's foreign-key columns.
///
/// Owning single-valued relations contribute their target's primary key
/// (NULL when cleared); one-to-many parents contribute their key to the
/// remote key columns of their children.
fn resolve_references(
    set: &mut EntitySet,
    registry: &SubjectRegistry,
    entity_id: EntityId,
) -> Result<(), PersistError> {
    let entity = set.entity(entity_id)?;
    let mut writes: Vec<(&'static str, Value)> = Vec::new();

    for relation in &entity.metadata().relationships {
        if relation.is_collection() || !relation.is_owning() {
            continue;
        }
        match entity.relation(relation.name) {
            Some(RelationValue::One(Some(target))) => {
                let target = set.entity(*target)?;
                let Some(key) = target.primary_key() else {
                    return Err(PersistError::Metadata(format!(
                        "'{}' row referenced by '{}.{}' has no identifier",
                        target.table(),
                        entity.table(),
                        relation.name
                    )));
                };
                writes.extend(relation.local_key_cols().iter().copied().zip(key));
            }
            Some(RelationValue::One(None)) => {
                writes.extend(relation.local_key_cols().iter().map(|c| (*c, Value::Null)));
            }
            Some(RelationValue::Many(_)) | None => {}
        }
    }

    for propagation in registry.propagations_into(entity_id) {
        let parent = set.entity(propagation.parent)?;
        let Some(relation) = parent.metadata().find_relation(propagation.relation) else {
            continue;
        };
        let Some(key) = parent.primary_key() else {
            return Err(PersistError::Metadata(format!(
                "'{}' parent of '{}' has no identifier",
                parent.table(),
                entity.table()
            )));
        };
        writes.extend(relation.remote_key_cols().iter().copied().zip(key));
    }

    let entity = set.entity_mut(entity_id)?;
    for (column, value) in writes {
        entity.set(column, value);
    }
    Ok(())
}

async fn insert<T: TransactionOps>(
    cx: &Cx,
    runner: &mut StatementRunner<'_, T>,
    set: &mut EntitySet,
    registry: &mut SubjectRegistry,
    sid: SubjectId,
    report: &mut PersistResult,
) -> Outcome<(), PersistError> {
    let (entity_id, metadata) = crate::try_result!(subject_parts(registry, sid));
    crate::try_result!(resolve_references(set, registry, entity_id));
    let entity = crate::try_result!(set.entity(entity_id));

    let dialect = runner.dialect();
    let path_column = metadata.tree.map(|t| t.path_column);
    let mut params = ParamList::new(dialect);
    let mut columns = Vec::new();
    let mut placeholders = Vec::new();
    for field in &metadata.fields {
        let value = match entity.get(field.column_name) {
            Some(v) => v.clone(),
            None if path_column == Some(field.column_name) => Value::Text(String::new()),
            None => continue,
        };
        if field.generated && value.is_null() {
            continue;
        }
        columns.push(dialect.escape_identifier(field.column_name));
        placeholders.push(params.push(field.kind.prepare_value(dialect, value)));
    }
    let table = dialect.escape_identifier(metadata.table_name);
    let sql = if columns.is_empty() {
        empty_insert(dialect, &table)
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        )
    };

    let generated: Vec<&'static str> = metadata
        .fields
        .iter()
        .filter(|f| f.primary_key && f.generated)
        .filter(|f| entity.get(f.column_name).is_none_or(Value::is_null))
        .map(|f| f.column_name)
        .collect();

    let generated_id = crate::try_outcome!(runner.insert(cx, &sql, params.values()).await);
    report.inserted += 1;

    let entity = crate::try_result!(set.entity_mut(entity_id));
    let written = match generated.as_slice() {
        [column] => Some(*column),
        _ => None,
    };
    if let Some(column) = written {
        entity.set(column, Value::BigInt(generated_id));
    }
    let identifier = entity.id();
    if let Some(subject) = registry.get_mut(sid) {
        if let Some(column) = written {
            subject
                .inserted_values
                .insert(column, Value::BigInt(generated_id));
        }
        subject.identifier = identifier;
    }
    tracing::trace!(table = metadata.table_name, generated_id, "row inserted");

    if metadata.tree.is_some() {
        let path = crate::try_outcome!(MaterializedPathMaintainer::on_insert(cx, runner, set, entity_id).await);
        if path.is_some() {
            report.paths_written += 1;
        }
    }
    Outcome::Ok(())
}

fn empty_insert(dialect: Dialect, table: &str) -> String {
    match dialect {
        Dialect::Mysql => format!("INSERT INTO {} () VALUES ()", table),
        Dialect::Postgres | Dialect::Sqlite => format!("INSERT INTO {} DEFAULT VALUES", table),
    }
}

async fn update<T: TransactionOps>(
    cx: &Cx,
    runner: &mut StatementRunner<'_, T>,
    set: &mut EntitySet,
    registry: &mut SubjectRegistry,
    sid: SubjectId,
    report: &mut PersistResult,
) -> Outcome<(), PersistError> {
    let (entity_id, metadata) = crate::try_result!(subject_parts(registry, sid));
    crate::try_result!(resolve_references(set, registry, entity_id));
    let entity = crate::try_result!(set.entity(entity_id));
    let snapshot = registry
        .get(sid)
        .and_then(|s| s.database_entity.clone())
        .unwrap_or_default();

    let skip: Vec<&str> = metadata.tree.iter().map(|t| t.path_column).collect();
    let changed = ChangeTracker::changed_columns(&metadata, entity.values(), &snapshot, &skip);
    if changed.is_empty() {
        report.skipped_updates += 1;
        tracing::trace!(table = metadata.table_name, "no changes, update skipped");
        return Outcome::Ok(());
    }
    let Some(pk) = entity.primary_key() else {
        return Outcome::Err(PersistError::Metadata(format!(
            "cannot update a '{}' row without identifier",
            metadata.table_name
        )));
    };

    let dialect = runner.dialect();
    let mut params = ParamList::new(dialect);
    let mut assignments = Vec::with_capacity(changed.len());
    for column in &changed {
        let value = entity.get(column).cloned().unwrap_or(Value::Null);
        let value = match metadata.field_by_column(column) {
            Some(field) => field.kind.prepare_value(dialect, value),
            None => value,
        };
        let placeholder = params.push(value);
        assignments.push(format!("{} = {}", dialect.escape_identifier(column), placeholder));
    }
    let condition = params.equals_all(metadata.primary_key_columns().into_iter().zip(pk));
    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        dialect.escape_identifier(metadata.table_name),
        assignments.join(", "),
        condition
    );
    crate::try_outcome!(runner.execute(cx, &sql, params.values()).await);
    report.updated += 1;
    tracing::trace!(table = metadata.table_name, columns = ?changed, "row updated");
    Outcome::Ok(())
}

/// Delete (or soft-delete) one row.
///
/// A hard removal first clears the junction rows of every owning
/// many-to-many relation. Junction rows reached only through an inverse
/// many-to-many (no `link_table`) are left to the junction table's
/// `ON DELETE CASCADE` foreign key.
async fn remove<T: TransactionOps>(
    cx: &Cx,
    runner: &mut StatementRunner<'_, T>,
    writer: &JunctionWriter,
    registry: &SubjectRegistry,
    sid: SubjectId,
    report: &mut PersistResult,
) -> Outcome<(), PersistError> {
    let Some(subject) = registry.get(sid) else {
        return Outcome::Err(PersistError::NodeNotFound {
            node: sid.to_string(),
        });
    };
    let metadata = Arc::clone(&subject.metadata);
    let SubjectOperation::Remove(kind) = subject.operation else {
        return Outcome::Ok(());
    };
    let Some(identifier) = subject.identifier.clone() else {
        return Outcome::Err(PersistError::Metadata(format!(
            "cannot remove a '{}' row without identifier",
            metadata.table_name
        )));
    };
    let pk_columns = metadata.primary_key_columns();
    let key: Vec<Value> = pk_columns
        .iter()
        .filter_map(|c| identifier.get(c).cloned())
        .collect();

    let dialect = runner.dialect();
    let table = dialect.escape_identifier(metadata.table_name);
    let mut params = ParamList::new(dialect);
    match kind {
        RemovalKind::Hard => {
            for relation in &metadata.relationships {
                if relation.kind != RelationshipKind::ManyToMany {
                    continue;
                }
                let Some(link) = &relation.link_table else {
                    continue;
                };
                report.junction_removed += crate::try_outcome!(
                    writer
                        .clear_owners(cx, runner, link, std::slice::from_ref(&key))
                        .await
                );
            }
            let condition = params.equals_all(pk_columns.iter().copied().zip(key));
            let sql = format!("DELETE FROM {} WHERE {}", table, condition);
            crate::try_outcome!(runner.execute(cx, &sql, params.values()).await);
            report.removed += 1;
        }
        RemovalKind::Soft => {
            let Some(column) = metadata.soft_delete_column else {
                return Outcome::Err(PersistError::Metadata(format!(
                    "table '{}' has no soft-delete column",
                    metadata.table_name
                )));
            };
            let condition = params.equals_all(pk_columns.iter().copied().zip(key));
            let sql = format!(
                "UPDATE {} SET {} = {} WHERE {}",
                table,
                dialect.escape_identifier(column),
                dialect.current_timestamp(),
                condition
            );
            crate::try_outcome!(runner.execute(cx, &sql, params.values()).await);
            report.soft_removed += 1;
        }
    }
    tracing::trace!(table = metadata.table_name, ?kind, "row removed");
    Outcome::Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn relations<T: TransactionOps>(
    cx: &Cx,
    runner: &mut StatementRunner<'_, T>,
    writer: &JunctionWriter,
    remover: &RelationRemover,
    set: &EntitySet,
    registry: &SubjectRegistry,
    sid: SubjectId,
    report: &mut PersistResult,
) -> Outcome<(), PersistError> {
    let Some(subject) = registry.get(sid) else {
        return Outcome::Err(PersistError::NodeNotFound {
            node: sid.to_string(),
        });
    };
    let metadata = Arc::clone(&subject.metadata);
    let inserts: Vec<JunctionInsert> = subject.junction_inserts.clone();
    let removals: Vec<RelationRemoval> = subject.junction_removals.clone();
    let detaches: Vec<RelationRemoval> = subject.detached_children.clone();

    let owner = crate::try_result!(set.entity(subject.entity));
    let Some(owner_key) = owner.primary_key() else {
        return Outcome::Err(PersistError::Metadata(format!(
            "'{}' row has relation changes but no identifier",
            metadata.table_name
        )));
    };
    let owners = std::slice::from_ref(&owner_key);

    for junction in &inserts {
        let link = crate::try_result!(link_of(&metadata, junction.relation));
        let member = crate::try_result!(set.entity(junction.member));
        let Some(member_key) = member.primary_key() else {
            return Outcome::Err(PersistError::Metadata(format!(
                "'{}' member of '{}.{}' has no identifier",
                member.table(),
                metadata.table_name,
                junction.relation
            )));
        };
        crate::try_outcome!(writer.insert_pair(cx, runner, &link, &owner_key, &member_key).await);
        report.junction_inserted += 1;
    }

    for removal in &removals {
        let link = crate::try_result!(link_of(&metadata, removal.relation));
        report.junction_removed += crate::try_outcome!(
            remover
                .remove_many_to_many(cx, runner, &link, owners, &removal.members)
                .await
        );
    }

    for detach in &detaches {
        let Some(relation) = metadata.find_relation(detach.relation) else {
            continue;
        };
        report.detached += crate::try_outcome!(
            remover
                .remove_one_to_many(cx, runner, relation, owners, &detach.members)
                .await
        );
    }
    Outcome::Ok(())
}

fn link_of(
    metadata: &EntityMetadata,
    relation: &str,
) -> Result<relorm_core::LinkTableInfo, PersistError> {
    metadata
        .find_relation(relation)
        .and_then(|r| r.link_table)
        .ok_or_else(|| {
            PersistError::Metadata(format!(
                "relation '{}.{}' has no junction table",
                metadata.table_name, relation
            ))
        })
}

async fn move_subtree<T: TransactionOps>(
    cx: &Cx,
    runner: &mut StatementRunner<'_, T>,
    set: &mut EntitySet,
    registry: &SubjectRegistry,
    sid: SubjectId,
    report: &mut PersistResult,
) -> Outcome<(), PersistError> {
    let Some(subject) = registry.get(sid) else {
        return Outcome::Ok(());
    };
    if subject.metadata.tree.is_none() {
        return Outcome::Ok(());
    }
    let entity_id = subject.entity;
    let previous: EntitySnapshot = subject.database_entity.clone().unwrap_or_default();
    let moved = crate::try_outcome!(
        MaterializedPathMaintainer::on_move(cx, runner, set, entity_id, &previous).await
    );
    if let Some(rows) = moved {
        report.paths_rewritten += rows;
    }
    Outcome::Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ChangeSet, SubjectGraphBuilder};
    use crate::change_tracker::NoDatabaseLookup;
    use crate::entity::Entity;
    use crate::orderer::OperationOrderer;
    use crate::testing::{CapturingLogger, RecordingConnection, fixtures};
    use asupersync::runtime::RuntimeBuilder;
    use relorm_core::{FieldInfo, RelationshipInfo, SqlType};

    fn run(
        conn: &RecordingConnection,
        set: &mut EntitySet,
        change_set: &ChangeSet,
    ) -> Outcome<PersistResult, PersistError> {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let mut registry =
                crate::try_outcome!(SubjectGraphBuilder::build(&cx, set, change_set, &NoDatabaseLookup).await);
            let plan = crate::try_result!(OperationOrderer::order(&registry, set));
            let config = PersistConfig::default();
            let logger = CapturingLogger::default();
            let tx = conn.transaction();
            let mut executor = SubjectExecutor::new(&config, &logger);
            executor.execute(&cx, &tx, set, &mut registry, &plan).await
        })
    }

    #[test]
    fn test_insert_writes_back_generated_ids_and_junction_rows() {
        let conn = RecordingConnection::new();
        let mut set = EntitySet::new();
        let author = set.insert(Entity::new(fixtures::users()).with_value("name", "ada"));
        let post = set.insert(Entity::new(fixtures::posts()).with_value("title", "hello"));
        let tag = set.insert(Entity::new(fixtures::tags()).with_value("name", "rust"));
        set.set_one(post, "author", Some(author)).unwrap();
        set.set_many(post, "tags", vec![tag]).unwrap();

        let Outcome::Ok(report) = run(&conn, &mut set, &ChangeSet::new().save(post)) else {
            panic!("execution failed");
        };
        assert_eq!(report.inserted, 3);
        assert_eq!(report.junction_inserted, 1);
        assert!(report.subjects.iter().all(|s| s.state == SubjectState::Done));

        let author_id = set.get(author).and_then(|e| e.get("id")).cloned().unwrap();
        assert_eq!(
            set.get(post).and_then(|e| e.get("author_id")),
            Some(&author_id)
        );

        let statements = conn.statements();
        let insert_post = statements
            .iter()
            .find(|s| s.sql.starts_with("INSERT INTO \"posts\""))
            .unwrap();
        assert_eq!(
            insert_post.sql,
            "INSERT INTO \"posts\" (\"title\", \"author_id\") VALUES ($1, $2)"
        );
        let junction = statements.last().unwrap();
        assert_eq!(
            junction.sql,
            "INSERT INTO \"post_tags\" (\"post_id\", \"tag_id\") VALUES ($1, $2)"
        );
        let post_id = set.get(post).and_then(|e| e.get("id")).cloned().unwrap();
        let tag_id = set.get(tag).and_then(|e| e.get("id")).cloned().unwrap();
        assert_eq!(junction.params, vec![post_id, tag_id]);
    }

    #[test]
    fn test_unchanged_update_issues_nothing() {
        let conn = RecordingConnection::new();
        let mut set = EntitySet::new();
        let user = set.insert(
            Entity::new(fixtures::users())
                .with_value("id", 1_i64)
                .with_value("name", "ada")
                .with_persisted(
                    EntitySnapshot::new()
                        .with_value("id", Value::Int(1))
                        .with_value("name", "ada"),
                ),
        );

        let Outcome::Ok(report) = run(&conn, &mut set, &ChangeSet::new().save(user)) else {
            panic!("execution failed");
        };
        assert_eq!(report.updated, 0);
        assert_eq!(report.skipped_updates, 1);
        assert_eq!(report.statements, 0);
        assert!(conn.statements().is_empty());
        assert!(!report.wrote_anything());
    }

    #[test]
    fn test_update_sets_only_changed_columns() {
        let conn = RecordingConnection::new();
        let mut set = EntitySet::new();
        let user = set.insert(
            Entity::new(fixtures::users())
                .with_value("id", 1_i64)
                .with_value("name", "grace")
                .with_persisted(
                    EntitySnapshot::new()
                        .with_value("id", 1_i64)
                        .with_value("name", "ada"),
                ),
        );

        let Outcome::Ok(report) = run(&conn, &mut set, &ChangeSet::new().save(user)) else {
            panic!("execution failed");
        };
        assert_eq!(report.updated, 1);
        let statements = conn.statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].sql,
            "UPDATE \"users\" SET \"name\" = $1 WHERE \"id\" = $2"
        );
        assert_eq!(
            statements[0].params,
            vec![Value::Text("grace".into()), Value::BigInt(1)]
        );
    }

    #[test]
    fn test_hard_remove_clears_junction_then_deletes() {
        let conn = RecordingConnection::new();
        let mut set = EntitySet::new();
        let post = set.insert(Entity::new(fixtures::posts()).with_value("id", 4_i64));

        let Outcome::Ok(report) = run(&conn, &mut set, &ChangeSet::new().remove(post)) else {
            panic!("execution failed");
        };
        assert_eq!(report.removed, 1);
        assert_eq!(
            conn.sql_log(),
            vec![
                "DELETE FROM \"post_tags\" WHERE (\"post_id\" = $1)".to_string(),
                "DELETE FROM \"posts\" WHERE \"id\" = $1".to_string(),
            ]
        );
    }

    #[test]
    fn test_inverse_many_to_many_remove_leaves_junction_to_foreign_key() {
        let tags = Arc::new(
            EntityMetadata::new("tags")
                .field(FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true))
                .relation(RelationshipInfo::new("posts", "posts", RelationshipKind::ManyToMany)),
        );
        let conn = RecordingConnection::new();
        let mut set = EntitySet::new();
        let tag = set.insert(Entity::new(tags).with_value("id", 9_i64));

        let Outcome::Ok(report) = run(&conn, &mut set, &ChangeSet::new().remove(tag)) else {
            panic!("execution failed");
        };
        assert_eq!(report.removed, 1);
        assert_eq!(report.junction_removed, 0);
        assert_eq!(
            conn.sql_log(),
            vec!["DELETE FROM \"tags\" WHERE \"id\" = $1".to_string()]
        );
    }

    #[test]
    fn test_soft_remove_sets_timestamp() {
        let conn = RecordingConnection::new();
        let mut set = EntitySet::new();
        let post = set.insert(Entity::new(fixtures::posts()).with_value("id", 4_i64));

        let Outcome::Ok(report) = run(&conn, &mut set, &ChangeSet::new().soft_remove(post)) else {
            panic!("execution failed");
        };
        assert_eq!(report.soft_removed, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(
            conn.sql_log(),
            vec!["UPDATE \"posts\" SET \"deleted_at\" = CURRENT_TIMESTAMP WHERE \"id\" = $1".to_string()]
        );
    }

    #[test]
    fn test_empty_insert_per_dialect() {
        assert_eq!(
            empty_insert(Dialect::Mysql, "`tags`"),
            "INSERT INTO `tags` () VALUES ()"
        );
        assert_eq!(
            empty_insert(Dialect::Sqlite, "\"tags\""),
            "INSERT INTO \"tags\" DEFAULT VALUES"
        );
    }

    #[test]
    fn test_failure_marks_subject_and_stops() {
        let conn = RecordingConnection::new();
        conn.fail_on("INSERT INTO \"users\"");
        let mut set = EntitySet::new();
        let author = set.insert(Entity::new(fixtures::users()).with_value("name", "ada"));
        let post = set.insert(Entity::new(fixtures::posts()).with_value("title", "hello"));
        set.set_one(post, "author", Some(author)).unwrap();

        let outcome = run(&conn, &mut set, &ChangeSet::new().save(post));
        let Outcome::Err(err) = outcome else {
            panic!("expected a failure");
        };
        assert_eq!(err.sql(), Some("INSERT INTO \"users\" (\"name\") VALUES ($1)"));
        assert_eq!(conn.count("INSERT INTO \"posts\""), 0);
    }

    #[test]
    fn test_executor_is_single_use() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = RecordingConnection::new();
        let config = PersistConfig::default();
        let logger = CapturingLogger::default();
        let mut set = EntitySet::new();
        let mut registry = SubjectRegistry::new();
        let plan = ExecutionPlan::default();

        rt.block_on(async {
            let tx = conn.transaction();
            let mut executor = SubjectExecutor::new(&config, &logger);
            let first = executor.execute(&cx, &tx, &mut set, &mut registry, &plan).await;
            assert!(matches!(first, Outcome::Ok(_)));
            let second = executor.execute(&cx, &tx, &mut set, &mut registry, &plan).await;
            assert!(matches!(second, Outcome::Err(PersistError::AlreadyReleased)));
        });
    }
}
