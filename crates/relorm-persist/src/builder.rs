//! Subject graph construction.
//!
//! Starting from the roots of a [`ChangeSet`], the builder walks cascades
//! and registers one [`Subject`](crate::subject::Subject) per reached
//! entity. It decides insert vs. update from the database state, records
//! relation changes (junction rows to add or drop, children to detach) and
//! the parent keys children must receive. No SQL runs here except the
//! lookups issued by the [`DatabaseEntityLoader`].

use crate::change_tracker::{ChangeTracker, DatabaseEntityLoader, same_key};
use crate::entity::{Entity, EntityId, EntitySet, RelationValue};
use crate::error::PersistError;
use crate::subject::{
    JunctionInsert, Propagation, RelationRemoval, RemovalKind, SubjectId, SubjectOperation,
    SubjectRegistry,
};
use relorm_core::{Cx, Outcome, RelationshipInfo, RelationshipKind, Value};
use std::collections::VecDeque;

/// Root entities of one persistence call and what to do with them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    saves: Vec<EntityId>,
    removals: Vec<(EntityId, RemovalKind)>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `entity` (and whatever it cascades to) for save.
    #[must_use]
    pub fn save(mut self, entity: EntityId) -> Self {
        if !self.saves.contains(&entity) {
            self.saves.push(entity);
        }
        self
    }

    /// Schedule `entity` for deletion.
    #[must_use]
    pub fn remove(self, entity: EntityId) -> Self {
        self.removal(entity, RemovalKind::Hard)
    }

    /// Schedule `entity` for soft deletion.
    #[must_use]
    pub fn soft_remove(self, entity: EntityId) -> Self {
        self.removal(entity, RemovalKind::Soft)
    }

    fn removal(mut self, entity: EntityId, kind: RemovalKind) -> Self {
        if !self.removals.iter().any(|(e, _)| *e == entity) {
            self.removals.push((entity, kind));
        }
        self
    }

    pub fn saves(&self) -> &[EntityId] {
        &self.saves
    }

    pub fn removals(&self) -> &[(EntityId, RemovalKind)] {
        &self.removals
    }

    pub fn is_empty(&self) -> bool {
        self.saves.is_empty() && self.removals.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Save,
    Remove(RemovalKind),
}

struct Pending {
    entity: EntityId,
    parent: Option<SubjectId>,
    intent: Intent,
}

/// Builds the subject registry of a change set.
pub struct SubjectGraphBuilder;

impl SubjectGraphBuilder {
    #[tracing::instrument(level = "debug", skip_all, fields(saves = change_set.saves().len(), removals = change_set.removals().len()))]
    pub async fn build<L>(
        cx: &Cx,
        set: &EntitySet,
        change_set: &ChangeSet,
        loader: &L,
    ) -> Outcome<SubjectRegistry, PersistError>
    where
        L: DatabaseEntityLoader,
    {
        for saved in change_set.saves() {
            if change_set.removals().iter().any(|(e, _)| e == saved) {
                let table = crate::try_result!(set.entity(*saved)).table();
                return Outcome::Err(PersistError::ConflictingOperation { table });
            }
        }

        let mut registry = SubjectRegistry::new();
        let mut queue: VecDeque<Pending> = change_set
            .saves()
            .iter()
            .map(|e| Pending {
                entity: *e,
                parent: None,
                intent: Intent::Save,
            })
            .chain(change_set.removals().iter().map(|(e, kind)| Pending {
                entity: *e,
                parent: None,
                intent: Intent::Remove(*kind),
            }))
            .collect();

        while let Some(pending) = queue.pop_front() {
            if let Some(existing) = registry.for_entity(pending.entity) {
                let removing = matches!(pending.intent, Intent::Remove(_));
                if existing.must_remove() != removing {
                    return Outcome::Err(PersistError::ConflictingOperation {
                        table: existing.table(),
                    });
                }
                continue;
            }

            let entity = crate::try_result!(set.entity(pending.entity));
            match pending.intent {
                Intent::Save => {
                    let identifier = entity.id();
                    let database_entity = match (entity.persisted(), &identifier) {
                        (Some(snapshot), _) => Some(snapshot.clone()),
                        (None, Some(id)) => {
                            crate::try_outcome!(loader.load(cx, entity.metadata(), id).await)
                        }
                        (None, None) => None,
                    };
                    let operation = if database_entity.is_some() {
                        SubjectOperation::Update
                    } else {
                        SubjectOperation::Insert
                    };
                    let sid = registry.register(
                        pending.entity,
                        std::sync::Arc::clone(entity.metadata()),
                        pending.parent,
                        operation,
                    );
                    if let Some(subject) = registry.get_mut(sid) {
                        subject.identifier = identifier;
                        subject.database_entity = database_entity;
                    }
                    crate::try_result!(Self::visit_save_relations(
                        set,
                        &mut registry,
                        &mut queue,
                        sid,
                        pending.entity,
                    ));
                }
                Intent::Remove(kind) => {
                    let Some(identifier) = entity.id() else {
                        return Outcome::Err(PersistError::Metadata(format!(
                            "cannot remove a '{}' row without identifier",
                            entity.table()
                        )));
                    };
                    if kind == RemovalKind::Soft && entity.metadata().soft_delete_column.is_none()
                    {
                        return Outcome::Err(PersistError::Metadata(format!(
                            "table '{}' has no soft-delete column",
                            entity.table()
                        )));
                    }
                    let sid = registry.register(
                        pending.entity,
                        std::sync::Arc::clone(entity.metadata()),
                        pending.parent,
                        SubjectOperation::Remove(kind),
                    );
                    if let Some(subject) = registry.get_mut(sid) {
                        subject.identifier = Some(identifier);
                        subject.database_entity = entity.persisted().cloned();
                    }
                    for relation in &entity.metadata().relationships {
                        if !relation.cascade_remove {
                            continue;
                        }
                        let Some(value) = entity.relation(relation.name) else {
                            continue;
                        };
                        for target in value.targets() {
                            queue.push_back(Pending {
                                entity: target,
                                parent: Some(sid),
                                intent: Intent::Remove(kind),
                            });
                        }
                    }
                }
            }
        }

        crate::try_result!(Self::check_required_relations(set, &registry));
        Self::drop_detaches_of_removed_rows(set, &mut registry);

        tracing::debug!(subjects = registry.len(), "subject graph built");
        Outcome::Ok(registry)
    }

    fn visit_save_relations(
        set: &EntitySet,
        registry: &mut SubjectRegistry,
        queue: &mut VecDeque<Pending>,
        sid: SubjectId,
        entity_id: EntityId,
    ) -> Result<(), PersistError> {
        let entity = set.entity(entity_id)?;
        let previous_state = registry.get(sid).and_then(|s| s.database_entity.clone());

        for relation in &entity.metadata().relationships {
            let Some(value) = entity.relation(relation.name) else {
                continue;
            };
            for target in value.targets() {
                if cascades(relation, set.entity(target)?) {
                    queue.push_back(Pending {
                        entity: target,
                        parent: Some(sid),
                        intent: Intent::Save,
                    });
                }
            }

            match relation.kind {
                RelationshipKind::ManyToOne => {}
                RelationshipKind::OneToOne if relation.is_owning() => {}
                RelationshipKind::OneToOne | RelationshipKind::OneToMany => {
                    for child in value.targets() {
                        registry.add_propagation(Propagation {
                            parent: entity_id,
                            child,
                            relation: relation.name,
                        });
                    }
                    let previous = previous_state
                        .as_ref()
                        .and_then(|s| s.related(relation.name));
                    if let Some(previous) = previous {
                        let current = member_keys(set, value);
                        let (_, removed) = ChangeTracker::relation_diff(previous, &current);
                        if !removed.is_empty() {
                            if let Some(subject) = registry.get_mut(sid) {
                                subject.detached_children.push(RelationRemoval {
                                    relation: relation.name,
                                    members: removed,
                                });
                            }
                        }
                    }
                }
                RelationshipKind::ManyToMany => {
                    if relation.link_table.is_none() {
                        continue;
                    }
                    let previous = previous_state
                        .as_ref()
                        .and_then(|s| s.related(relation.name))
                        .unwrap_or(&[]);
                    let mut inserts = Vec::new();
                    for member in value.targets() {
                        let known = set
                            .entity(member)?
                            .primary_key()
                            .is_some_and(|k| previous.iter().any(|p| same_key(p, &k)));
                        if !known {
                            inserts.push(JunctionInsert {
                                relation: relation.name,
                                member,
                            });
                        }
                    }
                    let current = member_keys(set, value);
                    let (_, removed) = ChangeTracker::relation_diff(previous, &current);
                    if let Some(subject) = registry.get_mut(sid) {
                        subject.junction_inserts.extend(inserts);
                        if !removed.is_empty() {
                            subject.junction_removals.push(RelationRemoval {
                                relation: relation.name,
                                members: removed,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Fail before any SQL runs when a relation cannot be satisfied.
    fn check_required_relations(
        set: &EntitySet,
        registry: &SubjectRegistry,
    ) -> Result<(), PersistError> {
        for subject in registry.iter() {
            if !(subject.must_insert() || subject.must_update()) {
                continue;
            }
            let entity = set.entity(subject.entity)?;
            let metadata = entity.metadata();

            for relation in &metadata.relationships {
                let unsatisfied = CascadeRequiredCheck {
                    set,
                    registry,
                    entity,
                    entity_id: subject.entity,
                    relation,
                }
                .unsatisfied(subject.must_insert())?;
                if unsatisfied {
                    return Err(PersistError::CascadeRequired {
                        table: metadata.table_name,
                        relation: relation.name,
                    });
                }
            }
        }
        Ok(())
    }

    /// Children that are removed in the same call need no detach.
    fn drop_detaches_of_removed_rows(set: &EntitySet, registry: &mut SubjectRegistry) {
        let removed: Vec<(&'static str, Vec<Value>)> = registry
            .iter()
            .filter(|s| s.must_remove())
            .filter_map(|s| {
                let key = set.get(s.entity)?.primary_key()?;
                Some((s.table(), key))
            })
            .collect();
        if removed.is_empty() {
            return;
        }

        let ids: Vec<SubjectId> = registry.iter().map(|s| s.id).collect();
        for id in ids {
            let Some(subject) = registry.get_mut(id) else {
                continue;
            };
            let metadata = std::sync::Arc::clone(&subject.metadata);
            for detach in &mut subject.detached_children {
                let Some(relation) = metadata.find_relation(detach.relation) else {
                    continue;
                };
                detach.members.retain(|key| {
                    !removed.iter().any(|(table, k)| {
                        *table == relation.related_table && same_key(k, key)
                    })
                });
            }
            subject.detached_children.retain(|d| !d.members.is_empty());
        }
    }
}

/// Whether saving through `relation` reaches `target`.
fn cascades(relation: &RelationshipInfo, target: &Entity) -> bool {
    relation.cascade_update || (relation.cascade_insert && target.persisted().is_none())
}

fn member_keys(set: &EntitySet, value: &RelationValue) -> Vec<Vec<Value>> {
    value
        .targets()
        .into_iter()
        .filter_map(|m| set.get(m).and_then(Entity::primary_key))
        .collect()
}

struct CascadeRequiredCheck<'a> {
    set: &'a EntitySet,
    registry: &'a SubjectRegistry,
    entity: &'a Entity,
    entity_id: EntityId,
    relation: &'a RelationshipInfo,
}

impl CascadeRequiredCheck<'_> {
    /// A target is reachable when it is saved in this call or already has
    /// an identifier.
    fn reachable(&self, target: EntityId) -> Result<bool, PersistError> {
        let saved = self
            .registry
            .for_entity(target)
            .is_some_and(|s| s.must_insert() || s.must_update());
        Ok(saved || self.set.entity(target)?.id().is_some())
    }

    fn unsatisfied(&self, inserting: bool) -> Result<bool, PersistError> {
        let relation = self.relation;
        let value = self.entity.relation(relation.name);

        if relation.kind == RelationshipKind::ManyToMany && relation.link_table.is_some() {
            if let Some(value) = value {
                for member in value.targets() {
                    if !self.reachable(member)? {
                        return Ok(true);
                    }
                }
            }
            return Ok(false);
        }

        if relation.is_collection() || !relation.is_owning() {
            return Ok(false);
        }

        match value {
            Some(RelationValue::One(Some(target))) => Ok(!self.reachable(*target)?),
            Some(RelationValue::One(None)) => Ok(!relation.nullable),
            Some(RelationValue::Many(_)) => Ok(false),
            None => {
                if relation.nullable || !inserting {
                    return Ok(false);
                }
                let has_key = self
                    .entity
                    .key_values(relation.local_key_cols())
                    .is_some();
                let propagated = self.registry.propagations_into(self.entity_id).any(|p| {
                    self.set
                        .get(p.parent)
                        .and_then(|parent| parent.metadata().find_relation(p.relation))
                        .is_some_and(|r| r.remote_key_cols() == relation.local_key_cols())
                });
                Ok(!has_key && !propagated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_tracker::{EntitySnapshot, NoDatabaseLookup};
    use crate::entity::Entity;
    use crate::subject::SubjectState;
    use crate::testing::fixtures;
    use asupersync::runtime::RuntimeBuilder;

    fn build(set: &EntitySet, change_set: &ChangeSet) -> Outcome<SubjectRegistry, PersistError> {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(SubjectGraphBuilder::build(&cx, set, change_set, &NoDatabaseLookup))
    }

    #[test]
    fn test_cascade_reaches_related_entities() {
        let mut set = EntitySet::new();
        let author = set.insert(Entity::new(fixtures::users()).with_value("name", "ada"));
        let post = set.insert(Entity::new(fixtures::posts()).with_value("title", "hi"));
        let tag = set.insert(Entity::new(fixtures::tags()).with_value("name", "rust"));
        set.set_one(post, "author", Some(author)).unwrap();
        set.set_many(post, "tags", vec![tag]).unwrap();

        let Outcome::Ok(registry) = build(&set, &ChangeSet::new().save(post)) else {
            panic!("build failed");
        };
        assert_eq!(registry.len(), 3);
        assert!(registry.iter().all(|s| s.must_insert()));
        assert!(registry.iter().all(|s| s.state == SubjectState::Pending));

        let post_subject = registry.for_entity(post).unwrap();
        assert_eq!(
            post_subject.junction_inserts,
            vec![JunctionInsert {
                relation: "tags",
                member: tag
            }]
        );
        let author_subject = registry.for_entity(author).unwrap();
        assert_eq!(author_subject.parent, Some(post_subject.id));
    }

    #[test]
    fn test_existing_snapshot_means_update() {
        let mut set = EntitySet::new();
        let user = set.insert(
            Entity::new(fixtures::users())
                .with_value("id", 1_i64)
                .with_value("name", "ada")
                .with_persisted(EntitySnapshot::new().with_value("id", 1_i64)),
        );
        let Outcome::Ok(registry) = build(&set, &ChangeSet::new().save(user)) else {
            panic!("build failed");
        };
        assert!(registry.for_entity(user).unwrap().must_update());
    }

    #[test]
    fn test_one_to_many_records_propagation_and_detach() {
        let mut set = EntitySet::new();
        let kept = set.insert(Entity::new(fixtures::posts()).with_value("id", 10_i64));
        let fresh = set.insert(Entity::new(fixtures::posts()).with_value("title", "new"));
        let user = set.insert(
            Entity::new(fixtures::users())
                .with_value("id", 1_i64)
                .with_persisted(
                    EntitySnapshot::new()
                        .with_value("id", 1_i64)
                        .with_related("posts", vec![vec![Value::BigInt(10)], vec![Value::BigInt(11)]]),
                ),
        );
        set.set_many(user, "posts", vec![kept, fresh]).unwrap();

        let Outcome::Ok(registry) = build(&set, &ChangeSet::new().save(user)) else {
            panic!("build failed");
        };
        assert_eq!(registry.propagations_into(fresh).count(), 1);
        let subject = registry.for_entity(user).unwrap();
        assert_eq!(
            subject.detached_children,
            vec![RelationRemoval {
                relation: "posts",
                members: vec![vec![Value::BigInt(11)]],
            }]
        );
    }

    #[test]
    fn test_conflicting_save_and_remove() {
        let mut set = EntitySet::new();
        let user = set.insert(Entity::new(fixtures::users()).with_value("id", 1_i64));
        let result = build(&set, &ChangeSet::new().save(user).remove(user));
        assert!(matches!(
            result,
            Outcome::Err(PersistError::ConflictingOperation { table: "users" })
        ));
    }

    #[test]
    fn test_required_relation_without_value() {
        let mut set = EntitySet::new();
        let comment = set.insert(Entity::new(fixtures::comments()).with_value("body", "x"));
        let result = build(&set, &ChangeSet::new().save(comment));
        assert!(matches!(
            result,
            Outcome::Err(PersistError::CascadeRequired {
                table: "comments",
                relation: "post"
            })
        ));

        let mut set = EntitySet::new();
        let comment = set.insert(
            Entity::new(fixtures::comments())
                .with_value("body", "x")
                .with_value("post_id", 4_i64),
        );
        assert!(matches!(
            build(&set, &ChangeSet::new().save(comment)),
            Outcome::Ok(_)
        ));
    }

    #[test]
    fn test_unsaved_target_without_cascade_is_rejected() {
        let mut set = EntitySet::new();
        let post = set.insert(Entity::new(fixtures::posts()));
        let comment = set.insert(Entity::new(fixtures::comments()));
        set.set_one(comment, "post", Some(post)).unwrap();
        assert!(matches!(
            build(&set, &ChangeSet::new().save(comment)),
            Outcome::Err(PersistError::CascadeRequired { .. })
        ));
    }

    #[test]
    fn test_remove_cascades_and_requires_identifier() {
        let mut set = EntitySet::new();
        let user = set.insert(Entity::new(fixtures::users()).with_value("id", 1_i64));
        let post = set.insert(Entity::new(fixtures::posts()).with_value("id", 2_i64));
        set.set_many(user, "posts", vec![post]).unwrap();

        let Outcome::Ok(registry) = build(&set, &ChangeSet::new().remove(user)) else {
            panic!("build failed");
        };
        assert_eq!(registry.len(), 2);
        assert!(registry.iter().all(|s| s.must_remove()));

        let fresh = set.insert(Entity::new(fixtures::users()));
        assert!(matches!(
            build(&set, &ChangeSet::new().remove(fresh)),
            Outcome::Err(PersistError::Metadata(_))
        ));
        let tag = set.insert(Entity::new(fixtures::tags()).with_value("id", 3_i64));
        assert!(matches!(
            build(&set, &ChangeSet::new().soft_remove(tag)),
            Outcome::Err(PersistError::Metadata(_))
        ));
    }
}
