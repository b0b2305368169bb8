//! In-memory entities and the arena that holds an entity graph.
//!
//! Entities are dynamic: a column-to-value map described by shared
//! [`EntityMetadata`]. Relations between entities point at other members of
//! the same [`EntitySet`] by [`EntityId`], so cyclic graphs need no shared
//! ownership.

use crate::change_tracker::EntitySnapshot;
use crate::error::PersistError;
use relorm_core::{EntityMetadata, IdMap, Model, Row, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Handle of an entity inside an [`EntitySet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(usize);

impl EntityId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Current value of one relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationValue {
    /// Single-valued relation; `None` clears it.
    One(Option<EntityId>),
    /// Collection relation.
    Many(Vec<EntityId>),
}

impl RelationValue {
    /// Every entity this value points at.
    pub fn targets(&self) -> Vec<EntityId> {
        match self {
            RelationValue::One(target) => target.iter().copied().collect(),
            RelationValue::Many(targets) => targets.clone(),
        }
    }
}

/// One entity instance.
///
/// Relations that were never set are treated as untouched: they neither
/// cascade nor produce relation changes.
#[derive(Debug, Clone)]
pub struct Entity {
    metadata: Arc<EntityMetadata>,
    values: BTreeMap<&'static str, Value>,
    relations: BTreeMap<&'static str, RelationValue>,
    persisted: Option<EntitySnapshot>,
}

impl Entity {
    pub fn new(metadata: Arc<EntityMetadata>) -> Self {
        Self {
            metadata,
            values: BTreeMap::new(),
            relations: BTreeMap::new(),
            persisted: None,
        }
    }

    /// Build an entity from a typed model.
    pub fn from_model<M: Model>(metadata: Arc<EntityMetadata>, model: &M) -> Self {
        let mut entity = Self::new(metadata);
        for (column, value) in model.to_row() {
            entity.values.insert(column, value);
        }
        entity
    }

    #[must_use]
    pub fn with_value(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    /// Attach the database state this entity was loaded from.
    #[must_use]
    pub fn with_persisted(mut self, snapshot: EntitySnapshot) -> Self {
        self.persisted = Some(snapshot);
        self
    }

    pub fn set(&mut self, column: &'static str, value: impl Into<Value>) {
        self.values.insert(column, value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn values(&self) -> &BTreeMap<&'static str, Value> {
        &self.values
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.metadata
    }

    pub fn table(&self) -> &'static str {
        self.metadata.table_name
    }

    pub fn relation(&self, name: &str) -> Option<&RelationValue> {
        self.relations.get(name)
    }

    pub fn persisted(&self) -> Option<&EntitySnapshot> {
        self.persisted.as_ref()
    }

    pub fn set_persisted(&mut self, snapshot: Option<EntitySnapshot>) {
        self.persisted = snapshot;
    }

    /// Primary-key identifier, `None` while any key column is unset.
    pub fn id(&self) -> Option<IdMap> {
        self.metadata.id_map(|column| self.values.get(column))
    }

    /// Values of `columns` in order, `None` if any is missing or NULL.
    pub fn key_values(&self, columns: &[&str]) -> Option<Vec<Value>> {
        let mut out = Vec::with_capacity(columns.len());
        for column in columns {
            match self.values.get(column) {
                Some(v) if !v.is_null() => out.push(v.clone()),
                _ => return None,
            }
        }
        if out.is_empty() { None } else { Some(out) }
    }

    /// Primary-key values in declaration order.
    pub fn primary_key(&self) -> Option<Vec<Value>> {
        self.key_values(&self.metadata.primary_key_columns())
    }

    pub fn to_row(&self) -> Row {
        Row::from_pairs(self.values.iter().map(|(c, v)| (*c, v.clone())))
    }

    /// Read the entity back into a typed model.
    #[allow(clippy::result_large_err)]
    pub fn to_model<M: Model>(&self) -> relorm_core::Result<M> {
        M::from_row(&self.to_row())
    }
}

/// Arena holding an entity graph.
#[derive(Debug, Clone, Default)]
pub struct EntitySet {
    entities: Vec<Entity>,
}

impl EntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: Entity) -> EntityId {
        self.entities.push(entity);
        EntityId(self.entities.len() - 1)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id.0)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        (0..self.entities.len()).map(EntityId)
    }

    pub(crate) fn entity(&self, id: EntityId) -> Result<&Entity, PersistError> {
        self.get(id)
            .ok_or_else(|| PersistError::Metadata(format!("{} is not part of this set", id)))
    }

    pub(crate) fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity, PersistError> {
        self.entities
            .get_mut(id.0)
            .ok_or_else(|| PersistError::Metadata(format!("{} is not part of this set", id)))
    }

    /// Point a single-valued relation of `owner` at `target`.
    pub fn set_one(
        &mut self,
        owner: EntityId,
        relation: &'static str,
        target: Option<EntityId>,
    ) -> Result<(), PersistError> {
        if let Some(t) = target {
            self.entity(t)?;
        }
        let entity = self.entity_mut(owner)?;
        let Some(info) = entity.metadata.find_relation(relation) else {
            return Err(unknown_relation(entity.table(), relation));
        };
        if info.is_collection() {
            return Err(PersistError::Metadata(format!(
                "relation '{}.{}' holds a collection",
                entity.table(),
                relation
            )));
        }
        entity
            .relations
            .insert(relation, RelationValue::One(target));
        Ok(())
    }

    /// Replace the members of a collection relation of `owner`.
    pub fn set_many(
        &mut self,
        owner: EntityId,
        relation: &'static str,
        targets: Vec<EntityId>,
    ) -> Result<(), PersistError> {
        for t in &targets {
            self.entity(*t)?;
        }
        let entity = self.entity_mut(owner)?;
        let Some(info) = entity.metadata.find_relation(relation) else {
            return Err(unknown_relation(entity.table(), relation));
        };
        if !info.is_collection() {
            return Err(PersistError::Metadata(format!(
                "relation '{}.{}' is single-valued",
                entity.table(),
                relation
            )));
        }
        entity
            .relations
            .insert(relation, RelationValue::Many(targets));
        Ok(())
    }

    /// Take the current state of `id` as its database state.
    ///
    /// Called after a successful save so that saving again is a no-op.
    pub fn refresh_snapshot(&mut self, id: EntityId) -> Result<(), PersistError> {
        let entity = self.entity(id)?;
        let mut snapshot = EntitySnapshot::new();
        for (column, value) in &entity.values {
            snapshot = snapshot.with_value(column, value.clone());
        }
        for relation in &entity.metadata.relationships {
            if !relation.is_collection() {
                continue;
            }
            let Some(RelationValue::Many(members)) = entity.relations.get(relation.name) else {
                continue;
            };
            let keys: Vec<Vec<Value>> = members
                .iter()
                .filter_map(|m| self.get(*m).and_then(Entity::primary_key))
                .collect();
            snapshot = snapshot.with_related(relation.name, keys);
        }
        self.entity_mut(id)?.persisted = Some(snapshot);
        Ok(())
    }

    /// Forget the database state of `id` (after it was removed).
    pub fn clear_snapshot(&mut self, id: EntityId) -> Result<(), PersistError> {
        self.entity_mut(id)?.persisted = None;
        Ok(())
    }
}

fn unknown_relation(table: &str, relation: &str) -> PersistError {
    PersistError::Metadata(format!("relation '{}.{}' is not declared", table, relation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_entity_ids_and_values() {
        let meta = fixtures::users();
        let user = Entity::new(Arc::clone(&meta)).with_value("name", "ada");
        assert!(user.id().is_none());
        assert!(user.primary_key().is_none());

        let user = user.with_value("id", 7_i64);
        assert_eq!(user.primary_key(), Some(vec![Value::BigInt(7)]));
        assert_eq!(user.id().map(|m| m.len()), Some(1));
        assert_eq!(user.get("name"), Some(&Value::Text("ada".into())));
        assert_eq!(user.table(), "users");
        assert!(user.key_values(&["id", "missing"]).is_none());
    }

    #[test]
    fn test_set_relations_checks_kind() {
        let mut set = EntitySet::new();
        let author = set.insert(Entity::new(fixtures::users()));
        let post = set.insert(Entity::new(fixtures::posts()));

        set.set_one(post, "author", Some(author)).unwrap();
        assert_eq!(
            set.get(post).and_then(|e| e.relation("author")),
            Some(&RelationValue::One(Some(author)))
        );
        assert!(set.set_many(post, "author", vec![author]).is_err());
        assert!(set.set_one(author, "posts", Some(post)).is_err());
        assert!(set.set_one(post, "editor", None).is_err());
        set.set_many(author, "posts", vec![post]).unwrap();
        assert_eq!(
            set.get(author).and_then(|e| e.relation("posts")).map(RelationValue::targets),
            Some(vec![post])
        );
    }

    #[test]
    fn test_refresh_snapshot_records_values_and_members() {
        let mut set = EntitySet::new();
        let post = set.insert(Entity::new(fixtures::posts()).with_value("id", 1_i64));
        let tag = set.insert(Entity::new(fixtures::tags()).with_value("id", 5_i64));
        let fresh = set.insert(Entity::new(fixtures::tags()));
        set.set_many(post, "tags", vec![tag, fresh]).unwrap();

        set.refresh_snapshot(post).unwrap();
        let snapshot = set.get(post).and_then(Entity::persisted).unwrap();
        assert_eq!(snapshot.value("id"), Some(&Value::BigInt(1)));
        assert_eq!(snapshot.related("tags"), Some(&[vec![Value::BigInt(5)]][..]));

        set.clear_snapshot(post).unwrap();
        assert!(set.get(post).and_then(Entity::persisted).is_none());
    }
}
