//! Subjects: units of pending work, and the registry that owns them.

use crate::change_tracker::EntitySnapshot;
use crate::entity::EntityId;
use relorm_core::{EntityMetadata, IdMap, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Synthetic id of a subject within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId(usize);

impl SubjectId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject#{}", self.0)
    }
}

/// How a removal is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalKind {
    /// DELETE the row.
    Hard,
    /// Set the soft-delete column to the current timestamp.
    Soft,
}

/// What a subject will do to its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectOperation {
    Insert,
    Update,
    Remove(RemovalKind),
    /// Present only to carry relation changes or to anchor cascades.
    None,
}

/// Lifecycle of a subject during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectState {
    Pending,
    Executing,
    Done,
    Failed,
}

/// Junction rows of one many-to-many relation to write for a subject.
#[derive(Debug, Clone, PartialEq)]
pub struct JunctionInsert {
    pub relation: &'static str,
    pub member: EntityId,
}

/// Relation rows to unlink for a subject: junction pairs for many-to-many,
/// foreign keys to null for one-to-many. Keys follow the related table's
/// primary-key order.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationRemoval {
    pub relation: &'static str,
    pub members: Vec<Vec<Value>>,
}

/// A parent key that must be copied into a child before the child is
/// written (one-to-many and inverse one-to-one cascades).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Propagation {
    pub parent: EntityId,
    pub child: EntityId,
    pub relation: &'static str,
}

/// One entity plus its pending intent.
#[derive(Debug, Clone)]
pub struct Subject {
    pub id: SubjectId,
    pub entity: EntityId,
    pub metadata: Arc<EntityMetadata>,
    /// Primary-key identifier; known up front for existing rows, filled in
    /// after insert for new ones.
    pub identifier: Option<IdMap>,
    /// State of the row as stored, `None` for new rows.
    pub database_entity: Option<EntitySnapshot>,
    /// Values produced by the database at insert time.
    pub inserted_values: IdMap,
    /// The subject whose cascade brought this one in.
    pub parent: Option<SubjectId>,
    pub operation: SubjectOperation,
    pub state: SubjectState,
    pub junction_inserts: Vec<JunctionInsert>,
    pub junction_removals: Vec<RelationRemoval>,
    pub detached_children: Vec<RelationRemoval>,
}

impl Subject {
    pub fn table(&self) -> &'static str {
        self.metadata.table_name
    }

    /// `table#index`, used in cycle reports.
    pub fn label(&self) -> String {
        format!("{}#{}", self.metadata.table_name, self.id.0)
    }

    pub fn must_insert(&self) -> bool {
        self.operation == SubjectOperation::Insert
    }

    pub fn must_update(&self) -> bool {
        self.operation == SubjectOperation::Update
    }

    pub fn must_remove(&self) -> bool {
        matches!(self.operation, SubjectOperation::Remove(_))
    }

    pub fn has_relation_changes(&self) -> bool {
        !self.junction_inserts.is_empty()
            || !self.junction_removals.is_empty()
            || !self.detached_children.is_empty()
    }
}

/// Owner of every subject of one save/remove call.
#[derive(Debug, Clone, Default)]
pub struct SubjectRegistry {
    subjects: Vec<Subject>,
    by_entity: HashMap<EntityId, SubjectId>,
    propagations: Vec<Propagation>,
}

impl SubjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &mut self,
        entity: EntityId,
        metadata: Arc<EntityMetadata>,
        parent: Option<SubjectId>,
        operation: SubjectOperation,
    ) -> SubjectId {
        let id = SubjectId(self.subjects.len());
        self.subjects.push(Subject {
            id,
            entity,
            metadata,
            identifier: None,
            database_entity: None,
            inserted_values: IdMap::new(),
            parent,
            operation,
            state: SubjectState::Pending,
            junction_inserts: Vec::new(),
            junction_removals: Vec::new(),
            detached_children: Vec::new(),
        });
        self.by_entity.insert(entity, id);
        id
    }

    pub(crate) fn add_propagation(&mut self, propagation: Propagation) {
        if !self.propagations.contains(&propagation) {
            self.propagations.push(propagation);
        }
    }

    pub fn get(&self, id: SubjectId) -> Option<&Subject> {
        self.subjects.get(id.0)
    }

    pub fn get_mut(&mut self, id: SubjectId) -> Option<&mut Subject> {
        self.subjects.get_mut(id.0)
    }

    pub fn for_entity(&self, entity: EntityId) -> Option<&Subject> {
        self.by_entity.get(&entity).and_then(|id| self.get(*id))
    }

    /// The subject whose cascade brought `id` in.
    pub fn parent_of(&self, id: SubjectId) -> Option<&Subject> {
        self.get(id)?.parent.and_then(|p| self.get(p))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subject> {
        self.subjects.iter()
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Key propagations into `child`.
    pub fn propagations_into(&self, child: EntityId) -> impl Iterator<Item = &Propagation> {
        self.propagations.iter().filter(move |p| p.child == child)
    }

    pub fn propagations(&self) -> &[Propagation] {
        &self.propagations
    }

    pub(crate) fn set_state(&mut self, id: SubjectId, state: SubjectState) {
        if let Some(subject) = self.subjects.get_mut(id.0) {
            subject.state = state;
        }
    }
}
