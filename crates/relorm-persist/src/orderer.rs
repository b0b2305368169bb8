//! Operation ordering.
//!
//! Inserts are ordered so that a row is written after every row it
//! references; removals in the opposite direction. Both orders come from a
//! [`DependencyGraph`] over subject ids, so a genuine cycle fails the whole
//! call before any statement is issued.

use crate::entity::{EntityId, EntitySet, RelationValue};
use crate::error::{GraphError, PersistError};
use crate::graph::DependencyGraph;
use crate::subject::{Subject, SubjectId, SubjectRegistry};
use crate::change_tracker::same_key;

/// Subject ids per execution phase, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub inserts: Vec<SubjectId>,
    pub updates: Vec<SubjectId>,
    pub removals: Vec<SubjectId>,
    /// Subjects with junction or detach work, in registry order.
    pub relation_owners: Vec<SubjectId>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.removals.is_empty()
            && self.relation_owners.is_empty()
    }
}

/// Partitions subjects into phases and orders them.
pub struct OperationOrderer;

impl OperationOrderer {
    #[tracing::instrument(level = "debug", skip_all, fields(subjects = registry.len()))]
    pub fn order(registry: &SubjectRegistry, set: &EntitySet) -> Result<ExecutionPlan, PersistError> {
        let inserts = Self::insert_order(registry, set)?;
        let removals = Self::removal_order(registry, set)?;
        let updates = registry
            .iter()
            .filter(|s| s.must_update())
            .map(|s| s.id)
            .collect();
        let relation_owners = registry
            .iter()
            .filter(|s| !s.must_remove() && s.has_relation_changes())
            .map(|s| s.id)
            .collect();

        let plan = ExecutionPlan {
            inserts,
            updates,
            removals,
            relation_owners,
        };
        tracing::debug!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            removals = plan.removals.len(),
            "execution plan ordered"
        );
        Ok(plan)
    }

    fn insert_order(
        registry: &SubjectRegistry,
        set: &EntitySet,
    ) -> Result<Vec<SubjectId>, PersistError> {
        let mut graph: DependencyGraph<SubjectId> = DependencyGraph::new();
        for subject in registry.iter().filter(|s| s.must_insert()) {
            graph.add_node(subject.id, ());
        }

        for subject in registry.iter().filter(|s| s.must_insert()) {
            for target in referenced_entities(set, subject)? {
                if let Some(dep) = registry.for_entity(target).filter(|s| s.must_insert()) {
                    add_edge(registry, &mut graph, subject.id, dep.id)?;
                }
            }
            for propagation in registry.propagations_into(subject.entity) {
                if let Some(parent) = registry
                    .for_entity(propagation.parent)
                    .filter(|s| s.must_insert())
                {
                    add_edge(registry, &mut graph, subject.id, parent.id)?;
                }
            }
        }

        graph
            .overall_order(false)
            .map_err(|e| graph_error(registry, e))
    }

    fn removal_order(
        registry: &SubjectRegistry,
        set: &EntitySet,
    ) -> Result<Vec<SubjectId>, PersistError> {
        let mut graph: DependencyGraph<SubjectId> = DependencyGraph::new();
        for subject in registry.iter().filter(|s| s.must_remove()) {
            graph.add_node(subject.id, ());
        }

        for subject in registry.iter().filter(|s| s.must_remove()) {
            // A referencing row goes before the row it references.
            for target in referenced_entities(set, subject)? {
                if let Some(dep) = registry.for_entity(target).filter(|s| s.must_remove()) {
                    if dep.id != subject.id {
                        add_edge(registry, &mut graph, dep.id, subject.id)?;
                    }
                }
            }
            for dep in referenced_by_key(registry, set, subject)? {
                if dep != subject.id {
                    add_edge(registry, &mut graph, dep, subject.id)?;
                }
            }
            for child in owned_children(set, subject)? {
                if let Some(c) = registry.for_entity(child).filter(|s| s.must_remove()) {
                    if c.id != subject.id {
                        add_edge(registry, &mut graph, subject.id, c.id)?;
                    }
                }
            }
        }

        graph
            .overall_order(false)
            .map_err(|e| graph_error(registry, e))
    }
}

/// Entities pointed at by the owning single-valued relations of `subject`.
fn referenced_entities(set: &EntitySet, subject: &Subject) -> Result<Vec<EntityId>, PersistError> {
    let entity = set.entity(subject.entity)?;
    let mut out = Vec::new();
    for relation in &subject.metadata.relationships {
        if relation.is_collection() || !relation.is_owning() {
            continue;
        }
        if let Some(RelationValue::One(Some(target))) = entity.relation(relation.name) {
            out.push(*target);
        }
    }
    Ok(out)
}

/// Removed subjects whose identifier matches a foreign key of `subject`
/// when the relation itself was not set.
fn referenced_by_key(
    registry: &SubjectRegistry,
    set: &EntitySet,
    subject: &Subject,
) -> Result<Vec<SubjectId>, PersistError> {
    let entity = set.entity(subject.entity)?;
    let mut out = Vec::new();
    for relation in &subject.metadata.relationships {
        if relation.is_collection() || !relation.is_owning() || entity.relation(relation.name).is_some() {
            continue;
        }
        let Some(fk) = entity.key_values(relation.local_key_cols()) else {
            continue;
        };
        for other in registry.iter().filter(|s| s.must_remove()) {
            if other.table() != relation.related_table {
                continue;
            }
            let matches = set
                .get(other.entity)
                .and_then(|e| e.primary_key())
                .is_some_and(|pk| same_key(&pk, &fk));
            if matches {
                out.push(other.id);
            }
        }
    }
    Ok(out)
}

/// Members of the inverse one-to-one and one-to-many relations of `subject`.
fn owned_children(set: &EntitySet, subject: &Subject) -> Result<Vec<EntityId>, PersistError> {
    let entity = set.entity(subject.entity)?;
    let mut out = Vec::new();
    for relation in &subject.metadata.relationships {
        if relation.is_owning() || relation.kind == relorm_core::RelationshipKind::ManyToMany {
            continue;
        }
        if let Some(value) = entity.relation(relation.name) {
            out.extend(value.targets());
        }
    }
    Ok(out)
}

fn add_edge(
    registry: &SubjectRegistry,
    graph: &mut DependencyGraph<SubjectId>,
    from: SubjectId,
    to: SubjectId,
) -> Result<(), PersistError> {
    graph
        .add_dependency(&from, &to)
        .map_err(|e| graph_error(registry, e))
}

fn graph_error(registry: &SubjectRegistry, err: GraphError<SubjectId>) -> PersistError {
    let label = |id: &SubjectId| {
        registry
            .get(*id)
            .map_or_else(|| id.to_string(), Subject::label)
    };
    match err {
        GraphError::NodeNotFound(id) => PersistError::NodeNotFound { node: label(&id) },
        GraphError::Cycle(path) => {
            let path: Vec<String> = path.iter().map(label).collect();
            tracing::warn!(cycle = %path.join(" -> "), "dependency cycle between subjects");
            PersistError::Cycle { path }
        }
    }
}
