//! Entity metadata: the table-level description the persistence engine reads.

use crate::field::FieldInfo;
use crate::model::Model;
use crate::relationship::{RelationshipInfo, RelationshipKind};
use crate::value::Value;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Primary-key (or foreign-key) column to value map addressing one row.
pub type IdMap = BTreeMap<&'static str, Value>;

/// Materialized-path tree settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeInfo {
    /// Self-referencing many-to-one relation pointing at the parent node.
    pub parent_relation: &'static str,
    /// Column holding the ancestor chain, e.g. `"1.4.9."`.
    pub path_column: &'static str,
}

impl TreeInfo {
    pub const fn materialized_path(
        parent_relation: &'static str,
        path_column: &'static str,
    ) -> Self {
        Self {
            parent_relation,
            path_column,
        }
    }
}

/// Table-level metadata for one entity type.
///
/// Shared read-only for the lifetime of the application (typically behind an
/// `Arc`).
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub table_name: &'static str,
    pub fields: Vec<FieldInfo>,
    pub relationships: Vec<RelationshipInfo>,
    pub tree: Option<TreeInfo>,
    pub soft_delete_column: Option<&'static str>,
}

impl EntityMetadata {
    pub fn new(table_name: &'static str) -> Self {
        Self {
            table_name,
            fields: Vec::new(),
            relationships: Vec::new(),
            tree: None,
            soft_delete_column: None,
        }
    }

    /// Derive metadata from a typed model.
    pub fn from_model<M: Model>() -> Self {
        Self {
            table_name: M::TABLE_NAME,
            fields: M::fields().to_vec(),
            relationships: M::RELATIONSHIPS.to_vec(),
            tree: M::TREE,
            soft_delete_column: M::SOFT_DELETE_COLUMN,
        }
    }

    #[must_use]
    pub fn field(mut self, field: FieldInfo) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn relation(mut self, relation: RelationshipInfo) -> Self {
        self.relationships.push(relation);
        self
    }

    #[must_use]
    pub fn tree(mut self, tree: TreeInfo) -> Self {
        self.tree = Some(tree);
        self
    }

    #[must_use]
    pub fn soft_delete(mut self, column: &'static str) -> Self {
        self.soft_delete_column = Some(column);
        self
    }

    /// Primary-key column names in declaration order.
    pub fn primary_key_columns(&self) -> Vec<&'static str> {
        self.fields
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| f.column_name)
            .collect()
    }

    /// Look up a field by its column name.
    pub fn field_by_column(&self, column: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.column_name == column)
    }

    /// Look up a relation by name.
    pub fn find_relation(&self, name: &str) -> Option<&RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// The tree's parent relation, if this entity is a materialized-path tree.
    pub fn tree_parent(&self) -> Option<(&TreeInfo, &RelationshipInfo)> {
        let tree = self.tree.as_ref()?;
        let relation = self.find_relation(tree.parent_relation)?;
        Some((tree, relation))
    }

    /// Build the identifier of a row from a column lookup.
    ///
    /// `None` if any primary-key column is missing or NULL.
    pub fn id_map<'a, F>(&self, mut column_value: F) -> Option<IdMap>
    where
        F: FnMut(&str) -> Option<&'a Value>,
    {
        let mut id = IdMap::new();
        for column in self.primary_key_columns() {
            match column_value(column) {
                Some(v) if !v.is_null() => {
                    id.insert(column, v.clone());
                }
                _ => return None,
            }
        }
        if id.is_empty() { None } else { Some(id) }
    }

    /// Check that the metadata is internally consistent.
    ///
    /// Every table needs a primary key; key columns of owning relations must
    /// be declared fields; tree parents must be self-referencing many-to-one
    /// relations on a single-column primary key.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.primary_key_columns().is_empty() {
            return Err(Error::Metadata(format!(
                "table '{}' has no primary key",
                self.table_name
            )));
        }
        for relation in &self.relationships {
            for column in relation.local_key_cols() {
                if self.field_by_column(column).is_none() {
                    return Err(Error::Metadata(format!(
                        "relation '{}.{}' uses undeclared column '{}'",
                        self.table_name, relation.name, column
                    )));
                }
            }
            if let Some(link) = &relation.link_table {
                if link.local_cols().is_empty() || link.remote_cols().is_empty() {
                    return Err(Error::Metadata(format!(
                        "junction table '{}' of '{}.{}' has no key columns",
                        link.table_name, self.table_name, relation.name
                    )));
                }
            }
        }
        if let Some(tree) = &self.tree {
            let Some(parent) = self.find_relation(tree.parent_relation) else {
                return Err(Error::Metadata(format!(
                    "tree parent relation '{}' not found on '{}'",
                    tree.parent_relation, self.table_name
                )));
            };
            if parent.kind != RelationshipKind::ManyToOne
                || parent.related_table != self.table_name
                || parent.local_key_cols().is_empty()
            {
                return Err(Error::Metadata(format!(
                    "tree parent relation '{}.{}' must be a self-referencing many-to-one",
                    self.table_name, parent.name
                )));
            }
            if self.primary_key_columns().len() != 1 {
                return Err(Error::Metadata(format!(
                    "materialized-path table '{}' needs a single-column primary key",
                    self.table_name
                )));
            }
            if self.field_by_column(tree.path_column).is_none() {
                return Err(Error::Metadata(format!(
                    "path column '{}' not declared on '{}'",
                    tree.path_column, self.table_name
                )));
            }
        }
        Ok(())
    }
}
