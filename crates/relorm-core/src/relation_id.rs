//! Relation id projection.
//!
//! A [`RelationIdAttribute`] asks a query to load only the identifiers of a
//! relation's members (instead of the related rows) and map them onto a
//! property of each parent. The attribute is built when the projection is
//! declared and consumed by [`RelationIdAttribute::collect`] once the query
//! has produced its rows.

use crate::row::Row;
use crate::value::Value;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// How related ids are shaped in the result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationIdShape {
    /// Single-column ids fold to their scalar value.
    #[default]
    Folded,
    /// Every id stays a column map, even with one column.
    Rows,
}

/// A single relation-id projection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationIdAttribute {
    alias: String,
    relation: String,
    map_to_property: String,
    junction_alias: String,
    shape: RelationIdShape,
}

/// One related identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum RelatedId {
    Scalar(Value),
    Map(BTreeMap<String, Value>),
}

/// Related ids of one parent row.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationIdEntry {
    pub parent: BTreeMap<String, Value>,
    pub ids: Vec<RelatedId>,
}

/// Result of collecting a relation-id projection.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationIdResult {
    pub map_to_property: String,
    pub entries: Vec<RelationIdEntry>,
}

impl RelationIdAttribute {
    /// Declare a projection of `relation_path` (`alias.relation`) onto
    /// `map_to_property`.
    #[allow(clippy::result_large_err)]
    pub fn new(relation_path: &str, map_to_property: &str) -> Result<Self> {
        let Some((alias, relation)) = relation_path.split_once('.') else {
            return Err(Error::Metadata(format!(
                "relation path '{}' must have the form alias.relation",
                relation_path
            )));
        };
        if alias.is_empty() || relation.is_empty() || relation.contains('.') {
            return Err(Error::Metadata(format!(
                "relation path '{}' must have the form alias.relation",
                relation_path
            )));
        }
        if map_to_property.is_empty() {
            return Err(Error::Metadata(
                "relation id projection needs a target property".to_string(),
            ));
        }
        Ok(Self {
            alias: alias.to_string(),
            relation: relation.to_string(),
            map_to_property: map_to_property.to_string(),
            junction_alias: format!("{}_{}_rid", alias, relation),
            shape: RelationIdShape::Folded,
        })
    }

    #[must_use]
    pub fn shape(mut self, shape: RelationIdShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }

    pub fn relation_path(&self) -> String {
        format!("{}.{}", self.alias, self.relation)
    }

    /// Alias under which the junction (or related) table is joined.
    pub fn junction_alias(&self) -> &str {
        &self.junction_alias
    }

    pub fn map_to_property(&self) -> &str {
        &self.map_to_property
    }

    /// Group raw result rows by parent and fold the related ids.
    ///
    /// Parents keep the order in which they first appear. Rows whose related
    /// columns are all NULL (an outer join without match) contribute a parent
    /// with no ids.
    #[allow(clippy::result_large_err)]
    pub fn collect(
        self,
        rows: &[Row],
        parent_columns: &[&str],
        related_columns: &[&str],
    ) -> Result<RelationIdResult> {
        let mut entries: Vec<RelationIdEntry> = Vec::new();

        for row in rows {
            let parent = pick(row, parent_columns)?;
            let related = pick(row, related_columns)?;

            let index = match entries
                .iter()
                .position(|e| same_key(&e.parent, &parent))
            {
                Some(i) => i,
                None => {
                    entries.push(RelationIdEntry {
                        parent,
                        ids: Vec::new(),
                    });
                    entries.len() - 1
                }
            };

            if related.values().all(Value::is_null) {
                continue;
            }
            let id = if self.shape == RelationIdShape::Folded && related.len() == 1 {
                match related.into_values().next() {
                    Some(v) => RelatedId::Scalar(v),
                    None => continue,
                }
            } else {
                RelatedId::Map(related)
            };
            entries[index].ids.push(id);
        }

        tracing::trace!(
            relation = %self.relation_path(),
            parents = entries.len(),
            "collected relation ids"
        );
        Ok(RelationIdResult {
            map_to_property: self.map_to_property,
            entries,
        })
    }
}

#[allow(clippy::result_large_err)]
fn pick(row: &Row, columns: &[&str]) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for column in columns {
        let Some(value) = row.get_by_name(column) else {
            return Err(Error::Metadata(format!(
                "column '{}' missing from relation id rows",
                column
            )));
        };
        out.insert((*column).to_string(), value.clone());
    }
    Ok(out)
}

fn same_key(a: &BTreeMap<String, Value>, b: &BTreeMap<String, Value>) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|((ka, va), (kb, vb))| ka == kb && va.same_identity(vb))
}
