//! Model trait for typed struct mapping.
//!
//! Persistence works on dynamic entities described by
//! [`EntityMetadata`](crate::EntityMetadata); `Model` is the typed front door
//! that produces both the metadata and the column values of a struct.

use crate::Result;
use crate::field::FieldInfo;
use crate::metadata::TreeInfo;
use crate::relationship::RelationshipInfo;
use crate::row::Row;
use crate::value::Value;

/// Trait for types that can be mapped to database tables.
///
/// # Example
///
/// ```ignore
/// struct Category {
///     id: Option<i64>,
///     name: String,
///     parent_id: Option<i64>,
/// }
///
/// impl Model for Category {
///     const TABLE_NAME: &'static str = "category";
///     const PRIMARY_KEY: &'static [&'static str] = &["id"];
///     const TREE: Option<TreeInfo> = Some(TreeInfo::materialized_path("parent", "mpath"));
///     // ...
/// }
/// ```
pub trait Model: Sized + Send + Sync {
    /// The name of the database table.
    const TABLE_NAME: &'static str;

    /// The primary key column name(s).
    const PRIMARY_KEY: &'static [&'static str];

    /// Relationship metadata for this model.
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[];

    /// Materialized-path tree settings, if the table is a tree.
    const TREE: Option<TreeInfo> = None;

    /// Column set to the deletion time by a soft removal.
    const SOFT_DELETE_COLUMN: Option<&'static str> = None;

    /// Get field metadata for all columns.
    fn fields() -> &'static [FieldInfo];

    /// Convert this model instance to a row of values.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Construct a model instance from a database row.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;

    /// Get the value of the primary key field(s).
    fn primary_key_value(&self) -> Vec<Value>;

    /// Check if this is a new record (primary key is None/default).
    fn is_new(&self) -> bool {
        self.primary_key_value().iter().all(Value::is_null)
    }
}
