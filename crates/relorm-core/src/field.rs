//! Field and column definitions.

use crate::types::{ColumnKind, SqlType};

/// Referential action for foreign key constraints (ON DELETE / ON UPDATE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferentialAction {
    /// No action - raise error if any references exist.
    #[default]
    NoAction,
    /// Restrict - same as NO ACTION.
    Restrict,
    /// Cascade - automatically delete/update referencing rows.
    Cascade,
    /// Set null - set referencing columns to NULL.
    SetNull,
}

impl ReferentialAction {
    /// Get the SQL representation of this action.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
        }
    }
}

/// Metadata about a mapped column.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// Rust field name
    pub name: &'static str,
    /// Database column name (may differ from field name)
    pub column_name: &'static str,
    /// SQL type for this field
    pub sql_type: SqlType,
    /// Logical kind resolved from `sql_type` at construction
    pub kind: ColumnKind,
    /// Whether this field is nullable
    pub nullable: bool,
    /// Whether this is a primary key
    pub primary_key: bool,
    /// Whether this field auto-increments
    pub auto_increment: bool,
    /// Whether the database produces this value (skipped on insert)
    pub generated: bool,
    /// Foreign key reference (table.column)
    pub foreign_key: Option<&'static str>,
    /// Referential action for ON DELETE (only valid with foreign_key)
    pub on_delete: Option<ReferentialAction>,
}

impl FieldInfo {
    /// Create a new field info with minimal required data.
    pub const fn new(name: &'static str, column_name: &'static str, sql_type: SqlType) -> Self {
        let kind = ColumnKind::of(&sql_type);
        Self {
            name,
            column_name,
            sql_type,
            kind,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            generated: false,
            foreign_key: None,
            on_delete: None,
        }
    }

    /// Set the database column name.
    pub const fn column(mut self, name: &'static str) -> Self {
        self.column_name = name;
        self
    }

    /// Set nullable flag.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set primary key flag.
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    /// Set auto-increment flag. Auto-increment columns are also generated.
    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self.generated = value || self.generated;
        self
    }

    /// Mark the column as produced by the database.
    pub const fn generated(mut self, value: bool) -> Self {
        self.generated = value;
        self
    }

    /// Set foreign key reference.
    pub const fn foreign_key(mut self, reference: &'static str) -> Self {
        self.foreign_key = Some(reference);
        self
    }

    /// Set ON DELETE action for foreign key.
    pub const fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = Some(action);
        self
    }

    /// Store values of this column as enum labels.
    pub const fn enum_string(mut self) -> Self {
        self.kind = ColumnKind::EnumString;
        self
    }

    /// Treat a JSON column as holding an array.
    pub const fn json_array(mut self) -> Self {
        self.kind = ColumnKind::JsonArray;
        self
    }

    /// Split the `table.column` foreign key reference.
    pub fn foreign_key_target(&self) -> Option<(&'static str, &'static str)> {
        self.foreign_key.and_then(|r| r.split_once('.'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_builders() {
        let id = FieldInfo::new("id", "id", SqlType::BigInt)
            .primary_key(true)
            .auto_increment(true);
        assert!(id.primary_key);
        assert!(id.generated);
        assert_eq!(id.kind, ColumnKind::Other);

        let parent = FieldInfo::new("parent_id", "parent_id", SqlType::BigInt)
            .nullable(true)
            .foreign_key("category.id")
            .on_delete(ReferentialAction::SetNull);
        assert_eq!(parent.foreign_key_target(), Some(("category", "id")));
        assert_eq!(parent.on_delete.map(|a| a.as_sql()), Some("SET NULL"));
    }

    #[test]
    fn test_kind_resolved_at_construction() {
        let flag = FieldInfo::new("active", "is_active", SqlType::Boolean);
        assert_eq!(flag.kind, ColumnKind::Boolean);
        assert_eq!(flag.column_name, "is_active");

        let status = FieldInfo::new("status", "status", SqlType::Text).enum_string();
        assert_eq!(status.kind, ColumnKind::EnumString);

        let tags = FieldInfo::new("tags", "tags", SqlType::Json).json_array();
        assert_eq!(tags.kind, ColumnKind::JsonArray);
    }

    #[test]
    fn test_const_construction() {
        const NAME: FieldInfo = FieldInfo::new("name", "name", SqlType::Text).column("title");
        assert_eq!(NAME.column_name, "title");
    }
}
