//! SQL type definitions and logical column kinds.

use crate::dialect::Dialect;
use crate::value::Value;

/// SQL data types of a mapped column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    // Integer types
    TinyInt,
    SmallInt,
    Integer,
    BigInt,

    // Floating point
    Real,
    Double,

    // Fixed precision
    Decimal { precision: u8, scale: u8 },

    // Boolean
    Boolean,

    // String types
    VarChar(u32),
    Text,

    // Binary types
    Blob,

    // Date/time types
    Date,
    Time,
    DateTime,
    Timestamp,
    TimestampTz,

    // UUID
    Uuid,

    // JSON
    Json,
    JsonB,

    // Arrays (PostgreSQL)
    Array(Box<SqlType>),

    // Custom type name
    Custom(&'static str),
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::TinyInt => "TINYINT".to_string(),
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Real => "REAL".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::VarChar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Time => "TIME".to_string(),
            SqlType::DateTime => "DATETIME".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::TimestampTz => "TIMESTAMPTZ".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSON".to_string(),
            SqlType::JsonB => "JSONB".to_string(),
            SqlType::Array(inner) => format!("{}[]", inner.sql_name()),
            SqlType::Custom(name) => name.to_string(),
        }
    }

    /// Check if this type is an integer type.
    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer | SqlType::BigInt
        )
    }
}

/// Logical kind of a column, resolved once from its [`SqlType`].
///
/// The write path coerces values by this tag instead of re-inspecting the
/// declared type on every statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Boolean,
    Date,
    Time,
    Timestamp,
    JsonArray,
    JsonObject,
    /// Enum stored as its string label.
    EnumString,
    Array,
    Other,
}

impl ColumnKind {
    /// Resolve the kind of a declared SQL type.
    ///
    /// JSON columns default to [`ColumnKind::JsonObject`]; enum columns are
    /// declared through `FieldInfo::enum_string`.
    pub const fn of(sql_type: &SqlType) -> Self {
        match sql_type {
            SqlType::Boolean => ColumnKind::Boolean,
            SqlType::Date => ColumnKind::Date,
            SqlType::Time => ColumnKind::Time,
            SqlType::DateTime | SqlType::Timestamp | SqlType::TimestampTz => ColumnKind::Timestamp,
            SqlType::Json | SqlType::JsonB => ColumnKind::JsonObject,
            SqlType::Array(_) => ColumnKind::Array,
            _ => ColumnKind::Other,
        }
    }

    /// Coerce a bound value into the representation `dialect` stores for
    /// this kind of column.
    pub fn prepare_value(self, dialect: Dialect, value: Value) -> Value {
        if value.is_null() {
            return value;
        }
        match (self, dialect) {
            (ColumnKind::Boolean, Dialect::Sqlite | Dialect::Mysql) => match value.as_bool() {
                Some(b) => Value::Int(i32::from(b)),
                None => value,
            },
            (ColumnKind::Boolean, Dialect::Postgres) => match value.as_bool() {
                Some(b) => Value::Bool(b),
                None => value,
            },
            (ColumnKind::JsonArray | ColumnKind::JsonObject, Dialect::Sqlite | Dialect::Mysql) => {
                match value {
                    Value::Json(json) => Value::Text(json.to_string()),
                    Value::Array(items) => Value::Text(array_to_json(&items).to_string()),
                    other => other,
                }
            }
            (ColumnKind::JsonArray, Dialect::Postgres) => match value {
                Value::Array(items) => Value::Json(array_to_json(&items)),
                other => other,
            },
            (ColumnKind::EnumString, _) => match value {
                Value::Text(_) => value,
                other => match other.to_path_segment() {
                    Some(label) => Value::Text(label),
                    None => other,
                },
            },
            (ColumnKind::Array, Dialect::Sqlite | Dialect::Mysql) => match value {
                Value::Array(items) => Value::Text(array_to_json(&items).to_string()),
                other => other,
            },
            _ => value,
        }
    }
}

fn array_to_json(items: &[Value]) -> serde_json::Value {
    serde_json::Value::Array(items.iter().map(value_to_json).collect())
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => value
            .as_i64()
            .map_or(serde_json::Value::Null, serde_json::Value::from),
        Value::Float(_) | Value::Double(_) => value
            .as_f64()
            .map_or(serde_json::Value::Null, serde_json::Value::from),
        Value::Json(json) => json.clone(),
        Value::Array(items) => array_to_json(items),
        Value::Text(s) | Value::Decimal(s) => serde_json::Value::String(s.clone()),
        other => serde_json::Value::String(other.to_string()),
    }
}
