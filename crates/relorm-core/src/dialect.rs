//! SQL dialects.
//!
//! The persistence engine never builds SQL through string interpolation of
//! values: identifiers go through [`Dialect::escape_identifier`] and values are
//! bound with [`Dialect::placeholder`]. [`Dialect::escape_literal`] exists for
//! the few places where a literal must be inlined (DDL-ish fragments, logs).

use crate::value::Value;

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are doubled.
    pub fn escape_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Render a value as an inline SQL literal.
    pub fn escape_literal(self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => match self {
                Dialect::Postgres => (if *b { "TRUE" } else { "FALSE" }).to_string(),
                Dialect::Sqlite | Dialect::Mysql => (if *b { "1" } else { "0" }).to_string(),
            },
            Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
                value.as_i64().map_or_else(String::new, |v| v.to_string())
            }
            Value::Float(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Decimal(s) => s.clone(),
            Value::Text(s) => self.quote_string(s),
            Value::Json(v) => self.quote_string(&v.to_string()),
            Value::Uuid(_) => self.quote_string(&value.to_path_segment().unwrap_or_default()),
            Value::Bytes(b) => {
                let hex: String = b.iter().map(|byte| format!("{:02x}", byte)).collect();
                match self {
                    Dialect::Postgres => format!("'\\x{}'", hex),
                    Dialect::Sqlite | Dialect::Mysql => format!("X'{}'", hex),
                }
            }
            Value::Date(_)
            | Value::Time(_)
            | Value::Timestamp(_)
            | Value::TimestampTz(_)
            | Value::Array(_) => self.quote_string(&value.to_string()),
        }
    }

    fn quote_string(self, s: &str) -> String {
        let mut escaped = s.replace('\'', "''");
        if self == Dialect::Mysql {
            escaped = escaped.replace('\\', "\\\\");
        }
        format!("'{}'", escaped)
    }

    /// Concatenate two SQL expressions.
    pub fn concat(self, left: &str, right: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => format!("{} || {}", left, right),
            Dialect::Mysql => format!("CONCAT({}, {})", left, right),
        }
    }

    /// Escape `%`, `_` and the escape character so `text` matches literally
    /// inside a LIKE pattern.
    pub fn escape_like(self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            if matches!(ch, '%' | '_' | '\\') {
                out.push('\\');
            }
            out.push(ch);
        }
        out
    }

    /// The `ESCAPE` clause matching [`escape_like`](Self::escape_like).
    pub const fn like_escape_clause(self) -> &'static str {
        match self {
            Dialect::Postgres | Dialect::Sqlite => "ESCAPE '\\'",
            Dialect::Mysql => "ESCAPE '\\\\'",
        }
    }

    /// Expression for the current timestamp.
    pub const fn current_timestamp(self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }

    /// Check if this dialect has native array columns.
    pub const fn supports_arrays(self) -> bool {
        matches!(self, Dialect::Postgres)
    }
}
