//! Database state of entities and change detection against it.
//!
//! A subject's database state is an [`EntitySnapshot`]: the column values of
//! its row and, for collection relations, the keys of the related rows. The
//! builder obtains it from the entity itself or from a
//! [`DatabaseEntityLoader`]; the executor diffs against it at write time.

use crate::error::PersistError;
use crate::statement::{ParamList, observe, wrap_failure};
use relorm_core::{
    Cx, Dialect, EntityMetadata, IdMap, Outcome, QueryLogger, RelationshipKind, Row,
    TracingQueryLogger, TransactionOps, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Database state of one row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Column values as stored.
    pub values: BTreeMap<String, Value>,
    /// Related row keys per collection relation, each in the related
    /// table's primary-key column order.
    pub relations: BTreeMap<String, Vec<Vec<Value>>>,
}

impl EntitySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_row(row: &Row) -> Self {
        let values = row
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        Self {
            values,
            relations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_value(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.values.insert(column.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn with_related(mut self, relation: &str, keys: Vec<Vec<Value>>) -> Self {
        self.relations.insert(relation.to_string(), keys);
        self
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn related(&self, relation: &str) -> Option<&[Vec<Value>]> {
        self.relations.get(relation).map(Vec::as_slice)
    }

    /// Values of `columns` in order, `None` if any is missing or NULL.
    pub fn key_values(&self, columns: &[&str]) -> Option<Vec<Value>> {
        let mut out = Vec::with_capacity(columns.len());
        for column in columns {
            match self.values.get(*column) {
                Some(v) if !v.is_null() => out.push(v.clone()),
                _ => return None,
            }
        }
        if out.is_empty() { None } else { Some(out) }
    }

    /// Serialize for logging or storage alongside the entity.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

/// Positional key equality, tolerant of integer width.
pub fn same_key(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_identity(y))
}

/// Change detection between current values and a snapshot.
pub struct ChangeTracker;

impl ChangeTracker {
    /// Columns whose current value differs from the snapshot.
    ///
    /// Primary-key columns, generated columns and `skip` are never reported.
    /// A column absent from the current values is left alone.
    #[tracing::instrument(level = "trace", skip_all, fields(table = metadata.table_name))]
    pub fn changed_columns(
        metadata: &EntityMetadata,
        current: &BTreeMap<&'static str, Value>,
        snapshot: &EntitySnapshot,
        skip: &[&str],
    ) -> Vec<&'static str> {
        let mut changed = Vec::new();
        for field in &metadata.fields {
            if field.primary_key || field.generated || skip.contains(&field.column_name) {
                continue;
            }
            let Some(value) = current.get(field.column_name) else {
                continue;
            };
            let dirty = match snapshot.value(field.column_name) {
                Some(old) => !old.same_identity(value),
                None => !value.is_null(),
            };
            if dirty {
                changed.push(field.column_name);
            }
        }
        tracing::trace!(changed_count = changed.len(), "dirty check result");
        changed
    }

    /// Split a collection relation into added and removed member keys.
    pub fn relation_diff(
        previous: &[Vec<Value>],
        current: &[Vec<Value>],
    ) -> (Vec<Vec<Value>>, Vec<Vec<Value>>) {
        let added = current
            .iter()
            .filter(|k| !previous.iter().any(|p| same_key(p, k)))
            .cloned()
            .collect();
        let removed = previous
            .iter()
            .filter(|p| !current.iter().any(|k| same_key(p, k)))
            .cloned()
            .collect();
        (added, removed)
    }
}

/// Looks up the database state of an entity by identifier.
pub trait DatabaseEntityLoader: Sync {
    fn load(
        &self,
        cx: &Cx,
        metadata: &EntityMetadata,
        id: &IdMap,
    ) -> impl Future<Output = Outcome<Option<EntitySnapshot>, PersistError>> + Send;

    /// Statements issued by this loader so far.
    fn issued(&self) -> usize {
        0
    }
}

/// Loader that never finds a row: entities without their own snapshot are
/// inserted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDatabaseLookup;

impl DatabaseEntityLoader for NoDatabaseLookup {
    fn load(
        &self,
        _cx: &Cx,
        _metadata: &EntityMetadata,
        _id: &IdMap,
    ) -> impl Future<Output = Outcome<Option<EntitySnapshot>, PersistError>> + Send {
        async { Outcome::Ok(None) }
    }
}

/// Loader reading through an open transaction.
///
/// Issues a point SELECT by identifier and, when the row exists, one SELECT
/// per one-to-many or owning many-to-many relation for the related keys.
/// Every SELECT is reported to the query logger like any other statement.
pub struct ConnectionLookup<'t, T> {
    tx: &'t T,
    dialect: Dialect,
    logger: &'t dyn QueryLogger,
    slow_threshold: Option<Duration>,
    issued: AtomicUsize,
}

impl<'t, T: TransactionOps> ConnectionLookup<'t, T> {
    pub fn new(tx: &'t T) -> Self {
        Self {
            dialect: tx.dialect(),
            tx,
            logger: &TracingQueryLogger,
            slow_threshold: None,
            issued: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Report lookups to `logger`, flagging those slower than `slow_threshold`.
    #[must_use]
    pub fn logger(mut self, logger: &'t dyn QueryLogger, slow_threshold: Option<Duration>) -> Self {
        self.logger = logger;
        self.slow_threshold = slow_threshold;
        self
    }

    async fn select(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Vec<Row>, PersistError> {
        tracing::trace!(sql = %sql, "database entity lookup");
        self.issued.fetch_add(1, Ordering::Relaxed);
        self.logger.log_query(sql, params);
        let started = Instant::now();
        let outcome = self.tx.query(cx, sql, params).await;
        observe(self.logger, self.slow_threshold, started, sql, params, &outcome);
        wrap_failure(sql, params, outcome)
    }

    async fn load_snapshot(
        &self,
        cx: &Cx,
        metadata: &EntityMetadata,
        id: &IdMap,
    ) -> Outcome<Option<EntitySnapshot>, PersistError> {
        let d = self.dialect;
        let mut params = ParamList::new(d);
        let condition = params.equals_all(id.iter().map(|(c, v)| (*c, v.clone())));
        let sql = format!(
            "SELECT * FROM {} WHERE {}",
            d.escape_identifier(metadata.table_name),
            condition
        );
        let rows = crate::try_outcome!(self.select(cx, &sql, params.values()).await);
        let Some(row) = rows.first() else {
            return Outcome::Ok(None);
        };
        let mut snapshot = EntitySnapshot::from_row(row);

        let pk = metadata.primary_key_columns();
        let own_key: Vec<Value> = pk.iter().filter_map(|c| id.get(c).cloned()).collect();

        for relation in &metadata.relationships {
            let (table, key_cols, select_cols) = match relation.kind {
                RelationshipKind::OneToMany => (
                    relation.related_table,
                    relation.remote_key_cols().to_vec(),
                    relation.related_primary_key(),
                ),
                RelationshipKind::ManyToMany => match &relation.link_table {
                    Some(link) => (
                        link.table_name,
                        link.local_cols().to_vec(),
                        link.remote_cols().to_vec(),
                    ),
                    None => continue,
                },
                RelationshipKind::OneToOne | RelationshipKind::ManyToOne => continue,
            };
            if key_cols.len() != own_key.len() || select_cols.is_empty() {
                continue;
            }

            let mut params = ParamList::new(d);
            let condition =
                params.equals_all(key_cols.iter().copied().zip(own_key.iter().cloned()));
            let projection: Vec<String> =
                select_cols.iter().map(|c| d.escape_identifier(c)).collect();
            let sql = format!(
                "SELECT {} FROM {} WHERE {}",
                projection.join(", "),
                d.escape_identifier(table),
                condition
            );
            let rows = crate::try_outcome!(self.select(cx, &sql, params.values()).await);
            let keys = rows
                .iter()
                .map(|row| {
                    select_cols
                        .iter()
                        .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
                        .collect()
                })
                .collect();
            snapshot = snapshot.with_related(relation.name, keys);
        }

        Outcome::Ok(Some(snapshot))
    }
}

impl<T: TransactionOps> DatabaseEntityLoader for ConnectionLookup<'_, T> {
    fn load(
        &self,
        cx: &Cx,
        metadata: &EntityMetadata,
        id: &IdMap,
    ) -> impl Future<Output = Outcome<Option<EntitySnapshot>, PersistError>> + Send {
        self.load_snapshot(cx, metadata, id)
    }

    fn issued(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }
}
