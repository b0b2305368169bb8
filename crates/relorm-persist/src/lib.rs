//! Unit-of-work persistence for relorm.
//!
//! `relorm-persist` turns a set of in-memory entities and a [`ChangeSet`]
//! (what to save, what to remove) into an ordered sequence of SQL statements
//! and runs them through a [`Connection`].
//!
//! # Pipeline
//!
//! - **Build**: [`SubjectGraphBuilder`] expands the change set through
//!   cascades into a [`SubjectRegistry`], one subject per touched entity,
//!   each with its insert, update or remove intent and its relation work.
//! - **Order**: [`OperationOrderer`] sorts inserts so referenced rows come
//!   first and removals so referencing rows go first, failing with
//!   [`PersistError::Cycle`] before any statement is issued.
//! - **Execute**: [`SubjectExecutor`] writes the plan phase by phase,
//!   propagating generated ids, maintaining materialized paths and batching
//!   junction and detach statements.
//!
//! [`Persistor`] wraps the three steps in a transaction.
//!
//! # Example
//!
//! ```ignore
//! let mut set = EntitySet::new();
//! let user = set.insert(Entity::new(user_meta).with_value("name", "ada"));
//! let post = set.insert(Entity::new(post_meta).with_value("title", "hello"));
//! set.set_many(user, "posts", vec![post])?;
//!
//! let result = Persistor::new().save(&cx, &conn, &mut set, &[user]).await?;
//! assert_eq!(result.inserted, 2);
//! ```

/// Propagate every non-`Ok` arm of an `Outcome`, converting the error.
macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            ::relorm_core::Outcome::Ok(v) => v,
            ::relorm_core::Outcome::Err(e) => return ::relorm_core::Outcome::Err(e.into()),
            ::relorm_core::Outcome::Cancelled(r) => return ::relorm_core::Outcome::Cancelled(r),
            ::relorm_core::Outcome::Panicked(p) => return ::relorm_core::Outcome::Panicked(p),
        }
    };
}

/// Lift a `Result` into an `Outcome`-returning function.
macro_rules! try_result {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return ::relorm_core::Outcome::Err(e.into()),
        }
    };
}

pub(crate) use try_outcome;
pub(crate) use try_result;

pub mod builder;
pub mod change_tracker;
pub mod config;
pub mod entity;
pub mod error;
pub mod executor;
pub mod graph;
pub mod junction;
pub mod orderer;
pub mod relation_query;
pub mod relation_remover;
pub mod statement;
pub mod subject;
pub mod tree;

#[cfg(test)]
mod testing;

pub use builder::{ChangeSet, SubjectGraphBuilder};
pub use change_tracker::{
    ChangeTracker, ConnectionLookup, DatabaseEntityLoader, EntitySnapshot, NoDatabaseLookup,
    same_key,
};
pub use config::PersistConfig;
pub use entity::{Entity, EntityId, EntitySet, RelationValue};
pub use error::{GraphError, PersistError};
pub use executor::{PersistResult, SubjectExecutor, SubjectReport};
pub use graph::DependencyGraph;
pub use junction::JunctionWriter;
pub use orderer::{ExecutionPlan, OperationOrderer};
pub use relation_query::RelationQuery;
pub use relation_remover::RelationRemover;
pub use statement::{ParamList, StatementRunner};
pub use subject::{
    JunctionInsert, Propagation, RelationRemoval, RemovalKind, Subject, SubjectId,
    SubjectOperation, SubjectRegistry, SubjectState,
};
pub use tree::{MaterializedPathMaintainer, rewrite_path};

use relorm_core::{
    Connection, Cx, Dialect, Error, Outcome, QueryLogger, Row, TracingQueryLogger,
    TransactionOps, Value,
};
use std::future::Future;
use std::sync::Arc;

/// Entry point for saving and removing entity graphs.
///
/// Each call builds its own subject registry and plan; nothing is shared
/// between calls except the configuration and the query logger.
#[derive(Clone)]
pub struct Persistor {
    config: PersistConfig,
    logger: Arc<dyn QueryLogger>,
}

impl Default for Persistor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Persistor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Persistor {
    /// Default configuration, queries logged through `tracing`.
    pub fn new() -> Self {
        Self::with_config(PersistConfig::default())
    }

    pub fn with_config(config: PersistConfig) -> Self {
        Self {
            config,
            logger: Arc::new(TracingQueryLogger),
        }
    }

    /// Replace the query logger.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn QueryLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    /// Lazy loader for `owner.relation` using this persistor's dialect
    /// override and query logger.
    pub fn relation<'c, C: Connection>(
        &'c self,
        conn: &'c C,
        owner: &Entity,
        relation: &str,
    ) -> Result<RelationQuery<'c, C>, PersistError> {
        Ok(RelationQuery::new(conn, &self.config, owner, relation)?.logger(self.logger.as_ref()))
    }

    /// Insert or update `roots` and everything they cascade to.
    pub async fn save<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        set: &mut EntitySet,
        roots: &[EntityId],
    ) -> Outcome<PersistResult, PersistError> {
        let change_set = roots.iter().fold(ChangeSet::new(), |cs, id| cs.save(*id));
        self.apply(cx, conn, set, &change_set).await
    }

    /// Delete `roots` and everything they cascade to.
    pub async fn remove<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        set: &mut EntitySet,
        roots: &[EntityId],
    ) -> Outcome<PersistResult, PersistError> {
        let change_set = roots.iter().fold(ChangeSet::new(), |cs, id| cs.remove(*id));
        self.apply(cx, conn, set, &change_set).await
    }

    /// Mark `roots` deleted through their soft-delete column.
    pub async fn soft_remove<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        set: &mut EntitySet,
        roots: &[EntityId],
    ) -> Outcome<PersistResult, PersistError> {
        let change_set = roots
            .iter()
            .fold(ChangeSet::new(), |cs, id| cs.soft_remove(*id));
        self.apply(cx, conn, set, &change_set).await
    }

    /// Run a whole change set.
    ///
    /// With [`PersistConfig::transaction`] enabled the statements run inside
    /// one transaction: committed on success, rolled back on any other
    /// outcome. Entity snapshots are refreshed only after the commit.
    #[tracing::instrument(level = "debug", skip_all, fields(
        saves = change_set.saves().len(),
        removals = change_set.removals().len(),
        transaction = self.config.transaction,
    ))]
    pub async fn apply<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        set: &mut EntitySet,
        change_set: &ChangeSet,
    ) -> Outcome<PersistResult, PersistError> {
        let dialect = self.config.resolve_dialect(conn.dialect());

        if !self.config.transaction {
            let tx = Autocommit { conn };
            let loader = ConnectionLookup::new(&tx)
                .dialect(dialect)
                .logger(self.logger.as_ref(), self.config.slow_query_threshold);
            return self.apply_in(cx, &tx, set, change_set, &loader).await;
        }

        let tx = match conn.begin(cx).await {
            Outcome::Ok(tx) => tx,
            Outcome::Err(e) => return Outcome::Err(PersistError::statement("BEGIN", &[], e)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let outcome = {
            let loader = ConnectionLookup::new(&tx)
                .dialect(dialect)
                .logger(self.logger.as_ref(), self.config.slow_query_threshold);
            self.run(cx, &tx, set, change_set, &loader).await
        };

        match outcome {
            Outcome::Ok(result) => {
                match tx.commit(cx).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => {
                        return Outcome::Err(PersistError::statement("COMMIT", &[], e));
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                try_result!(record_snapshots(set, &result));
                tracing::debug!(statements = result.statements, "change set committed");
                Outcome::Ok(result)
            }
            other => {
                if let Outcome::Err(e) = tx.rollback(cx).await {
                    tracing::warn!(error = %e, "rollback failed");
                }
                other
            }
        }
    }

    /// Save `roots` inside a transaction owned by the caller.
    pub async fn save_in<T: TransactionOps>(
        &self,
        cx: &Cx,
        tx: &T,
        set: &mut EntitySet,
        roots: &[EntityId],
    ) -> Outcome<PersistResult, PersistError> {
        let change_set = roots.iter().fold(ChangeSet::new(), |cs, id| cs.save(*id));
        let loader = ConnectionLookup::new(tx)
            .dialect(self.config.resolve_dialect(tx.dialect()))
            .logger(self.logger.as_ref(), self.config.slow_query_threshold);
        self.apply_in(cx, tx, set, &change_set, &loader).await
    }

    /// Run a change set inside a transaction owned by the caller, resolving
    /// database state through `loader`.
    ///
    /// Nothing is committed or rolled back here; snapshots are refreshed as
    /// soon as the plan has executed.
    pub async fn apply_in<T, L>(
        &self,
        cx: &Cx,
        tx: &T,
        set: &mut EntitySet,
        change_set: &ChangeSet,
        loader: &L,
    ) -> Outcome<PersistResult, PersistError>
    where
        T: TransactionOps,
        L: DatabaseEntityLoader,
    {
        let result = try_outcome!(self.run(cx, tx, set, change_set, loader).await);
        try_result!(record_snapshots(set, &result));
        Outcome::Ok(result)
    }

    async fn run<T, L>(
        &self,
        cx: &Cx,
        tx: &T,
        set: &mut EntitySet,
        change_set: &ChangeSet,
        loader: &L,
    ) -> Outcome<PersistResult, PersistError>
    where
        T: TransactionOps,
        L: DatabaseEntityLoader,
    {
        if change_set.is_empty() {
            return Outcome::Ok(PersistResult::default());
        }
        let mut registry = try_outcome!(SubjectGraphBuilder::build(cx, set, change_set, loader).await);
        let plan = try_result!(OperationOrderer::order(&registry, set));
        if plan.is_empty() {
            tracing::debug!(subjects = registry.len(), "nothing to write");
        }
        let mut executor = SubjectExecutor::new(&self.config, self.logger.as_ref());
        let mut result = try_outcome!(executor.execute(cx, tx, set, &mut registry, &plan).await);
        result.statements += loader.issued();
        Outcome::Ok(result)
    }
}

/// Take the written state of every finished subject as its database state.
fn record_snapshots(set: &mut EntitySet, result: &PersistResult) -> Result<(), PersistError> {
    for subject in &result.subjects {
        if subject.state != SubjectState::Done {
            continue;
        }
        match subject.operation {
            SubjectOperation::Insert | SubjectOperation::Update | SubjectOperation::None => {
                set.refresh_snapshot(subject.entity)?;
            }
            SubjectOperation::Remove(RemovalKind::Hard) => set.clear_snapshot(subject.entity)?,
            SubjectOperation::Remove(RemovalKind::Soft) => {}
        }
    }
    Ok(())
}

/// Statements straight on the connection, each committed on its own.
struct Autocommit<'c, C> {
    conn: &'c C,
}

impl<C: Connection> TransactionOps for Autocommit<'_, C> {
    fn dialect(&self) -> Dialect {
        self.conn.dialect()
    }

    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        self.conn.query(cx, sql, params)
    }

    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        self.conn.query_one(cx, sql, params)
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.conn.execute(cx, sql, params)
    }

    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        self.conn.insert(cx, sql, params)
    }

    fn commit(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn rollback(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }
}
