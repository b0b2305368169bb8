//! Statement issuing: parameter lists and the instrumented runner.

use crate::error::PersistError;
use relorm_core::{Cx, Dialect, Error, Outcome, QueryLogger, Row, TransactionOps, Value};
use std::time::{Duration, Instant};

/// Positional parameters of one statement under construction.
#[derive(Debug, Clone)]
pub struct ParamList {
    dialect: Dialect,
    values: Vec<Value>,
}

impl ParamList {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            values: Vec::new(),
        }
    }

    /// Bind `value` and return its placeholder.
    pub fn push(&mut self, value: Value) -> String {
        self.values.push(value);
        self.dialect.placeholder(self.values.len())
    }

    /// `"a" = $1 AND "b" = $2` over the given pairs.
    pub fn equals_all<'c, I>(&mut self, pairs: I) -> String
    where
        I: IntoIterator<Item = (&'c str, Value)>,
    {
        let mut parts = Vec::new();
        for (column, value) in pairs {
            let placeholder = self.push(value);
            parts.push(format!(
                "{} = {}",
                self.dialect.escape_identifier(column),
                placeholder
            ));
        }
        parts.join(" AND ")
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Issues statements through a transaction, reporting each to the query
/// logger, timing it against the slow-query threshold and wrapping driver
/// failures with their SQL.
pub struct StatementRunner<'t, T> {
    tx: &'t T,
    dialect: Dialect,
    logger: &'t dyn QueryLogger,
    slow_threshold: Option<Duration>,
    issued: usize,
}

impl<'t, T: TransactionOps> StatementRunner<'t, T> {
    pub fn new(
        tx: &'t T,
        dialect: Dialect,
        logger: &'t dyn QueryLogger,
        slow_threshold: Option<Duration>,
    ) -> Self {
        Self {
            tx,
            dialect,
            logger,
            slow_threshold,
            issued: 0,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Number of statements issued so far.
    pub fn issued(&self) -> usize {
        self.issued
    }

    pub async fn execute(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<u64, PersistError> {
        let started = self.start(sql, params);
        let outcome = self.tx.execute(cx, sql, params).await;
        self.finish(started, sql, params, outcome)
    }

    pub async fn insert(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<i64, PersistError> {
        let started = self.start(sql, params);
        let outcome = self.tx.insert(cx, sql, params).await;
        self.finish(started, sql, params, outcome)
    }

    pub async fn query_one(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Option<Row>, PersistError> {
        let started = self.start(sql, params);
        let outcome = self.tx.query_one(cx, sql, params).await;
        self.finish(started, sql, params, outcome)
    }

    pub async fn query(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Vec<Row>, PersistError> {
        let started = self.start(sql, params);
        let outcome = self.tx.query(cx, sql, params).await;
        self.finish(started, sql, params, outcome)
    }

    fn start(&mut self, sql: &str, params: &[Value]) -> Instant {
        self.issued += 1;
        self.logger.log_query(sql, params);
        Instant::now()
    }

    fn finish<R>(
        &self,
        started: Instant,
        sql: &str,
        params: &[Value],
        outcome: Outcome<R, Error>,
    ) -> Outcome<R, PersistError> {
        observe(self.logger, self.slow_threshold, started, sql, params, &outcome);
        wrap_failure(sql, params, outcome)
    }
}

/// Report the slow-query and error hooks for a finished statement.
pub(crate) fn observe<R>(
    logger: &dyn QueryLogger,
    slow_threshold: Option<Duration>,
    started: Instant,
    sql: &str,
    params: &[Value],
    outcome: &Outcome<R, Error>,
) {
    let elapsed = started.elapsed();
    if slow_threshold.is_some_and(|limit| elapsed > limit) {
        logger.log_query_slow(elapsed, sql, params);
    }
    if let Outcome::Err(e) = outcome {
        logger.log_query_error(e, sql, params);
    }
}

/// Attach the statement to a driver failure.
pub(crate) fn wrap_failure<R>(
    sql: &str,
    params: &[Value],
    outcome: Outcome<R, Error>,
) -> Outcome<R, PersistError> {
    match outcome {
        Outcome::Ok(v) => Outcome::Ok(v),
        Outcome::Err(e) => Outcome::Err(PersistError::statement(sql, params, e)),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CapturingLogger, RecordingConnection};
    use asupersync::runtime::RuntimeBuilder;

    #[test]
    fn test_param_list_placeholders() {
        let mut params = ParamList::new(Dialect::Postgres);
        let cond = params.equals_all([("a", Value::Int(1)), ("b", Value::Int(2))]);
        assert_eq!(cond, "\"a\" = $1 AND \"b\" = $2");
        assert_eq!(params.push(Value::Null), "$3");
        assert_eq!(params.len(), 3);

        let mut mysql = ParamList::new(Dialect::Mysql);
        assert_eq!(mysql.equals_all([("a", Value::Int(1))]), "`a` = ?");
    }

    #[test]
    fn test_runner_logs_and_wraps_failures() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let conn = RecordingConnection::new();
            conn.fail_on("DELETE");
            let tx = conn.transaction();
            let logger = CapturingLogger::default();
            let mut runner = StatementRunner::new(
                &tx,
                Dialect::Postgres,
                &logger,
                Some(Duration::ZERO),
            );

            let ok = runner
                .execute(&cx, "UPDATE \"t\" SET \"a\" = $1", &[Value::Int(1)])
                .await;
            assert!(matches!(ok, Outcome::Ok(_)));

            let failed = runner
                .execute(&cx, "DELETE FROM \"t\" WHERE \"id\" = $1", &[Value::Int(9)])
                .await;
            let Outcome::Err(PersistError::StatementFailed { sql, params, .. }) = failed else {
                panic!("expected a wrapped statement failure");
            };
            assert_eq!(sql, "DELETE FROM \"t\" WHERE \"id\" = $1");
            assert_eq!(params, vec![Value::Int(9)]);

            assert_eq!(runner.issued(), 2);
            let events = logger.events();
            assert_eq!(events.iter().filter(|e| e.starts_with("query:")).count(), 2);
            assert_eq!(events.iter().filter(|e| e.starts_with("error:")).count(), 1);
        });
    }
}
