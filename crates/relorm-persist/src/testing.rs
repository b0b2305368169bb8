//! In-memory connection and metadata fixtures for the unit tests.

use relorm_core::{
    Connection, Cx, Dialect, EntityMetadata, Error, FieldInfo, IsolationLevel, LinkTableInfo,
    Outcome, QueryLogger, RelationshipInfo, RelationshipKind, Row, SqlType, TransactionOps,
    TreeInfo, Value,
};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Default)]
struct RecordingState {
    statements: Vec<RecordedStatement>,
    events: Vec<&'static str>,
    next_id: i64,
    responses: Vec<(String, VecDeque<Vec<Row>>)>,
    fail_on: Vec<String>,
}

/// Connection that records every statement instead of running it.
///
/// Inserts hand out sequential ids starting at 1; queries answer with rows
/// scripted through [`respond`](Self::respond) (first matching fragment, in
/// FIFO order) and with nothing otherwise.
#[derive(Debug, Clone)]
pub(crate) struct RecordingConnection {
    state: Arc<Mutex<RecordingState>>,
    dialect: Dialect,
}

pub(crate) struct RecordingTx<'c> {
    conn: &'c RecordingConnection,
}

/// Yields to the executor once before completing.
struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

impl RecordingConnection {
    pub fn new() -> Self {
        Self::with_dialect(Dialect::Postgres)
    }

    pub fn with_dialect(dialect: Dialect) -> Self {
        Self {
            state: Arc::new(Mutex::new(RecordingState::default())),
            dialect,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `rows` as the answer to the next query containing `fragment`.
    pub fn respond(&self, fragment: &str, rows: Vec<Row>) {
        let mut state = self.lock();
        if let Some((_, queue)) = state.responses.iter_mut().find(|(f, _)| f == fragment) {
            queue.push_back(rows);
        } else {
            state
                .responses
                .push((fragment.to_string(), VecDeque::from([rows])));
        }
    }

    /// Fail every statement containing `fragment`.
    pub fn fail_on(&self, fragment: &str) {
        self.lock().fail_on.push(fragment.to_string());
    }

    /// A transaction handle without a recorded BEGIN.
    pub fn transaction(&self) -> RecordingTx<'_> {
        RecordingTx { conn: self }
    }

    pub fn statements(&self) -> Vec<RecordedStatement> {
        self.lock().statements.clone()
    }

    pub fn sql_log(&self) -> Vec<String> {
        self.lock()
            .statements
            .iter()
            .map(|s| s.sql.clone())
            .collect()
    }

    /// Number of statements starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.lock()
            .statements
            .iter()
            .filter(|s| s.sql.starts_with(prefix))
            .count()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.lock().events.clone()
    }

    fn record(&self, sql: &str, params: &[Value]) -> Result<(), Error> {
        let mut state = self.lock();
        state.statements.push(RecordedStatement {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        if state.fail_on.iter().any(|f| sql.contains(f.as_str())) {
            return Err(Error::query(format!("forced failure: {}", sql)));
        }
        Ok(())
    }

    fn event(&self, name: &'static str) {
        self.lock().events.push(name);
    }

    fn rows_for(&self, sql: &str) -> Vec<Row> {
        let mut state = self.lock();
        for (fragment, queue) in &mut state.responses {
            if sql.contains(fragment.as_str()) {
                if let Some(rows) = queue.pop_front() {
                    return rows;
                }
            }
        }
        Vec::new()
    }

    fn run_query(&self, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        match self.record(sql, params) {
            Ok(()) => Outcome::Ok(self.rows_for(sql)),
            Err(e) => Outcome::Err(e),
        }
    }

    fn run_execute(&self, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        match self.record(sql, params) {
            Ok(()) => Outcome::Ok(1),
            Err(e) => Outcome::Err(e),
        }
    }

    fn run_insert(&self, sql: &str, params: &[Value]) -> Outcome<i64, Error> {
        match self.record(sql, params) {
            Ok(()) => {
                let mut state = self.lock();
                state.next_id += 1;
                Outcome::Ok(state.next_id)
            }
            Err(e) => Outcome::Err(e),
        }
    }
}

fn first_row(outcome: Outcome<Vec<Row>, Error>) -> Outcome<Option<Row>, Error> {
    match outcome {
        Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

impl Connection for RecordingConnection {
    type Tx<'conn>
        = RecordingTx<'conn>
    where
        Self: 'conn;

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let outcome = self.run_query(sql, params);
        async move {
            YieldOnce(false).await;
            outcome
        }
    }

    fn query_one(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let outcome = first_row(self.run_query(sql, params));
        async move { outcome }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = self.run_execute(sql, params);
        async move { outcome }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let outcome = self.run_insert(sql, params);
        async move { outcome }
    }

    fn begin_with(
        &self,
        _cx: &Cx,
        _isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        self.event("BEGIN");
        async move { Outcome::Ok(RecordingTx { conn: self }) }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }
}

impl TransactionOps for RecordingTx<'_> {
    fn dialect(&self) -> Dialect {
        self.conn.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let outcome = self.conn.run_query(sql, params);
        async move { outcome }
    }

    fn query_one(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let outcome = first_row(self.conn.run_query(sql, params));
        async move { outcome }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = self.conn.run_execute(sql, params);
        async move { outcome }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let outcome = self.conn.run_insert(sql, params);
        async move { outcome }
    }

    fn commit(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.conn.event("COMMIT");
        async { Outcome::Ok(()) }
    }

    fn rollback(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.conn.event("ROLLBACK");
        async { Outcome::Ok(()) }
    }
}

/// Query logger keeping `kind:sql` lines.
#[derive(Debug, Default)]
pub(crate) struct CapturingLogger {
    events: Mutex<Vec<String>>,
}

impl CapturingLogger {
    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, line: String) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }
}

impl QueryLogger for CapturingLogger {
    fn log_query(&self, sql: &str, _params: &[Value]) {
        self.push(format!("query:{}", sql));
    }

    fn log_query_error(&self, _error: &Error, sql: &str, _params: &[Value]) {
        self.push(format!("error:{}", sql));
    }

    fn log_query_slow(&self, _duration: Duration, sql: &str, _params: &[Value]) {
        self.push(format!("slow:{}", sql));
    }
}

/// Metadata of a small blog schema plus a tree and a self-linked table.
pub(crate) mod fixtures {
    use super::*;

    static POST_FIELDS: [FieldInfo; 1] =
        [FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true)];
    static TAG_FIELDS: [FieldInfo; 1] =
        [FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true)];

    fn post_fields() -> &'static [FieldInfo] {
        &POST_FIELDS
    }

    fn tag_fields() -> &'static [FieldInfo] {
        &TAG_FIELDS
    }

    fn id() -> FieldInfo {
        FieldInfo::new("id", "id", SqlType::BigInt)
            .primary_key(true)
            .auto_increment(true)
    }

    pub fn users() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("users")
                .field(id())
                .field(FieldInfo::new("name", "name", SqlType::Text))
                .relation(
                    RelationshipInfo::new("posts", "posts", RelationshipKind::OneToMany)
                        .remote_key("author_id")
                        .related_fields(post_fields)
                        .cascade(true),
                ),
        )
    }

    pub fn posts() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("posts")
                .field(id())
                .field(FieldInfo::new("title", "title", SqlType::Text))
                .field(
                    FieldInfo::new("author_id", "author_id", SqlType::BigInt)
                        .nullable(true)
                        .foreign_key("users.id"),
                )
                .field(
                    FieldInfo::new("deleted_at", "deleted_at", SqlType::Timestamp).nullable(true),
                )
                .relation(
                    RelationshipInfo::new("author", "users", RelationshipKind::ManyToOne)
                        .local_key("author_id")
                        .cascade_insert(true),
                )
                .relation(
                    RelationshipInfo::new("tags", "tags", RelationshipKind::ManyToMany)
                        .link_table(LinkTableInfo::new("post_tags", "post_id", "tag_id"))
                        .related_fields(tag_fields)
                        .cascade_insert(true),
                )
                .soft_delete("deleted_at"),
        )
    }

    pub fn tags() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("tags")
                .field(id())
                .field(FieldInfo::new("name", "name", SqlType::Text)),
        )
    }

    pub fn comments() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("comments")
                .field(id())
                .field(FieldInfo::new("body", "body", SqlType::Text))
                .field(
                    FieldInfo::new("post_id", "post_id", SqlType::BigInt).foreign_key("posts.id"),
                )
                .relation(
                    RelationshipInfo::new("post", "posts", RelationshipKind::ManyToOne)
                        .local_key("post_id")
                        .nullable(false),
                ),
        )
    }

    pub fn categories() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("category")
                .field(id())
                .field(FieldInfo::new("name", "name", SqlType::Text))
                .field(
                    FieldInfo::new("parent_id", "parent_id", SqlType::BigInt)
                        .nullable(true)
                        .foreign_key("category.id"),
                )
                .field(FieldInfo::new("mpath", "mpath", SqlType::Text))
                .relation(
                    RelationshipInfo::new("parent", "category", RelationshipKind::ManyToOne)
                        .local_key("parent_id")
                        .cascade_insert(true),
                )
                .tree(TreeInfo::materialized_path("parent", "mpath")),
        )
    }

    pub fn links() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("links")
                .field(id())
                .field(FieldInfo::new("next_id", "next_id", SqlType::BigInt).nullable(true))
                .relation(
                    RelationshipInfo::new("next", "links", RelationshipKind::ManyToOne)
                        .local_key("next_id")
                        .cascade_insert(true),
                ),
        )
    }

    #[test]
    fn test_fixtures_are_valid() {
        for meta in [users(), posts(), tags(), comments(), categories(), links()] {
            assert!(meta.validate().is_ok(), "{}", meta.table_name);
        }
    }
}
