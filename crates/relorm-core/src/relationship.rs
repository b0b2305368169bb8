//! Relationship metadata and lazily loaded relation handles.
//!
//! Relationships are static metadata attached to an entity's table. The
//! persistence engine reads them to decide cascades, foreign-key propagation
//! and junction-table maintenance; the read path uses [`RelationHandle`] to
//! resolve a relation on first access.

use crate::Error;
use crate::field::FieldInfo;
use asupersync::{Cx, Outcome};
use std::fmt;
use std::future::Future;
use std::sync::PoisonError;

/// The type of relationship between two entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RelationshipKind {
    /// One-to-one: `User` has one `Profile`.
    OneToOne,
    /// Many-to-one: many `Post`s belong to one `User`.
    #[default]
    ManyToOne,
    /// One-to-many: one `User` has many `Post`s.
    OneToMany,
    /// Many-to-many: `Post`s have many `Tag`s via a junction table.
    ManyToMany,
}

/// Information about a junction table for many-to-many relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The junction table name (e.g., `"post_tags"`).
    pub table_name: &'static str,

    /// Column in the junction table pointing to the owner (e.g., `"post_id"`).
    pub local_column: &'static str,

    /// Column in the junction table pointing to the inverse side (e.g., `"tag_id"`).
    pub remote_column: &'static str,

    /// Composite owner columns. Takes precedence over `local_column`.
    pub local_columns: Option<&'static [&'static str]>,

    /// Composite inverse columns. Takes precedence over `remote_column`.
    pub remote_columns: Option<&'static [&'static str]>,
}

impl LinkTableInfo {
    /// Create a new junction-table definition.
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            local_column,
            remote_column,
            local_columns: None,
            remote_columns: None,
        }
    }

    /// Create a new composite junction-table definition.
    ///
    /// `local_columns` follow the owner's primary-key column order and
    /// `remote_columns` the inverse side's.
    #[must_use]
    pub const fn composite(
        table_name: &'static str,
        local_columns: &'static [&'static str],
        remote_columns: &'static [&'static str],
    ) -> Self {
        Self {
            table_name,
            local_column: "",
            remote_column: "",
            local_columns: Some(local_columns),
            remote_columns: Some(remote_columns),
        }
    }

    /// Return the owner columns (single or composite).
    #[must_use]
    pub fn local_cols(&self) -> &[&'static str] {
        if let Some(cols) = self.local_columns {
            return cols;
        }
        if self.local_column.is_empty() {
            return &[];
        }
        std::slice::from_ref(&self.local_column)
    }

    /// Return the inverse columns (single or composite).
    #[must_use]
    pub fn remote_cols(&self) -> &[&'static str] {
        if let Some(cols) = self.remote_columns {
            return cols;
        }
        if self.remote_column.is_empty() {
            return &[];
        }
        std::slice::from_ref(&self.remote_column)
    }
}

/// Metadata about a relationship between entities.
///
/// Key columns follow one convention throughout: local keys live on this
/// entity's table and reference the related table's primary key (in its
/// column order); remote keys live on the related table and reference this
/// entity's primary key.
#[derive(Debug, Clone, Copy)]
pub struct RelationshipInfo {
    /// Name of the relationship field.
    pub name: &'static str,

    /// The related table name.
    pub related_table: &'static str,

    /// The kind of relationship.
    pub kind: RelationshipKind,

    /// Local foreign key column (ManyToOne, owning OneToOne).
    pub local_key: Option<&'static str>,

    /// Composite local foreign key columns.
    pub local_keys: Option<&'static [&'static str]>,

    /// Remote foreign key column (OneToMany, inverse OneToOne).
    pub remote_key: Option<&'static str>,

    /// Composite remote foreign key columns.
    pub remote_keys: Option<&'static [&'static str]>,

    /// Junction table (ManyToMany owner side).
    pub link_table: Option<LinkTableInfo>,

    /// Newly related entities are inserted together with this one.
    pub cascade_insert: bool,

    /// Changes on related entities are saved together with this one.
    pub cascade_update: bool,

    /// Related entities are removed together with this one.
    pub cascade_remove: bool,

    /// Whether the relation may be empty (NULL foreign key).
    pub nullable: bool,

    /// Function returning the related table's field metadata.
    pub related_fields_fn: fn() -> &'static [FieldInfo],
}

impl RelationshipInfo {
    fn empty_related_fields() -> &'static [FieldInfo] {
        &[]
    }

    /// Create a new relationship with required fields.
    #[must_use]
    pub const fn new(
        name: &'static str,
        related_table: &'static str,
        kind: RelationshipKind,
    ) -> Self {
        Self {
            name,
            related_table,
            kind,
            local_key: None,
            local_keys: None,
            remote_key: None,
            remote_keys: None,
            link_table: None,
            cascade_insert: false,
            cascade_update: false,
            cascade_remove: false,
            nullable: true,
            related_fields_fn: Self::empty_related_fields,
        }
    }

    /// Return the local key columns for this relationship (empty slice if unset).
    #[must_use]
    pub fn local_key_cols(&self) -> &[&'static str] {
        if let Some(keys) = self.local_keys {
            return keys;
        }
        match &self.local_key {
            Some(key) => std::slice::from_ref(key),
            None => &[],
        }
    }

    /// Return the remote key columns for this relationship (empty slice if unset).
    #[must_use]
    pub fn remote_key_cols(&self) -> &[&'static str] {
        if let Some(keys) = self.remote_keys {
            return keys;
        }
        match &self.remote_key {
            Some(key) => std::slice::from_ref(key),
            None => &[],
        }
    }

    /// Provide the related table's field metadata.
    #[must_use]
    pub const fn related_fields(mut self, f: fn() -> &'static [FieldInfo]) -> Self {
        self.related_fields_fn = f;
        self
    }

    /// Set the local foreign key column.
    #[must_use]
    pub const fn local_key(mut self, key: &'static str) -> Self {
        self.local_key = Some(key);
        self.local_keys = None;
        self
    }

    /// Set composite local foreign key columns.
    #[must_use]
    pub const fn local_keys(mut self, keys: &'static [&'static str]) -> Self {
        self.local_keys = Some(keys);
        self.local_key = None;
        self
    }

    /// Set the remote foreign key column.
    #[must_use]
    pub const fn remote_key(mut self, key: &'static str) -> Self {
        self.remote_key = Some(key);
        self.remote_keys = None;
        self
    }

    /// Set composite remote foreign key columns.
    #[must_use]
    pub const fn remote_keys(mut self, keys: &'static [&'static str]) -> Self {
        self.remote_keys = Some(keys);
        self.remote_key = None;
        self
    }

    /// Set the junction table metadata (ManyToMany).
    #[must_use]
    pub const fn link_table(mut self, info: LinkTableInfo) -> Self {
        self.link_table = Some(info);
        self
    }

    /// Enable insert, update and remove cascades at once.
    #[must_use]
    pub const fn cascade(mut self, value: bool) -> Self {
        self.cascade_insert = value;
        self.cascade_update = value;
        self.cascade_remove = value;
        self
    }

    #[must_use]
    pub const fn cascade_insert(mut self, value: bool) -> Self {
        self.cascade_insert = value;
        self
    }

    #[must_use]
    pub const fn cascade_update(mut self, value: bool) -> Self {
        self.cascade_update = value;
        self
    }

    #[must_use]
    pub const fn cascade_remove(mut self, value: bool) -> Self {
        self.cascade_remove = value;
        self
    }

    /// Set whether the relation may be empty.
    #[must_use]
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Whether this side holds the foreign key (or the junction table).
    #[must_use]
    pub fn is_owning(&self) -> bool {
        match self.kind {
            RelationshipKind::ManyToOne => true,
            RelationshipKind::OneToOne => !self.local_key_cols().is_empty(),
            RelationshipKind::OneToMany => false,
            RelationshipKind::ManyToMany => self.link_table.is_some(),
        }
    }

    /// Whether the relation holds a collection.
    #[must_use]
    pub const fn is_collection(&self) -> bool {
        matches!(
            self.kind,
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany
        )
    }

    /// Primary-key columns of the related table.
    ///
    /// Taken from the related field metadata when provided, `["id"]` otherwise.
    #[must_use]
    pub fn related_primary_key(&self) -> Vec<&'static str> {
        let pk: Vec<&'static str> = (self.related_fields_fn)()
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| f.column_name)
            .collect();
        if pk.is_empty() { vec!["id"] } else { pk }
    }
}

impl Default for RelationshipInfo {
    fn default() -> Self {
        Self::new("", "", RelationshipKind::default())
    }
}

/// Load state of a [`RelationHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationStatus {
    Unloaded,
    Loading,
    Loaded,
}

enum RelationState<T> {
    Unloaded,
    Loading,
    Loaded(T),
}

/// Loads the value behind one relation of one entity.
pub trait RelationLoader<T> {
    fn load(&self, cx: &Cx) -> impl Future<Output = Outcome<T, Error>> + Send;
}

/// A lazily resolved relation.
///
/// The first [`get`](Self::get) issues one load through a [`RelationLoader`];
/// callers arriving while that load is in flight wait for it and observe the
/// same value. A load that fails, is cancelled or panics leaves the handle
/// `Unloaded` so a later read retries.
///
/// ```ignore
/// let author = RelationHandle::new();
/// let rows = author.get(&cx, &persistor.relation(&conn, &post, "author")?).await?;
/// ```
pub struct RelationHandle<T> {
    state: std::sync::Mutex<RelationState<T>>,
    gate: asupersync::sync::Mutex<()>,
}

impl<T: Clone + Send> RelationHandle<T> {
    /// Create an unloaded handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(RelationState::Unloaded),
            gate: asupersync::sync::Mutex::new(()),
        }
    }

    /// Create a handle that is already resolved.
    #[must_use]
    pub fn loaded(value: T) -> Self {
        Self {
            state: std::sync::Mutex::new(RelationState::Loaded(value)),
            gate: asupersync::sync::Mutex::new(()),
        }
    }

    /// Current load state.
    pub fn status(&self) -> RelationStatus {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            RelationState::Unloaded => RelationStatus::Unloaded,
            RelationState::Loading => RelationStatus::Loading,
            RelationState::Loaded(_) => RelationStatus::Loaded,
        }
    }

    /// The resolved value, without loading.
    pub fn peek(&self) -> Option<T> {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            RelationState::Loaded(value) => Some(value.clone()),
            RelationState::Unloaded | RelationState::Loading => None,
        }
    }

    /// Resolve the relation explicitly (e.g. after an eager load).
    pub fn set_loaded(&self, value: T) {
        self.set_state(RelationState::Loaded(value));
    }

    /// Forget the resolved value so the next read loads again.
    pub fn reset(&self) {
        self.set_state(RelationState::Unloaded);
    }

    fn set_state(&self, state: RelationState<T>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Get the related value, loading it on first access.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn get<L>(&self, cx: &Cx, loader: &L) -> Outcome<T, Error>
    where
        L: RelationLoader<T> + Sync + ?Sized,
    {
        if let Some(value) = self.peek() {
            return Outcome::Ok(value);
        }

        let Ok(_guard) = self.gate.lock(cx).await else {
            return Outcome::Err(Error::Custom(
                "failed to acquire relation load gate".to_string(),
            ));
        };

        // A concurrent reader may have finished the load while we waited.
        if let Some(value) = self.peek() {
            tracing::trace!("relation resolved by in-flight load");
            return Outcome::Ok(value);
        }

        self.set_state(RelationState::Loading);
        match loader.load(cx).await {
            Outcome::Ok(value) => {
                self.set_state(RelationState::Loaded(value.clone()));
                Outcome::Ok(value)
            }
            Outcome::Err(e) => {
                self.reset();
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.reset();
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.reset();
                Outcome::Panicked(p)
            }
        }
    }
}

impl<T: Clone + Send> Default for RelationHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for RelationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            RelationState::Unloaded => f.write_str("RelationHandle(Unloaded)"),
            RelationState::Loading => f.write_str("RelationHandle(Loading)"),
            RelationState::Loaded(v) => f.debug_tuple("RelationHandle").field(v).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SqlType;
    use asupersync::runtime::RuntimeBuilder;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

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

    struct CountingLoader {
        calls: AtomicUsize,
        fail_first: bool,
    }

    impl CountingLoader {
        fn new(fail_first: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
            }
        }
    }

    impl RelationLoader<Vec<i64>> for CountingLoader {
        fn load(&self, _cx: &Cx) -> impl Future<Output = Outcome<Vec<i64>, Error>> + Send {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail_first && call == 0;
            async move {
                YieldOnce(false).await;
                if fail {
                    Outcome::Err(Error::Custom("connection reset".to_string()))
                } else {
                    Outcome::Ok(vec![1, 2, 3])
                }
            }
        }
    }

    static TAG_FIELDS: [FieldInfo; 1] =
        [FieldInfo::new("code", "code", SqlType::Text).primary_key(true)];

    fn tag_fields() -> &'static [FieldInfo] {
        &TAG_FIELDS
    }

    #[test]
    fn test_relationship_kind_default() {
        assert_eq!(RelationshipKind::default(), RelationshipKind::ManyToOne);
    }

    #[test]
    fn test_relationship_info_builder_chain() {
        let info = RelationshipInfo::new("author", "users", RelationshipKind::ManyToOne)
            .local_key("author_id")
            .cascade_insert(true)
            .nullable(false);
        assert_eq!(info.local_key_cols(), &["author_id"]);
        assert!(info.cascade_insert);
        assert!(!info.cascade_remove);
        assert!(!info.nullable);
        assert!(info.is_owning());
        assert!(!info.is_collection());
    }

    #[test]
    fn test_owning_side_detection() {
        let inverse = RelationshipInfo::new("profile", "profiles", RelationshipKind::OneToOne)
            .remote_key("user_id");
        assert!(!inverse.is_owning());

        let owner = RelationshipInfo::new("tags", "tags", RelationshipKind::ManyToMany)
            .link_table(LinkTableInfo::new("post_tags", "post_id", "tag_code"));
        assert!(owner.is_owning());
        assert!(owner.is_collection());

        let children = RelationshipInfo::new("posts", "posts", RelationshipKind::OneToMany)
            .remote_keys(&["org_id", "author_id"]);
        assert_eq!(children.remote_key_cols(), &["org_id", "author_id"]);
        assert!(children.cascade(true).cascade_remove);
    }

    #[test]
    fn test_link_table_columns() {
        let single = LinkTableInfo::new("post_tags", "post_id", "tag_id");
        assert_eq!(single.local_cols(), &["post_id"]);
        assert_eq!(single.remote_cols(), &["tag_id"]);

        let composite = LinkTableInfo::composite("pt", &["a", "b"], &["c"]);
        assert_eq!(composite.local_cols(), &["a", "b"]);
        assert_eq!(composite.remote_cols(), &["c"]);
    }

    #[test]
    fn test_related_primary_key() {
        let info = RelationshipInfo::new("tags", "tags", RelationshipKind::ManyToMany)
            .related_fields(tag_fields);
        assert_eq!(info.related_primary_key(), vec!["code"]);
        let plain = RelationshipInfo::new("author", "users", RelationshipKind::ManyToOne);
        assert_eq!(plain.related_primary_key(), vec!["id"]);
    }

    #[test]
    fn test_handle_loads_once_and_caches() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let handle = RelationHandle::<Vec<i64>>::new();
            let loader = CountingLoader::new(false);
            assert_eq!(handle.status(), RelationStatus::Unloaded);

            let first = handle.get(&cx, &loader).await;
            assert!(matches!(first, Outcome::Ok(ref v) if v == &vec![1, 2, 3]));
            assert_eq!(handle.status(), RelationStatus::Loaded);

            let second = handle.get(&cx, &loader).await;
            assert!(matches!(second, Outcome::Ok(_)));
            assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_concurrent_reads_share_one_load() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let handle = RelationHandle::<Vec<i64>>::new();
            let loader = CountingLoader::new(false);

            let (a, b) =
                futures_util::future::join(handle.get(&cx, &loader), handle.get(&cx, &loader))
                    .await;

            let (Outcome::Ok(a), Outcome::Ok(b)) = (a, b) else {
                panic!("both reads should resolve");
            };
            assert_eq!(a, b);
            assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_failed_load_returns_to_unloaded() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let handle = RelationHandle::<Vec<i64>>::new();
            let loader = CountingLoader::new(true);

            let first = handle.get(&cx, &loader).await;
            assert!(matches!(first, Outcome::Err(_)));
            assert_eq!(handle.status(), RelationStatus::Unloaded);

            let retry = handle.get(&cx, &loader).await;
            assert!(matches!(retry, Outcome::Ok(_)));
            assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn test_set_loaded_and_reset() {
        let handle = RelationHandle::loaded(vec![7_i64]);
        assert_eq!(handle.peek(), Some(vec![7]));
        handle.reset();
        assert_eq!(handle.peek(), None);
        handle.set_loaded(vec![8]);
        assert_eq!(handle.status(), RelationStatus::Loaded);
        assert_eq!(format!("{:?}", handle), "RelationHandle([8])");
    }
}
