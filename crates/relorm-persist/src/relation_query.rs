//! Read-path loader for one relation of one entity.

use crate::config::PersistConfig;
use crate::entity::Entity;
use crate::error::PersistError;
use crate::statement::{ParamList, observe};
use relorm_core::{
    Connection, Cx, Error, Outcome, QueryLogger, RelationLoader, RelationshipKind, Row,
    TracingQueryLogger, Value,
};
use std::future::Future;
use std::time::{Duration, Instant};

/// The SELECT resolving `owner.relation`.
///
/// Pair it with a [`RelationHandle`](relorm_core::RelationHandle) to get a
/// cached, single-flight lazy relation:
///
/// ```ignore
/// let posts: RelationHandle<Vec<Row>> = RelationHandle::new();
/// let query = persistor.relation(&conn, &user, "posts")?;
/// let rows = posts.get(&cx, &query).await;
/// ```
pub struct RelationQuery<'c, C> {
    conn: &'c C,
    sql: Option<String>,
    params: Vec<Value>,
    logger: &'c dyn QueryLogger,
    slow_threshold: Option<Duration>,
}

impl<'c, C: Connection> RelationQuery<'c, C> {
    /// Build the SELECT in the dialect `config` resolves for `conn`.
    pub fn new(
        conn: &'c C,
        config: &PersistConfig,
        owner: &Entity,
        relation: &str,
    ) -> Result<Self, PersistError> {
        let metadata = owner.metadata();
        let Some(info) = metadata.find_relation(relation) else {
            return Err(PersistError::Metadata(format!(
                "relation '{}.{}' is not declared",
                metadata.table_name, relation
            )));
        };
        let d = config.resolve_dialect(conn.dialect());
        let related = d.escape_identifier(info.related_table);
        let mut params = ParamList::new(d);

        let sql = match info.kind {
            RelationshipKind::ManyToOne | RelationshipKind::OneToOne if info.is_owning() => owner
                .key_values(info.local_key_cols())
                .map(|fk| {
                    let condition =
                        params.equals_all(info.related_primary_key().into_iter().zip(fk));
                    format!("SELECT * FROM {} WHERE {}", related, condition)
                }),
            RelationshipKind::ManyToOne | RelationshipKind::OneToOne | RelationshipKind::OneToMany => {
                owner.primary_key().map(|pk| {
                    let condition =
                        params.equals_all(info.remote_key_cols().iter().copied().zip(pk));
                    format!("SELECT * FROM {} WHERE {}", related, condition)
                })
            }
            RelationshipKind::ManyToMany => {
                let Some(link) = &info.link_table else {
                    return Err(PersistError::Metadata(format!(
                        "relation '{}.{}' is the inverse side of a many-to-many; load it from the owner",
                        metadata.table_name, relation
                    )));
                };
                owner.primary_key().map(|pk| {
                    let junction = d.escape_identifier(link.table_name);
                    let join = link
                        .remote_cols()
                        .iter()
                        .zip(info.related_primary_key())
                        .map(|(j, r)| {
                            format!(
                                "{}.{} = {}.{}",
                                junction,
                                d.escape_identifier(j),
                                related,
                                d.escape_identifier(r)
                            )
                        })
                        .collect::<Vec<_>>()
                        .join(" AND ");
                    let condition = link
                        .local_cols()
                        .iter()
                        .zip(pk)
                        .map(|(c, v)| {
                            let placeholder = params.push(v);
                            format!("{}.{} = {}", junction, d.escape_identifier(c), placeholder)
                        })
                        .collect::<Vec<_>>()
                        .join(" AND ");
                    format!(
                        "SELECT {}.* FROM {} INNER JOIN {} ON {} WHERE {}",
                        related, related, junction, join, condition
                    )
                })
            }
        };

        Ok(Self {
            conn,
            sql,
            params: params.values().to_vec(),
            logger: &TracingQueryLogger,
            slow_threshold: config.slow_query_threshold,
        })
    }

    #[must_use]
    pub fn logger(mut self, logger: &'c dyn QueryLogger) -> Self {
        self.logger = logger;
        self
    }

    /// The statement to run; `None` when the relation is known to be empty
    /// (NULL foreign key or an owner without identifier).
    pub fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

impl<C: Connection> RelationLoader<Vec<Row>> for RelationQuery<'_, C> {
    fn load(&self, cx: &Cx) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        async move {
            let Some(sql) = &self.sql else {
                return Outcome::Ok(Vec::new());
            };
            tracing::trace!(sql = %sql, "loading relation");
            self.logger.log_query(sql, &self.params);
            let started = Instant::now();
            let outcome = self.conn.query(cx, sql, &self.params).await;
            observe(self.logger, self.slow_threshold, started, sql, &self.params, &outcome);
            outcome
        }
    }
}
