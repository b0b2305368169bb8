//! Junction table writes for many-to-many relations.

use crate::config::PersistConfig;
use crate::error::PersistError;
use crate::statement::{ParamList, StatementRunner};
use relorm_core::{Cx, LinkTableInfo, Outcome, TransactionOps, Value};

/// Inserts junction rows and clears them when an owner goes away.
#[derive(Debug, Clone, Copy)]
pub struct JunctionWriter {
    max_pairs: usize,
}

impl JunctionWriter {
    pub fn new(config: &PersistConfig) -> Self {
        Self {
            max_pairs: config.chunk_size(),
        }
    }

    /// Link `owner` to `inverse` with one INSERT.
    pub async fn insert_pair<T: TransactionOps>(
        &self,
        cx: &Cx,
        runner: &mut StatementRunner<'_, T>,
        link: &LinkTableInfo,
        owner: &[Value],
        inverse: &[Value],
    ) -> Outcome<u64, PersistError> {
        let local = link.local_cols();
        let remote = link.remote_cols();
        if local.len() != owner.len() || remote.len() != inverse.len() || local.is_empty() {
            return Outcome::Err(PersistError::Metadata(format!(
                "junction '{}' key width does not match its columns",
                link.table_name
            )));
        }

        let dialect = runner.dialect();
        let mut params = ParamList::new(dialect);
        let columns: Vec<String> = local
            .iter()
            .chain(remote)
            .map(|c| dialect.escape_identifier(c))
            .collect();
        let placeholders: Vec<String> = owner
            .iter()
            .chain(inverse)
            .map(|v| params.push(v.clone()))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            dialect.escape_identifier(link.table_name),
            columns.join(", "),
            placeholders.join(", ")
        );
        runner.execute(cx, &sql, params.values()).await
    }

    /// Delete every junction row of `owners`, batched like relation removal.
    #[tracing::instrument(level = "debug", skip_all, fields(junction = link.table_name, owners = owners.len()))]
    pub async fn clear_owners<T: TransactionOps>(
        &self,
        cx: &Cx,
        runner: &mut StatementRunner<'_, T>,
        link: &LinkTableInfo,
        owners: &[Vec<Value>],
    ) -> Outcome<u64, PersistError> {
        let local = link.local_cols();
        if local.is_empty() || owners.iter().any(|o| o.len() != local.len()) {
            return Outcome::Err(PersistError::Metadata(format!(
                "junction '{}' key width does not match its columns",
                link.table_name
            )));
        }

        let dialect = runner.dialect();
        let mut affected = 0;
        for chunk in owners.chunks(self.max_pairs) {
            let mut params = ParamList::new(dialect);
            let condition = chunk
                .iter()
                .map(|owner| {
                    let bound = local.iter().copied().zip(owner.iter().cloned());
                    format!("({})", params.equals_all(bound))
                })
                .collect::<Vec<_>>()
                .join(" OR ");
            let sql = format!(
                "DELETE FROM {} WHERE {}",
                dialect.escape_identifier(link.table_name),
                condition
            );
            affected += crate::try_outcome!(runner.execute(cx, &sql, params.values()).await);
        }
        Outcome::Ok(affected)
    }
}
