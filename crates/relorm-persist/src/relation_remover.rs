//! Batched relation removal.
//!
//! Unlinking rows from a relation issues one statement per chunk of
//! owner/member pairs, with one AND-group per pair joined by OR.

use crate::config::PersistConfig;
use crate::error::PersistError;
use crate::statement::{ParamList, StatementRunner};
use relorm_core::{Cx, LinkTableInfo, Outcome, RelationshipInfo, TransactionOps, Value};

/// Removes one-to-many and many-to-many links in batches.
#[derive(Debug, Clone, Copy)]
pub struct RelationRemover {
    max_pairs: usize,
}

impl RelationRemover {
    pub fn new(config: &PersistConfig) -> Self {
        Self {
            max_pairs: config.chunk_size(),
        }
    }

    /// Null the foreign key of `children` on the related table of a
    /// one-to-many `relation`, for every parent/child pair.
    ///
    /// `parents` follow the owner's primary-key order (the relation's remote
    /// key columns), `children` the related table's primary-key order.
    #[tracing::instrument(level = "debug", skip_all, fields(relation = relation.name, parents = parents.len(), children = children.len()))]
    pub async fn remove_one_to_many<T: TransactionOps>(
        &self,
        cx: &Cx,
        runner: &mut StatementRunner<'_, T>,
        relation: &RelationshipInfo,
        parents: &[Vec<Value>],
        children: &[Vec<Value>],
    ) -> Outcome<u64, PersistError> {
        let foreign_key = relation.remote_key_cols();
        let child_key = relation.related_primary_key();
        if foreign_key.is_empty() {
            return Outcome::Err(PersistError::Metadata(format!(
                "relation '{}' has no remote key columns",
                relation.name
            )));
        }
        crate::try_result!(check_widths(relation.name, foreign_key, parents));
        crate::try_result!(check_widths(relation.name, &child_key, children));

        let pairs = cross(parents, children);
        let dialect = runner.dialect();
        let mut affected = 0;
        for chunk in pairs.chunks(self.max_pairs) {
            let mut params = ParamList::new(dialect);
            let assignments = foreign_key
                .iter()
                .map(|c| format!("{} = NULL", dialect.escape_identifier(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let condition = or_of_and(&mut params, foreign_key, &child_key, chunk);
            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                dialect.escape_identifier(relation.related_table),
                assignments,
                condition
            );
            affected += crate::try_outcome!(runner.execute(cx, &sql, params.values()).await);
        }

        tracing::debug!(pairs = pairs.len(), affected, "one-to-many links removed");
        Outcome::Ok(affected)
    }

    /// Delete the junction rows linking `owners` to `inverses`.
    ///
    /// `owners` follow the link table's local columns, `inverses` its remote
    /// columns.
    #[tracing::instrument(level = "debug", skip_all, fields(junction = link.table_name, owners = owners.len(), inverses = inverses.len()))]
    pub async fn remove_many_to_many<T: TransactionOps>(
        &self,
        cx: &Cx,
        runner: &mut StatementRunner<'_, T>,
        link: &LinkTableInfo,
        owners: &[Vec<Value>],
        inverses: &[Vec<Value>],
    ) -> Outcome<u64, PersistError> {
        let local = link.local_cols();
        let remote = link.remote_cols();
        crate::try_result!(check_widths(link.table_name, local, owners));
        crate::try_result!(check_widths(link.table_name, remote, inverses));

        let pairs = cross(owners, inverses);
        let dialect = runner.dialect();
        let mut affected = 0;
        for chunk in pairs.chunks(self.max_pairs) {
            let mut params = ParamList::new(dialect);
            let condition = or_of_and(&mut params, local, remote, chunk);
            let sql = format!(
                "DELETE FROM {} WHERE {}",
                dialect.escape_identifier(link.table_name),
                condition
            );
            affected += crate::try_outcome!(runner.execute(cx, &sql, params.values()).await);
        }

        tracing::debug!(pairs = pairs.len(), affected, "junction rows removed");
        Outcome::Ok(affected)
    }
}

fn cross<'a>(left: &'a [Vec<Value>], right: &'a [Vec<Value>]) -> Vec<(&'a [Value], &'a [Value])> {
    left.iter()
        .flat_map(|l| right.iter().map(move |r| (l.as_slice(), r.as_slice())))
        .collect()
}

/// `("a" = $1 AND "b" = $2) OR (...)`, one group per pair.
fn or_of_and(
    params: &mut ParamList,
    left_cols: &[&str],
    right_cols: &[&str],
    pairs: &[(&[Value], &[Value])],
) -> String {
    pairs
        .iter()
        .map(|(left, right)| {
            let bound = left_cols
                .iter()
                .copied()
                .zip(left.iter().cloned())
                .chain(right_cols.iter().copied().zip(right.iter().cloned()));
            format!("({})", params.equals_all(bound))
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn check_widths(name: &str, columns: &[&str], keys: &[Vec<Value>]) -> Result<(), PersistError> {
    if columns.is_empty() {
        return Err(PersistError::Metadata(format!("'{}' has no key columns", name)));
    }
    if let Some(bad) = keys.iter().find(|k| k.len() != columns.len()) {
        return Err(PersistError::Metadata(format!(
            "'{}' expects {} key values, got {}",
            name,
            columns.len(),
            bad.len()
        )));
    }
    Ok(())
}
