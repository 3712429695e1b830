//! Bounded history cleanup.
//!
//! Deletes the oldest rows beyond a retention horizon in fixed-size rounds
//! so a large backlog never produces one giant statement. MySQL supports
//! `DELETE ... ORDER BY ... LIMIT` directly; PostgreSQL needs a CTE over the
//! primary keys of the oldest rows.

use sea_query::{Value, Values};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Db, Dialect};
use crate::types::{Binary, UnixMilli};
use crate::{retry, Result};

/// Information needed to compose cleanup statements for one table.
#[derive(Debug, Clone, Copy)]
pub struct CleanupStmt {
    pub table: &'static str,
    pub pk: &'static str,
    pub column: &'static str,
}

impl CleanupStmt {
    /// Assemble the bounded DELETE for the given dialect and per-round limit.
    pub fn build(&self, dialect: Dialect, limit: u64) -> String {
        match dialect {
            Dialect::MySql => format!(
                "DELETE FROM {table} WHERE environment_id = {p1} AND {column} < {p2} \
                 ORDER BY {column} LIMIT {limit}",
                table = self.table,
                column = self.column,
                p1 = dialect.placeholder(1),
                p2 = dialect.placeholder(2),
            ),
            Dialect::PostgreSql => format!(
                "WITH rows AS (\
                 SELECT {pk} FROM {table} WHERE environment_id = {p1} AND {column} < {p2} \
                 ORDER BY {column} LIMIT {limit}\
                 ) DELETE FROM {table} WHERE {pk} IN (SELECT {pk} FROM rows)",
                pk = self.pk,
                table = self.table,
                column = self.column,
                p1 = dialect.placeholder(1),
                p2 = dialect.placeholder(2),
            ),
        }
    }
}

impl Db {
    /// Delete all rows of `stmt.table` for `env` older than `older_than`, at
    /// most `count` rows per round, until a round falls short of the limit.
    /// Returns the total number of rows deleted.
    pub async fn cleanup_older_than(
        &self,
        token: &CancellationToken,
        stmt: CleanupStmt,
        env: &Binary,
        count: u64,
        older_than: UnixMilli,
    ) -> Result<u64> {
        let sql = stmt.build(self.dialect(), count);
        let values = Values(vec![
            Value::Bytes(Some(Box::new(env.as_slice().to_vec()))),
            Value::BigInt(Some(older_than.as_millis())),
        ]);

        let mut total = 0u64;
        loop {
            let deleted = retry::with_backoff(
                token,
                || async {
                    let query = super::bind_values(sqlx::query(&sql), &values);
                    let result = query.execute(self.pool()).await?;
                    Ok(result.rows_affected())
                },
                crate::error::Error::retryable,
                retry::quick_backoff(),
                self.retry_settings(),
            )
            .await?;

            total += deleted;
            if deleted < count {
                break;
            }
        }

        debug!(
            table = stmt.table,
            rows = total,
            older_than = older_than.as_millis(),
            "Cleanup pass finished"
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STMT: CleanupStmt = CleanupStmt {
        table: "state_history",
        pk: "id",
        column: "event_time",
    };

    #[test]
    fn mysql_uses_order_by_limit() {
        let sql = STMT.build(Dialect::MySql, 1000);
        assert_eq!(
            sql,
            "DELETE FROM state_history WHERE environment_id = ? AND event_time < ? \
             ORDER BY event_time LIMIT 1000"
        );
    }

    #[test]
    fn postgres_wraps_a_cte() {
        let sql = STMT.build(Dialect::PostgreSql, 250);
        assert!(sql.starts_with("WITH rows AS ("));
        assert!(sql.contains("SELECT id FROM state_history"));
        assert!(sql.contains("environment_id = $1 AND event_time < $2"));
        assert!(sql.contains("ORDER BY event_time LIMIT 250"));
        assert!(sql.ends_with("DELETE FROM state_history WHERE id IN (SELECT id FROM rows)"));
    }
}
