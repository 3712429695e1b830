//! Durable store access.
//!
//! One shared handle over a `sqlx` Any pool. The dialect is fixed at connect
//! time from the DSN scheme; every statement is either composed with
//! sea-query against the dialect's builder or assembled with dialect-aware
//! placeholders. All writes run under retry with the connection-error
//! telemetry hooks attached.

pub mod cleanup;
pub mod schema;

use std::sync::{Arc, Once};

use sea_query::{Alias, Expr, OnConflict, Order, Query, QueryBuilder, Value, Values};
use sqlx::any::{AnyArguments, AnyPoolOptions};
use sqlx::{AnyPool, Row};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::entity::{EntityKind, EntityRow};
use crate::error::Error;
use crate::retry;
use crate::telemetry::Telemetry;
use crate::types::Binary;
use crate::Result;

use schema::Common;

/// Rows per write statement during sync and history apply.
pub const BATCH_SIZE: usize = 1000;

/// Rows per page when streaming checksums out of the durable store.
const CHECKSUM_PAGE: u64 = 10_000;

static DRIVERS: Once = Once::new();

/// Supported SQL dialects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    PostgreSql,
}

impl Dialect {
    /// Derive the dialect from the DSN scheme. Anything else is a fatal
    /// configuration error.
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url.split("://").next().unwrap_or_default();
        match scheme {
            "mysql" => Ok(Dialect::MySql),
            "postgres" | "postgresql" => Ok(Dialect::PostgreSql),
            other => Err(Error::Config(format!(
                "unsupported database scheme {other:?}, expected mysql or postgres"
            ))),
        }
    }

    pub fn query_builder(&self) -> &'static dyn QueryBuilder {
        match self {
            Dialect::MySql => &sea_query::MysqlQueryBuilder,
            Dialect::PostgreSql => &sea_query::PostgresQueryBuilder,
        }
    }

    /// Positional placeholder for hand-assembled statements.
    pub fn placeholder(&self, position: usize) -> String {
        match self {
            Dialect::MySql => "?".to_string(),
            Dialect::PostgreSql => format!("${position}"),
        }
    }
}

/// Shared durable-store handle.
#[derive(Clone)]
pub struct Db {
    pool: AnyPool,
    dialect: Dialect,
    telemetry: Arc<Telemetry>,
}

impl Db {
    /// Open the pool, retrying the initial connection like every other
    /// database operation.
    pub async fn connect(
        token: &CancellationToken,
        config: &DatabaseConfig,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self> {
        DRIVERS.call_once(sqlx::any::install_default_drivers);
        let dialect = Dialect::from_url(&config.url)?;

        let pool = retry::with_backoff(
            token,
            || async {
                let pool = AnyPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect(&config.url)
                    .await?;
                Ok(pool)
            },
            Error::retryable,
            retry::default_backoff(),
            connection_settings(&telemetry, "database"),
        )
        .await?;

        info!(dialect = ?dialect, "Connected to database");

        Ok(Db {
            pool,
            dialect,
            telemetry,
        })
    }

    /// Test constructor over an existing pool.
    pub fn with_pool(pool: AnyPool, dialect: Dialect, telemetry: Arc<Telemetry>) -> Self {
        Db {
            pool,
            dialect,
            telemetry,
        }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub(crate) fn retry_settings(&self) -> retry::Settings {
        let on_error = self.telemetry.clone();
        let on_success = self.telemetry.clone();
        retry::Settings::with_timeout(retry::DEFAULT_TIMEOUT)
            .on_retryable(Box::new(move |err, last| {
                on_error.set_db_error(Some(err.to_string()));
                if last != Some(err.to_string().as_str()) {
                    warn!(error = %err, "Can't perform database query. Retrying");
                }
            }))
            .on_success(Box::new(move |elapsed, attempts| {
                on_success.set_db_error(None);
                info!(after = ?elapsed, attempts, "Database query succeeded after retries");
            }))
    }

    /// Execute a statement with bound values under retry; returns affected
    /// row count.
    pub async fn execute_retry(
        &self,
        token: &CancellationToken,
        sql: &str,
        values: &Values,
    ) -> Result<u64> {
        retry::with_backoff(
            token,
            || async {
                let query = bind_values(sqlx::query(sql), values);
                let result = query.execute(&self.pool).await?;
                Ok(result.rows_affected())
            },
            Error::retryable,
            retry::default_backoff(),
            self.retry_settings(),
        )
        .await
    }

    /// Upsert a batch of rows of one kind: insert, overwriting all mirrored
    /// columns on primary-key conflict. Idempotent by construction.
    pub async fn upsert_batch(
        &self,
        token: &CancellationToken,
        env: &Binary,
        kind: &EntityKind,
        rows: &[EntityRow],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut columns: Vec<Alias> = vec![Alias::new("id"), Alias::new("environment_id")];
        if kind.has_checksum {
            columns.push(Alias::new("properties_checksum"));
        }
        columns.extend(kind.columns.iter().map(|c| Alias::new(*c)));

        let (sql, values) = {
            let mut insert = Query::insert();
            insert.into_table(Alias::new(kind.table));
            insert.columns(columns.clone());

            for row in rows {
                let mut values: Vec<sea_query::SimpleExpr> = Vec::with_capacity(columns.len());
                values.push(Value::Bytes(Some(Box::new(row.id.as_slice().to_vec()))).into());
                values.push(Value::Bytes(Some(Box::new(env.as_slice().to_vec()))).into());
                if kind.has_checksum {
                    let checksum = row
                        .checksum
                        .as_ref()
                        .ok_or_else(|| Error::decode(kind.name, "row is missing its checksum"))?;
                    values
                        .push(Value::Bytes(Some(Box::new(checksum.as_slice().to_vec()))).into());
                }
                values.extend(row.values.iter().cloned().map(|v| Value::from(v).into()));
                insert
                    .values(values)
                    .map_err(|e| Error::decode(kind.name, e.to_string()))?;
            }

            // Overwrite every column except the primary key on conflict.
            let update_columns: Vec<Alias> = columns.iter().skip(1).cloned().collect();
            insert.on_conflict(
                OnConflict::column(Common::Id)
                    .update_columns(update_columns)
                    .to_owned(),
            );

            insert.build_any(self.dialect.query_builder())
        };
        let affected = self.execute_retry(token, &sql, &values).await?;

        debug!(kind = kind.name, rows = rows.len(), "Upserted batch");
        Ok(affected)
    }

    /// Delete a batch of rows of one kind by primary key.
    pub async fn delete_batch(
        &self,
        token: &CancellationToken,
        kind: &EntityKind,
        ids: &[Binary],
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let (sql, values) = Query::delete()
            .from_table(Alias::new(kind.table))
            .and_where(
                Expr::col(Common::Id).is_in(ids.iter().map(|id| id.as_slice().to_vec())),
            )
            .build_any(self.dialect.query_builder());

        let affected = self.execute_retry(token, &sql, &values).await?;

        debug!(kind = kind.name, rows = ids.len(), "Deleted batch");
        Ok(affected)
    }

    /// One page of `(pk, checksum)` pairs for a kind, ordered by primary
    /// key, starting strictly after `after`.
    pub async fn checksum_page(
        &self,
        token: &CancellationToken,
        env: &Binary,
        kind: &EntityKind,
        after: Option<&Binary>,
    ) -> Result<Vec<(Binary, Binary)>> {
        let (sql, values) = {
            let mut select = Query::select();
            select
                .column(Common::Id)
                .column(Common::PropertiesChecksum)
                .from(Alias::new(kind.table))
                .and_where(Expr::col(Common::EnvironmentId).eq(env.as_slice().to_vec()))
                .order_by(Common::Id, Order::Asc)
                .limit(CHECKSUM_PAGE);
            if let Some(after) = after {
                select.and_where(Expr::col(Common::Id).gt(after.as_slice().to_vec()));
            }

            select.build_any(self.dialect.query_builder())
        };

        retry::with_backoff(
            token,
            || async {
                let query = bind_values(sqlx::query(&sql), &values);
                let rows = query.fetch_all(&self.pool).await?;

                let mut page = Vec::with_capacity(rows.len());
                for row in rows {
                    let id: Vec<u8> = row.try_get(0).map_err(Error::Db)?;
                    let checksum: Option<Vec<u8>> = row.try_get(1).map_err(Error::Db)?;
                    page.push((
                        Binary::new(id),
                        Binary::new(checksum.unwrap_or_default()),
                    ));
                }
                Ok(page)
            },
            Error::retryable,
            retry::default_backoff(),
            self.retry_settings(),
        )
        .await
    }
}

/// Bind sea-query values onto a sqlx query in order.
pub fn bind_values<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Any, AnyArguments<'q>>,
    values: &Values,
) -> sqlx::query::Query<'q, sqlx::Any, AnyArguments<'q>> {
    for value in values.iter() {
        query = match value {
            Value::Bool(v) => query.bind(*v),
            Value::TinyInt(v) => query.bind(v.map(i64::from)),
            Value::SmallInt(v) => query.bind(v.map(i64::from)),
            Value::Int(v) => query.bind(v.map(i64::from)),
            Value::BigInt(v) => query.bind(*v),
            Value::TinyUnsigned(v) => query.bind(v.map(i64::from)),
            Value::SmallUnsigned(v) => query.bind(v.map(i64::from)),
            Value::Unsigned(v) => query.bind(v.map(i64::from)),
            Value::BigUnsigned(v) => query.bind(v.map(|n| n as i64)),
            Value::Float(v) => query.bind(v.map(f64::from)),
            Value::Double(v) => query.bind(*v),
            Value::String(v) => query.bind(v.as_deref().cloned()),
            Value::Char(v) => query.bind(v.map(String::from)),
            Value::Bytes(v) => query.bind(v.as_deref().cloned()),
        };
    }
    query
}

/// Retry settings for connection establishment, shared by the database and
/// stream-store connectors.
pub fn connection_settings(telemetry: &Arc<Telemetry>, backend: &'static str) -> retry::Settings {
    let on_error = telemetry.clone();
    let on_success = telemetry.clone();
    let record_error = move |message: Option<String>| match backend {
        "database" => on_error.set_db_error(message),
        _ => on_error.set_redis_error(message),
    };
    let clear_error = move |message: Option<String>| match backend {
        "database" => on_success.set_db_error(message),
        _ => on_success.set_redis_error(message),
    };

    retry::Settings::with_timeout(retry::DEFAULT_TIMEOUT)
        .on_retryable(Box::new(move |err, last| {
            record_error(Some(err.to_string()));
            if last != Some(err.to_string().as_str()) {
                warn!(backend, error = %err, "Can't connect. Retrying");
            }
        }))
        .on_success(Box::new(move |elapsed, attempts| {
            clear_error(None);
            if attempts > 1 {
                info!(backend, after = ?elapsed, attempts, "Reconnected");
            }
        }))
}
