//! Bounded, filtered row reads from the source database.
//!
//! The reader builds one `SELECT` per table covering the union of the
//! configured fields (deduplicated), applies the `where_clause` verbatim,
//! and caps the result with `LIMIT`. Rows are streamed through a bounded
//! channel rather than materialized, so memory stays flat even when the
//! configured limit is large.
//!
//! Transient connection failures (I/O, TLS, pool timeout) are retried with
//! exponential backoff; auth and syntax errors propagate immediately.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{DatabaseSettings, TableConfig};
use crate::credentials::DbCredentials;
use crate::error::DataSourceError;
use crate::models::{RowMap, ScalarValue};

/// Backpressure bound between the query task and the consumer.
const ROW_CHANNEL_CAPACITY: usize = 64;

/// A lazy sequence of decoded rows for one table.
pub type RowStream = BoxStream<'static, Result<RowMap, DataSourceError>>;

/// A source of rows for a configured table. The seam the orchestrator and
/// tests program against.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch(&self, table: &TableConfig) -> Result<RowStream, DataSourceError>;
}

/// Build the read query for one table.
///
/// Selects `title_field ∪ content_fields ∪ metadata_fields` (first-occurrence
/// order, backtick-quoted), applies the predicate verbatim, and bounds the
/// result count.
pub fn build_query(table: &TableConfig) -> String {
    let mut columns: Vec<&str> = Vec::new();
    for field in table.all_fields() {
        if !columns.contains(&field.as_str()) {
            columns.push(field);
        }
    }

    let select_list = columns
        .iter()
        .map(|c| format!("`{}`", c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!("SELECT {} FROM `{}`", select_list, table.name);
    if let Some(where_clause) = &table.where_clause {
        if !where_clause.trim().is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }
    }
    sql.push_str(&format!(" LIMIT {}", table.limit));
    sql
}

/// Whether a connection error is worth retrying.
pub fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut
    )
}

/// Open a connection pool for this invocation.
///
/// Transient failures are retried with exponential backoff (1s, 2s, 4s);
/// non-transient failures (auth, unknown database) return immediately.
pub async fn connect(
    db: &DatabaseSettings,
    creds: &DbCredentials,
) -> Result<MySqlPool, DataSourceError> {
    let options = MySqlConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .database(&db.database)
        .username(&creds.username)
        .password(&creds.password);

    let mut last_err = None;

    for attempt in 0..=db.max_connect_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(db.connect_timeout_secs))
            .connect_with(options.clone())
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if is_transient(&e) => {
                debug!(attempt, error = %e, "transient connection failure, retrying");
                last_err = Some(e);
            }
            Err(e) => {
                return Err(DataSourceError::Connect {
                    attempts: attempt + 1,
                    source: e,
                });
            }
        }
    }

    Err(DataSourceError::Connect {
        attempts: db.max_connect_retries + 1,
        source: last_err.unwrap_or(sqlx::Error::PoolTimedOut),
    })
}

/// Row source backed by a MySQL connection pool.
pub struct MySqlRowSource {
    pool: MySqlPool,
}

impl MySqlRowSource {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Release all connections. Called on every invocation exit path.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RowSource for MySqlRowSource {
    async fn fetch(&self, table: &TableConfig) -> Result<RowStream, DataSourceError> {
        let sql = build_query(table);
        debug!(table = %table.name, %sql, "fetching rows");

        let pool = self.pool.clone();
        let table_name = table.name.clone();
        let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);

        // The producer owns the pool clone and SQL string; it ends (and the
        // connection returns to the pool) on completion, query error, or
        // when the consumer drops the stream.
        tokio::spawn(async move {
            let mut rows = sqlx::query(&sql).fetch(&pool);
            while let Some(next) = rows.next().await {
                let item = match next {
                    Ok(row) => decode_row(&row),
                    Err(e) => Err(DataSourceError::Query {
                        table: table_name.clone(),
                        source: e,
                    }),
                };
                let stop = item.is_err();
                if tx.send(item).await.is_err() || stop {
                    break;
                }
            }
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

/// Decode every column of a row into a [`ScalarValue`].
fn decode_row(row: &MySqlRow) -> Result<RowMap, DataSourceError> {
    let mut map = RowMap::new();

    for column in row.columns() {
        let name = column.name().to_string();
        let idx = column.ordinal();

        let raw = row.try_get_raw(idx).map_err(|e| DataSourceError::Decode {
            column: name.clone(),
            reason: e.to_string(),
        })?;

        if raw.is_null() {
            map.insert(name, ScalarValue::Null);
            continue;
        }

        let type_name = raw.type_info().name().to_string();
        let value = decode_scalar(row, idx, &type_name, &name)?;
        map.insert(name, value);
    }

    Ok(map)
}

/// Map one MySQL column value to a scalar.
///
/// Dates and times are rendered as ISO-8601 text so the mapper's type
/// coercion can tag them; unknown types fall back through an
/// integer → float → string decode chain.
fn decode_scalar(
    row: &MySqlRow,
    idx: usize,
    type_name: &str,
    column: &str,
) -> Result<ScalarValue, DataSourceError> {
    let decoded = match type_name {
        "BOOLEAN" => row.try_get::<bool, _>(idx).ok().map(ScalarValue::Boolean),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<i64, _>(idx).ok().map(ScalarValue::Integer)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => row
            .try_get::<u64, _>(idx)
            .ok()
            .map(|v| ScalarValue::Integer(v as i64)),
        "FLOAT" => row
            .try_get::<f32, _>(idx)
            .ok()
            .map(|v| ScalarValue::Float(v as f64)),
        "DOUBLE" => row.try_get::<f64, _>(idx).ok().map(ScalarValue::Float),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .ok()
            .map(|d| ScalarValue::Text(d.format("%Y-%m-%d").to_string())),
        "DATETIME" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .ok()
            .map(|dt| ScalarValue::Text(format!("{}Z", dt.format("%Y-%m-%dT%H:%M:%S")))),
        "TIMESTAMP" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .ok()
            .map(|dt| {
                ScalarValue::Text(dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
            }),
        _ => None,
    };

    decoded
        .or_else(|| row.try_get::<i64, _>(idx).ok().map(ScalarValue::Integer))
        .or_else(|| row.try_get::<f64, _>(idx).ok().map(ScalarValue::Float))
        .or_else(|| row.try_get::<String, _>(idx).ok().map(ScalarValue::Text))
        .ok_or_else(|| DataSourceError::Decode {
            column: column.to_string(),
            reason: format!("unsupported column type {}", type_name),
        })
}
