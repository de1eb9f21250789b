//! SQL adapters over sqlx pools (PostgreSQL, MySQL, SQLite).
//!
//! Plans arrive with `$n` placeholders; MySQL and SQLite take `?`, so the
//! placeholders are rewritten per dialect before binding. All three dialects
//! support `LIMIT`, which is appended when the plan did not already bound
//! the row count. Cell values decode to text by trying the common column
//! types in order.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row};

use crate::error::ConnectorError;

use super::adapter::{AdapterResult, DataAdapter};

/// Which SQL dialect a pool speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    MySql,
    Sqlite,
}

enum SqlPool {
    Postgres(PgPool),
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

/// sqlx-backed adapter.
pub struct SqlAdapter {
    pool: SqlPool,
    source_name: String,
}

impl SqlAdapter {
    /// Connect a pool for the given dialect.
    pub async fn connect(
        dialect: SqlDialect,
        url: &str,
        max_connections: u32,
        source_name: &str,
    ) -> Result<Self, ConnectorError> {
        let connect_timeout = Duration::from_secs(5);
        let pool = match dialect {
            SqlDialect::Postgres => SqlPool::Postgres(
                tokio::time::timeout(
                    connect_timeout,
                    PgPoolOptions::new()
                        .max_connections(max_connections)
                        .connect(url),
                )
                .await
                .map_err(|_| connect_timed_out(source_name))?
                .map_err(|e| unavailable(source_name, e))?,
            ),
            SqlDialect::MySql => SqlPool::MySql(
                tokio::time::timeout(
                    connect_timeout,
                    MySqlPoolOptions::new()
                        .max_connections(max_connections)
                        .connect(url),
                )
                .await
                .map_err(|_| connect_timed_out(source_name))?
                .map_err(|e| unavailable(source_name, e))?,
            ),
            SqlDialect::Sqlite => SqlPool::Sqlite(
                tokio::time::timeout(
                    connect_timeout,
                    SqlitePoolOptions::new()
                        .max_connections(max_connections)
                        .connect(url),
                )
                .await
                .map_err(|_| connect_timed_out(source_name))?
                .map_err(|e| unavailable(source_name, e))?,
            ),
        };
        Ok(Self {
            pool,
            source_name: source_name.to_string(),
        })
    }

    fn dialect(&self) -> SqlDialect {
        match self.pool {
            SqlPool::Postgres(_) => SqlDialect::Postgres,
            SqlPool::MySql(_) => SqlDialect::MySql,
            SqlPool::Sqlite(_) => SqlDialect::Sqlite,
        }
    }
}

fn connect_timed_out(source: &str) -> ConnectorError {
    ConnectorError::SourceUnavailable(format!("{source}: connect timed out"))
}

fn unavailable(source: &str, err: sqlx::Error) -> ConnectorError {
    ConnectorError::SourceUnavailable(format!("{source}: {err}"))
}

/// Rewrite `$1`-style placeholders for dialects that bind with `?`.
fn rewrite_placeholders(query: &str, dialect: SqlDialect) -> String {
    match dialect {
        SqlDialect::Postgres => query.to_string(),
        SqlDialect::MySql | SqlDialect::Sqlite => {
            static RE: std::sync::LazyLock<regex::Regex> =
                std::sync::LazyLock::new(|| regex::Regex::new(r"\$\d+").unwrap());
            RE.replace_all(query, "?").into_owned()
        }
    }
}

/// Append a LIMIT when the plan did not already bound the rows.
fn ensure_limit(query: &str, max_rows: u32) -> String {
    if query.to_lowercase().contains(" limit ") {
        query.to_string()
    } else {
        format!("{query} LIMIT {max_rows}")
    }
}

macro_rules! cell_as_string {
    ($row:expr, $idx:expr) => {{
        if let Ok(v) = $row.try_get::<Option<String>, _>($idx) {
            v.unwrap_or_default()
        } else if let Ok(v) = $row.try_get::<Option<i64>, _>($idx) {
            v.map(|n| n.to_string()).unwrap_or_default()
        } else if let Ok(v) = $row.try_get::<Option<f64>, _>($idx) {
            v.map(|n| n.to_string()).unwrap_or_default()
        } else if let Ok(v) = $row.try_get::<Option<bool>, _>($idx) {
            v.map(|b| b.to_string()).unwrap_or_default()
        } else {
            String::new()
        }
    }};
}

fn pg_row_to_cells(row: &PgRow) -> (Vec<String>, Vec<String>) {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let cells = (0..columns.len()).map(|i| cell_as_string!(row, i)).collect();
    (columns, cells)
}

fn mysql_row_to_cells(row: &MySqlRow) -> (Vec<String>, Vec<String>) {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let cells = (0..columns.len()).map(|i| cell_as_string!(row, i)).collect();
    (columns, cells)
}

fn sqlite_row_to_cells(row: &SqliteRow) -> (Vec<String>, Vec<String>) {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let cells = (0..columns.len()).map(|i| cell_as_string!(row, i)).collect();
    (columns, cells)
}

#[async_trait]
impl DataAdapter for SqlAdapter {
    async fn open(&self) -> Result<(), ConnectorError> {
        let probe = async {
            match &self.pool {
                SqlPool::Postgres(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
                SqlPool::MySql(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
                SqlPool::Sqlite(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
            }
        };
        probe.await.map_err(|e| unavailable(&self.source_name, e))
    }

    async fn execute(
        &self,
        query: &str,
        parameters: &[String],
        deadline: Duration,
        max_rows: u32,
    ) -> Result<AdapterResult, ConnectorError> {
        let sql = ensure_limit(&rewrite_placeholders(query, self.dialect()), max_rows);
        let started = tokio::time::Instant::now();

        let fetched = tokio::time::timeout(deadline, async {
            match &self.pool {
                SqlPool::Postgres(pool) => {
                    let mut q = sqlx::query(&sql);
                    for p in parameters {
                        q = q.bind(p);
                    }
                    q.fetch_all(pool)
                        .await
                        .map(|rows| rows.iter().map(pg_row_to_cells).collect::<Vec<_>>())
                }
                SqlPool::MySql(pool) => {
                    let mut q = sqlx::query(&sql);
                    for p in parameters {
                        q = q.bind(p);
                    }
                    q.fetch_all(pool)
                        .await
                        .map(|rows| rows.iter().map(mysql_row_to_cells).collect::<Vec<_>>())
                }
                SqlPool::Sqlite(pool) => {
                    let mut q = sqlx::query(&sql);
                    for p in parameters {
                        q = q.bind(p);
                    }
                    q.fetch_all(pool)
                        .await
                        .map(|rows| rows.iter().map(sqlite_row_to_cells).collect::<Vec<_>>())
                }
            }
        })
        .await
        .map_err(|_| ConnectorError::SourceTimeout {
            source_name: self.source_name.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })?
        .map_err(|e| ConnectorError::Execution(format!("{}: {e}", self.source_name)))?;

        let columns = fetched
            .first()
            .map(|(columns, _)| columns.clone())
            .unwrap_or_default();
        let mut rows: Vec<Vec<String>> =
            fetched.into_iter().map(|(_, cells)| cells).collect();
        let truncated = rows.len() > max_rows as usize;
        rows.truncate(max_rows as usize);

        Ok(AdapterResult {
            columns,
            rows,
            truncated,
        })
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        match &self.pool {
            SqlPool::Postgres(pool) => pool.close().await,
            SqlPool::MySql(pool) => pool.close().await,
            SqlPool::Sqlite(pool) => pool.close().await,
        }
        Ok(())
    }
}
