//! SQLite store, schema versioning and HTTP fetch utilities for UDR.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
};
use sqlx::query::Query;
use sqlx::{Column, Executor, Pool, Row, Sqlite, Statement, Transaction, TypeInfo, ValueRef};
use thiserror::Error;
use tracing::{debug, info};
use udr_core::{Headlines, SqlParam, Table};

pub mod fetch;
pub mod schema;

pub use fetch::{parse_http_date, retry_delay, FetchError, FetchSettings, FetchedReport, LicenceFetcher};
pub use schema::{ensure_schema, record_version, SchemaOutcome};

pub const CRATE_NAME: &str = "udr-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("creating database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error("headline query returned {0} column(s), need at least 2")]
    Headlines(usize),
    #[error("schema step {0} has no update query")]
    MissingUpdate(u32),
}

/// One connection only: SQLite allows a single writer and every run holds a
/// transaction for its whole duration.
#[derive(Debug, Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
    path: PathBuf,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>, on_open: Option<&str>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        if let Some(statement) = on_open.map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::raw_sql(statement).execute(&pool).await?;
        }

        info!(path = %path.display(), "opened database");
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [SqlParam],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlParam::Text(v) => query.bind(v.as_str()),
            SqlParam::Int(v) => query.bind(*v),
            SqlParam::Bool(v) => query.bind(*v),
            SqlParam::Null => query.bind(Option::<String>::None),
        };
    }
    query
}

pub async fn exec(
    conn: &mut SqliteConnection,
    sql: &str,
    params: &[SqlParam],
) -> Result<u64, StoreError> {
    let result = bind_params(sqlx::query(sql), params)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Run a template that may hold several `;`-separated statements.
pub async fn exec_batch(conn: &mut SqliteConnection, sql: &str) -> Result<(), StoreError> {
    debug!(sql, "executing batch");
    (&mut *conn).execute(sqlx::raw_sql(sql)).await?;
    Ok(())
}

pub async fn prepare(conn: &mut SqliteConnection, sql: &str) -> Result<(), StoreError> {
    (&mut *conn).prepare(sql).await?;
    Ok(())
}

fn cell_text(row: &sqlx::sqlite::SqliteRow, index: usize) -> Result<String, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(String::new());
    }
    let type_name = raw.type_info().name().to_string();
    Ok(match type_name.as_str() {
        "INTEGER" => row.try_get_unchecked::<i64, _>(index)?.to_string(),
        "REAL" => row.try_get_unchecked::<f64, _>(index)?.to_string(),
        _ => row.try_get_unchecked::<String, _>(index)?,
    })
}

/// Run a query and render every cell as text. The header comes from the
/// prepared statement so an empty result still carries its columns.
pub async fn query_to_table(conn: &mut SqliteConnection, sql: &str) -> Result<Table, StoreError> {
    let columns: Vec<String> = {
        let statement = (&mut *conn).prepare(sql).await?;
        statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    };

    let rows = sqlx::query(sql).fetch_all(&mut *conn).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut cells = Vec::with_capacity(columns.len());
        for index in 0..row.len() {
            cells.push(cell_text(row, index)?);
        }
        out.push(cells);
    }
    Ok(Table { columns, rows: out })
}

pub async fn query_headlines(
    conn: &mut SqliteConnection,
    sql: &str,
) -> Result<Headlines, StoreError> {
    let table = query_to_table(conn, sql).await?;
    if table.columns.len() < 2 {
        return Err(StoreError::Headlines(table.columns.len()));
    }
    Ok(table
        .rows
        .into_iter()
        .map(|mut row| {
            let value = row.swap_remove(1);
            let name = row.swap_remove(0);
            (name, value)
        })
        .collect())
}

pub async fn query_column(
    conn: &mut SqliteConnection,
    sql: &str,
    params: &[SqlParam],
) -> Result<Vec<String>, StoreError> {
    let rows = bind_params(sqlx::query(sql), params)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .filter(|row| !row.is_empty())
        .map(|row| cell_text(row, 0).map_err(StoreError::from))
        .collect()
}

pub async fn scalar_text(
    conn: &mut SqliteConnection,
    sql: &str,
    params: &[SqlParam],
) -> Result<Option<String>, StoreError> {
    let row = bind_params(sqlx::query(sql), params)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) if !row.is_empty() => {
            if row.try_get_raw(0)?.is_null() {
                Ok(None)
            } else {
                Ok(Some(cell_text(&row, 0)?))
            }
        }
        _ => Ok(None),
    }
}

pub async fn scalar_i64(conn: &mut SqliteConnection, sql: &str) -> Result<i64, StoreError> {
    let value: Option<Option<i64>> = sqlx::query_scalar(sql).fetch_optional(&mut *conn).await?;
    Ok(value.flatten().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("nested/udr.db"), Some("PRAGMA foreign_keys = ON"))
            .await
            .expect("open");
        (dir, store)
    }

    #[tokio::test]
    async fn tables_render_cells_as_text_and_keep_empty_headers() {
        let (_dir, store) = store().await;
        let mut conn = store.pool().acquire().await.expect("conn");
        exec_batch(
            &mut conn,
            "CREATE TABLE t (name TEXT, n INTEGER, r REAL, missing TEXT);
             INSERT INTO t VALUES ('a', 3, 1.5, NULL);",
        )
        .await
        .expect("setup");

        let table = query_to_table(&mut conn, "SELECT name, n, r, missing FROM t")
            .await
            .expect("query");
        assert_eq!(table.columns, vec!["name", "n", "r", "missing"]);
        assert_eq!(table.rows, vec![vec!["a", "3", "1.5", ""]]);

        let empty = query_to_table(&mut conn, "SELECT name AS Source FROM t WHERE 0")
            .await
            .expect("query");
        assert_eq!(empty.columns, vec!["Source"]);
        assert!(empty.is_header_only());
    }

    #[tokio::test]
    async fn numbered_parameters_bind_in_order() {
        let (_dir, store) = store().await;
        let mut tx = store.begin().await.expect("begin");
        exec_batch(&mut tx, "CREATE TABLE p (a TEXT, b INTEGER, c INTEGER, d TEXT)")
            .await
            .expect("create");
        let affected = exec(
            &mut tx,
            "INSERT INTO p (d, c, b, a) VALUES (?4, ?3, ?2, ?1)",
            &[
                SqlParam::Text("x".into()),
                SqlParam::Int(7),
                SqlParam::Bool(true),
                SqlParam::Null,
            ],
        )
        .await
        .expect("insert");
        assert_eq!(affected, 1);
        tx.commit().await.expect("commit");

        let mut conn = store.pool().acquire().await.expect("conn");
        let value = scalar_text(&mut conn, "SELECT b + c FROM p WHERE a = ?1", &["x".into()])
            .await
            .expect("scalar");
        assert_eq!(value.as_deref(), Some("8"));
        assert_eq!(
            scalar_text(&mut conn, "SELECT d FROM p", &[]).await.expect("null"),
            None
        );
    }

    #[tokio::test]
    async fn headlines_need_two_columns() {
        let (_dir, store) = store().await;
        let mut conn = store.pool().acquire().await.expect("conn");
        let headlines = query_headlines(&mut conn, "SELECT 'Host', 'itrsrh1' UNION ALL SELECT 'Count', 2")
            .await
            .expect("headlines");
        assert_eq!(
            headlines,
            vec![
                ("Host".to_string(), "itrsrh1".to_string()),
                ("Count".to_string(), "2".to_string())
            ]
        );
        assert!(matches!(
            query_headlines(&mut conn, "SELECT 1").await,
            Err(StoreError::Headlines(1))
        ));
    }
}
