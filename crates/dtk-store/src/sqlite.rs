//! SQLite implementation of the database adapter.
//!
//! Uses runtime-checked `sqlx::query` calls; the internal tables are
//! created at run time so compile-time query macros do not apply. SQLite
//! has no deduplicating merge engine, so `upsert` is an
//! `INSERT ... ON CONFLICT DO UPDATE`.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use dtk_common::{Error, Result};

use crate::adapter::{DatabaseAdapter, SqlRow, SqlValue};

/// SQLite-backed adapter over a connection pool
pub struct SqliteAdapter {
    pool: SqlitePool,
    query_timeout: Duration,
}

impl SqliteAdapter {
    /// Open (creating if missing) a file-backed database
    pub async fn connect(path: &str, query_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        Ok(SqliteAdapter { pool, query_timeout })
    }

    /// Open an in-memory database. The pool is pinned to a single
    /// connection because each SQLite memory connection is its own
    /// database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_err)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        Ok(SqliteAdapter {
            pool,
            query_timeout: Duration::from_secs(300),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn timed<T, F: Future<Output = std::result::Result<T, sqlx::Error>>>(
        &self,
        what: &str,
        fut: F,
    ) -> Result<T> {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result.map_err(db_err),
            Err(_) => Err(Error::Timeout(format!(
                "{} exceeded {}s",
                what,
                self.query_timeout.as_secs()
            ))),
        }
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

/// Rewrite `:name` placeholders (outside string literals, ignoring `::`
/// casts) to positional `?` binds, returning the bind values in order.
fn rewrite_placeholders(
    query: &str,
    params: &[(&str, SqlValue)],
) -> Result<(String, Vec<SqlValue>)> {
    let mut rewritten = String::with_capacity(query.len());
    let mut binds = Vec::new();
    let chars: Vec<char> = query.chars().collect();
    let mut i = 0;
    let mut in_single = false;
    let mut in_double = false;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                rewritten.push(c);
                i += 1;
            }
            '"' if !in_single => {
                in_double = !in_double;
                rewritten.push(c);
                i += 1;
            }
            ':' if !in_single && !in_double => {
                let prev_is_colon = i > 0 && chars[i - 1] == ':';
                let next_is_colon = i + 1 < chars.len() && chars[i + 1] == ':';
                let starts_ident = i + 1 < chars.len()
                    && (chars[i + 1].is_ascii_alphabetic() || chars[i + 1] == '_');
                if prev_is_colon || next_is_colon || !starts_ident {
                    rewritten.push(c);
                    i += 1;
                    continue;
                }
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let name: String = chars[i + 1..j].iter().collect();
                let value = params
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| {
                        Error::Query(format!("query references unbound parameter :{}", name))
                    })?;
                binds.push(value);
                rewritten.push('?');
                i = j;
            }
            _ => {
                rewritten.push(c);
                i += 1;
            }
        }
    }
    Ok((rewritten, binds))
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &[SqlValue],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for value in binds {
        query = match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Timestamp(t) => query.bind(dtk_common::format_timestamp(*t)),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> Result<SqlRow> {
    let mut out = SqlRow::new();
    for column in row.columns() {
        let ordinal = column.ordinal();
        let raw = row.try_get_raw(ordinal).map_err(db_err)?;
        let value = if raw.is_null() {
            SqlValue::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => SqlValue::Int(row.try_get(ordinal).map_err(db_err)?),
                "REAL" => SqlValue::Float(row.try_get(ordinal).map_err(db_err)?),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get(ordinal).map_err(db_err)?;
                    SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => SqlValue::Text(row.try_get(ordinal).map_err(db_err)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn insert_statement(table: &str, columns: &[&String]) -> String {
    let placeholders = vec!["?"; columns.len()].join(", ");
    let column_list = columns
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table, column_list, placeholders
    )
}

fn upsert_statement(table: &str, columns: &[&String], unique_keys: &[&str]) -> String {
    let base = insert_statement(table, columns);
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !unique_keys.contains(&c.as_str()))
        .map(|c| format!("{} = excluded.{}", c, c))
        .collect();
    if updates.is_empty() {
        format!("{} ON CONFLICT({}) DO NOTHING", base, unique_keys.join(", "))
    } else {
        format!(
            "{} ON CONFLICT({}) DO UPDATE SET {}",
            base,
            unique_keys.join(", "),
            updates.join(", ")
        )
    }
}

fn row_binds(row: &SqlRow, columns: &[&String]) -> Result<Vec<SqlValue>> {
    columns
        .iter()
        .map(|c| {
            row.get(c.as_str()).cloned().ok_or_else(|| {
                Error::Database(format!("row is missing column '{}'", c))
            })
        })
        .collect()
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    async fn execute(&self, query: &str, params: &[(&str, SqlValue)]) -> Result<Vec<SqlRow>> {
        let (rewritten, binds) = rewrite_placeholders(query, params)?;
        let rows = self
            .timed("query", bind_all(sqlx::query(&rewritten), &binds).fetch_all(&self.pool))
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute_ddl(&self, statement: &str) -> Result<()> {
        self.timed("ddl", sqlx::query(statement).execute(&self.pool))
            .await?;
        Ok(())
    }

    async fn insert(&self, table: &str, rows: &[SqlRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns: Vec<&String> = rows[0].keys().collect();
        let statement = insert_statement(table, &columns);
        let mut tx = self.timed("begin", self.pool.begin()).await?;
        let mut written = 0;
        for row in rows {
            let binds = row_binds(row, &columns)?;
            let result = self
                .timed("insert", bind_all(sqlx::query(&statement), &binds).execute(&mut *tx))
                .await?;
            written += result.rows_affected();
        }
        self.timed("commit", tx.commit()).await?;
        Ok(written)
    }

    async fn delete(
        &self,
        table: &str,
        predicate: &str,
        params: &[(&str, SqlValue)],
    ) -> Result<u64> {
        let statement = format!("DELETE FROM {} WHERE {}", table, predicate);
        let (rewritten, binds) = rewrite_placeholders(&statement, params)?;
        let result = self
            .timed("delete", bind_all(sqlx::query(&rewritten), &binds).execute(&self.pool))
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert(&self, table: &str, unique_keys: &[&str], rows: &[SqlRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns: Vec<&String> = rows[0].keys().collect();
        let statement = upsert_statement(table, &columns, unique_keys);
        let mut tx = self.timed("begin", self.pool.begin()).await?;
        let mut written = 0;
        for row in rows {
            let binds = row_binds(row, &columns)?;
            let result = self
                .timed("upsert", bind_all(sqlx::query(&statement), &binds).execute(&mut *tx))
                .await?;
            written += result.rows_affected();
        }
        self.timed("commit", tx.commit()).await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_named_placeholders_in_order() {
        let params = [
            ("from_date", SqlValue::Text("a".into())),
            ("to_date", SqlValue::Text("b".into())),
        ];
        let (sql, binds) = rewrite_placeholders(
            "SELECT * FROM t WHERE ts >= :from_date AND ts < :to_date AND ts != :from_date",
            &params,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM t WHERE ts >= ? AND ts < ? AND ts != ?"
        );
        assert_eq!(
            binds,
            vec![
                SqlValue::Text("a".into()),
                SqlValue::Text("b".into()),
                SqlValue::Text("a".into())
            ]
        );
    }

    #[test]
    fn placeholder_scan_skips_strings_and_casts() {
        let params = [("x", SqlValue::Int(1))];
        let (sql, binds) =
            rewrite_placeholders("SELECT ':x' AS lit, v::int, :x FROM t", &params).unwrap();
        assert_eq!(sql, "SELECT ':x' AS lit, v::int, ? FROM t");
        assert_eq!(binds.len(), 1);
    }

    #[test]
    fn unbound_placeholder_is_an_error() {
        assert!(rewrite_placeholders("SELECT :missing", &[]).is_err());
    }

    #[test]
    fn upsert_statement_shape() {
        let a = "a".to_string();
        let b = "b".to_string();
        let k = "k".to_string();
        let columns = vec![&a, &b, &k];
        let sql = upsert_statement("t", &columns, &["k"]);
        assert_eq!(
            sql,
            "INSERT INTO t (a, b, k) VALUES (?, ?, ?) ON CONFLICT(k) DO UPDATE SET a = excluded.a, b = excluded.b"
        );
    }

    #[tokio::test]
    async fn round_trips_values() {
        let adapter = SqliteAdapter::in_memory().await.unwrap();
        adapter
            .execute_ddl("CREATE TABLE vals (i INTEGER, f REAL, s TEXT, n TEXT)")
            .await
            .unwrap();
        let mut row = SqlRow::new();
        row.insert("i".into(), SqlValue::Int(42));
        row.insert("f".into(), SqlValue::Float(2.5));
        row.insert("s".into(), SqlValue::Text("hello".into()));
        row.insert("n".into(), SqlValue::Null);
        adapter.insert("vals", &[row]).await.unwrap();

        let rows = adapter.execute("SELECT * FROM vals", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["i"], SqlValue::Int(42));
        assert_eq!(rows[0]["f"], SqlValue::Float(2.5));
        assert_eq!(rows[0]["s"], SqlValue::Text("hello".into()));
        assert!(rows[0]["n"].is_null());
    }

    #[tokio::test]
    async fn upsert_replaces_by_key() {
        let adapter = SqliteAdapter::in_memory().await.unwrap();
        adapter
            .execute_ddl("CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER)")
            .await
            .unwrap();
        let mut row = SqlRow::new();
        row.insert("k".into(), SqlValue::Text("a".into()));
        row.insert("v".into(), SqlValue::Int(1));
        adapter.upsert("kv", &["k"], &[row.clone()]).await.unwrap();
        row.insert("v".into(), SqlValue::Int(2));
        adapter.upsert("kv", &["k"], &[row]).await.unwrap();

        let rows = adapter.execute("SELECT v FROM kv WHERE k = :k", &[("k", SqlValue::Text("a".into()))]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["v"], SqlValue::Int(2));
    }
}
