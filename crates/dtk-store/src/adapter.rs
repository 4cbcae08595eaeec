//! Narrow database adapter interface.
//!
//! The engine reads and writes through [`DatabaseAdapter`] only; backends
//! implement five operations and the row model below. Queries use named
//! parameters (`:from_date`), translated by each adapter to whatever the
//! driver expects.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;

use dtk_common::{format_timestamp, parse_timestamp, Error, Result};

/// A single database value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Numeric view: integers widen to floats
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int(v) => Some(*v as f64),
            SqlValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Timestamp view: accepts native timestamps, text forms, and epoch
    /// seconds
    pub fn as_timestamp(&self) -> Result<NaiveDateTime> {
        match self {
            SqlValue::Timestamp(t) => Ok(*t),
            SqlValue::Text(s) => parse_timestamp(s),
            SqlValue::Int(secs) => chrono::DateTime::from_timestamp(*secs, 0)
                .map(|t| t.naive_utc())
                .ok_or_else(|| Error::InvalidTimestamp(format!("epoch {}", secs))),
            SqlValue::Float(secs) => chrono::DateTime::from_timestamp(*secs as i64, 0)
                .map(|t| t.naive_utc())
                .ok_or_else(|| Error::InvalidTimestamp(format!("epoch {}", secs))),
            SqlValue::Null => Err(Error::InvalidTimestamp("NULL".to_string())),
        }
    }

    pub fn from_opt_f64(value: Option<f64>) -> SqlValue {
        match value {
            Some(v) => SqlValue::Float(v),
            None => SqlValue::Null,
        }
    }

    pub fn from_opt_text(value: Option<&str>) -> SqlValue {
        match value {
            Some(v) => SqlValue::Text(v.to_string()),
            None => SqlValue::Null,
        }
    }

    pub fn from_opt_timestamp(value: Option<NaiveDateTime>) -> SqlValue {
        match value {
            Some(t) => SqlValue::Timestamp(t),
            None => SqlValue::Null,
        }
    }

    /// The canonical text form used when binding to text-typed columns
    pub fn to_bind_string(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Int(v) => Some(v.to_string()),
            SqlValue::Float(v) => Some(v.to_string()),
            SqlValue::Text(v) => Some(v.clone()),
            SqlValue::Timestamp(t) => Some(format_timestamp(*t)),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

/// One result row, keyed by column name
pub type SqlRow = BTreeMap<String, SqlValue>;

/// Database backend interface used by every driftkit component.
///
/// `upsert` must provide write-or-replace semantics by `unique_keys`:
/// either through a deduplicating engine or an explicit DELETE+INSERT /
/// ON CONFLICT path.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Run a query with named parameters and return all rows
    async fn execute(&self, query: &str, params: &[(&str, SqlValue)]) -> Result<Vec<SqlRow>>;

    /// Run a DDL statement
    async fn execute_ddl(&self, statement: &str) -> Result<()>;

    /// Append rows to a table; all rows must share the same columns
    async fn insert(&self, table: &str, rows: &[SqlRow]) -> Result<u64>;

    /// Delete rows matching a predicate with named parameters
    async fn delete(&self, table: &str, predicate: &str, params: &[(&str, SqlValue)])
        -> Result<u64>;

    /// Write-or-replace rows by the given unique key columns. Columns not
    /// present in a row keep their previous value on conflict.
    async fn upsert(&self, table: &str, unique_keys: &[&str], rows: &[SqlRow]) -> Result<u64>;
}

/// Pull a named column out of a result row
pub fn column<'r>(row: &'r SqlRow, name: &str) -> Result<&'r SqlValue> {
    row.get(name)
        .ok_or_else(|| Error::Query(format!("result row has no column '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_views_widen() {
        assert_eq!(SqlValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(SqlValue::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(SqlValue::Text("x".into()).as_f64(), None);
        assert_eq!(SqlValue::Null.as_f64(), None);
    }

    #[test]
    fn timestamp_views() {
        let t = parse_timestamp("2024-02-01 00:00:00").unwrap();
        assert_eq!(SqlValue::Timestamp(t).as_timestamp().unwrap(), t);
        assert_eq!(SqlValue::Text("2024-02-01 00:00:00".into()).as_timestamp().unwrap(), t);
        assert_eq!(
            SqlValue::Int(t.and_utc().timestamp()).as_timestamp().unwrap(),
            t
        );
        assert!(SqlValue::Null.as_timestamp().is_err());
    }
}
