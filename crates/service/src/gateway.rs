//! Row-oriented persistence gateway contract
//!
//! The core never executes SQL itself; it talks to session and account
//! storage through [`Gateway`]. Production uses the sqlite implementation
//! in [`crate::database`], tests and databaseless deployments use
//! [`Memory`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

pub use self::memory::Memory;

pub mod memory;

/// Timestamp layout used when a temporal column arrives as text
pub const SQL_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single storage row, column name to value
pub type Row = HashMap<String, Value>;

/// A value stored in, or bound to, a gateway column
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent / NULL
    Null,
    /// Integer column
    Integer(i64),
    /// Text column
    Text(String),
    /// Native temporal column
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Integer content, if this is an integer
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Text content, if this is text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Temporal content. Rows may store timestamps natively or as
    /// pre-formatted strings; both are accepted here so every caller
    /// shares one parsing rule.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::Text(s) => parse_timestamp(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

/// Parse a textual timestamp in any of the layouts seen in session rows
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts.with_timezone(&Utc));
    }
    for format in [SQL_DATETIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }

    None
}

/// A conjunction of `column = value` terms. An empty filter matches
/// every row. Values are always bound, never interpolated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter(Vec<(String, Value)>);

impl Filter {
    /// Filter matching every row of a table
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter with a single equality term
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self(vec![(column.into(), value.into())])
    }

    /// Add another equality term
    pub fn and_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push((column.into(), value.into()));
        self
    }

    /// True when no terms constrain the match
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The equality terms, in insertion order
    pub fn terms(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(column, value)| (column.as_str(), value))
    }

    /// Whether `row` satisfies every term
    pub fn matches(&self, row: &Row) -> bool {
        self.0
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }
}

/// Row-oriented operations the core requires from its persistence layer
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Fetch the named `columns` of every row matching `filter`
    async fn get_rows(&self, table: &str, columns: &[&str], filter: &Filter) -> Result<Vec<Row>, Error>;

    /// Insert a single row
    async fn insert_row(&self, table: &str, columns: &[&str], values: &[Value]) -> Result<(), Error>;

    /// Set `columns` to `values` on every row matching `filter`,
    /// returning the number of rows affected
    async fn update_row(&self, table: &str, columns: &[&str], values: &[Value], filter: &Filter)
    -> Result<u64, Error>;

    /// Delete every row matching `filter`, returning the number removed
    async fn delete_rows(&self, table: &str, filter: &Filter) -> Result<u64, Error>;
}

/// A gateway error
#[derive(Debug, Error)]
pub enum Error {
    /// The named table does not exist
    #[error("unknown table {table}")]
    UnknownTable {
        /// Requested table name
        table: String,
    },
    /// A table or column name failed identifier validation
    #[error("invalid identifier {name}")]
    InvalidIdentifier {
        /// Offending name
        name: String,
    },
    /// Column and value counts differ
    #[error("column / value arity mismatch")]
    Arity,
    /// The underlying store failed to execute the operation
    #[error("execute operation")]
    Execute(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn timestamp_layouts() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();

        for text in [
            "2026-03-14T09:26:53Z",
            "2026-03-14T09:26:53+00:00",
            "2026-03-14 09:26:53",
            "2026-03-14 09:26:53.000",
            "2026-03-14 09:26:53+00:00",
            "  2026-03-14 09:26:53  ",
        ] {
            assert_eq!(parse_timestamp(text), Some(expected), "layout {text:?}");
        }

        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("not a date"), None);
        assert_eq!(parse_timestamp("2026-13-40 99:00:00"), None);
    }

    #[test]
    fn value_timestamp_accessor() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();

        assert_eq!(Value::Timestamp(expected).as_timestamp(), Some(expected));
        assert_eq!(Value::from("2026-03-14 09:26:53").as_timestamp(), Some(expected));
        assert_eq!(Value::from("garbage").as_timestamp(), None);
        assert_eq!(Value::Null.as_timestamp(), None);
        assert_eq!(Value::Integer(7).as_timestamp(), None);
    }

    #[test]
    fn filter_matching() {
        let row = Row::from([
            ("token".to_string(), Value::from("abc123")),
            ("user_id".to_string(), Value::Integer(42)),
        ]);

        assert!(Filter::all().matches(&row));
        assert!(Filter::eq("token", "abc123").matches(&row));
        assert!(Filter::eq("token", "abc123").and_eq("user_id", 42).matches(&row));
        assert!(!Filter::eq("token", "other").matches(&row));
        assert!(!Filter::eq("token", "abc123").and_eq("user_id", 7).matches(&row));
        assert!(!Filter::eq("missing", 1).matches(&row));
    }
}
