//! SQLite-backed persistence gateway
//!
//! Pooled sqlite database implementing the row contract in
//! [`crate::gateway`]. Identifiers are validated and every value is
//! bound, never interpolated into the statement text.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteRow};
use sqlx::{Column, Pool, Row as _, Sqlite, TypeInfo, ValueRef};
use thiserror::Error;

use crate::gateway::{self, Filter, Gateway, Row, Value};
use crate::registry::{Permit, Singleton};

/// Connection pool to the underlying sqlite database
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Singleton for Database {}

impl Database {
    /// Opens (or creates) the database at `path` and runs migrations.
    ///
    /// Takes a registry [`Permit`]: the pool is a stateful singleton and
    /// must only ever be constructed through the registry.
    pub async fn connect(_permit: Permit, path: impl AsRef<Path>) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .read_only(false)
            .foreign_keys(true);

        let pool = sqlx::SqlitePool::connect_with(options).await.map_err(Error::Connect)?;

        sqlx::migrate!("src/database/migrations")
            .run(&pool)
            .await
            .map_err(Error::Migrate)?;

        Ok(Self { pool })
    }
}

type Query<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn identifier(name: &str) -> Result<&str, gateway::Error> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(name)
    } else {
        Err(gateway::Error::InvalidIdentifier {
            name: name.to_string(),
        })
    }
}

fn projection(columns: &[&str]) -> Result<String, gateway::Error> {
    let columns = columns
        .iter()
        .map(|column| identifier(column).map(str::to_owned))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns.join(", "))
}

fn where_clause(filter: &Filter) -> Result<String, gateway::Error> {
    if filter.is_empty() {
        return Ok(String::new());
    }

    let terms = filter
        .terms()
        .map(|(column, _)| Ok(format!("{} = ?", identifier(column)?)))
        .collect::<Result<Vec<_>, gateway::Error>>()?;

    Ok(format!(" WHERE {}", terms.join(" AND ")))
}

fn bind_value<'q>(query: Query<'q>, value: &Value) -> Query<'q> {
    match value {
        Value::Null => query.bind(Option::<i64>::None),
        Value::Integer(n) => query.bind(*n),
        Value::Text(s) => query.bind(s.clone()),
        Value::Timestamp(ts) => query.bind(*ts),
    }
}

fn execute(e: sqlx::Error) -> gateway::Error {
    gateway::Error::Execute(Box::new(e))
}

fn decode_row(row: &SqliteRow) -> Result<Row, gateway::Error> {
    let mut decoded = Row::new();

    for column in row.columns() {
        let ordinal = column.ordinal();
        let raw = row.try_get_raw(ordinal).map_err(execute)?;
        let type_name = raw.type_info().name().to_uppercase();

        let value = if raw.is_null() {
            Value::Null
        } else if type_name.contains("INT") {
            Value::Integer(row.try_get(ordinal).map_err(execute)?)
        } else if type_name.contains("DATE") || type_name.contains("TIME") {
            match row.try_get::<DateTime<Utc>, _>(ordinal) {
                Ok(ts) => Value::Timestamp(ts),
                // Legacy rows may carry free-form timestamp strings; hand
                // them back as text for the shared parser to deal with
                Err(_) => Value::Text(row.try_get(ordinal).map_err(execute)?),
            }
        } else {
            Value::Text(row.try_get(ordinal).map_err(execute)?)
        };

        decoded.insert(column.name().to_string(), value);
    }

    Ok(decoded)
}

#[async_trait]
impl Gateway for Database {
    async fn get_rows(&self, table: &str, columns: &[&str], filter: &Filter) -> Result<Vec<Row>, gateway::Error> {
        let sql = format!(
            "SELECT {} FROM {}{}",
            projection(columns)?,
            identifier(table)?,
            where_clause(filter)?
        );

        let mut query = sqlx::query(&sql);
        for (_, value) in filter.terms() {
            query = bind_value(query, value);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(execute)?;
        rows.iter().map(decode_row).collect()
    }

    async fn insert_row(&self, table: &str, columns: &[&str], values: &[Value]) -> Result<(), gateway::Error> {
        if columns.len() != values.len() {
            return Err(gateway::Error::Arity);
        }

        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            identifier(table)?,
            projection(columns)?,
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for value in values {
            query = bind_value(query, value);
        }

        query.execute(&self.pool).await.map_err(execute)?;
        Ok(())
    }

    async fn update_row(
        &self,
        table: &str,
        columns: &[&str],
        values: &[Value],
        filter: &Filter,
    ) -> Result<u64, gateway::Error> {
        if columns.len() != values.len() {
            return Err(gateway::Error::Arity);
        }

        let assignments = columns
            .iter()
            .map(|column| Ok(format!("{} = ?", identifier(column)?)))
            .collect::<Result<Vec<_>, gateway::Error>>()?
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {}{}",
            identifier(table)?,
            assignments,
            where_clause(filter)?
        );

        let mut query = sqlx::query(&sql);
        for value in values {
            query = bind_value(query, value);
        }
        for (_, value) in filter.terms() {
            query = bind_value(query, value);
        }

        let result = query.execute(&self.pool).await.map_err(execute)?;
        Ok(result.rows_affected())
    }

    async fn delete_rows(&self, table: &str, filter: &Filter) -> Result<u64, gateway::Error> {
        let sql = format!("DELETE FROM {}{}", identifier(table)?, where_clause(filter)?);

        let mut query = sqlx::query(&sql);
        for (_, value) in filter.terms() {
            query = bind_value(query, value);
        }

        let result = query.execute(&self.pool).await.map_err(execute)?;
        Ok(result.rows_affected())
    }
}

/// A database error
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to connect
    #[error("failed to connect")]
    Connect(#[source] sqlx::Error),
    /// Migrations failed
    #[error("migrations failed")]
    Migrate(#[source] sqlx::migrate::MigrateError),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identifiers_are_validated() {
        assert!(identifier("connections").is_ok());
        assert!(identifier("user_id").is_ok());
        assert!(identifier("").is_err());
        assert!(identifier("token = 'x' OR 1=1 --").is_err());
        assert!(identifier("drop table;").is_err());
    }

    #[test]
    fn where_clause_shape() {
        assert_eq!(where_clause(&Filter::all()).unwrap(), "");
        assert_eq!(where_clause(&Filter::eq("token", "abc")).unwrap(), " WHERE token = ?");
        assert_eq!(
            where_clause(&Filter::eq("token", "abc").and_eq("user_id", 1)).unwrap(),
            " WHERE token = ? AND user_id = ?"
        );
        assert!(where_clause(&Filter::eq("bad column", 1)).is_err());
    }
}
