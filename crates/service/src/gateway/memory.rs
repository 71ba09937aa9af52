//! In-process persistence gateway
//!
//! Backs the row contract with plain maps. Used by tests and by
//! deployments running without a database file. Tables must be created
//! up front, mirroring the sqlite gateway refusing unknown tables.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Error, Filter, Gateway, Row, Value};
use crate::registry::Singleton;

/// Gateway holding all rows in process memory
#[derive(Debug, Clone, Default)]
pub struct Memory {
    tables: Arc<RwLock<HashMap<String, Vec<Row>>>>,
}

impl Memory {
    /// An empty store with no tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `table` if it does not exist yet
    pub async fn create_table(&self, table: impl Into<String>) {
        self.tables.write().await.entry(table.into()).or_default();
    }
}

impl Singleton for Memory {}

fn project(row: &Row, columns: &[&str]) -> Row {
    columns
        .iter()
        .map(|column| {
            let value = row.get(*column).cloned().unwrap_or(Value::Null);
            (column.to_string(), value)
        })
        .collect()
}

fn unknown(table: &str) -> Error {
    Error::UnknownTable {
        table: table.to_string(),
    }
}

#[async_trait]
impl Gateway for Memory {
    async fn get_rows(&self, table: &str, columns: &[&str], filter: &Filter) -> Result<Vec<Row>, Error> {
        let tables = self.tables.read().await;
        let rows = tables.get(table).ok_or_else(|| unknown(table))?;

        Ok(rows
            .iter()
            .filter(|row| filter.matches(row))
            .map(|row| project(row, columns))
            .collect())
    }

    async fn insert_row(&self, table: &str, columns: &[&str], values: &[Value]) -> Result<(), Error> {
        if columns.len() != values.len() {
            return Err(Error::Arity);
        }

        let mut tables = self.tables.write().await;
        let rows = tables.get_mut(table).ok_or_else(|| unknown(table))?;

        rows.push(
            columns
                .iter()
                .zip(values)
                .map(|(column, value)| (column.to_string(), value.clone()))
                .collect(),
        );

        Ok(())
    }

    async fn update_row(
        &self,
        table: &str,
        columns: &[&str],
        values: &[Value],
        filter: &Filter,
    ) -> Result<u64, Error> {
        if columns.len() != values.len() {
            return Err(Error::Arity);
        }

        let mut tables = self.tables.write().await;
        let rows = tables.get_mut(table).ok_or_else(|| unknown(table))?;

        let mut affected = 0;
        for row in rows.iter_mut().filter(|row| filter.matches(row)) {
            for (column, value) in columns.iter().zip(values) {
                row.insert(column.to_string(), value.clone());
            }
            affected += 1;
        }

        Ok(affected)
    }

    async fn delete_rows(&self, table: &str, filter: &Filter) -> Result<u64, Error> {
        let mut tables = self.tables.write().await;
        let rows = tables.get_mut(table).ok_or_else(|| unknown(table))?;

        let before = rows.len();
        rows.retain(|row| !filter.matches(row));

        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unknown_table_is_an_error() {
        let memory = Memory::new();

        assert!(matches!(
            memory.get_rows("nope", &["id"], &Filter::all()).await,
            Err(Error::UnknownTable { .. })
        ));
        assert!(matches!(
            memory.insert_row("nope", &["id"], &[Value::Integer(1)]).await,
            Err(Error::UnknownTable { .. })
        ));
    }

    #[tokio::test]
    async fn roundtrip() {
        let memory = Memory::new();
        memory.create_table("pets").await;

        memory
            .insert_row("pets", &["id", "name"], &[1.into(), "biscuit".into()])
            .await
            .unwrap();
        memory
            .insert_row("pets", &["id", "name"], &[2.into(), "mochi".into()])
            .await
            .unwrap();

        let rows = memory
            .get_rows("pets", &["name"], &Filter::eq("id", 2))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name").and_then(Value::as_text), Some("mochi"));

        let affected = memory
            .update_row("pets", &["name"], &["pretzel".into()], &Filter::eq("id", 2))
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let removed = memory.delete_rows("pets", &Filter::eq("id", 1)).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = memory.get_rows("pets", &["id", "name"], &Filter::all()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].get("name").and_then(Value::as_text), Some("pretzel"));
    }

    #[tokio::test]
    async fn projection_fills_absent_columns_with_null() {
        let memory = Memory::new();
        memory.create_table("pets").await;
        memory.insert_row("pets", &["id"], &[1.into()]).await.unwrap();

        let rows = memory
            .get_rows("pets", &["id", "name"], &Filter::all())
            .await
            .unwrap();
        assert_eq!(rows[0].get("name"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn arity_mismatch_is_rejected() {
        let memory = Memory::new();
        memory.create_table("pets").await;

        assert!(matches!(
            memory.insert_row("pets", &["id", "name"], &[1.into()]).await,
            Err(Error::Arity)
        ));
        assert!(matches!(
            memory
                .update_row("pets", &["id"], &[], &Filter::all())
                .await,
            Err(Error::Arity)
        ));
    }
}
