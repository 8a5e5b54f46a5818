//! Store boundary and an in-memory implementation.

use crate::error::Error;
use crate::predicate::Predicate;
use crate::storage::StorageRow;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Persistence of storage rows.
///
/// A relational implementation renders predicates with
/// [`Predicate::to_select_sql`]; [`MemoryStore`] evaluates them directly.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a row and returns it as stored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the row cannot be stored.
    async fn insert(&self, table: &str, row: StorageRow) -> Result<StorageRow, Error>;

    /// Returns the rows of `table` matching `predicate` (all rows if `None`),
    /// ordered by id.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the query fails, or
    /// `Error::InvalidPredicateComposition` if the predicate targets another table.
    async fn select(
        &self,
        table: &str,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<StorageRow>, Error>;
}

/// In-memory store keyed by table and id.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<BTreeMap<String, BTreeMap<i64, StorageRow>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a stored row, returning the previous one.
    pub async fn replace(&self, table: &str, row: StorageRow) -> Option<StorageRow> {
        self.tables.write().await.entry(table.to_string()).or_default().insert(row.id, row)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert(&self, table: &str, row: StorageRow) -> Result<StorageRow, Error> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        if rows.contains_key(&row.id) {
            return Err(Error::Store(format!("duplicate id {} in {table}", row.id)));
        }
        debug!(table, id = row.id, "row inserted");
        rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn select(
        &self,
        table: &str,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<StorageRow>, Error> {
        if let Some(p) = predicate {
            if p.table() != table {
                return Err(Error::InvalidPredicateComposition(format!(
                    "predicate for {} used on {table}",
                    p.table()
                )));
            }
        }
        let tables = self.tables.read().await;
        let rows = tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| predicate.map_or(true, |p| p.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }
}
