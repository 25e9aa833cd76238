// ABOUTME: Destination warehouse interface and the dataset/table naming scheme
// ABOUTME: Catalog lookups return Lookup::NotFound instead of failing

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::source::RowSet;

pub use memory::InMemoryWarehouse;

/// Column type used for every column of an inferred schema.
pub const TEXT_TYPE: &str = "text";

/// Outcome of a catalog lookup. Absence is an expected answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

/// Role of a destination dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Final,
    Changed,
    UnchangedIds,
}

impl DatasetKind {
    pub fn prefix(self) -> &'static str {
        match self {
            DatasetKind::Final => "final",
            DatasetKind::Changed => "changed",
            DatasetKind::UnchangedIds => "unchanged_ids",
        }
    }
}

/// Kind of extracted set. A `full` set is loaded straight into the final table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Full,
    Changed,
    UnchangedIds,
}

impl ArtifactKind {
    pub fn dataset_kind(self) -> DatasetKind {
        match self {
            ArtifactKind::Full => DatasetKind::Final,
            ArtifactKind::Changed => DatasetKind::Changed,
            ArtifactKind::UnchangedIds => DatasetKind::UnchangedIds,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactKind::Full => "full",
            ArtifactKind::Changed => "changed",
            ArtifactKind::UnchangedIds => "unchanged-ids",
        };
        f.write_str(name)
    }
}

/// A dataset named `{kind}_{environment}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetRef {
    pub name: String,
}

impl DatasetRef {
    pub fn new(kind: DatasetKind, environment: &str) -> Self {
        Self {
            name: format!("{}_{}", kind.prefix(), environment),
        }
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A table named `{kind}_{table}` inside the `{kind}_{environment}` dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(kind: DatasetKind, environment: &str, table: &str) -> Self {
        Self {
            dataset: DatasetRef::new(kind, environment).name,
            table: format!("{}_{}", kind.prefix(), table),
        }
    }

    pub fn final_table(environment: &str, table: &str) -> Self {
        Self::new(DatasetKind::Final, environment, table)
    }

    pub fn artifact(kind: ArtifactKind, environment: &str, table: &str) -> Self {
        Self::new(kind.dataset_kind(), environment, table)
    }

    pub fn dataset_ref(&self) -> DatasetRef {
        DatasetRef {
            name: self.dataset.clone(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// Recover the source table name from a destination table name.
pub fn source_table_name(kind: DatasetKind, destination_table: &str) -> Option<&str> {
    destination_table
        .strip_prefix(kind.prefix())
        .and_then(|rest| rest.strip_prefix('_'))
        .filter(|name| !name.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_column_names(&self, names: &[String]) -> bool {
        self.columns.len() == names.len()
            && self.columns.iter().zip(names).all(|(c, n)| &c.name == n)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    pub schema: TableSchema,
    pub num_rows: u64,
    /// `None` when the warehouse has no modification record for the table.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Operations the mirror needs from the destination warehouse.
///
/// Every mutating call records a new last-modified time for the table it
/// changes. `ensure_dataset` must tolerate concurrent callers.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn table_metadata(&self, table: &TableRef) -> Result<Lookup<TableMetadata>>;

    async fn ensure_dataset(&self, dataset: &DatasetRef) -> Result<()>;

    /// Replace the table's contents (creating it from `schema` if needed).
    async fn load_replace(&self, table: &TableRef, schema: &TableSchema, rows: &RowSet)
        -> Result<u64>;

    /// `DELETE FROM target WHERE key NOT IN (SELECT key FROM keys)`.
    async fn delete_missing_keys(
        &self,
        target: &TableRef,
        key_column: &str,
        keys: &TableRef,
    ) -> Result<u64>;

    /// `INSERT INTO target SELECT * FROM source`, matching columns by name.
    async fn insert_from(&self, target: &TableRef, source: &TableRef) -> Result<u64>;

    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Lookup<Vec<String>>>;

    /// Text rendering of `MAX(column)`; `Found(None)` for an empty table.
    async fn max_value(&self, table: &TableRef, column: &str) -> Result<Lookup<Option<String>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naming_scheme() {
        let final_table = TableRef::final_table("prod", "orders");
        assert_eq!(final_table.to_string(), "final_prod.final_orders");

        let ids = TableRef::artifact(ArtifactKind::UnchangedIds, "prod", "orders");
        assert_eq!(ids.to_string(), "unchanged_ids_prod.unchanged_ids_orders");

        let full = TableRef::artifact(ArtifactKind::Full, "prod", "orders");
        assert_eq!(full, final_table);
    }

    #[test]
    fn test_source_table_name() {
        assert_eq!(
            source_table_name(DatasetKind::Changed, "changed_order_items"),
            Some("order_items")
        );
        assert_eq!(source_table_name(DatasetKind::Changed, "changed_"), None);
        assert_eq!(source_table_name(DatasetKind::Changed, "final_orders"), None);
    }

    #[test]
    fn test_has_column_names_is_order_sensitive() {
        let schema = TableSchema {
            columns: vec![
                Column {
                    name: "id".to_string(),
                    data_type: "integer".to_string(),
                },
                Column {
                    name: "name".to_string(),
                    data_type: TEXT_TYPE.to_string(),
                },
            ],
        };
        assert!(schema.has_column_names(&["id".to_string(), "name".to_string()]));
        assert!(!schema.has_column_names(&["name".to_string(), "id".to_string()]));
        assert!(!schema.has_column_names(&["id".to_string()]));
    }

    #[test]
    fn test_lookup_helpers() {
        assert!(Lookup::Found(1).is_found());
        assert_eq!(Lookup::<u8>::NotFound.found(), None);
    }

    #[test]
    fn test_artifact_kind_display() {
        assert_eq!(ArtifactKind::UnchangedIds.to_string(), "unchanged-ids");
        assert_eq!(ArtifactKind::Full.dataset_kind(), DatasetKind::Final);
    }
}
