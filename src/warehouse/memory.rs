// ABOUTME: In-memory warehouse used by the test suite and dry runs
// ABOUTME: Implements the set operations directly and supports fault injection

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use super::{DatasetRef, Lookup, TableMetadata, TableRef, TableSchema, Warehouse};
use crate::source::RowSet;

/// Warehouse calls that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Metadata,
    EnsureDataset,
    Load,
    DeleteMissingKeys,
    InsertFrom,
    ListTables,
    MaxValue,
}

#[derive(Debug, Clone)]
struct StoredTable {
    schema: TableSchema,
    rows: Vec<Vec<Option<String>>>,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    datasets: BTreeSet<String>,
    tables: BTreeMap<(String, String), StoredTable>,
    failing: HashSet<Operation>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryWarehouse {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `op` fail until `recover` is called.
    pub fn fail(&self, op: Operation) {
        self.lock().failing.insert(op);
    }

    pub fn recover(&self, op: Operation) {
        self.lock().failing.remove(&op);
    }

    /// Backdate or forward-date a table's last-modified time.
    pub fn set_modified(&self, table: &TableRef, modified: DateTime<Utc>) {
        if let Some(t) = self.lock().tables.get_mut(&key(table)) {
            t.modified = modified;
        }
    }

    /// Snapshot of a table's rows with its column header.
    pub fn rows(&self, table: &TableRef) -> Option<RowSet> {
        self.lock().tables.get(&key(table)).map(|t| RowSet {
            columns: t.schema.column_names(),
            rows: t.rows.clone(),
        })
    }

    pub fn has_dataset(&self, dataset: &DatasetRef) -> bool {
        self.lock().datasets.contains(&dataset.name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, op: Operation) -> Result<()> {
        if self.lock().failing.contains(&op) {
            bail!("warehouse unavailable during {:?}", op);
        }
        Ok(())
    }
}

fn key(table: &TableRef) -> (String, String) {
    (table.dataset.clone(), table.table.clone())
}

fn not_found(table: &TableRef) -> anyhow::Error {
    anyhow!("Not found: Table {}", table)
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn table_metadata(&self, table: &TableRef) -> Result<Lookup<TableMetadata>> {
        self.check(Operation::Metadata)?;
        Ok(match self.lock().tables.get(&key(table)) {
            Some(t) => Lookup::Found(TableMetadata {
                schema: t.schema.clone(),
                num_rows: t.rows.len() as u64,
                last_modified: Some(t.modified),
            }),
            None => Lookup::NotFound,
        })
    }

    async fn ensure_dataset(&self, dataset: &DatasetRef) -> Result<()> {
        self.check(Operation::EnsureDataset)?;
        self.lock().datasets.insert(dataset.name.clone());
        Ok(())
    }

    async fn load_replace(
        &self,
        table: &TableRef,
        schema: &TableSchema,
        rows: &RowSet,
    ) -> Result<u64> {
        self.check(Operation::Load)?;
        let mut inner = self.lock();
        if !inner.datasets.contains(&table.dataset) {
            bail!("Not found: Dataset {}", table.dataset);
        }
        if !schema.has_column_names(&rows.columns) {
            bail!(
                "schema for {} does not match extracted columns {:?}",
                table,
                rows.columns
            );
        }
        inner.tables.insert(
            key(table),
            StoredTable {
                schema: schema.clone(),
                rows: rows.rows.clone(),
                modified: Utc::now(),
            },
        );
        Ok(rows.len() as u64)
    }

    async fn delete_missing_keys(
        &self,
        target: &TableRef,
        key_column: &str,
        keys: &TableRef,
    ) -> Result<u64> {
        self.check(Operation::DeleteMissingKeys)?;
        let mut inner = self.lock();

        let keep: HashSet<String> = {
            let ids = inner.tables.get(&key(keys)).ok_or_else(|| not_found(keys))?;
            let idx = ids
                .schema
                .columns
                .iter()
                .position(|c| c.name == key_column)
                .ok_or_else(|| anyhow!("Unrecognized name: {} in {}", key_column, keys))?;
            ids.rows
                .iter()
                .filter_map(|row| row.get(idx).cloned().flatten())
                .collect()
        };

        let table = inner
            .tables
            .get_mut(&key(target))
            .ok_or_else(|| not_found(target))?;
        let idx = table
            .schema
            .columns
            .iter()
            .position(|c| c.name == key_column)
            .ok_or_else(|| anyhow!("Unrecognized name: {} in {}", key_column, target))?;

        let before = table.rows.len();
        // NULL keys never satisfy NOT IN, so they stay.
        table.rows.retain(|row| match row.get(idx).and_then(|v| v.as_ref()) {
            Some(value) => keep.contains(value),
            None => true,
        });
        let deleted = (before - table.rows.len()) as u64;
        table.modified = Utc::now();
        Ok(deleted)
    }

    async fn insert_from(&self, target: &TableRef, source: &TableRef) -> Result<u64> {
        self.check(Operation::InsertFrom)?;
        let mut inner = self.lock();

        let incoming = inner
            .tables
            .get(&key(source))
            .cloned()
            .ok_or_else(|| not_found(source))?;
        let table = inner
            .tables
            .get_mut(&key(target))
            .ok_or_else(|| not_found(target))?;

        let mapping: Vec<Option<usize>> = table
            .schema
            .columns
            .iter()
            .map(|c| incoming.schema.columns.iter().position(|s| s.name == c.name))
            .collect();

        for row in &incoming.rows {
            table.rows.push(
                mapping
                    .iter()
                    .map(|idx| idx.and_then(|i| row.get(i).cloned().flatten()))
                    .collect(),
            );
        }
        table.modified = Utc::now();
        Ok(incoming.rows.len() as u64)
    }

    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Lookup<Vec<String>>> {
        self.check(Operation::ListTables)?;
        let inner = self.lock();
        if !inner.datasets.contains(&dataset.name) {
            return Ok(Lookup::NotFound);
        }
        Ok(Lookup::Found(
            inner
                .tables
                .keys()
                .filter(|(d, _)| d == &dataset.name)
                .map(|(_, t)| t.clone())
                .collect(),
        ))
    }

    async fn max_value(&self, table: &TableRef, column: &str) -> Result<Lookup<Option<String>>> {
        self.check(Operation::MaxValue)?;
        let inner = self.lock();
        let Some(stored) = inner.tables.get(&key(table)) else {
            return Ok(Lookup::NotFound);
        };
        let idx = stored
            .schema
            .columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| anyhow!("Unrecognized name: {} in {}", column, table))?;
        Ok(Lookup::Found(
            stored
                .rows
                .iter()
                .filter_map(|row| row.get(idx).cloned().flatten())
                .max(),
        ))
    }
}
