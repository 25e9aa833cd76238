// ABOUTME: In-memory source store for tests and dry runs
// ABOUTME: Holds tables as text rows and evaluates timestamp predicates lexically

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use super::{RowSet, SourceConnector, SourceStore, TimestampPredicate};

#[derive(Debug, Clone, Default)]
struct SourceTable {
    primary_key: Vec<String>,
    rows: RowSet,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, SourceTable>,
    unreachable: bool,
    failing_tables: HashSet<String>,
}

/// A shared, cloneable in-memory source database.
///
/// Clones observe the same tables, so a test can mutate the source between
/// pipeline runs through the handle it kept.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    inner: Arc<Mutex<Inner>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a table.
    pub fn put_table(&self, name: &str, primary_key: &[&str], columns: &[&str]) {
        let table = SourceTable {
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            rows: RowSet::new(columns.iter().map(|c| c.to_string()).collect()),
        };
        self.lock().tables.insert(name.to_string(), table);
    }

    pub fn drop_table(&self, name: &str) {
        self.lock().tables.remove(name);
    }

    /// Append a row; `None` stands for NULL.
    pub fn insert(&self, table: &str, values: &[Option<&str>]) {
        let mut inner = self.lock();
        if let Some(t) = inner.tables.get_mut(table) {
            t.rows
                .rows
                .push(values.iter().map(|v| v.map(str::to_string)).collect());
        }
    }

    /// Replace the row whose first key column equals `key`.
    pub fn update(&self, table: &str, key: &str, values: &[Option<&str>]) {
        let mut inner = self.lock();
        if let Some(t) = inner.tables.get_mut(table) {
            let idx = key_index(t);
            for row in t.rows.rows.iter_mut() {
                if row.get(idx).and_then(|v| v.as_deref()) == Some(key) {
                    *row = values.iter().map(|v| v.map(str::to_string)).collect();
                }
            }
        }
    }

    /// Delete the row whose first key column equals `key`.
    pub fn delete(&self, table: &str, key: &str) {
        let mut inner = self.lock();
        if let Some(t) = inner.tables.get_mut(table) {
            let idx = key_index(t);
            t.rows
                .rows
                .retain(|row| row.get(idx).and_then(|v| v.as_deref()) != Some(key));
        }
    }

    /// Make every subsequent `connect` fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Make every export of `table` fail.
    pub fn fail_table(&self, table: &str) {
        self.lock().failing_tables.insert(table.to_string());
    }

    pub fn rows(&self, table: &str) -> Option<RowSet> {
        self.lock().tables.get(table).map(|t| t.rows.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn table(&self, table: &str) -> Result<SourceTable> {
        let inner = self.lock();
        if inner.failing_tables.contains(table) {
            bail!("connection reset while reading {}", table);
        }
        inner
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| anyhow!("relation \"{}\" does not exist", table))
    }
}

fn key_index(table: &SourceTable) -> usize {
    table
        .primary_key
        .first()
        .and_then(|k| table.rows.column_index(k))
        .unwrap_or(0)
}

fn filter_rows(
    rows: &RowSet,
    predicate: Option<&TimestampPredicate>,
) -> Result<Vec<Vec<Option<String>>>> {
    let Some(predicate) = predicate else {
        return Ok(rows.rows.clone());
    };
    let idx = rows
        .column_index(predicate.column())
        .ok_or_else(|| anyhow!("column \"{}\" does not exist", predicate.column()))?;
    Ok(rows
        .rows
        .iter()
        .filter(|row| predicate.matches(row.get(idx).and_then(|v| v.as_deref())))
        .cloned()
        .collect())
}

#[async_trait]
impl SourceStore for InMemorySource {
    async fn list_tables(&self, _schema: &str) -> Result<Vec<String>> {
        Ok(self.lock().tables.keys().cloned().collect())
    }

    async fn list_columns(&self, _schema: &str, table: &str) -> Result<Vec<String>> {
        Ok(self.table(table)?.rows.columns)
    }

    async fn primary_key(&self, _schema: &str, table: &str) -> Result<Vec<String>> {
        Ok(self.table(table)?.primary_key)
    }

    async fn export_rows(
        &self,
        _schema: &str,
        table: &str,
        predicate: Option<&TimestampPredicate>,
    ) -> Result<RowSet> {
        let source = self.table(table)?;
        Ok(RowSet {
            columns: source.rows.columns.clone(),
            rows: filter_rows(&source.rows, predicate)?,
        })
    }

    async fn export_column(
        &self,
        _schema: &str,
        table: &str,
        column: &str,
        predicate: Option<&TimestampPredicate>,
    ) -> Result<RowSet> {
        let source = self.table(table)?;
        let idx = source
            .rows
            .column_index(column)
            .ok_or_else(|| anyhow!("column \"{}\" does not exist", column))?;
        let rows = filter_rows(&source.rows, predicate)?
            .into_iter()
            .map(|row| vec![row.get(idx).cloned().flatten()])
            .collect();
        Ok(RowSet {
            columns: vec![column.to_string()],
            rows,
        })
    }
}

#[async_trait]
impl SourceConnector for InMemorySource {
    async fn connect(&self) -> Result<Box<dyn SourceStore>> {
        if self.lock().unreachable {
            bail!("could not connect to server: Connection refused");
        }
        Ok(Box::new(self.clone()))
    }
}
