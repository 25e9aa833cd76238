// ABOUTME: Flags staged changed tables that have not been refreshed recently
// ABOUTME: Best-effort: unreadable tables are logged and skipped

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::warehouse::{source_table_name, DatasetKind, DatasetRef, Lookup, TableRef, Warehouse};

/// Tables are stale once their `changed` artifact is older than this many whole days.
pub const DEFAULT_STALE_AFTER_DAYS: i64 = 2;

pub struct StalenessWatchdog<'a> {
    warehouse: &'a dyn Warehouse,
    stale_after_days: i64,
}

impl<'a> StalenessWatchdog<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, stale_after_days: i64) -> Self {
        Self {
            warehouse,
            stale_after_days,
        }
    }

    /// Source table name -> last refresh date (`YYYY-MM-DD`) for every stale table.
    ///
    /// Age is counted in whole days, truncated: a table last refreshed 2 days
    /// and 23 hours ago is 2 days old.
    pub async fn scan(
        &self,
        environment: &str,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, String>> {
        let dataset = DatasetRef::new(DatasetKind::Changed, environment);
        let tables = match self
            .warehouse
            .list_tables(&dataset)
            .await
            .with_context(|| format!("Failed to list tables in {}", dataset))?
        {
            Lookup::Found(tables) => tables,
            Lookup::NotFound => {
                tracing::debug!("{} does not exist yet, nothing to check", dataset);
                return Ok(BTreeMap::new());
            }
        };

        let mut stale = BTreeMap::new();
        for destination in tables {
            let Some(source_name) = source_table_name(DatasetKind::Changed, &destination) else {
                continue;
            };
            let table = TableRef {
                dataset: dataset.name.clone(),
                table: destination.clone(),
            };

            let last_modified = match self.warehouse.table_metadata(&table).await {
                Ok(Lookup::Found(metadata)) => metadata.last_modified,
                Ok(Lookup::NotFound) => continue,
                Err(e) => {
                    tracing::warn!("Could not read metadata of {}: {:#}", table, e);
                    continue;
                }
            };
            let Some(last_modified) = last_modified else {
                continue;
            };

            let age_days = (now - last_modified).num_days();
            if age_days > self.stale_after_days {
                stale.insert(
                    source_name.to_string(),
                    last_modified.format("%Y-%m-%d").to_string(),
                );
            }
        }

        Ok(stale)
    }
}
