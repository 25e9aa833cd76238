// ABOUTME: Per-run results: table outcomes, environment summaries, plans
// ABOUTME: Reports serialize to JSON for the --report file

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use uuid::Uuid;

use super::error::{SyncError, TableState};
use super::watermark::Strategy;

fn error_text<S: Serializer>(error: &Option<SyncError>, serializer: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Outcome of one table in one run.
#[derive(Debug, Serialize)]
pub struct TableReport {
    pub table: String,
    pub strategy: Option<Strategy>,
    /// Last state reached; a failed table stops where it failed.
    pub state: TableState,
    pub rows_staged: u64,
    pub rows_pruned: u64,
    pub rows_inserted: u64,
    pub merge_skipped: bool,
    #[serde(serialize_with = "error_text")]
    pub error: Option<SyncError>,
    pub elapsed_ms: u64,
}

impl TableReport {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            strategy: None,
            state: TableState::Start,
            rows_staged: 0,
            rows_pruned: 0,
            rows_inserted: 0,
            merge_skipped: false,
            error: None,
            elapsed_ms: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Serialize)]
pub struct EnvironmentReport {
    pub environment: String,
    pub run_id: Uuid,
    /// Set when the environment failed before any table ran.
    #[serde(serialize_with = "error_text")]
    pub error: Option<SyncError>,
    pub tables: BTreeMap<String, TableReport>,
    pub stale_tables: BTreeMap<String, String>,
    pub watchdog_error: Option<String>,
}

impl EnvironmentReport {
    pub fn new(environment: &str, run_id: Uuid) -> Self {
        Self {
            environment: environment.to_string(),
            run_id,
            error: None,
            tables: BTreeMap::new(),
            stale_tables: BTreeMap::new(),
            watchdog_error: None,
        }
    }

    /// Every error text of the run, environment-level first.
    pub fn errors(&self) -> Vec<String> {
        self.error
            .iter()
            .chain(self.tables.values().filter_map(|t| t.error.as_ref()))
            .map(|e| e.to_string())
            .collect()
    }

    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .values()
            .filter(|t| !t.succeeded())
            .map(|t| t.table.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.tables.values().all(TableReport::succeeded)
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub environments: BTreeMap<String, EnvironmentReport>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.environments.values().any(|e| !e.succeeded())
    }

    /// Save the report as pretty-printed JSON
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write run report to {:?}", path))?;
        Ok(())
    }
}

/// Strategies an environment would use, without moving any data.
#[derive(Debug, Default, Serialize)]
pub struct EnvironmentPlan {
    pub environment: String,
    pub error: Option<String>,
    pub tables: BTreeMap<String, Strategy>,
    pub failures: BTreeMap<String, String>,
}
