// ABOUTME: Failure taxonomy for a mirror run and the per-table state machine
// ABOUTME: Errors carry the environment or table they aborted

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Progress of one table through the pipeline.
///
/// A failed table keeps the last state it reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    Start,
    WatermarkResolved,
    Extracted,
    Staged,
    Merged,
}

impl fmt::Display for TableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TableState::Start => "start",
            TableState::WatermarkResolved => "watermark-resolved",
            TableState::Extracted => "extracted",
            TableState::Staged => "staged",
            TableState::Merged => "merged",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Work upstream of any table failed; the whole environment was skipped.
    #[error("environment {environment}: {cause:#}")]
    Environment {
        environment: String,
        cause: anyhow::Error,
    },

    #[error("table {table} failed after reaching {reached}: {cause:#}")]
    Table {
        table: String,
        reached: TableState,
        cause: anyhow::Error,
    },

    /// The staged unchanged-ids set is not the one this run loaded.
    #[error("staged artifact {artifact} is stale: {reason}")]
    StaleArtifact { artifact: String, reason: String },

    /// Prune committed but Insert did not: the final table is missing the
    /// changed rows until the next run.
    #[error("partial merge of {table}: pruned {pruned} rows, then insert failed: {cause:#}")]
    PartialMerge {
        table: String,
        pruned: u64,
        cause: anyhow::Error,
    },
}

impl SyncError {
    pub fn table(table: &str, reached: TableState, cause: anyhow::Error) -> Self {
        SyncError::Table {
            table: table.to_string(),
            reached,
            cause,
        }
    }

    pub fn environment(environment: &str, cause: anyhow::Error) -> Self {
        SyncError::Environment {
            environment: environment.to_string(),
            cause,
        }
    }
}
