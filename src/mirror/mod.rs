// ABOUTME: Incremental mirror pipeline - resolve, extract, stage, merge, watch
// ABOUTME: Each stage borrows its collaborators; Pipeline owns them for a run

pub mod error;
pub mod extractor;
pub mod merger;
pub mod orchestrator;
pub mod report;
pub mod stager;
pub mod watchdog;
pub mod watermark;

pub use error::{SyncError, TableState};
pub use orchestrator::{Pipeline, SyncOptions};
pub use report::{EnvironmentPlan, EnvironmentReport, RunReport, TableReport};
pub use watermark::{FullReason, Strategy};

/// Where tables live in the source and which columns drive incremental runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSettings {
    pub source_schema: String,
    /// Timestamp column bumped on every insert and update.
    pub update_column: String,
    /// Merge key used when a table has no single-column primary key.
    pub key_column: String,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            source_schema: "public".to_string(),
            update_column: "updated_at".to_string(),
            key_column: "id".to_string(),
        }
    }
}
