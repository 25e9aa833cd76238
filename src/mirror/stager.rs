// ABOUTME: Loads extracted sets into scoped destination tables
// ABOUTME: Fresh tables get an all-text schema; existing ones keep their types

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::source::RowSet;
use crate::warehouse::{
    ArtifactKind, Column, Lookup, TableRef, TableSchema, Warehouse, TEXT_TYPE,
};

/// Schema with every column typed as text, in the given order.
///
/// Used whenever no compatible destination table exists; values are never
/// coerced on the way in.
pub fn text_schema(columns: &[String]) -> TableSchema {
    TableSchema {
        columns: columns
            .iter()
            .map(|name| Column {
                name: name.clone(),
                data_type: TEXT_TYPE.to_string(),
            })
            .collect(),
    }
}

/// Artifacts of one incremental extraction, staged by this run.
///
/// Only [`Stager::stage_incremental`] builds this, so holding one proves the
/// `changed` and `unchanged-ids` tables were loaded in the same run.
#[derive(Debug, Clone)]
pub struct StagedIncremental {
    run_id: Uuid,
    environment: String,
    table: String,
    key_column: String,
    changed_rows: u64,
    unchanged_ids_rows: u64,
    unchanged_ids_loaded_at: Option<DateTime<Utc>>,
}

impl StagedIncremental {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn changed_rows(&self) -> u64 {
        self.changed_rows
    }

    pub fn unchanged_ids_rows(&self) -> u64 {
        self.unchanged_ids_rows
    }

    /// Modification time the warehouse reported right after the load.
    pub fn unchanged_ids_loaded_at(&self) -> Option<DateTime<Utc>> {
        self.unchanged_ids_loaded_at
    }

    pub fn changed_table(&self) -> TableRef {
        TableRef::artifact(ArtifactKind::Changed, &self.environment, &self.table)
    }

    pub fn unchanged_ids_table(&self) -> TableRef {
        TableRef::artifact(ArtifactKind::UnchangedIds, &self.environment, &self.table)
    }

    pub fn final_table(&self) -> TableRef {
        TableRef::final_table(&self.environment, &self.table)
    }
}

pub struct Stager<'a> {
    warehouse: &'a dyn Warehouse,
}

impl<'a> Stager<'a> {
    pub fn new(warehouse: &'a dyn Warehouse) -> Self {
        Self { warehouse }
    }

    /// Load a full extraction straight into the final table.
    pub async fn stage_full(&self, environment: &str, table: &str, rows: &RowSet) -> Result<u64> {
        self.stage_artifact(ArtifactKind::Full, environment, table, rows)
            .await
    }

    pub async fn stage_incremental(
        &self,
        run_id: Uuid,
        environment: &str,
        table: &str,
        key_column: &str,
        changed: &RowSet,
        unchanged_ids: &RowSet,
    ) -> Result<StagedIncremental> {
        let changed_rows = self
            .stage_artifact(ArtifactKind::Changed, environment, table, changed)
            .await?;
        let unchanged_ids_rows = self
            .stage_artifact(ArtifactKind::UnchangedIds, environment, table, unchanged_ids)
            .await?;

        let ids_table = TableRef::artifact(ArtifactKind::UnchangedIds, environment, table);
        let loaded_at = match self.warehouse.table_metadata(&ids_table).await? {
            Lookup::Found(metadata) => metadata.last_modified,
            Lookup::NotFound => bail!("{} vanished right after it was loaded", ids_table),
        };

        Ok(StagedIncremental {
            run_id,
            environment: environment.to_string(),
            table: table.to_string(),
            key_column: key_column.to_string(),
            changed_rows,
            unchanged_ids_rows,
            unchanged_ids_loaded_at: loaded_at,
        })
    }

    /// Create the dataset if needed and replace the table's contents.
    async fn stage_artifact(
        &self,
        kind: ArtifactKind,
        environment: &str,
        table: &str,
        rows: &RowSet,
    ) -> Result<u64> {
        let target = TableRef::artifact(kind, environment, table);
        self.warehouse
            .ensure_dataset(&target.dataset_ref())
            .await
            .with_context(|| format!("Failed to prepare dataset for {}", target))?;

        let schema = match self.warehouse.table_metadata(&target).await? {
            Lookup::Found(metadata) if metadata.schema.has_column_names(&rows.columns) => {
                metadata.schema
            }
            _ => text_schema(&rows.columns),
        };

        let loaded = self
            .warehouse
            .load_replace(&target, &schema, rows)
            .await
            .with_context(|| format!("Failed to load {} set into {}", kind, target))?;

        tracing::debug!("Staged {} rows into {}", loaded, target);
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::memory::Operation;
    use crate::warehouse::{DatasetKind, InMemoryWarehouse};

    fn row_set(columns: &[&str], rows: &[&[Option<&str>]]) -> RowSet {
        RowSet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|v| v.map(str::to_string)).collect())
                .collect(),
        }
    }

    #[test]
    fn test_text_schema() {
        let schema = text_schema(&["id".to_string(), "name".to_string()]);
        assert_eq!(schema.column_names(), vec!["id", "name"]);
        assert!(schema.columns.iter().all(|c| c.data_type == TEXT_TYPE));
    }

    #[tokio::test]
    async fn test_stage_full_creates_final_table() {
        let wh = InMemoryWarehouse::new();
        let rows = row_set(&["id", "name"], &[&[Some("1"), Some("a")], &[Some("2"), None]]);

        let loaded = Stager::new(&wh).stage_full("dev", "users", &rows).await.unwrap();

        assert_eq!(loaded, 2);
        let stored = wh.rows(&TableRef::final_table("dev", "users")).unwrap();
        assert_eq!(stored, rows);
    }

    #[tokio::test]
    async fn test_stage_keeps_existing_schema_when_names_match() {
        let wh = InMemoryWarehouse::new();
        let target = TableRef::final_table("dev", "users");
        wh.ensure_dataset(&target.dataset_ref()).await.unwrap();
        let typed = TableSchema {
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
        wh.load_replace(&target, &typed, &row_set(&["id", "name"], &[]))
            .await
            .unwrap();

        Stager::new(&wh)
            .stage_full("dev", "users", &row_set(&["id", "name"], &[&[Some("7"), Some("x")]]))
            .await
            .unwrap();

        let metadata = wh.table_metadata(&target).await.unwrap().found().unwrap();
        assert_eq!(metadata.schema, typed);
        assert_eq!(metadata.num_rows, 1);
    }

    #[tokio::test]
    async fn test_stage_incremental_records_load() {
        let wh = InMemoryWarehouse::new();
        let run_id = Uuid::new_v4();
        let changed = row_set(&["id", "name"], &[&[Some("4"), Some("d")]]);
        let ids = row_set(&["id"], &[&[Some("1")], &[Some("2")]]);

        let staged = Stager::new(&wh)
            .stage_incremental(run_id, "dev", "users", "id", &changed, &ids)
            .await
            .unwrap();

        assert_eq!(staged.run_id(), run_id);
        assert_eq!(staged.changed_rows(), 1);
        assert_eq!(staged.unchanged_ids_rows(), 2);
        assert!(staged.unchanged_ids_loaded_at().is_some());
        assert!(wh.has_dataset(&crate::warehouse::DatasetRef::new(DatasetKind::Changed, "dev")));
        assert_eq!(
            staged.unchanged_ids_table().to_string(),
            "unchanged_ids_dev.unchanged_ids_users"
        );
    }

    #[tokio::test]
    async fn test_stage_propagates_load_failure() {
        let wh = InMemoryWarehouse::new();
        wh.fail(Operation::Load);
        let result = Stager::new(&wh)
            .stage_full("dev", "users", &row_set(&["id"], &[]))
            .await;
        assert!(result.is_err());
    }
}
