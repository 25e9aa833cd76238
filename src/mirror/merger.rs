// ABOUTME: Delete-then-insert reconciliation of a final table against staged sets
// ABOUTME: Refuses to run on artifacts this run did not stage

use super::error::{SyncError, TableState};
use super::stager::StagedIncremental;
use crate::warehouse::{Lookup, Warehouse};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub pruned: u64,
    pub inserted: u64,
    /// The final table was gone, so nothing was merged.
    pub skipped: bool,
}

pub struct Merger<'a> {
    warehouse: &'a dyn Warehouse,
}

impl<'a> Merger<'a> {
    pub fn new(warehouse: &'a dyn Warehouse) -> Self {
        Self { warehouse }
    }

    /// Apply `Final' = (Final ∩ unchanged-ids) ∪ changed`.
    ///
    /// Prune and Insert are separate statements. If Insert fails the final
    /// table has lost the updated rows until the next run.
    pub async fn merge(&self, staged: &StagedIncremental) -> Result<MergeReport, SyncError> {
        let table = staged.table();
        self.check_artifact(staged).await?;

        let final_table = staged.final_table();
        match self.warehouse.table_metadata(&final_table).await {
            Ok(Lookup::Found(_)) => {}
            Ok(Lookup::NotFound) => {
                tracing::warn!("{} no longer exists, skipping merge", final_table);
                return Ok(MergeReport {
                    skipped: true,
                    ..MergeReport::default()
                });
            }
            Err(e) => return Err(SyncError::table(table, TableState::Staged, e)),
        }

        let ids_table = staged.unchanged_ids_table();
        let pruned = self
            .warehouse
            .delete_missing_keys(&final_table, staged.key_column(), &ids_table)
            .await
            .map_err(|e| SyncError::table(table, TableState::Staged, e))?;
        tracing::debug!("Pruned {} rows from {}", pruned, final_table);

        let mut inserted = 0;
        if staged.changed_rows() > 0 {
            inserted = self
                .warehouse
                .insert_from(&final_table, &staged.changed_table())
                .await
                .map_err(|cause| SyncError::PartialMerge {
                    table: final_table.to_string(),
                    pruned,
                    cause,
                })?;
            tracing::debug!("Inserted {} rows into {}", inserted, final_table);
        }

        Ok(MergeReport {
            pruned,
            inserted,
            skipped: false,
        })
    }

    /// The unchanged-ids table must still be exactly what this run loaded.
    ///
    /// Compares the row count and the modification time the warehouse reported
    /// after the load, so no clock comparison across machines is involved.
    async fn check_artifact(&self, staged: &StagedIncremental) -> Result<(), SyncError> {
        let ids_table = staged.unchanged_ids_table();
        let stale = |reason: String| SyncError::StaleArtifact {
            artifact: ids_table.to_string(),
            reason,
        };

        let metadata = match self.warehouse.table_metadata(&ids_table).await {
            Ok(Lookup::Found(metadata)) => metadata,
            Ok(Lookup::NotFound) => return Err(stale("table is missing".to_string())),
            Err(e) => return Err(SyncError::table(staged.table(), TableState::Staged, e)),
        };

        if metadata.num_rows != staged.unchanged_ids_rows() {
            return Err(stale(format!(
                "holds {} rows but run {} loaded {}",
                metadata.num_rows,
                staged.run_id(),
                staged.unchanged_ids_rows()
            )));
        }

        if metadata.last_modified != staged.unchanged_ids_loaded_at() {
            return Err(stale(format!(
                "modified at {:?}, run {} loaded it at {:?}",
                metadata.last_modified,
                staged.run_id(),
                staged.unchanged_ids_loaded_at()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::stager::{text_schema, Stager};
    use crate::source::RowSet;
    use crate::warehouse::memory::Operation;
    use crate::warehouse::{InMemoryWarehouse, TableRef};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn row_set(columns: &[&str], rows: &[&[Option<&str>]]) -> RowSet {
        RowSet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|v| v.map(str::to_string)).collect())
                .collect(),
        }
    }

    fn ids(rows: &[&str]) -> Vec<Option<String>> {
        rows.iter().map(|r| Some(r.to_string())).collect()
    }

    async fn seed(wh: &InMemoryWarehouse) {
        let final_table = TableRef::final_table("dev", "users");
        wh.ensure_dataset(&final_table.dataset_ref()).await.unwrap();
        let rows = row_set(
            &["id", "name"],
            &[
                &[Some("1"), Some("a")],
                &[Some("2"), Some("b")],
                &[Some("3"), Some("c")],
            ],
        );
        wh.load_replace(&final_table, &text_schema(&rows.columns), &rows)
            .await
            .unwrap();
    }

    async fn stage(wh: &InMemoryWarehouse) -> StagedIncremental {
        Stager::new(wh)
            .stage_incremental(
                Uuid::new_v4(),
                "dev",
                "users",
                "id",
                &row_set(&["id", "name"], &[&[Some("2"), Some("b2")], &[Some("4"), Some("d")]]),
                &row_set(&["id"], &[&[Some("3")]]),
            )
            .await
            .unwrap()
    }

    fn final_ids(wh: &InMemoryWarehouse) -> Vec<Option<String>> {
        let mut keys: Vec<_> = wh
            .rows(&TableRef::final_table("dev", "users"))
            .unwrap()
            .column_values("id")
            .map(|v| v.map(str::to_string))
            .collect();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_merge_prunes_then_inserts() {
        let wh = InMemoryWarehouse::new();
        seed(&wh).await;
        let staged = stage(&wh).await;

        let report = Merger::new(&wh).merge(&staged).await.unwrap();

        assert_eq!(
            report,
            MergeReport {
                pruned: 2,
                inserted: 2,
                skipped: false
            }
        );
        assert_eq!(final_ids(&wh), ids(&["2", "3", "4"]));
    }

    #[tokio::test]
    async fn test_merge_skips_insert_for_empty_changed_set() {
        let wh = InMemoryWarehouse::new();
        seed(&wh).await;
        let staged = Stager::new(&wh)
            .stage_incremental(
                Uuid::new_v4(),
                "dev",
                "users",
                "id",
                &row_set(&["id", "name"], &[]),
                &row_set(&["id"], &[&[Some("1")], &[Some("2")], &[Some("3")]]),
            )
            .await
            .unwrap();
        wh.fail(Operation::InsertFrom);

        let report = Merger::new(&wh).merge(&staged).await.unwrap();
        assert_eq!(report.pruned, 0);
        assert_eq!(report.inserted, 0);
    }

    #[tokio::test]
    async fn test_merge_refuses_overwritten_artifact() {
        let wh = InMemoryWarehouse::new();
        seed(&wh).await;
        let staged = stage(&wh).await;
        wh.set_modified(&staged.unchanged_ids_table(), Utc::now() + Duration::seconds(5));

        let err = Merger::new(&wh).merge(&staged).await.unwrap_err();
        assert!(matches!(err, SyncError::StaleArtifact { .. }));
        assert_eq!(final_ids(&wh), ids(&["1", "2", "3"]));
    }

    #[tokio::test]
    async fn test_merge_refuses_row_count_mismatch() {
        let wh = InMemoryWarehouse::new();
        seed(&wh).await;
        let staged = stage(&wh).await;
        let ids_table = staged.unchanged_ids_table();
        let modified = wh.table_metadata(&ids_table).await.unwrap().found().unwrap().last_modified;
        wh.load_replace(
            &ids_table,
            &text_schema(&["id".to_string()]),
            &row_set(&["id"], &[&[Some("1")], &[Some("2")]]),
        )
        .await
        .unwrap();
        if let Some(modified) = modified {
            wh.set_modified(&ids_table, modified);
        }

        let err = Merger::new(&wh).merge(&staged).await.unwrap_err();
        assert!(err.to_string().contains("holds 2 rows"));
    }

    #[tokio::test]
    async fn test_missing_final_table_skips_merge() {
        let wh = InMemoryWarehouse::new();
        let staged = stage(&wh).await;

        let report = Merger::new(&wh).merge(&staged).await.unwrap();
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn test_insert_failure_after_prune_is_partial_merge() {
        let wh = InMemoryWarehouse::new();
        seed(&wh).await;
        let staged = stage(&wh).await;
        wh.fail(Operation::InsertFrom);

        let err = Merger::new(&wh).merge(&staged).await.unwrap_err();
        match err {
            SyncError::PartialMerge { pruned, .. } => assert_eq!(pruned, 2),
            other => panic!("expected partial merge, got {other}"),
        }
        assert_eq!(final_ids(&wh), ids(&["3"]));
    }

    #[tokio::test]
    async fn test_prune_failure_leaves_final_table_untouched() {
        let wh = InMemoryWarehouse::new();
        seed(&wh).await;
        let staged = stage(&wh).await;
        wh.fail(Operation::DeleteMissingKeys);

        let err = Merger::new(&wh).merge(&staged).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Table {
                reached: TableState::Staged,
                ..
            }
        ));
        assert_eq!(final_ids(&wh), ids(&["1", "2", "3"]));
    }
}
