// ABOUTME: Runs every table of every environment through the mirror pipeline
// ABOUTME: Bounded concurrency; failures stay scoped to their table or environment

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::error::{SyncError, TableState};
use super::extractor::{Extraction, Extractor};
use super::merger::Merger;
use super::report::{EnvironmentPlan, EnvironmentReport, RunReport, TableReport};
use super::stager::Stager;
use super::watchdog::{StalenessWatchdog, DEFAULT_STALE_AFTER_DAYS};
use super::watermark::{Strategy, WatermarkResolver};
use super::TableSettings;
use crate::filters::TableFilter;
use crate::notify::{deliver, Alert, Notifier};
use crate::source::{SourceConnector, SourceStore};
use crate::warehouse::Warehouse;

/// One environment's source connection, serialized across its tables.
type SharedSource = Mutex<Box<dyn SourceStore>>;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub table: TableSettings,
    pub filter: TableFilter,
    /// Tables of one environment processed at once.
    pub table_concurrency: usize,
    pub environment_concurrency: usize,
    pub stale_after_days: i64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            table: TableSettings::default(),
            filter: TableFilter::empty(),
            table_concurrency: 4,
            environment_concurrency: 1,
            stale_after_days: DEFAULT_STALE_AFTER_DAYS,
        }
    }
}

/// Everything a run needs, built once at startup and borrowed by each stage.
pub struct Pipeline {
    warehouse: Arc<dyn Warehouse>,
    notifier: Arc<dyn Notifier>,
    sources: BTreeMap<String, Arc<dyn SourceConnector>>,
    options: SyncOptions,
}

impl Pipeline {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        notifier: Arc<dyn Notifier>,
        options: SyncOptions,
    ) -> Self {
        Self {
            warehouse,
            notifier,
            sources: BTreeMap::new(),
            options,
        }
    }

    pub fn add_environment(&mut self, name: &str, connector: Arc<dyn SourceConnector>) {
        self.sources.insert(name.to_string(), connector);
    }

    pub fn with_environment(mut self, name: &str, connector: Arc<dyn SourceConnector>) -> Self {
        self.add_environment(name, connector);
        self
    }

    pub fn environments(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Mirror every environment, then check each for stale tables.
    pub async fn run(&self) -> RunReport {
        let started_at = Utc::now();
        let reports: Vec<EnvironmentReport> = stream::iter(self.sources.keys())
            .map(|env| self.run_environment(env))
            .buffer_unordered(self.options.environment_concurrency.max(1))
            .collect()
            .await;

        RunReport {
            started_at,
            finished_at: Utc::now(),
            environments: reports
                .into_iter()
                .map(|r| (r.environment.clone(), r))
                .collect(),
        }
    }

    /// Mirror one environment, alert on its failures, then run the watchdog.
    pub async fn run_environment(&self, environment: &str) -> EnvironmentReport {
        let mut report = self.sync_environment(environment, Uuid::new_v4()).await;

        let errors = report.errors();
        if !errors.is_empty() {
            tracing::error!(
                "Environment {} finished with {} error(s)",
                environment,
                errors.len()
            );
            deliver(self.notifier.as_ref(), &Alert::failure(environment, errors)).await;
        }

        match self.watch_environment(environment, Utc::now()).await {
            Ok(stale) => report.stale_tables = stale,
            Err(e) => {
                tracing::warn!("Staleness check for {} failed: {:#}", environment, e);
                report.watchdog_error = Some(format!("{:#}", e));
            }
        }

        report
    }

    /// Mirror one environment's tables without alerting.
    pub async fn sync_environment(&self, environment: &str, run_id: Uuid) -> EnvironmentReport {
        let started = Instant::now();
        let mut report = EnvironmentReport::new(environment, run_id);

        let (source, tables) = match self.open_environment(environment).await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!("{}", e);
                report.error = Some(e);
                return report;
            }
        };

        tracing::info!(
            "Mirroring {} table(s) for environment {} (run {})",
            tables.len(),
            environment,
            run_id
        );

        let outcomes: Vec<TableReport> = stream::iter(tables)
            .map(|table| self.sync_table(environment, &source, table, run_id))
            .buffer_unordered(self.options.table_concurrency.max(1))
            .collect()
            .await;

        report.tables = outcomes
            .into_iter()
            .map(|t| (t.table.clone(), t))
            .collect();

        tracing::info!(
            "Environment {} done in {:.1}s: {} ok, {} failed",
            environment,
            started.elapsed().as_secs_f64(),
            report.tables.values().filter(|t| t.succeeded()).count(),
            report.failed_tables().len()
        );
        report
    }

    /// Resolve every table's strategy without extracting or writing anything.
    pub async fn plan(&self) -> Vec<EnvironmentPlan> {
        let mut plans = Vec::new();
        for environment in self.sources.keys() {
            let mut plan = EnvironmentPlan {
                environment: environment.clone(),
                ..EnvironmentPlan::default()
            };

            match self.open_environment(environment).await {
                Ok((source, tables)) => {
                    let store = source.lock().await;
                    let resolver = WatermarkResolver::new(
                        &**store,
                        self.warehouse.as_ref(),
                        &self.options.table,
                    );
                    for table in tables {
                        match resolver.resolve(environment, &table).await {
                            Ok(strategy) => {
                                plan.tables.insert(table, strategy);
                            }
                            Err(e) => {
                                plan.failures.insert(table, format!("{:#}", e));
                            }
                        }
                    }
                }
                Err(e) => plan.error = Some(e.to_string()),
            }

            plans.push(plan);
        }
        plans
    }

    /// Run only the watchdog for every environment, alerting on stale tables.
    pub async fn watch(
        &self,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, Result<BTreeMap<String, String>>> {
        let mut results = BTreeMap::new();
        for environment in self.sources.keys() {
            let result = self.watch_environment(environment, now).await;
            results.insert(environment.clone(), result);
        }
        results
    }

    async fn watch_environment(
        &self,
        environment: &str,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, String>> {
        let stale = StalenessWatchdog::new(self.warehouse.as_ref(), self.options.stale_after_days)
            .scan(environment, now)
            .await?;

        if !stale.is_empty() {
            tracing::warn!(
                "{} stale table(s) in environment {}",
                stale.len(),
                environment
            );
            deliver(
                self.notifier.as_ref(),
                &Alert::stale_tables(environment, stale.clone()),
            )
            .await;
        }
        Ok(stale)
    }

    /// Connect to the environment's source and list the tables to mirror.
    async fn open_environment(
        &self,
        environment: &str,
    ) -> Result<(SharedSource, Vec<String>), SyncError> {
        let opened = async {
            let connector = self
                .sources
                .get(environment)
                .ok_or_else(|| anyhow!("no source configured"))?;
            let store = connector
                .connect()
                .await
                .context("Failed to connect to source")?;
            let schema = &self.options.table.source_schema;
            let tables = store
                .list_tables(schema)
                .await
                .with_context(|| format!("Failed to list tables in schema {}", schema))?;
            Ok::<_, anyhow::Error>((Mutex::new(store), self.options.filter.apply(tables)))
        };

        opened
            .await
            .map_err(|e| SyncError::environment(environment, e))
    }

    async fn sync_table(
        &self,
        environment: &str,
        source: &SharedSource,
        table: String,
        run_id: Uuid,
    ) -> TableReport {
        let started = Instant::now();
        let mut report = TableReport::new(&table);

        if let Err(e) = self
            .drive_table(environment, source, &table, run_id, &mut report)
            .await
        {
            tracing::error!("{}/{}: {}", environment, table, e);
            report.error = Some(e);
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            "{}/{}: finished at {} in {} ms",
            environment,
            table,
            report.state,
            report.elapsed_ms
        );
        report
    }

    /// Advance one table from Start to Merged, recording each state reached.
    async fn drive_table(
        &self,
        environment: &str,
        source: &SharedSource,
        table: &str,
        run_id: Uuid,
        report: &mut TableReport,
    ) -> Result<(), SyncError> {
        let settings = &self.options.table;
        let warehouse = self.warehouse.as_ref();

        let (strategy, extraction) = {
            let store = source.lock().await;

            let step = Instant::now();
            let strategy = WatermarkResolver::new(&**store, warehouse, settings)
                .resolve(environment, table)
                .await
                .map_err(|e| SyncError::table(table, TableState::Start, e))?;
            tracing::info!("{}/{}: {}", environment, table, strategy);
            tracing::debug!("{}/{}: resolved in {:?}", environment, table, step.elapsed());
            report.strategy = Some(strategy.clone());
            report.state = TableState::WatermarkResolved;

            let step = Instant::now();
            let extraction = Extractor::new(&**store, settings)
                .extract(table, &strategy)
                .await
                .map_err(|e| SyncError::table(table, TableState::WatermarkResolved, e))?;
            tracing::debug!(
                "{}/{}: extracted {} rows in {:?}",
                environment,
                table,
                extraction.row_count(),
                step.elapsed()
            );
            report.state = TableState::Extracted;

            (strategy, extraction)
        };

        let stager = Stager::new(warehouse);
        let step = Instant::now();
        match (extraction, strategy) {
            (Extraction::Full(rows), _) => {
                let loaded = stager
                    .stage_full(environment, table, &rows)
                    .await
                    .map_err(|e| SyncError::table(table, TableState::Extracted, e))?;
                tracing::debug!("{}/{}: loaded in {:?}", environment, table, step.elapsed());
                report.rows_staged = loaded;
                // A full load lands in the final table directly; there is nothing to merge.
                report.state = TableState::Merged;
            }
            (
                Extraction::Incremental {
                    changed,
                    unchanged_ids,
                },
                Strategy::Incremental { key_column, .. },
            ) => {
                let staged = stager
                    .stage_incremental(
                        run_id,
                        environment,
                        table,
                        &key_column,
                        &changed,
                        &unchanged_ids,
                    )
                    .await
                    .map_err(|e| SyncError::table(table, TableState::Extracted, e))?;
                tracing::debug!("{}/{}: staged in {:?}", environment, table, step.elapsed());
                report.rows_staged = staged.changed_rows() + staged.unchanged_ids_rows();
                report.state = TableState::Staged;

                let step = Instant::now();
                let merged = Merger::new(warehouse).merge(&staged).await?;
                tracing::debug!("{}/{}: merged in {:?}", environment, table, step.elapsed());
                report.rows_pruned = merged.pruned;
                report.rows_inserted = merged.inserted;
                report.merge_skipped = merged.skipped;
                report.state = TableState::Merged;
            }
            (Extraction::Incremental { .. }, Strategy::Full { .. }) => {
                return Err(SyncError::table(
                    table,
                    TableState::Extracted,
                    anyhow!("incremental extraction for a full strategy"),
                ));
            }
        }

        Ok(())
    }
}
