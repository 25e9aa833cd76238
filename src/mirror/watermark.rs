// ABOUTME: Decides per table between a full reload and an incremental transfer
// ABOUTME: Read-only; destination not-found answers select a full reload

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::TableSettings;
use crate::source::SourceStore;
use crate::warehouse::{Lookup, TableRef, Warehouse};

/// Watermark used when the final table holds no update timestamps yet.
pub const SENTINEL_WATERMARK: &str = "1900-01-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullReason {
    NoFinalTable,
    SchemaDrift,
    NoUpdateColumn,
    NoKeyColumn,
}

impl fmt::Display for FullReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FullReason::NoFinalTable => "no final table",
            FullReason::SchemaDrift => "schema drift",
            FullReason::NoUpdateColumn => "no update column",
            FullReason::NoKeyColumn => "no key column",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Strategy {
    Full { reason: FullReason },
    Incremental { watermark: String, key_column: String },
}

impl Strategy {
    pub fn is_full(&self) -> bool {
        matches!(self, Strategy::Full { .. })
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Full { reason } => write!(f, "full ({})", reason),
            Strategy::Incremental {
                watermark,
                key_column,
            } => write!(f, "incremental after {} keyed by {}", watermark, key_column),
        }
    }
}

/// Pick the merge key: a single-column primary key, else the configured
/// fallback column when the table has no primary key at all.
///
/// A composite primary key yields `None`; no single column of it is unique.
pub fn choose_key_column(
    primary_key: &[String],
    columns: &[String],
    fallback: &str,
) -> Option<String> {
    match primary_key {
        [key] => Some(key.clone()),
        [] => columns.iter().find(|c| *c == fallback).cloned(),
        _ => None,
    }
}

pub struct WatermarkResolver<'a> {
    source: &'a dyn SourceStore,
    warehouse: &'a dyn Warehouse,
    settings: &'a TableSettings,
}

impl<'a> WatermarkResolver<'a> {
    pub fn new(
        source: &'a dyn SourceStore,
        warehouse: &'a dyn Warehouse,
        settings: &'a TableSettings,
    ) -> Self {
        Self {
            source,
            warehouse,
            settings,
        }
    }

    pub async fn resolve(&self, environment: &str, table: &str) -> Result<Strategy> {
        let schema = &self.settings.source_schema;
        let columns = self
            .source
            .list_columns(schema, table)
            .await
            .with_context(|| format!("Failed to list columns of {}.{}", schema, table))?;
        if columns.is_empty() {
            bail!("Source table {}.{} has no columns", schema, table);
        }

        let final_table = TableRef::final_table(environment, table);
        let metadata = match self.warehouse.table_metadata(&final_table).await? {
            Lookup::Found(metadata) => metadata,
            Lookup::NotFound => return Ok(full(FullReason::NoFinalTable)),
        };

        if !metadata.schema.has_column_names(&columns) {
            tracing::debug!(
                "{}: final columns {:?} differ from source columns {:?}",
                final_table,
                metadata.schema.column_names(),
                columns
            );
            return Ok(full(FullReason::SchemaDrift));
        }

        let update_column = &self.settings.update_column;
        if !columns.iter().any(|c| c == update_column) {
            return Ok(full(FullReason::NoUpdateColumn));
        }

        let primary_key = self
            .source
            .primary_key(schema, table)
            .await
            .with_context(|| format!("Failed to read primary key of {}.{}", schema, table))?;
        let Some(key_column) = choose_key_column(&primary_key, &columns, &self.settings.key_column)
        else {
            return Ok(full(FullReason::NoKeyColumn));
        };

        let watermark = match self.warehouse.max_value(&final_table, update_column).await? {
            Lookup::Found(Some(max)) => max,
            Lookup::Found(None) => SENTINEL_WATERMARK.to_string(),
            // Dropped between the metadata read and now.
            Lookup::NotFound => return Ok(full(FullReason::NoFinalTable)),
        };

        Ok(Strategy::Incremental {
            watermark,
            key_column,
        })
    }
}

fn full(reason: FullReason) -> Strategy {
    Strategy::Full { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::stager::text_schema;
    use crate::source::{InMemorySource, RowSet};
    use crate::warehouse::InMemoryWarehouse;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn seed_final(wh: &InMemoryWarehouse, columns: &[&str], rows: &[&[Option<&str>]]) {
        let table = TableRef::final_table("dev", "orders");
        wh.ensure_dataset(&table.dataset_ref()).await.unwrap();
        let data = RowSet {
            columns: names(columns),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|v| v.map(str::to_string)).collect())
                .collect(),
        };
        wh.load_replace(&table, &text_schema(&data.columns), &data)
            .await
            .unwrap();
    }

    fn orders_source() -> InMemorySource {
        let source = InMemorySource::new();
        source.put_table("orders", &["id"], &["id", "name", "updated_at"]);
        source
    }

    #[test]
    fn test_choose_key_column() {
        let columns = names(&["id", "order_id", "line"]);
        assert_eq!(
            choose_key_column(&names(&["order_id"]), &columns, "id"),
            Some("order_id".to_string())
        );
        assert_eq!(choose_key_column(&names(&["order_id", "line"]), &columns, "id"), None);
        assert_eq!(choose_key_column(&[], &columns, "id"), Some("id".to_string()));
        assert_eq!(choose_key_column(&[], &names(&["code"]), "id"), None);
    }

    #[tokio::test]
    async fn test_missing_final_table_selects_full() {
        let source = orders_source();
        let wh = InMemoryWarehouse::new();
        let settings = TableSettings::default();
        let resolver = WatermarkResolver::new(&source, &wh, &settings);

        assert_eq!(
            resolver.resolve("dev", "orders").await.unwrap(),
            Strategy::Full {
                reason: FullReason::NoFinalTable
            }
        );
    }

    #[tokio::test]
    async fn test_extra_final_column_is_schema_drift() {
        let source = InMemorySource::new();
        source.put_table("orders", &["id"], &["id", "name"]);
        let wh = InMemoryWarehouse::new();
        seed_final(&wh, &["id", "name", "email"], &[]).await;
        let settings = TableSettings::default();

        let strategy = WatermarkResolver::new(&source, &wh, &settings)
            .resolve("dev", "orders")
            .await
            .unwrap();
        assert_eq!(
            strategy,
            Strategy::Full {
                reason: FullReason::SchemaDrift
            }
        );
    }

    #[tokio::test]
    async fn test_missing_update_column() {
        let source = InMemorySource::new();
        source.put_table("orders", &["id"], &["id", "name"]);
        let wh = InMemoryWarehouse::new();
        seed_final(&wh, &["id", "name"], &[]).await;
        let settings = TableSettings::default();

        let strategy = WatermarkResolver::new(&source, &wh, &settings)
            .resolve("dev", "orders")
            .await
            .unwrap();
        assert_eq!(
            strategy,
            Strategy::Full {
                reason: FullReason::NoUpdateColumn
            }
        );
    }

    #[tokio::test]
    async fn test_missing_key_column() {
        let source = InMemorySource::new();
        source.put_table("orders", &[], &["code", "updated_at"]);
        let wh = InMemoryWarehouse::new();
        seed_final(&wh, &["code", "updated_at"], &[]).await;
        let settings = TableSettings::default();

        let strategy = WatermarkResolver::new(&source, &wh, &settings)
            .resolve("dev", "orders")
            .await
            .unwrap();
        assert_eq!(
            strategy,
            Strategy::Full {
                reason: FullReason::NoKeyColumn
            }
        );
    }

    #[tokio::test]
    async fn test_watermark_is_max_update_value() {
        let source = orders_source();
        let wh = InMemoryWarehouse::new();
        seed_final(
            &wh,
            &["id", "name", "updated_at"],
            &[
                &[Some("1"), Some("a"), Some("2024-01-01 00:00:00")],
                &[Some("2"), Some("b"), Some("2024-03-01 00:00:00")],
                &[Some("3"), Some("c"), None],
            ],
        )
        .await;
        let settings = TableSettings::default();

        let strategy = WatermarkResolver::new(&source, &wh, &settings)
            .resolve("dev", "orders")
            .await
            .unwrap();
        assert_eq!(
            strategy,
            Strategy::Incremental {
                watermark: "2024-03-01 00:00:00".to_string(),
                key_column: "id".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_empty_final_table_uses_sentinel() {
        let source = orders_source();
        let wh = InMemoryWarehouse::new();
        seed_final(&wh, &["id", "name", "updated_at"], &[&[Some("1"), Some("a"), None]]).await;
        let settings = TableSettings::default();

        let strategy = WatermarkResolver::new(&source, &wh, &settings)
            .resolve("dev", "orders")
            .await
            .unwrap();
        assert_eq!(
            strategy,
            Strategy::Incremental {
                watermark: SENTINEL_WATERMARK.to_string(),
                key_column: "id".to_string(),
            }
        );
    }

    #[test]
    fn test_strategy_serializes_with_tag() {
        let json = serde_json::to_value(Strategy::Full {
            reason: FullReason::SchemaDrift,
        })
        .unwrap();
        assert_eq!(json["strategy"], "full");
        assert_eq!(json["reason"], "schema_drift");
    }
}
