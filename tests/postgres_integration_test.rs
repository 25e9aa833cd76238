// ABOUTME: End-to-end mirror tests against real PostgreSQL source and warehouse databases
// ABOUTME: Ignored by default; set TEST_SOURCE_URL and TEST_WAREHOUSE_URL and run with --ignored

use std::env;
use std::sync::Arc;
use uuid::Uuid;
use warehouse_mirror::mirror::{FullReason, Pipeline, Strategy, SyncOptions};
use warehouse_mirror::notify::LogNotifier;
use warehouse_mirror::postgres::{connect, ConnectOptions, PostgresConnector, PostgresWarehouse};
use warehouse_mirror::warehouse::{Lookup, TableRef, Warehouse};

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let source = env::var("TEST_SOURCE_URL").ok()?;
    let warehouse = env::var("TEST_WAREHOUSE_URL").ok()?;
    Some((source, warehouse))
}

/// Unique environment name so parallel runs do not share datasets
fn test_environment() -> String {
    format!("it_{}", &Uuid::new_v4().simple().to_string()[..8])
}

async fn setup_source_table(client: &tokio_postgres::Client, table: &str) -> anyhow::Result<()> {
    let ddl = format!(
        r#"
        DROP TABLE IF EXISTS "public"."{table}";
        CREATE TABLE "public"."{table}" (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT NOW()
        );
        INSERT INTO "public"."{table}" (id, name, updated_at) VALUES
            (1, 'alpha', '2024-01-01 10:00:01'),
            (2, 'beta',  '2024-01-01 10:00:02'),
            (3, 'gamma', '2024-01-01 10:00:03');
        "#
    );
    client.batch_execute(&ddl).await?;
    Ok(())
}

async fn final_ids(warehouse_url: &str, environment: &str, table: &str) -> Vec<String> {
    let client = connect(warehouse_url, &ConnectOptions::default())
        .await
        .expect("Failed to connect to warehouse");
    let final_table = TableRef::final_table(environment, table);
    let rows = client
        .query(
            &format!(
                "SELECT id::text FROM \"{}\".\"{}\" ORDER BY id::text",
                final_table.dataset, final_table.table
            ),
            &[],
        )
        .await
        .expect("Failed to read final table");
    rows.iter().map(|r| r.get(0)).collect()
}

#[tokio::test]
#[ignore]
async fn test_bootstrap_then_incremental_merge() {
    let (source_url, warehouse_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_WAREHOUSE_URL must be set");
    let environment = test_environment();
    let table = format!("mirror_{}", environment);

    let source_client = connect(&source_url, &ConnectOptions::default())
        .await
        .expect("Failed to connect to source");
    setup_source_table(&source_client, &table)
        .await
        .expect("Failed to create source table");

    let options = ConnectOptions::default();
    let warehouse = PostgresWarehouse::connect(&warehouse_url, 2, &options)
        .await
        .expect("Failed to open warehouse");
    let sync = SyncOptions {
        filter: warehouse_mirror::filters::TableFilter::new(vec![table.clone()], vec![])
            .unwrap(),
        ..SyncOptions::default()
    };
    let pipeline = Pipeline::new(Arc::new(warehouse), Arc::new(LogNotifier), sync)
        .with_environment(
            &environment,
            Arc::new(PostgresConnector::new(source_url.clone(), options)),
        );

    let report = pipeline.run_environment(&environment).await;
    let first = &report.tables[&table];
    assert!(first.succeeded(), "{:?}", first.error);
    assert_eq!(
        first.strategy,
        Some(Strategy::Full {
            reason: FullReason::NoFinalTable
        })
    );
    assert_eq!(final_ids(&warehouse_url, &environment, &table).await, vec!["1", "2", "3"]);

    source_client
        .batch_execute(&format!(
            r#"
            DELETE FROM "public"."{table}" WHERE id = 1;
            UPDATE "public"."{table}" SET name = 'beta v2', updated_at = '2024-01-02 09:00:00' WHERE id = 2;
            INSERT INTO "public"."{table}" (id, name, updated_at) VALUES (4, 'delta', '2024-01-02 09:30:00');
            "#
        ))
        .await
        .expect("Failed to mutate source");

    let report = pipeline.run_environment(&environment).await;
    let second = &report.tables[&table];
    assert!(second.succeeded(), "{:?}", second.error);
    assert!(matches!(second.strategy, Some(Strategy::Incremental { .. })));
    assert_eq!(second.rows_pruned, 2);
    assert_eq!(second.rows_inserted, 2);
    assert_eq!(final_ids(&warehouse_url, &environment, &table).await, vec!["2", "3", "4"]);

    source_client
        .batch_execute(&format!(r#"DROP TABLE IF EXISTS "public"."{table}""#))
        .await
        .ok();
}

#[tokio::test]
#[ignore]
async fn test_warehouse_lookups_report_not_found() {
    let (_source_url, warehouse_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_WAREHOUSE_URL must be set");
    let warehouse = PostgresWarehouse::connect(&warehouse_url, 1, &ConnectOptions::default())
        .await
        .expect("Failed to open warehouse");

    let ghost = TableRef::final_table(&test_environment(), "ghost");
    assert_eq!(warehouse.table_metadata(&ghost).await.unwrap(), Lookup::NotFound);
    assert_eq!(
        warehouse.max_value(&ghost, "updated_at").await.unwrap(),
        Lookup::NotFound
    );
    assert_eq!(
        warehouse.list_tables(&ghost.dataset_ref()).await.unwrap(),
        Lookup::NotFound
    );
}

#[tokio::test]
#[ignore]
async fn test_concurrent_ensure_dataset() {
    let (_source_url, warehouse_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_WAREHOUSE_URL must be set");
    let warehouse = Arc::new(
        PostgresWarehouse::connect(&warehouse_url, 4, &ConnectOptions::default())
            .await
            .expect("Failed to open warehouse"),
    );
    let dataset = TableRef::final_table(&test_environment(), "t").dataset_ref();

    let results = futures::future::join_all((0..8).map(|_| {
        let warehouse = warehouse.clone();
        let dataset = dataset.clone();
        async move { warehouse.ensure_dataset(&dataset).await }
    }))
    .await;

    assert!(results.iter().all(|r| r.is_ok()));
}
