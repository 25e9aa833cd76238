// ABOUTME: PostgreSQL-wire warehouse - datasets are schemas, loads truncate and refill
// ABOUTME: A catalog table records each table's last modification for the watchdog

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, GenericClient};

use super::{connect_with_retry, ConnectOptions};
use crate::source::RowSet;
use crate::utils::quote_ident;
use crate::warehouse::{
    Column, DatasetRef, Lookup, TableMetadata, TableRef, TableSchema, Warehouse,
};

const CATALOG_SCHEMA: &str = "_mirror";
const CATALOG_TABLE: &str = "table_modifications";

/// PostgreSQL accepts at most 65535 bind parameters per statement.
const MAX_PARAMS: usize = 65000;

/// A warehouse reached over the PostgreSQL protocol.
///
/// Holds a small pool of connections; each operation checks one out for its
/// whole duration so a connection never serves two statements at once.
pub struct PostgresWarehouse {
    clients: Vec<Mutex<Client>>,
    next: AtomicUsize,
}

impl PostgresWarehouse {
    pub async fn connect(url: &str, pool_size: usize, options: &ConnectOptions) -> Result<Self> {
        let mut clients = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            let client = connect_with_retry(url, options)
                .await
                .context("Failed to connect to warehouse")?;
            clients.push(Mutex::new(client));
        }

        let warehouse = Self {
            clients,
            next: AtomicUsize::new(0),
        };
        warehouse.ensure_catalog().await?;
        Ok(warehouse)
    }

    async fn checkout(&self) -> MutexGuard<'_, Client> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        self.clients[idx].lock().await
    }

    async fn ensure_catalog(&self) -> Result<()> {
        let client = self.checkout().await;
        create_schema_if_absent(&*client, CATALOG_SCHEMA).await?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (
                dataset TEXT NOT NULL,
                table_name TEXT NOT NULL,
                modified_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (dataset, table_name)
            )",
            quote_ident(CATALOG_SCHEMA),
            quote_ident(CATALOG_TABLE)
        );
        match client.batch_execute(&ddl).await {
            Ok(()) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e).context("Failed to create warehouse catalog table"),
        }
    }
}

fn qualified(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.dataset), quote_ident(&table.table))
}

/// Concurrent `IF NOT EXISTS` DDL can still lose a race on the catalog's
/// unique indexes; those errors mean someone else created the object.
fn is_already_exists(e: &tokio_postgres::Error) -> bool {
    e.code().is_some_and(|code| {
        *code == SqlState::DUPLICATE_SCHEMA
            || *code == SqlState::DUPLICATE_TABLE
            || *code == SqlState::UNIQUE_VIOLATION
    })
}

fn is_missing_relation(e: &tokio_postgres::Error) -> bool {
    e.code().is_some_and(|code| {
        *code == SqlState::UNDEFINED_TABLE || *code == SqlState::INVALID_SCHEMA_NAME
    })
}

async fn create_schema_if_absent(client: &impl GenericClient, schema: &str) -> Result<()> {
    let ddl = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema));
    match client.batch_execute(&ddl).await {
        Ok(()) => Ok(()),
        Err(e) if is_already_exists(&e) => {
            tracing::debug!("Schema {} created concurrently", schema);
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to create dataset {}", schema)),
    }
}

/// Columns and their declared types, in ordinal order. Empty when the table is absent.
async fn describe(client: &impl GenericClient, table: &TableRef) -> Result<Vec<Column>> {
    let rows = client
        .query(
            "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
             FROM pg_attribute a
             JOIN pg_class c ON c.oid = a.attrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1
               AND c.relname = $2
               AND c.relkind IN ('r', 'p')
               AND a.attnum > 0
               AND NOT a.attisdropped
             ORDER BY a.attnum",
            &[&table.dataset, &table.table],
        )
        .await
        .with_context(|| format!("Failed to describe {}", table))?;

    Ok(rows
        .iter()
        .map(|row| Column {
            name: row.get(0),
            data_type: row.get(1),
        })
        .collect())
}

/// Record that `table` changed now.
async fn touch(client: &impl GenericClient, table: &TableRef) -> Result<()> {
    let query = format!(
        "INSERT INTO {}.{} (dataset, table_name, modified_at) VALUES ($1, $2, clock_timestamp())
         ON CONFLICT (dataset, table_name) DO UPDATE SET modified_at = EXCLUDED.modified_at",
        quote_ident(CATALOG_SCHEMA),
        quote_ident(CATALOG_TABLE)
    );
    client
        .execute(&query, &[&table.dataset, &table.table])
        .await
        .with_context(|| format!("Failed to record modification of {}", table))?;
    Ok(())
}

fn build_create_table(table: &TableRef, schema: &TableSchema) -> String {
    let columns = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.data_type))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({})", qualified(table), columns)
}

/// Build a multi-row insert whose text parameters are cast to each column's type.
///
/// ```sql
/// INSERT INTO "d"."t" ("id", "name")
/// VALUES (CAST($1::text AS integer), CAST($2::text AS text)), (...)
/// ```
fn build_insert_query(table: &TableRef, columns: &[Column], num_rows: usize) -> String {
    let names = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let width = columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let casts: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(col_idx, c)| {
                    format!("CAST(${}::text AS {})", row_idx * width + col_idx + 1, c.data_type)
                })
                .collect();
            format!("({})", casts.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified(table),
        names,
        value_rows.join(", ")
    )
}

fn build_delete_missing_keys(target: &TableRef, key_column: &str, keys: &TableRef) -> String {
    let key = quote_ident(key_column);
    format!(
        "DELETE FROM {target} WHERE {key}::text NOT IN \
         (SELECT {key}::text FROM {keys} WHERE {key} IS NOT NULL)",
        target = qualified(target),
        keys = qualified(keys),
        key = key
    )
}

/// `INSERT ... SELECT` matching columns by name; target columns the source
/// lacks are filled with NULL.
fn build_insert_select(
    target: &TableRef,
    target_columns: &[Column],
    source: &TableRef,
    source_columns: &[Column],
) -> String {
    let names = target_columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let exprs = target_columns
        .iter()
        .map(|c| {
            if source_columns.iter().any(|s| s.name == c.name) {
                format!("CAST({}::text AS {})", quote_ident(&c.name), c.data_type)
            } else {
                "NULL".to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        qualified(target),
        names,
        exprs,
        qualified(source)
    )
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    async fn table_metadata(&self, table: &TableRef) -> Result<Lookup<TableMetadata>> {
        let client = self.checkout().await;
        let columns = describe(&*client, table).await?;
        if columns.is_empty() {
            return Ok(Lookup::NotFound);
        }

        let count: i64 = client
            .query_one(&format!("SELECT COUNT(*) FROM {}", qualified(table)), &[])
            .await
            .with_context(|| format!("Failed to count rows of {}", table))?
            .get(0);

        let modified = client
            .query_opt(
                &format!(
                    "SELECT modified_at FROM {}.{} WHERE dataset = $1 AND table_name = $2",
                    quote_ident(CATALOG_SCHEMA),
                    quote_ident(CATALOG_TABLE)
                ),
                &[&table.dataset, &table.table],
            )
            .await
            .with_context(|| format!("Failed to read modification time of {}", table))?
            .map(|row| row.get::<_, DateTime<Utc>>(0));

        Ok(Lookup::Found(TableMetadata {
            schema: TableSchema { columns },
            num_rows: count.max(0) as u64,
            last_modified: modified,
        }))
    }

    async fn ensure_dataset(&self, dataset: &DatasetRef) -> Result<()> {
        let client = self.checkout().await;
        create_schema_if_absent(&*client, &dataset.name).await
    }

    async fn load_replace(
        &self,
        table: &TableRef,
        schema: &TableSchema,
        rows: &RowSet,
    ) -> Result<u64> {
        if !schema.has_column_names(&rows.columns) {
            bail!(
                "Schema for {} does not match extracted columns {:?}",
                table,
                rows.columns
            );
        }
        if schema.columns.is_empty() {
            bail!("Cannot load {} without columns", table);
        }

        let mut client = self.checkout().await;
        let tx = client
            .transaction()
            .await
            .context("Failed to begin load transaction")?;

        let existing = describe(&tx, table).await?;
        let columns = if !existing.is_empty()
            && existing.len() == schema.columns.len()
            && existing.iter().zip(&schema.columns).all(|(e, s)| e.name == s.name)
        {
            tx.batch_execute(&format!("TRUNCATE TABLE {}", qualified(table)))
                .await
                .with_context(|| format!("Failed to truncate {}", table))?;
            existing
        } else {
            if !existing.is_empty() {
                tracing::info!("Replacing {} because its columns changed", table);
            }
            tx.batch_execute(&format!(
                "DROP TABLE IF EXISTS {}; {}",
                qualified(table),
                build_create_table(table, schema)
            ))
            .await
            .with_context(|| format!("Failed to create {}", table))?;
            schema.columns.clone()
        };

        let batch_size = std::cmp::max(1, MAX_PARAMS / columns.len());
        let mut loaded = 0u64;
        for chunk in rows.rows.chunks(batch_size) {
            if let Some(bad) = chunk.iter().find(|row| row.len() != columns.len()) {
                bail!(
                    "Row with {} values does not fit {} columns of {}",
                    bad.len(),
                    columns.len(),
                    table
                );
            }
            let query = build_insert_query(table, &columns, chunk.len());
            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flat_map(|row| row.iter().map(|v| v as &(dyn ToSql + Sync)))
                .collect();
            loaded += tx
                .execute(&query, &params)
                .await
                .with_context(|| format!("Failed to load batch into {}", table))?;
        }

        touch(&tx, table).await?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit load of {}", table))?;

        Ok(loaded)
    }

    async fn delete_missing_keys(
        &self,
        target: &TableRef,
        key_column: &str,
        keys: &TableRef,
    ) -> Result<u64> {
        let mut client = self.checkout().await;
        let tx = client
            .transaction()
            .await
            .context("Failed to begin prune transaction")?;

        let deleted = tx
            .execute(&build_delete_missing_keys(target, key_column, keys), &[])
            .await
            .with_context(|| format!("Failed to prune {} against {}", target, keys))?;

        touch(&tx, target).await?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit prune of {}", target))?;
        Ok(deleted)
    }

    async fn insert_from(&self, target: &TableRef, source: &TableRef) -> Result<u64> {
        let mut client = self.checkout().await;
        let tx = client
            .transaction()
            .await
            .context("Failed to begin insert transaction")?;

        let target_columns = describe(&tx, target).await?;
        if target_columns.is_empty() {
            bail!("Not found: Table {}", target);
        }
        let source_columns = describe(&tx, source).await?;
        if source_columns.is_empty() {
            bail!("Not found: Table {}", source);
        }

        let inserted = tx
            .execute(
                &build_insert_select(target, &target_columns, source, &source_columns),
                &[],
            )
            .await
            .with_context(|| format!("Failed to insert {} into {}", source, target))?;

        touch(&tx, target).await?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit insert into {}", target))?;
        Ok(inserted)
    }

    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Lookup<Vec<String>>> {
        let client = self.checkout().await;
        let exists: bool = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)",
                &[&dataset.name],
            )
            .await
            .with_context(|| format!("Failed to look up dataset {}", dataset))?
            .get(0);
        if !exists {
            return Ok(Lookup::NotFound);
        }

        let rows = client
            .query(
                "SELECT table_name::text
                 FROM information_schema.tables
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE'
                 ORDER BY table_name",
                &[&dataset.name],
            )
            .await
            .with_context(|| format!("Failed to list tables in {}", dataset))?;

        Ok(Lookup::Found(rows.iter().map(|row| row.get(0)).collect()))
    }

    async fn max_value(&self, table: &TableRef, column: &str) -> Result<Lookup<Option<String>>> {
        let client = self.checkout().await;
        let query = format!(
            "SELECT MAX({})::text FROM {}",
            quote_ident(column),
            qualified(table)
        );
        match client.query_one(&query, &[]).await {
            Ok(row) => Ok(Lookup::Found(row.get(0))),
            Err(e) if is_missing_relation(&e) => Ok(Lookup::NotFound),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read MAX({}) of {}", column, table))
            }
        }
    }
}
