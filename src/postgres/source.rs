// ABOUTME: PostgreSQL source store - catalog queries and streamed text exports
// ABOUTME: Every column is cast to text so rows stay type-agnostic until the warehouse

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::{pin_mut, TryStreamExt};
use tokio_postgres::Client;

use super::{connect_with_retry, ConnectOptions};
use crate::source::{RowSet, SourceConnector, SourceStore, TimestampPredicate};
use crate::utils::{quote_ident, quote_literal};

/// Reads tables from one source PostgreSQL database.
pub struct PostgresSource {
    client: Client,
}

impl PostgresSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Run `query` and collect every row in one pass.
    ///
    /// The query must select exactly `columns.len()` text columns.
    async fn stream_text_rows(&self, query: &str, columns: Vec<String>) -> Result<RowSet> {
        let stream = self
            .client
            .query_raw(query, Vec::<String>::new())
            .await
            .with_context(|| format!("Failed to start export: {}", query))?;
        pin_mut!(stream);

        let width = columns.len();
        let mut rows = RowSet::new(columns);
        while let Some(row) = stream
            .try_next()
            .await
            .context("Export stream failed")?
        {
            rows.rows
                .push((0..width).map(|i| row.get::<_, Option<String>>(i)).collect());
        }

        Ok(rows)
    }
}

/// Render a predicate as a SQL condition.
///
/// The watermark is a string literal so PostgreSQL coerces it to the column's
/// own timestamp type.
pub(crate) fn predicate_sql(predicate: &TimestampPredicate) -> String {
    match predicate {
        TimestampPredicate::After { column, watermark } => {
            let column = quote_ident(column);
            format!(
                "({} > {} OR {} IS NULL)",
                column,
                quote_literal(watermark),
                column
            )
        }
        TimestampPredicate::NotAfter { column, watermark } => {
            format!("{} <= {}", quote_ident(column), quote_literal(watermark))
        }
    }
}

fn build_export_query(
    schema: &str,
    table: &str,
    columns: &[String],
    predicate: Option<&TimestampPredicate>,
) -> String {
    let select_list = columns
        .iter()
        .map(|c| format!("{}::text AS {}", quote_ident(c), quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut query = format!(
        "SELECT {} FROM {}.{}",
        select_list,
        quote_ident(schema),
        quote_ident(table)
    );
    if let Some(predicate) = predicate {
        query.push_str(" WHERE ");
        query.push_str(&predicate_sql(predicate));
    }
    query
}

#[async_trait]
impl SourceStore for PostgresSource {
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT table_name::text
                 FROM information_schema.tables
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE'
                 ORDER BY table_name",
                &[&schema],
            )
            .await
            .with_context(|| format!("Failed to list tables in schema {}", schema))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT column_name::text
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&schema, &table],
            )
            .await
            .with_context(|| format!("Failed to get columns for {}.{}", schema, table))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn primary_key(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname::text
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisprimary
                   AND n.nspname = $1
                   AND c.relname = $2
                 ORDER BY array_position(i.indkey, a.attnum)",
                &[&schema, &table],
            )
            .await
            .with_context(|| format!("Failed to get primary key for {}.{}", schema, table))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn export_rows(
        &self,
        schema: &str,
        table: &str,
        predicate: Option<&TimestampPredicate>,
    ) -> Result<RowSet> {
        let columns = self.list_columns(schema, table).await?;
        if columns.is_empty() {
            bail!("Table {}.{} does not exist or has no columns", schema, table);
        }

        let query = build_export_query(schema, table, &columns, predicate);
        self.stream_text_rows(&query, columns)
            .await
            .with_context(|| format!("Failed to export {}.{}", schema, table))
    }

    async fn export_column(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        predicate: Option<&TimestampPredicate>,
    ) -> Result<RowSet> {
        let columns = vec![column.to_string()];
        let query = build_export_query(schema, table, &columns, predicate);
        self.stream_text_rows(&query, columns)
            .await
            .with_context(|| format!("Failed to export {}.{}({})", schema, table, column))
    }
}

/// Opens [`PostgresSource`] connections for one environment.
pub struct PostgresConnector {
    url: String,
    options: ConnectOptions,
}

impl PostgresConnector {
    pub fn new(url: impl Into<String>, options: ConnectOptions) -> Self {
        Self {
            url: url.into(),
            options,
        }
    }
}

#[async_trait]
impl SourceConnector for PostgresConnector {
    async fn connect(&self) -> Result<Box<dyn SourceStore>> {
        let client = connect_with_retry(&self.url, &self.options).await?;
        Ok(Box::new(PostgresSource::new(client)))
    }
}
