// ABOUTME: Source store interface - catalog listing and streamed row export
// ABOUTME: Rows travel as ordered optional text values with a column header

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

pub use memory::InMemorySource;

/// Extracted rows with their column header.
///
/// Every value is the source's text rendering of the column, `None` for SQL NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one column, in row order.
    pub fn column_values<'a>(&'a self, name: &str) -> impl Iterator<Item = Option<&'a str>> + 'a {
        let idx = self.column_index(name);
        self.rows
            .iter()
            .map(move |row| idx.and_then(|i| row.get(i)).and_then(|v| v.as_deref()))
    }
}

/// Filter on the update-timestamp column used by incremental extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampPredicate {
    /// `column > watermark OR column IS NULL`: rows changed since the last mirror.
    ///
    /// A NULL timestamp cannot be placed against the watermark, so the row is
    /// re-staged on every run.
    After { column: String, watermark: String },
    /// `column <= watermark`: rows the mirror already holds.
    NotAfter { column: String, watermark: String },
}

impl TimestampPredicate {
    pub fn column(&self) -> &str {
        match self {
            TimestampPredicate::After { column, .. }
            | TimestampPredicate::NotAfter { column, .. } => column,
        }
    }

    /// Evaluate against a text value, comparing lexically.
    pub fn matches(&self, value: Option<&str>) -> bool {
        match self {
            TimestampPredicate::After { watermark, .. } => {
                value.map_or(true, |v| v > watermark.as_str())
            }
            TimestampPredicate::NotAfter { watermark, .. } => {
                value.is_some_and(|v| v <= watermark.as_str())
            }
        }
    }
}

/// Read access to one source database.
///
/// Implementations must read each export in a single pass so the rows of one
/// artifact reflect one consistent read.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>>;

    /// Column names in ordinal order.
    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<String>>;

    /// Primary key columns in key order; empty when the table has none.
    async fn primary_key(&self, schema: &str, table: &str) -> Result<Vec<String>>;

    async fn export_rows(
        &self,
        schema: &str,
        table: &str,
        predicate: Option<&TimestampPredicate>,
    ) -> Result<RowSet>;

    async fn export_column(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        predicate: Option<&TimestampPredicate>,
    ) -> Result<RowSet>;
}

/// Opens source connections for one environment.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SourceStore>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_after_predicate_includes_null_excludes_equal() {
        let p = TimestampPredicate::After {
            column: "updated_at".to_string(),
            watermark: "2024-01-01 00:00:00".to_string(),
        };
        assert!(p.matches(Some("2024-01-02 00:00:00")));
        assert!(!p.matches(Some("2024-01-01 00:00:00")));
        assert!(p.matches(None));
    }

    #[test]
    fn test_not_after_predicate_excludes_null() {
        let p = TimestampPredicate::NotAfter {
            column: "updated_at".to_string(),
            watermark: "2024-01-01 00:00:00".to_string(),
        };
        assert!(p.matches(Some("2024-01-01 00:00:00")));
        assert!(!p.matches(None));
        assert!(!p.matches(Some("2024-03-01 00:00:00")));
        assert_eq!(p.column(), "updated_at");
    }

    #[test]
    fn test_row_set_column_values() {
        let mut rows = RowSet::new(vec!["id".to_string(), "name".to_string()]);
        rows.rows.push(vec![Some("1".to_string()), Some("a".to_string())]);
        rows.rows.push(vec![Some("2".to_string()), None]);

        let names: Vec<_> = rows.column_values("name").collect();
        assert_eq!(names, vec![Some("a"), None]);
        assert_eq!(rows.column_values("missing").count(), 2);
        assert_eq!(rows.len(), 2);
    }
}
