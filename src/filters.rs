// ABOUTME: Table include/exclude rules applied to each environment's table listing
// ABOUTME: Include and exclude lists are mutually exclusive

use anyhow::{bail, Result};

use crate::utils::validate_identifier;

/// Which source tables to mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    include_tables: Option<Vec<String>>,
    exclude_tables: Option<Vec<String>>,
}

impl TableFilter {
    /// Creates a filter from configured lists. Empty lists mean "no rule".
    pub fn new(include_tables: Vec<String>, exclude_tables: Vec<String>) -> Result<Self> {
        if !include_tables.is_empty() && !exclude_tables.is_empty() {
            bail!("Cannot use both include_tables and exclude_tables");
        }

        for table in include_tables.iter().chain(&exclude_tables) {
            if let Err(e) = validate_identifier(table) {
                bail!("Invalid table name in filter '{}': {}", table, e);
            }
        }

        Ok(Self {
            include_tables: (!include_tables.is_empty()).then_some(include_tables),
            exclude_tables: (!exclude_tables.is_empty()).then_some(exclude_tables),
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.include_tables.is_none() && self.exclude_tables.is_none()
    }

    /// Determines if a table should be mirrored
    pub fn should_mirror_table(&self, table: &str) -> bool {
        if let Some(ref include) = self.include_tables {
            if !include.iter().any(|t| t == table) {
                return false;
            }
        }

        if let Some(ref exclude) = self.exclude_tables {
            if exclude.iter().any(|t| t == table) {
                return false;
            }
        }

        true
    }

    /// Keep the tables that pass the filter, preserving order.
    pub fn apply(&self, tables: Vec<String>) -> Vec<String> {
        tables
            .into_iter()
            .filter(|t| self.should_mirror_table(t))
            .collect()
    }
}
