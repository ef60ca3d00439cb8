//! Storage and query-execution boundary
//!
//! The compiler only needs [`ColumnResolver`]; the cache builder and lookup
//! service need the full [`Backend`]. [`SqliteBackend`] is the bundled
//! implementation used by the CLI and the test suite.

mod sqlite;

pub use sqlite::{sanitize_identifier, SqliteBackend};

use crate::core::reference::column_letter_to_index;
use crate::core::sql::Dialect;
use crate::error::SheetResult;
use crate::types::Row;
use std::collections::HashMap;

/// Maps sheets and column letters to physical table and column names
pub trait ColumnResolver: Send + Sync {
    /// SQL flavour the generated query text must target
    fn dialect(&self) -> Dialect {
        Dialect::Analytical
    }

    fn resolve_table(&self, sheet: &str) -> Option<String>;

    /// `column` is an upper-case letter such as `A` or `AB`
    fn resolve_column(&self, sheet: &str, column: &str) -> Option<String>;
}

/// Executes generated query text and stores derived tables
pub trait Backend: ColumnResolver {
    fn execute(&self, query: &str) -> SheetResult<Vec<Row>>;

    /// First row of the result, if any
    fn execute_scalar(&self, query: &str) -> SheetResult<Option<Row>> {
        Ok(self.execute(query)?.into_iter().next())
    }

    /// Create or replace table `name` from `select_query`
    fn materialize(&self, name: &str, select_query: &str) -> SheetResult<()>;

    /// Index `column` of `table`; callers treat failure as non-fatal
    fn create_index(&self, table: &str, column: &str) -> SheetResult<()>;
}

/// Physical layout of one loaded sheet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetColumns {
    pub table: String,
    /// Physical column names; index 0 is column A
    pub columns: Vec<String>,
    pub row_count: usize,
}

/// In-memory sheet → table and letter → column mapping
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    dialect: Dialect,
    sheets: HashMap<String, SheetColumns>,
}

impl ColumnMap {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sheets: HashMap::new(),
        }
    }

    /// Register (or replace) a sheet's layout
    pub fn insert_sheet(&mut self, sheet: &str, table: &str, columns: Vec<String>, row_count: usize) {
        self.sheets.insert(
            sheet.to_string(),
            SheetColumns {
                table: table.to_string(),
                columns,
                row_count,
            },
        );
    }

    /// Builder form of [`ColumnMap::insert_sheet`]
    pub fn with_sheet(mut self, sheet: &str, table: &str, columns: &[&str]) -> Self {
        self.insert_sheet(
            sheet,
            table,
            columns.iter().map(|c| c.to_string()).collect(),
            0,
        );
        self
    }

    pub fn sheet(&self, sheet: &str) -> Option<&SheetColumns> {
        self.sheets.get(sheet)
    }

    /// Table names already taken by loaded sheets
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.sheets.values().map(|s| s.table.as_str())
    }

    pub fn sheet_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sheets.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ColumnResolver for ColumnMap {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn resolve_table(&self, sheet: &str) -> Option<String> {
        self.sheets.get(sheet).map(|s| s.table.clone())
    }

    fn resolve_column(&self, sheet: &str, column: &str) -> Option<String> {
        let index = column_letter_to_index(column)?;
        self.sheets.get(sheet)?.columns.get(index).cloned()
    }
}
