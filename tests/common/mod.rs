//! Shared fixtures for integration tests
#![allow(dead_code)]

use parking_lot::Mutex;
use royalbit_sheetsql::core::sql::Dialect;
use royalbit_sheetsql::error::{SheetError, SheetResult};
use royalbit_sheetsql::storage::{Backend, ColumnResolver, SqliteBackend};
use royalbit_sheetsql::types::{Row, Value};

/// (value, category, region)
pub const SALES: [(f64, &str, &str); 8] = [
    (100.0, "A", "East"),
    (200.0, "A", "West"),
    (150.0, "B", "East"),
    (250.0, "B", "West"),
    (300.0, "A", "East"),
    (175.0, "C", "East"),
    (225.0, "C", "West"),
    (350.0, "A", "West"),
];

pub fn sales_rows() -> Vec<Row> {
    SALES
        .iter()
        .map(|(value, category, region)| vec![Value::from(*value), Value::from(*category), Value::from(*region)])
        .collect()
}

/// SQLite backend with the sales data loaded as sheet `Sales`
pub fn sales_backend() -> SqliteBackend {
    let backend = SqliteBackend::open_in_memory().unwrap();
    backend
        .load_sheet(
            "Sales",
            &["value".to_string(), "category".to_string(), "region".to_string()],
            &sales_rows(),
        )
        .unwrap();
    backend
}

/// Backend that records every materialize request before delegating
pub struct RecordingBackend {
    inner: SqliteBackend,
    pub materialized: Mutex<Vec<String>>,
    pub fail_materialize_for: Option<String>,
}

impl RecordingBackend {
    pub fn new(inner: SqliteBackend) -> Self {
        Self {
            inner,
            materialized: Mutex::new(Vec::new()),
            fail_materialize_for: None,
        }
    }

    pub fn failing_on(inner: SqliteBackend, table_fragment: &str) -> Self {
        Self {
            fail_materialize_for: Some(table_fragment.to_string()),
            ..Self::new(inner)
        }
    }

    pub fn materialize_count(&self) -> usize {
        self.materialized.lock().len()
    }
}

impl ColumnResolver for RecordingBackend {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn resolve_table(&self, sheet: &str) -> Option<String> {
        self.inner.resolve_table(sheet)
    }

    fn resolve_column(&self, sheet: &str, column: &str) -> Option<String> {
        self.inner.resolve_column(sheet, column)
    }
}

impl Backend for RecordingBackend {
    fn execute(&self, query: &str) -> SheetResult<Vec<Row>> {
        self.inner.execute(query)
    }

    fn materialize(&self, name: &str, select_query: &str) -> SheetResult<()> {
        self.materialized.lock().push(name.to_string());
        if let Some(fragment) = &self.fail_materialize_for {
            if name.contains(fragment.as_str()) {
                return Err(SheetError::Backend(format!("refusing to materialize {}", name)));
            }
        }
        self.inner.materialize(name, select_query)
    }

    fn create_index(&self, table: &str, column: &str) -> SheetResult<()> {
        self.inner.create_index(table, column)
    }
}
