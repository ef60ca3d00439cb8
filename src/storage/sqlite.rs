//! In-memory SQLite backend
//!
//! Sheets are loaded into untyped tables, so a number stays a REAL and text
//! stays TEXT. `try_double`, `greatest` and `least` are registered as scalar
//! functions so that generated query text behaves the same here as on an
//! analytical engine.

use super::{Backend, ColumnMap, ColumnResolver, SheetColumns};
use crate::core::sql::{self, Dialect};
use crate::error::{SheetError, SheetResult};
use crate::types::{Row, Value};
use parking_lot::{Mutex, RwLock};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::collections::HashSet;
use tracing::debug;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
    columns: RwLock<ColumnMap>,
}

impl SqliteBackend {
    /// Open a private in-memory database with the numeric helpers registered
    pub fn open_in_memory() -> SheetResult<Self> {
        let conn = Connection::open_in_memory()?;
        register_functions(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            columns: RwLock::new(ColumnMap::new(Dialect::Sqlite)),
        })
    }

    /// Load (or reload) a sheet from header names and row values
    ///
    /// Column A maps to the first header, B to the second, and so on. Rows
    /// shorter than the header are padded with NULL.
    ///
    /// Derived cache tables are not touched. After a reload, run
    /// `Calculator::invalidate_sheet` (or `CacheManager::invalidate_sheet`)
    /// before serving lookups again.
    pub fn load_sheet(&self, sheet: &str, headers: &[String], rows: &[Row]) -> SheetResult<SheetColumns> {
        if headers.is_empty() {
            return Err(SheetError::Validation(format!("sheet '{}' has no columns", sheet)));
        }
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() > headers.len()) {
            return Err(SheetError::Validation(format!(
                "sheet '{}' row {} has {} values but only {} columns",
                sheet,
                i + 1,
                row.len(),
                headers.len()
            )));
        }

        let mut columns = self.columns.write();
        let table = match columns.sheet(sheet) {
            Some(existing) => existing.table.clone(),
            None => {
                let taken: HashSet<String> = columns.tables().map(str::to_string).collect();
                unique_name(&sanitize_identifier(sheet, "t_", "sheet"), &taken)
            }
        };
        let physical = column_names(headers);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {t}; CREATE TABLE {t} ({cols})",
            t = sql::ident(&table),
            cols = physical.iter().map(|c| sql::ident(c)).collect::<Vec<_>>().join(", ")
        ))?;
        {
            let placeholders = vec!["?"; physical.len()].join(", ");
            let mut insert = tx.prepare(&format!(
                "INSERT INTO {} VALUES ({})",
                sql::ident(&table),
                placeholders
            ))?;
            for row in rows {
                let values = (0..physical.len()).map(|i| row.get(i).map(to_sql).unwrap_or(SqlValue::Null));
                insert.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;

        columns.insert_sheet(sheet, &table, physical, rows.len());
        debug!(sheet, table = %table, rows = rows.len(), "loaded sheet");

        columns
            .sheet(sheet)
            .cloned()
            .ok_or_else(|| SheetError::SheetNotLoaded(sheet.to_string()))
    }

    /// Layout of a loaded sheet
    pub fn sheet(&self, sheet: &str) -> Option<SheetColumns> {
        self.columns.read().sheet(sheet).cloned()
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.columns.read().sheet_names()
    }

    /// Whether a table (sheet or materialized cache) exists
    pub fn table_exists(&self, name: &str) -> SheetResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

impl ColumnResolver for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn resolve_table(&self, sheet: &str) -> Option<String> {
        self.columns.read().resolve_table(sheet)
    }

    fn resolve_column(&self, sheet: &str, column: &str) -> Option<String> {
        self.columns.read().resolve_column(sheet, column)
    }
}

impl Backend for SqliteBackend {
    fn execute(&self, query: &str) -> SheetResult<Vec<Row>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(query)?;
        let width = stmt.column_count();
        if width == 0 {
            stmt.execute([])?;
            return Ok(Vec::new());
        }

        let rows = stmt.query_map([], |row| {
            (0..width)
                .map(|i| row.get_ref(i).map(from_sql))
                .collect::<rusqlite::Result<Row>>()
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn materialize(&self, name: &str, select_query: &str) -> SheetResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {t}; CREATE TABLE {t} AS {q}",
            t = sql::ident(name),
            q = select_query
        ))?;
        Ok(())
    }

    fn create_index(&self, table: &str, column: &str) -> SheetResult<()> {
        let index = sanitize_identifier(&format!("idx_{}_{}", table, column), "i_", "idx");
        let conn = self.conn.lock();
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            sql::ident(&index),
            sql::ident(table),
            sql::ident(column)
        ))?;
        Ok(())
    }
}

//==============================================================================
// Names
//==============================================================================

/// Lower-case `name`, replacing anything outside `[a-z0-9_]` with `_`
///
/// A leading digit gets `prefix`; an empty result becomes `fallback`.
pub fn sanitize_identifier(name: &str, prefix: &str, fallback: &str) -> String {
    let cleaned: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if cleaned.is_empty() {
        fallback.to_string()
    } else if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        format!("{}{}", prefix, cleaned)
    } else {
        cleaned
    }
}

/// Append `_2`, `_3`, ... until `base` is not in `taken`
fn unique_name(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

fn column_names(headers: &[String]) -> Vec<String> {
    let mut taken = HashSet::new();
    headers
        .iter()
        .enumerate()
        .map(|(i, header)| {
            let fallback = format!("col{}", i + 1);
            let base = sanitize_identifier(header, "c_", &fallback);
            let name = unique_name(&base, &taken);
            taken.insert(name.clone());
            name
        })
        .collect()
}

//==============================================================================
// Value conversion
//==============================================================================

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => SqlValue::Real(*n),
        Value::Text(s) => SqlValue::Text(s.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i as f64),
        ValueRef::Real(f) => Value::Number(f),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

//==============================================================================
// Scalar functions
//==============================================================================

fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("try_double", 1, flags, |ctx| Ok(numeric_arg(ctx, 0)))?;
    conn.create_scalar_function("greatest", -1, flags, |ctx| {
        Ok(numeric_args(ctx).into_iter().reduce(f64::max))
    })?;
    conn.create_scalar_function("least", -1, flags, |ctx| {
        Ok(numeric_args(ctx).into_iter().reduce(f64::min))
    })?;
    Ok(())
}

/// Numeric value of argument `i`, NULL when it does not coerce
fn numeric_arg(ctx: &Context<'_>, i: usize) -> Option<f64> {
    match ctx.get_raw(i) {
        ValueRef::Integer(n) => Some(n as f64),
        ValueRef::Real(f) => Some(f),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| sql::parse_number(s)),
        ValueRef::Null | ValueRef::Blob(_) => None,
    }
}

/// Non-NULL numeric arguments
fn numeric_args(ctx: &Context<'_>) -> Vec<f64> {
    (0..ctx.len()).filter_map(|i| numeric_arg(ctx, i)).collect()
}
