//! Query text builders
//!
//! Every identifier quote, string escape and numeric coercion in generated
//! query text goes through this module. The compiler, the cache builder and
//! the cache lookup service only assemble the pieces returned from here.

use crate::types::{format_number, Value};
use serde::{Deserialize, Serialize};

/// Row-number column added by [`row_numbered`] sources
pub const ROW_NUMBER_COLUMN: &str = "__rn";
/// Pseudo-column carrying insertion order on SQLite and analytical tables
pub const STORAGE_ORDER: &str = "rowid";
/// Pre-aggregated sum column of an aggregation cache table
pub const SUM_COLUMN: &str = "__sum";
/// Pre-aggregated row count column of an aggregation cache table
pub const COUNT_COLUMN: &str = "__count";
/// Count of numeric values, the divisor for cached averages
pub const NUMERIC_COUNT_COLUMN: &str = "__numeric_count";
/// Key column of a match index table
pub const LOOKUP_VALUE_COLUMN: &str = "lookup_val";
/// 1-based first position column of a match index table
pub const POSITION_COLUMN: &str = "position";
/// Original position tag of a staged batch criteria tuple
pub const INDEX_COLUMN: &str = "__idx";

/// SQL flavour of the storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Analytical engines with `TRY_CAST`, `GREATEST`, `LEAST`
    #[default]
    Analytical,
    /// SQLite with the `try_double`, `greatest`, `least` user functions
    Sqlite,
}

impl Dialect {
    /// Numeric coercion that yields NULL instead of failing
    pub fn try_number(self, expr: &str) -> String {
        match self {
            Dialect::Analytical => format!("TRY_CAST({} AS DOUBLE)", expr),
            Dialect::Sqlite => format!("try_double({})", expr),
        }
    }
}

/// Comparison operators accepted in criteria and IF conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }

    /// Split a leading operator off `text`; two-character operators win
    pub fn strip_prefix(text: &str) -> Option<(CompareOp, &str)> {
        const OPS: [(&str, CompareOp); 6] = [
            (">=", CompareOp::Ge),
            ("<=", CompareOp::Le),
            ("<>", CompareOp::Ne),
            (">", CompareOp::Gt),
            ("<", CompareOp::Lt),
            ("=", CompareOp::Eq),
        ];
        OPS.iter()
            .find_map(|(token, op)| text.strip_prefix(token).map(|rest| (*op, rest)))
    }
}

//==============================================================================
// Literals and identifiers
//==============================================================================

/// Quote an identifier, doubling embedded double quotes
pub fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes
pub fn string_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Parse `text` as a finite number, rejecting `inf`/`nan` spellings
pub fn parse_number(text: &str) -> Option<f64> {
    let t = text.trim();
    if t.is_empty() || t.chars().any(|c| c.is_alphabetic() && c != 'e' && c != 'E') {
        return None;
    }
    t.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Literal for a criteria or lookup operand: numbers unquoted, anything else quoted
pub fn value_literal(text: &str) -> String {
    let t = text.trim();
    if parse_number(t).is_some() {
        t.to_string()
    } else {
        string_literal(t)
    }
}

/// Literal for a typed value
pub fn typed_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Number(n) => format_number(*n),
        Value::Text(s) => string_literal(s),
    }
}

//==============================================================================
// Predicates
//==============================================================================

pub fn compare(lhs: &str, op: CompareOp, rhs: &str) -> String {
    format!("{} {} {}", lhs, op.as_sql(), rhs)
}

pub fn like(lhs: &str, pattern: &str) -> String {
    format!("{} LIKE {}", lhs, string_literal(pattern))
}

pub fn between(lhs: &str, low: u32, high: u32) -> String {
    format!("{} BETWEEN {} AND {}", lhs, low, high)
}

/// Conjoin predicates; an empty list yields `None` (no WHERE clause)
pub fn and_all(predicates: &[String]) -> Option<String> {
    if predicates.is_empty() {
        None
    } else {
        Some(predicates.join(" AND "))
    }
}

//==============================================================================
// Aggregate expressions
//==============================================================================

pub fn sum_numeric(dialect: Dialect, expr: &str) -> String {
    format!("COALESCE(SUM({}), 0)", dialect.try_number(expr))
}

pub fn count_numeric(dialect: Dialect, expr: &str) -> String {
    format!(
        "COUNT(CASE WHEN {} IS NOT NULL THEN 1 END)",
        dialect.try_number(expr)
    )
}

pub fn count_nonblank(expr: &str) -> String {
    format!(
        "COUNT(CASE WHEN {e} IS NOT NULL AND CAST({e} AS VARCHAR) <> '' THEN 1 END)",
        e = expr
    )
}

pub fn avg_numeric(dialect: Dialect, expr: &str) -> String {
    format!("AVG({})", dialect.try_number(expr))
}

pub fn min_numeric(dialect: Dialect, expr: &str) -> String {
    format!("MIN({})", dialect.try_number(expr))
}

pub fn max_numeric(dialect: Dialect, expr: &str) -> String {
    format!("MAX({})", dialect.try_number(expr))
}

/// Combine per-column aggregates with LEAST; a single input passes through
pub fn least(exprs: &[String]) -> String {
    combine("LEAST", exprs)
}

/// Combine per-column aggregates with GREATEST; a single input passes through
pub fn greatest(exprs: &[String]) -> String {
    combine("GREATEST", exprs)
}

fn combine(function: &str, exprs: &[String]) -> String {
    if exprs.len() == 1 {
        exprs[0].clone()
    } else {
        format!("{}({})", function, exprs.join(", "))
    }
}

/// Division where a zero divisor yields NULL
pub fn safe_divide(numerator: &str, denominator: &str) -> String {
    format!("({}) / NULLIF({}, 0)", numerator, denominator)
}

pub fn coalesce_zero(expr: &str) -> String {
    format!("COALESCE({}, 0)", expr)
}

/// `CASE WHEN predicate THEN expr END`, used to bound a column to a row span
pub fn when(predicate: &str, expr: &str) -> String {
    format!("CASE WHEN {} THEN {} END", predicate, expr)
}

//==============================================================================
// Sources and statements
//==============================================================================

/// `ROW_NUMBER()` over insertion order
///
/// `OVER ()` follows the planner's scan, which is key order once the column
/// is indexed.
fn row_number() -> String {
    format!("ROW_NUMBER() OVER (ORDER BY {})", STORAGE_ORDER)
}

/// Table source carrying a 1-based row number in insertion order
pub fn row_numbered(table: &str) -> String {
    format!(
        "(SELECT {} AS {}, * FROM {})",
        row_number(),
        ident(ROW_NUMBER_COLUMN),
        ident(table)
    )
}

/// `SELECT column_expr FROM table` at 0-based `offset` in insertion order
pub fn nth_row(column: &str, table: &str, offset: u64) -> String {
    format!(
        "SELECT {} FROM {} ORDER BY {} LIMIT 1 OFFSET {}",
        column,
        ident(table),
        STORAGE_ORDER,
        offset
    )
}

/// `SELECT select_list FROM source [WHERE predicate]`
pub fn select(select_list: &str, source: &str, predicate: Option<&str>) -> String {
    match predicate {
        Some(p) => format!("SELECT {} FROM {} WHERE {}", select_list, source, p),
        None => format!("SELECT {} FROM {}", select_list, source),
    }
}

/// Scalar subquery yielding the value of one cell (1-based row)
pub fn cell_value(table: &str, column: &str, row: u32) -> String {
    format!("({})", nth_row(&ident(column), table, u64::from(row.saturating_sub(1))))
}

/// GROUP BY pre-aggregation feeding an aggregation cache table
pub fn aggregation_cache_select(
    dialect: Dialect,
    table: &str,
    group_columns: &[String],
    aggregated_column: &str,
    include_sum: bool,
    include_count: bool,
    include_avg: bool,
) -> String {
    let groups: Vec<String> = group_columns.iter().map(|c| ident(c)).collect();
    let value = ident(aggregated_column);

    let mut select_list = groups.clone();
    if include_sum || include_avg {
        select_list.push(format!(
            "{} AS {}",
            sum_numeric(dialect, &value),
            ident(SUM_COLUMN)
        ));
    }
    if include_count {
        select_list.push(format!("COUNT(*) AS {}", ident(COUNT_COLUMN)));
    }
    if include_avg {
        select_list.push(format!(
            "{} AS {}",
            count_numeric(dialect, &value),
            ident(NUMERIC_COUNT_COLUMN)
        ));
    }

    format!(
        "SELECT {} FROM {} GROUP BY {}",
        select_list.join(", "),
        ident(table),
        groups.join(", ")
    )
}

/// Value to first 1-based position map feeding a match index table
pub fn match_index_select(table: &str, column: &str) -> String {
    let col = ident(column);
    format!(
        "SELECT {col} AS {val}, MIN({rn}) AS {pos} FROM (SELECT {number} AS {rn}, {col} FROM {table}) GROUP BY {col}",
        col = col,
        number = row_number(),
        val = ident(LOOKUP_VALUE_COLUMN),
        pos = ident(POSITION_COLUMN),
        rn = ident(ROW_NUMBER_COLUMN),
        table = ident(table),
    )
}
