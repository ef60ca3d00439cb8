//! Excel criteria (`">10"`, `"<>0"`, `"A*"`, `"Apple"`) to SQL predicates
//!
//! Shared by every ...IF / ...IFS function and by the calculator when it
//! decides whether a criteria value can be answered from a cache table.

use super::sql::{self, CompareOp};
use crate::types::Value;

/// A parsed criteria expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criteria {
    /// Leading comparison operator and its operand text
    Compare(CompareOp, String),
    /// LIKE pattern, already translated from Excel wildcards
    Pattern(String),
    /// Plain value, compared with `=`
    Equals(String),
}

impl Criteria {
    /// Parse criteria text; one layer of surrounding quotes is stripped
    pub fn parse(text: &str) -> Self {
        let value = strip_quotes(text.trim());

        if let Some((op, operand)) = CompareOp::strip_prefix(&value) {
            return Criteria::Compare(op, operand.to_string());
        }

        if value.contains('*') || value.contains('?') {
            return Criteria::Pattern(value.replace('*', "%").replace('?', "_"));
        }

        Criteria::Equals(value)
    }

    /// Predicate over `column_expr`, which is inserted verbatim
    pub fn to_predicate(&self, column_expr: &str) -> String {
        match self {
            Criteria::Compare(op, operand) => {
                sql::compare(column_expr, *op, &sql::value_literal(operand))
            }
            Criteria::Pattern(pattern) => sql::like(column_expr, pattern),
            Criteria::Equals(value) => {
                sql::compare(column_expr, CompareOp::Eq, &sql::value_literal(value))
            }
        }
    }

    /// The value matched when this is a plain equality test
    ///
    /// Only these criteria can be answered by a GROUP BY cache table.
    pub fn equality_value(&self) -> Option<Value> {
        match self {
            Criteria::Equals(v) | Criteria::Compare(CompareOp::Eq, v) => {
                let v = v.trim();
                Some(match sql::parse_number(v) {
                    Some(n) => Value::Number(n),
                    None => Value::Text(v.to_string()),
                })
            }
            _ => None,
        }
    }
}

/// Compile `criteria` against `column_expr` in one step
pub fn criteria_predicate(column_expr: &str, criteria: &str) -> String {
    Criteria::parse(criteria).to_predicate(column_expr)
}

fn strip_quotes(text: &str) -> String {
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        text[1..text.len() - 1].replace("\"\"", "\"")
    } else if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
        text[1..text.len() - 1].to_string()
    } else {
        text.to_string()
    }
}
