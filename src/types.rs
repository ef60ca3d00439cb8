use serde::{Deserialize, Serialize};
use std::fmt;

//==============================================================================
// Cell Values
//==============================================================================

/// A single cell value as stored by, and read back from, the storage layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Empty cell or SQL NULL
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value, coercing numeric text the way TRY_CAST does
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            Value::Null => None,
        }
    }

    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Boolean",
            Value::Number(_) => "Number",
            Value::Text(_) => "Text",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// Format a number for display, dropping the fraction when it is integral
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// One result row, in select-list order
pub type Row = Vec<Value>;

//==============================================================================
// Compiled Queries
//==============================================================================

/// Query text produced for one formula
///
/// Two compilations of the same formula against the same column mapping
/// produce byte-identical `query_text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledQuery {
    pub query_text: String,
    /// Upper-cased function name the query was compiled from (SUMIFS, MATCH, ...)
    pub source_function: String,
    /// Names of positional parameters; empty because values are inlined
    pub param_names: Vec<String>,
}

impl CompiledQuery {
    pub fn new(query_text: String, source_function: &str) -> Self {
        Self {
            query_text,
            source_function: source_function.to_string(),
            param_names: Vec::new(),
        }
    }
}
