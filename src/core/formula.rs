//! Formula text to [`ParsedFormula`]
//!
//! Only the `NAME(arg, arg, ...)` shape is recognized. Arguments are split on
//! top-level commas and classified, in order, as nested function, range,
//! single cell, number, quoted string, or plain literal. Double-quoted string
//! literals are opaque to both nesting and splitting, so `"a,b"` and `"(x"`
//! stay inside one argument.

use super::reference::{parse_cell, parse_range, RangeRef};
use once_cell::sync::Lazy;
use regex::Regex;

static FUNCTION_HEAD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z0-9_.]*)\s*\(").expect("function head pattern is valid")
});

/// Every function name the parser marks as supported
pub const SUPPORTED_FUNCTIONS: &[&str] = &[
    // Aggregation
    "SUM", "SUMIF", "SUMIFS", "COUNT", "COUNTA", "COUNTIF", "COUNTIFS", "AVERAGE", "AVERAGEIF",
    "AVERAGEIFS", "MIN", "MINIFS", "MAX", "MAXIFS",
    // Lookup
    "VLOOKUP", "HLOOKUP", "INDEX", "MATCH", "XLOOKUP", "LOOKUP",
    // Math
    "ABS", "ROUND", "ROUNDUP", "ROUNDDOWN", "CEILING", "FLOOR", "MOD", "POWER", "SQRT", "LN",
    "LOG", "LOG10", "EXP",
    // Text
    "LEN", "LEFT", "RIGHT", "MID", "UPPER", "LOWER", "TRIM", "CONCAT", "CONCATENATE", "TEXT",
    "VALUE", "SUBSTITUTE", "REPLACE",
    // Conditional
    "IF", "IFS", "IFERROR", "IFNA",
    // Logical
    "AND", "OR", "NOT",
];

/// One argument of a function call
#[derive(Debug, Clone, PartialEq)]
pub enum FormulaArg {
    /// Number, quoted string (quotes kept), or unclassified text
    Literal(String),
    /// Single-cell reference text such as `B2` or `Data!$B$2`
    CellRef(String),
    RangeRef(RangeRef),
    NestedFormula(Box<ParsedFormula>),
}

impl FormulaArg {
    pub fn as_range(&self) -> Option<&RangeRef> {
        match self {
            FormulaArg::RangeRef(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&str> {
        match self {
            FormulaArg::Literal(s) => Some(s),
            _ => None,
        }
    }
}

/// A formula broken into function name and classified arguments
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFormula {
    /// Upper-cased; empty when the text is not a function call
    pub function_name: String,
    pub arguments: Vec<FormulaArg>,
    /// Formula text without the leading `=`
    pub raw_text: String,
    /// Function is on the allow-list and the call spans the whole text
    pub is_supported: bool,
}

/// Whether `name` is on the allow-list
pub fn is_supported_function(name: &str) -> bool {
    SUPPORTED_FUNCTIONS.contains(&name)
}

/// Parse formula text, with or without a leading `=`
pub fn parse(text: &str) -> ParsedFormula {
    let trimmed = text.trim();
    let body = trimmed.strip_prefix('=').unwrap_or(trimmed).trim();

    let Some(caps) = FUNCTION_HEAD_RE.captures(body) else {
        return ParsedFormula {
            function_name: String::new(),
            arguments: Vec::new(),
            raw_text: body.to_string(),
            is_supported: false,
        };
    };

    let function_name = caps[1].to_ascii_uppercase();
    let open = caps[0].len() - 1;
    let (interior, spans_whole) = match find_closing_paren(body, open) {
        Some(close) => (&body[open + 1..close], body[close + 1..].trim().is_empty()),
        None => (&body[open + 1..], false),
    };

    let arguments = split_arguments(interior)
        .into_iter()
        .map(classify_argument)
        .collect();

    ParsedFormula {
        is_supported: spans_whole && is_supported_function(&function_name),
        function_name,
        arguments,
        raw_text: body.to_string(),
    }
}

/// Byte index of the parenthesis closing the one at `open`
fn find_closing_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    for (i, c) in text.char_indices().skip_while(|(i, _)| *i < open) {
        match c {
            '"' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas that sit outside parentheses and string literals
pub(crate) fn split_arguments(interior: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_string = false;

    for c in interior.chars() {
        match c {
            '"' => {
                in_string = !in_string;
                current.push(c);
            }
            '(' if !in_string => {
                depth += 1;
                current.push(c);
            }
            ')' if !in_string => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if !in_string && depth == 0 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }

    if !current.trim().is_empty() {
        args.push(current.trim().to_string());
    }

    args
}

/// Classify one argument; anything unrecognized degrades to a literal
pub fn classify_argument(arg: String) -> FormulaArg {
    if arg.is_empty() {
        return FormulaArg::Literal(arg);
    }

    if let Some(caps) = FUNCTION_HEAD_RE.captures(&arg) {
        let open = caps[0].len() - 1;
        if find_closing_paren(&arg, open) == Some(arg.len() - 1) {
            return FormulaArg::NestedFormula(Box::new(parse(&arg)));
        }
    }

    if let Some(range) = parse_range(&arg) {
        return FormulaArg::RangeRef(range);
    }

    if parse_cell(&arg).is_some() {
        return FormulaArg::CellRef(arg);
    }

    // Numbers, quoted strings and unclassified text all stay literal; the
    // compiler interprets them in context.
    FormulaArg::Literal(arg)
}

pub(crate) fn is_quoted(text: &str) -> bool {
    text.len() >= 2 && text.starts_with('"') && text.ends_with('"')
}

/// Strip one layer of double quotes and undo Excel's `""` escaping
pub fn unquote(text: &str) -> String {
    let t = text.trim();
    if is_quoted(t) {
        t[1..t.len() - 1].replace("\"\"", "\"")
    } else {
        t.to_string()
    }
}
