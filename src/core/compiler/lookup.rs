//! VLOOKUP, INDEX, MATCH and the minimal IF

use super::{check_arity, integer_literal, FormulaCompiler};
use crate::core::formula::{classify_argument, FormulaArg, ParsedFormula};
use crate::core::sql::{self, CompareOp, POSITION_COLUMN, ROW_NUMBER_COLUMN};
use crate::error::{SheetError, SheetResult};
use crate::storage::ColumnResolver;

/// MATCH search mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    /// `0`: first position equal to the lookup value
    Exact,
    /// `1`: largest value not above the lookup value; data sorted ascending
    Ascending,
    /// `-1`: smallest value not below the lookup value; data sorted descending
    Descending,
}

impl MatchType {
    /// Parse a literal match type argument; `None` means the default (1)
    pub fn from_arg(arg: Option<&FormulaArg>) -> SheetResult<Self> {
        let Some(arg) = arg else {
            return Ok(MatchType::Ascending);
        };
        match integer_literal(arg) {
            Some(0) => Ok(MatchType::Exact),
            Some(1) => Ok(MatchType::Ascending),
            Some(-1) => Ok(MatchType::Descending),
            _ => Err(SheetError::InvalidMatchType(super::arg_text(arg))),
        }
    }
}

impl<'r, R: ColumnResolver + ?Sized> FormulaCompiler<'r, R> {
    /// VLOOKUP(value, table, col_index, [range_lookup])
    ///
    /// Approximate match assumes the key column is sorted ascending; the
    /// order is not checked.
    pub(super) fn compile_vlookup(&self, sheet: &str, parsed: &ParsedFormula) -> SheetResult<String> {
        let function = "VLOOKUP";
        check_arity(parsed, 3, Some(4))?;
        let args = &parsed.arguments;

        let value = self.scalar(sheet, function, &args[0])?;
        let range = self.resolve_range(sheet, function, &args[1])?;

        let col_index = integer_literal(&args[2])
            .filter(|n| *n >= 1)
            .ok_or_else(|| {
                SheetError::invalid_argument(
                    function,
                    format!("column index must be a positive integer, got '{}'", super::arg_text(&args[2])),
                )
            })?;
        let result = sql::ident(range.column_at(function, (col_index - 1) as usize)?);
        let key = sql::ident(range.first_column());

        let exact = match args.get(3) {
            Some(arg) => is_false_literal(arg),
            None => false,
        };

        let source = sql::row_numbered(&range.table);
        let rn = sql::ident(ROW_NUMBER_COLUMN);
        let mut predicates: Vec<String> = range.bounds_predicate().into_iter().collect();

        // Duplicate keys: exact takes the first row, approximate the last
        let order = if exact {
            predicates.push(sql::compare(&key, CompareOp::Eq, &value));
            rn
        } else {
            predicates.push(sql::compare(&key, CompareOp::Le, &value));
            format!("{} DESC, {} DESC", key, rn)
        };

        let predicate = sql::and_all(&predicates);
        Ok(format!(
            "{} ORDER BY {} LIMIT 1",
            sql::select(&result, &source, predicate.as_deref()),
            order
        ))
    }

    /// INDEX(range, row_num, [col_num])
    ///
    /// A literal row number becomes an OFFSET; a cell or nested formula row
    /// number is matched against the row-number column.
    pub(super) fn compile_index(&self, sheet: &str, parsed: &ParsedFormula) -> SheetResult<String> {
        let function = "INDEX";
        check_arity(parsed, 2, Some(3))?;
        let args = &parsed.arguments;

        let range = self.resolve_range(sheet, function, &args[0])?;

        let column_offset = match args.get(2) {
            None => 0,
            Some(arg) => integer_literal(arg)
                .filter(|n| *n >= 1)
                .map(|n| (n - 1) as usize)
                .ok_or_else(|| {
                    SheetError::invalid_argument(
                        function,
                        format!("column number must be a positive integer, got '{}'", super::arg_text(arg)),
                    )
                })?,
        };
        let column = sql::ident(range.column_at(function, column_offset)?);

        match &args[1] {
            FormulaArg::Literal(_) => {
                let row = integer_literal(&args[1]).filter(|n| *n >= 1).ok_or_else(|| {
                    SheetError::invalid_argument(
                        function,
                        format!("row number must be a positive integer, got '{}'", super::arg_text(&args[1])),
                    )
                })?;
                let offset = row_offset(function, range.bounds, row)?;
                Ok(sql::nth_row(&column, &range.table, offset))
            }
            row_arg => {
                let row = self.scalar(sheet, function, row_arg)?;
                let target = match range.bounds {
                    Some((start, _)) if start > 1 => format!("{} + {}", row, start - 1),
                    _ => row,
                };
                let mut predicates: Vec<String> = range.bounds_predicate().into_iter().collect();
                predicates.push(sql::compare(&sql::ident(ROW_NUMBER_COLUMN), CompareOp::Eq, &target));
                let predicate = sql::and_all(&predicates);
                Ok(sql::select(&column, &sql::row_numbered(&range.table), predicate.as_deref()))
            }
        }
    }

    /// MATCH(value, lookup_array, [match_type]); yields a 1-based position
    /// relative to the start of the lookup array
    pub(super) fn compile_match(&self, sheet: &str, parsed: &ParsedFormula) -> SheetResult<String> {
        let function = "MATCH";
        check_arity(parsed, 2, Some(3))?;
        let args = &parsed.arguments;

        let match_type = MatchType::from_arg(args.get(2))?;
        let value = self.scalar(sheet, function, &args[0])?;
        let range = self.resolve_range(sheet, function, &args[1])?;

        let column = sql::ident(range.first_column());
        let rn = sql::ident(ROW_NUMBER_COLUMN);
        let position = match range.bounds {
            Some((start, _)) if start > 1 => format!("{} - {}", rn, start - 1),
            _ => rn.clone(),
        };
        let select_list = format!("{} AS {}", position, sql::ident(POSITION_COLUMN));

        let mut predicates: Vec<String> = range.bounds_predicate().into_iter().collect();
        let order = match match_type {
            MatchType::Exact => {
                predicates.push(sql::compare(&column, CompareOp::Eq, &value));
                rn.clone()
            }
            MatchType::Ascending => {
                predicates.push(sql::compare(&column, CompareOp::Le, &value));
                format!("{} DESC, {} DESC", column, rn)
            }
            MatchType::Descending => {
                predicates.push(sql::compare(&column, CompareOp::Ge, &value));
                format!("{} ASC, {} DESC", column, rn)
            }
        };

        let predicate = sql::and_all(&predicates);
        Ok(format!(
            "{} ORDER BY {} LIMIT 1",
            sql::select(&select_list, &sql::row_numbered(&range.table), predicate.as_deref()),
            order
        ))
    }

    /// IF(condition, value_if_true, [value_if_false]); the false branch
    /// defaults to an empty string
    pub(super) fn compile_if(&self, sheet: &str, parsed: &ParsedFormula) -> SheetResult<String> {
        let function = "IF";
        check_arity(parsed, 2, Some(3))?;
        let args = &parsed.arguments;

        let condition = self.condition(sheet, &args[0])?;
        let when_true = self.scalar(sheet, function, &args[1])?;
        let when_false = match args.get(2) {
            Some(arg) => self.scalar(sheet, function, arg)?,
            None => sql::string_literal(""),
        };

        Ok(format!(
            "SELECT CASE WHEN {} THEN {} ELSE {} END",
            condition, when_true, when_false
        ))
    }

    /// Boolean expression for an IF condition
    fn condition(&self, sheet: &str, arg: &FormulaArg) -> SheetResult<String> {
        let function = "IF";
        let FormulaArg::Literal(text) = arg else {
            let value = self.scalar(sheet, function, arg)?;
            return Ok(format!("{} <> 0", value));
        };

        if let Some((lhs, op, rhs)) = split_comparison(text) {
            let lhs = self.scalar(sheet, function, &classify_argument(lhs.trim().to_string()))?;
            let rhs = self.scalar(sheet, function, &classify_argument(rhs.trim().to_string()))?;
            return Ok(sql::compare(&lhs, op, &rhs));
        }

        match text.trim().to_ascii_uppercase().as_str() {
            "TRUE" => Ok("TRUE".to_string()),
            "FALSE" => Ok("FALSE".to_string()),
            _ if sql::parse_number(text).is_some() => Ok(format!("{} <> 0", text.trim())),
            _ => Err(SheetError::invalid_argument(
                function,
                format!("condition '{}' is not a comparison", text),
            )),
        }
    }
}

/// 0-based storage offset of the 1-based `row` of a range; rows past the
/// end of a bounded range are rejected
fn row_offset(function: &str, bounds: Option<(u32, u32)>, row: i64) -> SheetResult<u64> {
    let outside = || SheetError::invalid_argument(function, format!("row number {} is outside the range", row));
    let first_row = match bounds {
        Some((start, end)) => {
            if row > i64::from(end) - i64::from(start) + 1 {
                return Err(outside());
            }
            start
        }
        None => 1,
    };
    i64::from(first_row)
        .checked_add(row)
        .and_then(|n| n.checked_sub(2))
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(outside)
}

fn is_false_literal(arg: &FormulaArg) -> bool {
    match arg.as_literal().map(|t| t.trim().to_ascii_uppercase()) {
        Some(t) => t == "FALSE" || sql::parse_number(&t) == Some(0.0),
        None => false,
    }
}

/// Split `text` on its first comparison operator outside quotes and parentheses
fn split_comparison(text: &str) -> Option<(&str, CompareOp, &str)> {
    let mut depth = 0usize;
    let mut in_string = false;

    for (i, c) in text.char_indices() {
        match c {
            '"' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => depth = depth.saturating_sub(1),
            '<' | '>' | '=' if !in_string && depth == 0 => {
                let (op, rest) = CompareOp::strip_prefix(&text[i..])?;
                let lhs = &text[..i];
                if lhs.trim().is_empty() {
                    return None;
                }
                return Some((lhs, op, rest));
            }
            _ => {}
        }
    }
    None
}
