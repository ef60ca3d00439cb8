//! Formula compiler: [`ParsedFormula`] to [`CompiledQuery`]
//!
//! Dispatches on function family. Aggregations live in `aggregation.rs`,
//! VLOOKUP/INDEX/MATCH and IF in `lookup.rs`; this module holds argument
//! resolution shared by both.

mod aggregation;
mod lookup;

pub use lookup::MatchType;

use super::criteria::criteria_predicate;
use super::formula::{self, unquote, FormulaArg, ParsedFormula};
use super::reference::{column_index_to_letter, column_letter_to_index, parse_cell, RangeRef};
use super::sql::{self, CompareOp, Dialect, ROW_NUMBER_COLUMN};
use crate::error::{SheetError, SheetResult};
use crate::storage::ColumnResolver;
use crate::types::CompiledQuery;

/// Compiles formulas against the sheets known to a [`ColumnResolver`]
///
/// Holds nothing but the resolver reference, so compiling is a pure function
/// of formula text and the resolver's current mapping.
pub struct FormulaCompiler<'r, R: ColumnResolver + ?Sized> {
    resolver: &'r R,
}

impl<'r, R: ColumnResolver + ?Sized> FormulaCompiler<'r, R> {
    pub fn new(resolver: &'r R) -> Self {
        Self { resolver }
    }

    pub fn parse(&self, text: &str) -> ParsedFormula {
        formula::parse(text)
    }

    /// Whether the function is on the allow-list
    pub fn is_supported(&self, text: &str) -> bool {
        formula::parse(text).is_supported
    }

    /// Compile `text`, evaluated on `sheet`, into query text
    pub fn compile(&self, sheet: &str, text: &str) -> SheetResult<CompiledQuery> {
        let parsed = formula::parse(text);
        if !parsed.is_supported {
            return Err(SheetError::UnsupportedFormula(parsed.raw_text));
        }
        self.compile_parsed(sheet, &parsed)
    }

    /// Compile an already parsed formula
    pub fn compile_parsed(&self, sheet: &str, parsed: &ParsedFormula) -> SheetResult<CompiledQuery> {
        if !parsed.is_supported {
            return Err(SheetError::UnsupportedFormula(parsed.raw_text.clone()));
        }

        let name = parsed.function_name.as_str();
        let query_text = match name {
            "SUM" | "COUNT" | "COUNTA" | "AVERAGE" | "MIN" | "MAX" => {
                self.compile_aggregate(sheet, parsed)?
            }
            "SUMIF" | "SUMIFS" | "COUNTIF" | "COUNTIFS" | "AVERAGEIF" | "AVERAGEIFS"
            | "MINIFS" | "MAXIFS" => self.compile_conditional(sheet, parsed)?,
            "VLOOKUP" => self.compile_vlookup(sheet, parsed)?,
            "INDEX" => self.compile_index(sheet, parsed)?,
            "MATCH" => self.compile_match(sheet, parsed)?,
            "IF" => self.compile_if(sheet, parsed)?,
            other => {
                return Err(SheetError::UnsupportedFormula(format!(
                    "{} is recognized but not translated to a query",
                    other
                )))
            }
        };

        Ok(CompiledQuery::new(query_text, name))
    }

    fn dialect(&self) -> Dialect {
        self.resolver.dialect()
    }

    //==========================================================================
    // Reference resolution
    //==========================================================================

    fn table_for(&self, sheet: &str) -> SheetResult<String> {
        self.resolver
            .resolve_table(sheet)
            .ok_or_else(|| SheetError::SheetNotLoaded(sheet.to_string()))
    }

    fn column_for(&self, sheet: &str, letter: &str) -> SheetResult<String> {
        self.resolver
            .resolve_column(sheet, letter)
            .ok_or_else(|| SheetError::ColumnNotFound {
                sheet: sheet.to_string(),
                column: letter.to_string(),
            })
    }

    /// Resolve a range argument to its table and physical columns
    fn resolve_range(&self, home: &str, function: &str, arg: &FormulaArg) -> SheetResult<ResolvedRange> {
        let range = range_arg(function, arg)?;
        let sheet = range.target_sheet(home).to_string();
        let table = self.table_for(&sheet)?;
        let start_index = column_letter_to_index(&range.start_col)
            .ok_or_else(|| SheetError::InvalidRangeReference(range.start_col.clone()))?;
        let columns = range
            .columns()
            .iter()
            .map(|letter| self.column_for(&sheet, letter))
            .collect::<SheetResult<Vec<_>>>()?;

        Ok(ResolvedRange {
            sheet,
            table,
            columns,
            start_index,
            bounds: range.row_bounds(),
        })
    }

    //==========================================================================
    // Scalar and criteria operands
    //==========================================================================

    /// Compile an argument that must produce one value
    fn scalar(&self, home: &str, function: &str, arg: &FormulaArg) -> SheetResult<String> {
        match arg {
            FormulaArg::Literal(text) => Ok(literal_scalar(text)),
            FormulaArg::CellRef(text) => {
                let cell = parse_cell(text)
                    .ok_or_else(|| SheetError::InvalidRangeReference(text.clone()))?;
                let sheet = cell.target_sheet(home);
                let table = self.table_for(sheet)?;
                let column = self.column_for(sheet, &cell.column)?;
                Ok(sql::cell_value(&table, &column, cell.row))
            }
            FormulaArg::RangeRef(_) => Err(SheetError::InvalidRangeReference(format!(
                "{}: expected a single value, got range '{}'",
                function,
                arg_text(arg)
            ))),
            FormulaArg::NestedFormula(inner) => {
                let compiled = self.compile_parsed(home, inner)?;
                Ok(format!("({})", compiled.query_text))
            }
        }
    }

    /// Predicate for one criteria argument against `column_expr`
    fn criteria(&self, home: &str, function: &str, column_expr: &str, arg: &FormulaArg) -> SheetResult<String> {
        match arg {
            FormulaArg::Literal(text) => Ok(criteria_predicate(column_expr, text)),
            FormulaArg::CellRef(_) | FormulaArg::NestedFormula(_) => {
                let value = self.scalar(home, function, arg)?;
                Ok(sql::compare(column_expr, CompareOp::Eq, &value))
            }
            FormulaArg::RangeRef(_) => Err(SheetError::InvalidRangeReference(format!(
                "{}: criteria must be a value, got range '{}'",
                function,
                arg_text(arg)
            ))),
        }
    }
}

/// A range argument resolved against the storage layer
#[derive(Debug, Clone)]
struct ResolvedRange {
    sheet: String,
    table: String,
    /// Physical columns, left to right
    columns: Vec<String>,
    /// 0-based index of the first column letter
    start_index: usize,
    bounds: Option<(u32, u32)>,
}

impl ResolvedRange {
    fn first_column(&self) -> &str {
        &self.columns[0]
    }

    /// Column expression, NULL outside the row bounds
    fn column_expr(&self, column: &str) -> String {
        match self.bounds {
            Some((start, end)) => sql::when(
                &sql::between(&sql::ident(ROW_NUMBER_COLUMN), start, end),
                &sql::ident(column),
            ),
            None => sql::ident(column),
        }
    }

    fn bounds_predicate(&self) -> Option<String> {
        self.bounds
            .map(|(start, end)| sql::between(&sql::ident(ROW_NUMBER_COLUMN), start, end))
    }

    /// Physical column `offset` columns right of the first (0-based)
    fn column_at(&self, function: &str, offset: usize) -> SheetResult<&str> {
        self.columns.get(offset).map(String::as_str).ok_or_else(|| {
            SheetError::invalid_argument(
                function,
                format!(
                    "column {} is outside the range starting at {}",
                    column_index_to_letter(self.start_index + offset),
                    column_index_to_letter(self.start_index)
                ),
            )
        })
    }
}

/// The single table shared by every range of one formula
fn common_table(function: &str, ranges: &[&ResolvedRange]) -> SheetResult<String> {
    let first = &ranges[0];
    match ranges.iter().find(|r| r.table != first.table) {
        Some(other) => Err(SheetError::InvalidRangeReference(format!(
            "{}: ranges span sheets '{}' and '{}'",
            function, first.sheet, other.sheet
        ))),
        None => Ok(first.table.clone()),
    }
}

/// Source clause: the raw table, or a row-numbered view when any range is bounded
fn source_for(table: &str, ranges: &[&ResolvedRange]) -> String {
    if ranges.iter().any(|r| r.bounds.is_some()) {
        sql::row_numbered(table)
    } else {
        sql::ident(table)
    }
}

fn range_arg(function: &str, arg: &FormulaArg) -> SheetResult<RangeRef> {
    match arg {
        FormulaArg::RangeRef(range) => Ok(range.clone()),
        FormulaArg::CellRef(text) => parse_cell(text)
            .map(|cell| RangeRef::from_cell(&cell))
            .ok_or_else(|| SheetError::InvalidRangeReference(text.clone())),
        _ => Err(SheetError::InvalidRangeReference(format!(
            "{}: expected a range, got '{}'",
            function,
            arg_text(arg)
        ))),
    }
}

fn check_arity(parsed: &ParsedFormula, min: usize, max: Option<usize>) -> SheetResult<()> {
    let actual = parsed.arguments.len();
    let ok = actual >= min && max.map_or(true, |m| actual <= m);
    if ok {
        return Ok(());
    }
    let expected = match max {
        Some(m) if m == min => format!("exactly {}", min),
        Some(m) => format!("{} to {}", min, m),
        None => format!("at least {}", min),
    };
    Err(SheetError::arity(&parsed.function_name, expected, actual))
}

/// Integer literal argument, `None` if the argument is not a literal integer
fn integer_literal(arg: &FormulaArg) -> Option<i64> {
    let n = sql::parse_number(&unquote(arg.as_literal()?))?;
    (n.fract() == 0.0).then_some(n as i64)
}

fn literal_scalar(text: &str) -> String {
    let t = text.trim();
    if t.is_empty() {
        return sql::string_literal("");
    }
    if sql::parse_number(t).is_some() {
        return t.to_string();
    }
    if formula::is_quoted(t) {
        return sql::string_literal(&unquote(t));
    }
    match t.to_ascii_uppercase().as_str() {
        "TRUE" => "TRUE".to_string(),
        "FALSE" => "FALSE".to_string(),
        _ => sql::string_literal(t),
    }
}

fn arg_text(arg: &FormulaArg) -> String {
    match arg {
        FormulaArg::Literal(text) | FormulaArg::CellRef(text) => text.clone(),
        FormulaArg::RangeRef(range) => {
            let prefix = range
                .sheet
                .as_ref()
                .map(|s| format!("{}!", s))
                .unwrap_or_default();
            match range.row_bounds() {
                Some((start, end)) => format!(
                    "{}{}{}:{}{}",
                    prefix, range.start_col, start, range.end_col, end
                ),
                None => format!("{}{}:{}", prefix, range.start_col, range.end_col),
            }
        }
        FormulaArg::NestedFormula(inner) => inner.raw_text.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ColumnMap;
    use pretty_assertions::assert_eq;

    fn resolver() -> ColumnMap {
        ColumnMap::new(Dialect::Analytical)
            .with_sheet("Sales", "sales", &["value", "category", "region"])
            .with_sheet("Rates", "rates", &["code", "rate"])
    }

    #[test]
    fn test_literal_scalar() {
        assert_eq!(literal_scalar("42"), "42");
        assert_eq!(literal_scalar("\"it\"\"s\""), "'it\"s'");
        assert_eq!(literal_scalar("true"), "TRUE");
        assert_eq!(literal_scalar("East"), "'East'");
        assert_eq!(literal_scalar(""), "''");
    }

    #[test]
    fn test_cell_scalar_reads_one_row() {
        let map = resolver();
        let compiler = FormulaCompiler::new(&map);
        let arg = FormulaArg::CellRef("Rates!B3".to_string());
        assert_eq!(
            compiler.scalar("Sales", "IF", &arg).unwrap(),
            "(SELECT \"rate\" FROM \"rates\" ORDER BY rowid LIMIT 1 OFFSET 2)"
        );
    }

    #[test]
    fn test_unknown_sheet_and_column() {
        let map = resolver();
        let compiler = FormulaCompiler::new(&map);
        assert!(matches!(
            compiler.compile("Missing", "=SUM(A:A)"),
            Err(SheetError::SheetNotLoaded(s)) if s == "Missing"
        ));
        assert!(matches!(
            compiler.compile("Sales", "=SUM(Z:Z)"),
            Err(SheetError::ColumnNotFound { column, .. }) if column == "Z"
        ));
    }

    #[test]
    fn test_recognized_but_untranslated() {
        let map = resolver();
        let compiler = FormulaCompiler::new(&map);
        assert!(compiler.is_supported("=ROUND(A1, 2)"));
        assert!(matches!(
            compiler.compile("Sales", "=ROUND(A1, 2)"),
            Err(SheetError::UnsupportedFormula(_))
        ));
    }

    #[test]
    fn test_arity_message() {
        let map = resolver();
        let compiler = FormulaCompiler::new(&map);
        let err = compiler.compile("Sales", "=COUNTIF(B:B)").unwrap_err();
        assert_eq!(err.to_string(), "COUNTIF expects exactly 2, got 1 argument(s)");
    }
}
