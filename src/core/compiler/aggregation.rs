//! SUM/COUNT/COUNTA/AVERAGE/MIN/MAX and their IF/IFS variants

use super::{check_arity, common_table, source_for, FormulaCompiler, ResolvedRange};
use crate::core::formula::ParsedFormula;
use crate::core::sql::{self, Dialect};
use crate::error::{SheetError, SheetResult};
use crate::storage::ColumnResolver;

impl<'r, R: ColumnResolver + ?Sized> FormulaCompiler<'r, R> {
    /// Plain aggregates; a multi-column range contributes one aggregate per column
    pub(super) fn compile_aggregate(&self, sheet: &str, parsed: &ParsedFormula) -> SheetResult<String> {
        let function = parsed.function_name.as_str();
        check_arity(parsed, 1, None)?;

        let ranges = parsed
            .arguments
            .iter()
            .map(|arg| self.resolve_range(sheet, function, arg))
            .collect::<SheetResult<Vec<_>>>()?;
        let refs: Vec<&ResolvedRange> = ranges.iter().collect();
        let table = common_table(function, &refs)?;

        let columns: Vec<String> = ranges
            .iter()
            .flat_map(|r| r.columns.iter().map(move |c| r.column_expr(c)))
            .collect();
        let dialect = self.dialect();

        let per_column = |f: fn(Dialect, &str) -> String| -> Vec<String> {
            columns.iter().map(|c| f(dialect, c)).collect()
        };

        let expr = match function {
            "SUM" => per_column(sql::sum_numeric).join(" + "),
            "COUNT" => per_column(sql::count_numeric).join(" + "),
            "COUNTA" => per_column(|_, c| sql::count_nonblank(c)).join(" + "),
            "AVERAGE" if columns.len() == 1 => sql::avg_numeric(dialect, &columns[0]),
            "AVERAGE" => sql::safe_divide(
                &per_column(sql::sum_numeric).join(" + "),
                &per_column(sql::count_numeric).join(" + "),
            ),
            "MIN" => sql::coalesce_zero(&sql::least(&per_column(sql::min_numeric))),
            "MAX" => sql::coalesce_zero(&sql::greatest(&per_column(sql::max_numeric))),
            other => return Err(SheetError::UnsupportedFormula(other.to_string())),
        };

        Ok(sql::select(&expr, &source_for(&table, &refs), None))
    }

    /// SUMIF(S), COUNTIF(S), AVERAGEIF(S), MINIFS, MAXIFS
    ///
    /// The ...IFS forms take the aggregated range first, then criteria pairs.
    /// The ...IF forms take criteria range, criteria and an optional
    /// aggregated range that defaults to the criteria range.
    pub(super) fn compile_conditional(&self, sheet: &str, parsed: &ParsedFormula) -> SheetResult<String> {
        let function = parsed.function_name.as_str();
        let args = &parsed.arguments;

        // (aggregated argument index, criteria pair arguments)
        let (aggregated_index, pairs) = match function {
            "SUMIF" | "AVERAGEIF" => {
                check_arity(parsed, 2, Some(3))?;
                (if args.len() == 3 { Some(2) } else { Some(0) }, &args[..2])
            }
            "COUNTIF" => {
                check_arity(parsed, 2, Some(2))?;
                (None, &args[..])
            }
            "COUNTIFS" => {
                check_arity(parsed, 2, None)?;
                if args.len() % 2 != 0 {
                    return Err(SheetError::arity(function, "criteria range/criteria pairs", args.len()));
                }
                (None, &args[..])
            }
            _ => {
                check_arity(parsed, 3, None)?;
                if args.len() % 2 == 0 {
                    return Err(SheetError::arity(
                        function,
                        "an aggregated range followed by criteria range/criteria pairs",
                        args.len(),
                    ));
                }
                (Some(0), &args[1..])
            }
        };

        let aggregated = aggregated_index
            .map(|i| self.resolve_range(sheet, function, &args[i]))
            .transpose()?;

        let mut criteria_ranges = Vec::new();
        let mut criteria_args = Vec::new();
        for pair in pairs.chunks(2) {
            criteria_ranges.push(self.resolve_range(sheet, function, &pair[0])?);
            criteria_args.push(&pair[1]);
        }

        let mut refs: Vec<&ResolvedRange> = aggregated.iter().collect();
        refs.extend(criteria_ranges.iter());
        let table = common_table(function, &refs)?;

        let mut predicates = Vec::new();
        for range in &refs {
            if let Some(bounds) = range.bounds_predicate() {
                if !predicates.contains(&bounds) {
                    predicates.push(bounds);
                }
            }
        }
        for (range, arg) in criteria_ranges.iter().zip(criteria_args) {
            let column = sql::ident(range.first_column());
            predicates.push(self.criteria(sheet, function, &column, arg)?);
        }

        let dialect = self.dialect();
        let value = aggregated
            .as_ref()
            .map(|r| sql::ident(r.first_column()))
            .unwrap_or_default();

        let expr = match function {
            "SUMIF" | "SUMIFS" => sql::sum_numeric(dialect, &value),
            "COUNTIF" | "COUNTIFS" => "COUNT(*)".to_string(),
            "AVERAGEIF" | "AVERAGEIFS" => sql::avg_numeric(dialect, &value),
            "MINIFS" => sql::coalesce_zero(&sql::min_numeric(dialect, &value)),
            "MAXIFS" => sql::coalesce_zero(&sql::max_numeric(dialect, &value)),
            other => return Err(SheetError::UnsupportedFormula(other.to_string())),
        };

        let predicate = sql::and_all(&predicates);
        Ok(sql::select(&expr, &source_for(&table, &refs), predicate.as_deref()))
    }
}
