use crate::cache::{
    fingerprint, pattern_of, AggregateKind, CacheManager, CacheStats, CriteriaValues, MemoStats,
    ResultMemo,
};
use crate::core::compiler::FormulaCompiler;
use crate::core::criteria::Criteria;
use crate::core::formula::{self, is_quoted, unquote, FormulaArg, ParsedFormula};
use crate::core::reference::{column_index_to_letter, column_letter_to_index};
use crate::core::sql;
use crate::error::SheetResult;
use crate::storage::Backend;
use crate::types::{CompiledQuery, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Calculator settings; also the `config:` section of a workbook file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculatorConfig {
    /// Observe and optimize every batch before evaluating it
    pub auto_optimize: bool,
    /// Minimum occurrences before a shape is materialized
    pub optimize_threshold: usize,
    /// Memoize results per (sheet, cell, formula)
    pub enable_result_cache: bool,
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            auto_optimize: true,
            optimize_threshold: 10,
            enable_result_cache: true,
        }
    }
}

/// Results of [`Calculator::calc_cells`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub values: BTreeMap<String, Value>,
    /// Cell → error message for cells that could not be evaluated
    pub errors: BTreeMap<String, String>,
    /// Cells answered from materialized caches
    pub cache_served: usize,
    /// Cells answered from the result memo
    pub memo_served: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculatorStats {
    pub optimization: CacheStats,
    pub result_cache: MemoStats,
}

/// How a formula can be answered from a materialized cache
#[derive(Debug, Clone, PartialEq)]
enum CachePlan {
    /// Equality-criteria ...IF/...IFS over whole columns
    Aggregate {
        sheet: String,
        aggregated_column: String,
        kind: AggregateKind,
        criteria: CriteriaValues,
    },
    /// Exact MATCH
    Position { sheet: String, column: String, value: Value },
    /// Exact VLOOKUP: position of `value` in `column`, then read `result_column`
    Fetch {
        sheet: String,
        column: String,
        value: Value,
        result_column: String,
    },
}

/// Compiles and evaluates formulas, preferring caches and the result memo
pub struct Calculator {
    backend: Arc<dyn Backend>,
    cache: CacheManager,
    memo: ResultMemo<Value>,
    config: CalculatorConfig,
}

impl Calculator {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: CalculatorConfig) -> Self {
        Self {
            cache: CacheManager::new(Arc::clone(&backend)),
            backend,
            memo: ResultMemo::new(),
            config,
        }
    }

    pub fn config(&self) -> &CalculatorConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn compiler(&self) -> FormulaCompiler<'_, dyn Backend> {
        FormulaCompiler::new(self.backend.as_ref())
    }

    pub fn is_sheet_loaded(&self, sheet: &str) -> bool {
        self.backend.resolve_table(sheet).is_some()
    }

    pub fn is_supported(&self, formula: &str) -> bool {
        formula::parse(formula).is_supported
    }

    pub fn compile(&self, sheet: &str, formula: &str) -> SheetResult<CompiledQuery> {
        self.compiler().compile(sheet, formula)
    }

    /// Evaluate one formula on `sheet`; a query returning no rows is an empty value
    pub fn calc_cell(&self, sheet: &str, cell: &str, formula: &str) -> SheetResult<Value> {
        let key = fingerprint(sheet, cell, formula);
        if self.config.enable_result_cache {
            if let Some(value) = self.memo.get(&key) {
                return Ok(value);
            }
        }

        let parsed = formula::parse(formula);
        let value = match self.serve_from_cache(sheet, &parsed) {
            Some(value) => value,
            None => self.evaluate_direct(sheet, &parsed)?,
        };

        if self.config.enable_result_cache {
            self.memo.insert(key, value.clone());
        }
        Ok(value)
    }

    /// Evaluate a batch of `cell → formula` on `sheet`
    ///
    /// Memo hits are served first. With `auto_optimize` the remaining
    /// formulas are observed and optimized, then equality-criteria
    /// aggregations sharing a cache are answered by one batch lookup per
    /// group. Everything else is compiled and executed per cell. Errors are
    /// collected per cell.
    pub fn calc_cells(&self, sheet: &str, formulas: &BTreeMap<String, String>) -> BatchReport {
        let mut report = BatchReport::default();

        let mut pending = BTreeMap::new();
        for (cell, formula) in formulas {
            let cached = if self.config.enable_result_cache {
                self.memo.get(&fingerprint(sheet, cell, formula))
            } else {
                None
            };
            match cached {
                Some(value) => {
                    report.values.insert(cell.clone(), value);
                    report.memo_served += 1;
                }
                None => {
                    pending.insert(cell.clone(), formula.clone());
                }
            }
        }

        if self.config.auto_optimize && !pending.is_empty() {
            self.cache.observe(sheet, &pending);
            self.cache.optimize(self.config.optimize_threshold);
        }

        type GroupKey = (String, String, AggregateKind, Vec<String>);
        let mut groups: BTreeMap<GroupKey, Vec<(String, CriteriaValues)>> = BTreeMap::new();
        let mut direct: Vec<(String, ParsedFormula)> = Vec::new();

        for (cell, text) in &pending {
            let parsed = formula::parse(text);
            match cache_plan(sheet, &parsed) {
                Some(CachePlan::Aggregate {
                    sheet: target,
                    aggregated_column,
                    kind,
                    criteria,
                }) if self.aggregate_ready(&target, &aggregated_column, kind, &criteria) => {
                    let letters = criteria.keys().cloned().collect();
                    groups
                        .entry((target, aggregated_column, kind, letters))
                        .or_default()
                        .push((cell.clone(), criteria));
                }
                Some(plan @ (CachePlan::Position { .. } | CachePlan::Fetch { .. })) => {
                    match self.serve_plan(&plan) {
                        Some(value) => {
                            report.cache_served += 1;
                            self.record(&mut report, sheet, cell, text, value);
                        }
                        None => direct.push((cell.clone(), parsed)),
                    }
                }
                _ => direct.push((cell.clone(), parsed)),
            }
        }

        for ((target, column, kind, _), members) in groups {
            let criteria_list: Vec<CriteriaValues> = members.iter().map(|(_, c)| c.clone()).collect();
            match self
                .cache
                .batch_lookup_optional(&target, &column, &criteria_list, kind)
            {
                Ok(results) => {
                    debug!(sheet = %target, column = %column, %kind, cells = members.len(), "batch lookup");
                    for ((cell, _), result) in members.iter().zip(results) {
                        report.cache_served += 1;
                        let text = &pending[cell];
                        self.record(&mut report, sheet, cell, text, aggregate_value(kind, result));
                    }
                }
                Err(e) => {
                    warn!(sheet = %target, column = %column, error = %e, "batch lookup failed, evaluating directly");
                    for (cell, _) in members {
                        let parsed = formula::parse(&pending[&cell]);
                        direct.push((cell, parsed));
                    }
                }
            }
        }

        for (cell, parsed) in direct {
            match self.evaluate_direct(sheet, &parsed) {
                Ok(value) => {
                    let text = &pending[&cell];
                    self.record(&mut report, sheet, &cell, text, value);
                }
                Err(e) => {
                    report.errors.insert(cell, e.to_string());
                }
            }
        }

        debug!(
            sheet,
            cells = formulas.len(),
            memo = report.memo_served,
            cached = report.cache_served,
            errors = report.errors.len(),
            "batch evaluated"
        );
        report
    }

    /// Forget caches and memoized results that depend on `sheet`
    ///
    /// Reloading a sheet replaces its table; call this afterwards so no
    /// lookup reads a derived table built from the old rows.
    pub fn invalidate_sheet(&self, sheet: &str) {
        self.cache.invalidate_sheet(sheet);
        self.memo.clear();
    }

    /// Drop memoized results and forget all patterns and caches
    pub fn clear_cache(&self) {
        self.memo.clear();
        self.cache.clear();
        debug!("calculator caches cleared");
    }

    pub fn stats(&self) -> CalculatorStats {
        CalculatorStats {
            optimization: self.cache.stats(),
            result_cache: self.memo.stats(),
        }
    }

    fn record(&self, report: &mut BatchReport, sheet: &str, cell: &str, formula: &str, value: Value) {
        if self.config.enable_result_cache {
            self.memo.insert(fingerprint(sheet, cell, formula), value.clone());
        }
        report.values.insert(cell.to_string(), value);
    }

    fn evaluate_direct(&self, sheet: &str, parsed: &ParsedFormula) -> SheetResult<Value> {
        let query = self.compiler().compile_parsed(sheet, parsed)?;
        let row = self.backend.execute_scalar(&query.query_text)?;
        Ok(row.and_then(|r| r.into_iter().next()).unwrap_or(Value::Null))
    }

    /// Answer from a cache when one exists for this formula's shape
    fn serve_from_cache(&self, sheet: &str, parsed: &ParsedFormula) -> Option<Value> {
        let plan = cache_plan(sheet, parsed)?;
        if let CachePlan::Aggregate {
            sheet,
            aggregated_column,
            kind,
            criteria,
        } = &plan
        {
            if !self.aggregate_ready(sheet, aggregated_column, *kind, criteria) {
                return None;
            }
        }
        self.serve_plan(&plan)
    }

    fn aggregate_ready(&self, sheet: &str, column: &str, kind: AggregateKind, criteria: &CriteriaValues) -> bool {
        self.cache.aggregation(sheet, column).is_some_and(|cache| {
            cache.supports(kind) && criteria.keys().all(|letter| cache.group_columns.contains(letter))
        })
    }

    /// `None` when the needed cache is missing or the cache query fails
    fn serve_plan(&self, plan: &CachePlan) -> Option<Value> {
        let result = match plan {
            CachePlan::Aggregate {
                sheet,
                aggregated_column,
                kind,
                criteria,
            } => self
                .cache
                .lookup_optional(sheet, aggregated_column, criteria, *kind)
                .map(|v| Some(aggregate_value(*kind, v))),
            CachePlan::Position { sheet, column, value } => {
                self.cache.lookup_index(sheet, column)?;
                self.cache
                    .match_position(sheet, column, value)
                    .map(|p| Some(p.map_or(Value::Null, |p| Value::Number(p as f64))))
            }
            CachePlan::Fetch {
                sheet,
                column,
                value,
                result_column,
            } => {
                let index = self.cache.lookup_index(sheet, column)?;
                let physical = self.backend.resolve_column(sheet, result_column)?;
                self.cache.match_position(sheet, column, value).and_then(|position| {
                    let Some(position) = position else {
                        return Ok(Some(Value::Null));
                    };
                    let query = format!(
                        "SELECT {}",
                        sql::cell_value(&index.source_table, &physical, position as u32)
                    );
                    let row = self.backend.execute_scalar(&query)?;
                    Ok(Some(row.and_then(|r| r.into_iter().next()).unwrap_or(Value::Null)))
                })
            }
        };

        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "cache lookup failed, evaluating directly");
                None
            }
        }
    }
}

/// Raw ...IF(S) semantics for a cache result: no data is 0 for sums and
/// counts, empty for averages
fn aggregate_value(kind: AggregateKind, result: Option<f64>) -> Value {
    match (kind, result) {
        (_, Some(v)) => Value::Number(v),
        (AggregateKind::Average, None) => Value::Null,
        (_, None) => Value::Number(0.0),
    }
}

/// Literal argument as a typed value; cells, ranges and nested calls are `None`
fn literal_value(arg: &FormulaArg) -> Option<Value> {
    let text = arg.as_literal()?.trim();
    if let Some(n) = sql::parse_number(text) {
        return Some(Value::Number(n));
    }
    if is_quoted(text) {
        return Some(Value::Text(unquote(text)));
    }
    match text.to_ascii_uppercase().as_str() {
        "TRUE" => Some(Value::Bool(true)),
        "FALSE" => Some(Value::Bool(false)),
        _ => None,
    }
}

/// Indices of the criteria arguments of a conditional aggregation
fn criteria_arg_indices(function: &str, len: usize) -> Vec<usize> {
    match function {
        "COUNTIFS" => (1..len).step_by(2).collect(),
        "SUMIFS" | "AVERAGEIFS" => (2..len).step_by(2).collect(),
        _ => vec![1],
    }
}

fn cache_plan(home: &str, parsed: &ParsedFormula) -> Option<CachePlan> {
    if !parsed.is_supported {
        return None;
    }
    let pattern = pattern_of(home, parsed)?;
    let args = &parsed.arguments;

    match parsed.function_name.as_str() {
        "MATCH" => {
            (literal_value(args.get(2)?)? == Value::Number(0.0)).then_some(())?;
            Some(CachePlan::Position {
                sheet: pattern.sheet,
                column: pattern.aggregated_column,
                value: literal_value(&args[0])?,
            })
        }
        "VLOOKUP" => {
            let flag = literal_value(args.get(3)?)?;
            if flag != Value::Bool(false) && flag != Value::Number(0.0) {
                return None;
            }
            let range = args[1].as_range()?;
            let offset = match literal_value(&args[2])? {
                Value::Number(n) if n >= 1.0 && n.fract() == 0.0 => n as usize - 1,
                _ => return None,
            };
            let start = column_letter_to_index(&range.start_col)?;
            let end = column_letter_to_index(&range.end_col)?;
            if start + offset > end {
                return None;
            }
            Some(CachePlan::Fetch {
                sheet: pattern.sheet,
                column: pattern.aggregated_column,
                value: literal_value(&args[0])?,
                result_column: column_index_to_letter(start + offset),
            })
        }
        function => {
            let kind = AggregateKind::for_function(function)?;
            let indices = criteria_arg_indices(function, args.len());
            if indices.len() != pattern.criteria_columns.len() {
                return None;
            }

            let mut criteria = CriteriaValues::new();
            for (letter, index) in pattern.criteria_columns.iter().zip(indices) {
                let text = args.get(index)?.as_literal()?;
                let value = Criteria::parse(text).equality_value()?;
                if let Some(previous) = criteria.insert(letter.clone(), value.clone()) {
                    if previous != value {
                        return None;
                    }
                }
            }

            Some(CachePlan::Aggregate {
                sheet: pattern.sheet,
                aggregated_column: pattern.aggregated_column,
                kind,
                criteria,
            })
        }
    }
}
