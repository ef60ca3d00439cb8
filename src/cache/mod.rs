//! Pattern detection and the aggregation/lookup cache registry
//!
//! [`CacheManager::observe`] counts formula shapes across a batch without
//! touching storage. [`CacheManager::optimize`] materializes derived tables
//! for shapes seen often enough (see `builder.rs`), and the lookup service in
//! `lookup.rs` answers criteria tuples from those tables.

mod builder;
mod lookup;
mod memo;

pub use builder::{aggregation_table_name, match_index_table_name};
pub use lookup::CriteriaValues;
pub use memo::{fingerprint, MemoStats, ResultMemo};

use crate::core::formula::{self, FormulaArg, ParsedFormula};
use crate::core::reference::RangeRef;
use crate::error::{SheetError, SheetResult};
use crate::storage::Backend;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

//==============================================================================
// Patterns
//==============================================================================

/// Identity of a formula shape: (sheet, family, aggregated column, criteria columns)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PatternKey {
    pub sheet: String,
    pub function_family: String,
    pub aggregated_column: String,
    pub criteria_columns: Vec<String>,
}

impl PatternKey {
    pub fn new(sheet: &str, function_family: &str, aggregated_column: &str, criteria_columns: &[&str]) -> Self {
        Self {
            sheet: sheet.to_string(),
            function_family: function_family.to_ascii_uppercase(),
            aggregated_column: aggregated_column.to_ascii_uppercase(),
            criteria_columns: criteria_columns.iter().map(|c| c.to_ascii_uppercase()).collect(),
        }
    }
}

impl fmt::Display for PatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.sheet,
            self.function_family,
            self.aggregated_column,
            self.criteria_columns.join(",")
        )
    }
}

/// A formula shape and how often it was observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormulaPattern {
    pub function_family: String,
    pub aggregated_column: String,
    pub criteria_columns: Vec<String>,
    pub sheet: String,
    pub occurrence_count: usize,
}

impl FormulaPattern {
    pub fn key(&self) -> PatternKey {
        PatternKey {
            sheet: self.sheet.clone(),
            function_family: self.function_family.clone(),
            aggregated_column: self.aggregated_column.clone(),
            criteria_columns: self.criteria_columns.clone(),
        }
    }

    /// Served by a value→position index rather than a GROUP BY table
    pub fn is_lookup(&self) -> bool {
        matches!(self.function_family.as_str(), "VLOOKUP" | "MATCH" | "INDEX")
    }

    /// Aggregates a cache must hold to answer this shape
    fn required_aggregates(&self) -> AggregateFlags {
        match self.function_family.as_str() {
            "SUMIF" | "SUMIFS" => AggregateFlags {
                sum: true,
                count: true,
                avg: true,
            },
            "COUNTIF" | "COUNTIFS" => AggregateFlags {
                count: true,
                ..AggregateFlags::default()
            },
            _ => AggregateFlags {
                avg: true,
                ..AggregateFlags::default()
            },
        }
    }
}

//==============================================================================
// Materialized caches
//==============================================================================

/// Aggregate requested from an aggregation cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    Sum,
    Count,
    Average,
}

impl AggregateKind {
    /// Kind answering a conditional-aggregation function, if any
    pub fn for_function(function: &str) -> Option<Self> {
        match function {
            "SUMIF" | "SUMIFS" => Some(AggregateKind::Sum),
            "COUNTIF" | "COUNTIFS" => Some(AggregateKind::Count),
            "AVERAGEIF" | "AVERAGEIFS" => Some(AggregateKind::Average),
            _ => None,
        }
    }
}

impl FromStr for AggregateKind {
    type Err = SheetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(AggregateKind::Sum),
            "count" => Ok(AggregateKind::Count),
            "avg" | "average" => Ok(AggregateKind::Average),
            _ => Err(SheetError::UnsupportedAggregate(s.to_string())),
        }
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateKind::Sum => "sum",
            AggregateKind::Count => "count",
            AggregateKind::Average => "avg",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct AggregateFlags {
    sum: bool,
    count: bool,
    avg: bool,
}

impl AggregateFlags {
    fn union(self, other: Self) -> Self {
        Self {
            sum: self.sum || other.sum,
            count: self.count || other.count,
            avg: self.avg || other.avg,
        }
    }

    fn covers(self, other: Self) -> bool {
        self.union(other) == self
    }
}

/// A materialized GROUP BY table for one (sheet, aggregated column)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationCache {
    pub materialized_table_id: String,
    /// Column letter
    pub aggregated_column: String,
    /// Column letters, in GROUP BY order
    pub group_columns: Vec<String>,
    /// Physical names of `group_columns`, same order
    pub physical_group_columns: Vec<String>,
    pub has_sum: bool,
    pub has_count: bool,
    pub has_avg: bool,
}

impl AggregationCache {
    fn flags(&self) -> AggregateFlags {
        AggregateFlags {
            sum: self.has_sum,
            count: self.has_count,
            avg: self.has_avg,
        }
    }

    /// Whether the table carries the columns `kind` is computed from
    pub fn supports(&self, kind: AggregateKind) -> bool {
        match kind {
            AggregateKind::Sum => self.has_sum || self.has_avg,
            AggregateKind::Count => self.has_count,
            AggregateKind::Average => self.has_avg,
        }
    }
}

/// A materialized value → first-position table for one (sheet, column)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookupIndex {
    pub materialized_table_id: String,
    pub source_table: String,
    /// Column letter
    pub column: String,
    pub physical_column: String,
}

//==============================================================================
// Manager
//==============================================================================

/// Counters exposed to the orchestration layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub pattern_count: usize,
    pub materialized_aggregation_count: usize,
    pub materialized_lookup_count: usize,
    pub formula_count_by_function: BTreeMap<String, usize>,
    /// Materialize requests issued since the last clear
    pub materialization_count: usize,
}

/// Outcome of one [`CacheManager::optimize`] call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizeReport {
    /// Patterns that became answerable from a cache
    pub optimized: Vec<PatternKey>,
    /// Patterns whose materialization failed, with the error text
    pub failed: Vec<(PatternKey, String)>,
}

#[derive(Debug, Default)]
struct CacheState {
    patterns: BTreeMap<PatternKey, FormulaPattern>,
    formula_counts: BTreeMap<String, usize>,
    ready: HashSet<PatternKey>,
    aggregations: HashMap<(String, String), AggregationCache>,
    lookups: HashMap<(String, String), LookupIndex>,
    materializations: usize,
}

/// Owns the pattern table and the materialized-cache registry
///
/// Reads take the shared lock; observation, optimization and clearing take
/// the exclusive lock, so concurrent `optimize` calls run one at a time.
pub struct CacheManager {
    backend: Arc<dyn Backend>,
    state: RwLock<CacheState>,
}

impl CacheManager {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Count the shape of every supported formula in `formulas`
    ///
    /// `formulas` maps cell ids to formula text evaluated on `sheet`. No
    /// storage calls are made.
    pub fn observe(&self, sheet: &str, formulas: &BTreeMap<String, String>) {
        let mut state = self.state.write();
        let mut shaped = 0usize;

        for text in formulas.values() {
            let parsed = formula::parse(text);
            if !parsed.is_supported {
                continue;
            }
            *state
                .formula_counts
                .entry(parsed.function_name.clone())
                .or_insert(0) += 1;

            let Some(pattern) = pattern_of(sheet, &parsed) else {
                continue;
            };
            shaped += 1;
            state
                .patterns
                .entry(pattern.key())
                .and_modify(|p| p.occurrence_count += 1)
                .or_insert(pattern);
        }

        debug!(
            sheet,
            formulas = formulas.len(),
            shaped,
            patterns = state.patterns.len(),
            "observed formula batch"
        );
    }

    /// Materialize caches for every pattern seen at least `min_occurrence` times
    ///
    /// Patterns already answerable are skipped, so repeating the call is a
    /// no-op. A failing pattern is reported and the rest still proceed.
    pub fn optimize(&self, min_occurrence: usize) -> OptimizeReport {
        let mut state = self.state.write();
        let mut report = OptimizeReport::default();

        let candidates: Vec<FormulaPattern> = state
            .patterns
            .values()
            .filter(|p| p.occurrence_count >= min_occurrence && !state.ready.contains(&p.key()))
            .cloned()
            .collect();

        for pattern in candidates {
            let key = pattern.key();
            let result = if pattern.is_lookup() {
                self.ensure_lookup(&mut state, &pattern)
            } else {
                self.ensure_aggregation(&mut state, &pattern)
            };

            match result {
                Ok(()) => {
                    state.ready.insert(key.clone());
                    report.optimized.push(key);
                }
                Err(e) => {
                    warn!(pattern = %key, error = %e, "cache materialization failed");
                    report.failed.push((key, e.to_string()));
                }
            }
        }

        info!(
            optimized = report.optimized.len(),
            failed = report.failed.len(),
            min_occurrence,
            "optimize finished"
        );
        report
    }

    fn ensure_aggregation(&self, state: &mut CacheState, pattern: &FormulaPattern) -> SheetResult<()> {
        let slot = (pattern.sheet.clone(), pattern.aggregated_column.clone());
        let existing = state.aggregations.get(&slot);

        let mut group_columns: Vec<String> = existing.map(|c| c.group_columns.clone()).unwrap_or_default();
        for column in &pattern.criteria_columns {
            if !group_columns.contains(column) {
                group_columns.push(column.clone());
            }
        }
        let flags = existing
            .map(|c| c.flags())
            .unwrap_or_default()
            .union(pattern.required_aggregates());

        if let Some(cache) = existing {
            if cache.group_columns == group_columns && cache.flags().covers(flags) {
                return Ok(());
            }
        }

        let cache = builder::build_aggregation(
            self.backend.as_ref(),
            &pattern.sheet,
            &pattern.aggregated_column,
            &group_columns,
            flags,
        )?;
        state.materializations += 1;
        state.aggregations.insert(slot, cache);
        Ok(())
    }

    fn ensure_lookup(&self, state: &mut CacheState, pattern: &FormulaPattern) -> SheetResult<()> {
        let slot = (pattern.sheet.clone(), pattern.aggregated_column.clone());
        if state.lookups.contains_key(&slot) {
            return Ok(());
        }

        let index = builder::build_lookup(self.backend.as_ref(), &pattern.sheet, &pattern.aggregated_column)?;
        state.materializations += 1;
        state.lookups.insert(slot, index);
        Ok(())
    }

    /// Whether the shape has been made answerable from a cache
    pub fn is_optimized(&self, key: &PatternKey) -> bool {
        self.state.read().ready.contains(key)
    }

    /// Observed patterns in key order
    pub fn patterns(&self) -> Vec<FormulaPattern> {
        self.state.read().patterns.values().cloned().collect()
    }

    pub fn aggregation(&self, sheet: &str, aggregated_column: &str) -> Option<AggregationCache> {
        self.state
            .read()
            .aggregations
            .get(&(sheet.to_string(), aggregated_column.to_ascii_uppercase()))
            .cloned()
    }

    pub fn lookup_index(&self, sheet: &str, column: &str) -> Option<LookupIndex> {
        self.state
            .read()
            .lookups
            .get(&(sheet.to_string(), column.to_ascii_uppercase()))
            .cloned()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        CacheStats {
            pattern_count: state.patterns.len(),
            materialized_aggregation_count: state.aggregations.len(),
            materialized_lookup_count: state.lookups.len(),
            formula_count_by_function: state.formula_counts.clone(),
            materialization_count: state.materializations,
        }
    }

    /// Unregister every cache built from `sheet`, keeping its observed patterns
    ///
    /// Call after the sheet's data is replaced. The next `optimize` rebuilds
    /// the caches for patterns that still meet the threshold.
    pub fn invalidate_sheet(&self, sheet: &str) {
        let mut state = self.state.write();
        state.ready.retain(|key| key.sheet != sheet);
        state.aggregations.retain(|(owner, _), _| owner != sheet);
        state.lookups.retain(|(owner, _), _| owner != sheet);
        debug!(sheet, "sheet caches invalidated");
    }

    /// Forget all patterns and registered caches
    ///
    /// Materialized tables stay in storage; the next `optimize` replaces them.
    pub fn clear(&self) {
        let mut state = self.state.write();
        *state = CacheState::default();
        debug!("cache registry cleared");
    }
}

//==============================================================================
// Shape extraction
//==============================================================================

/// Whole-column range argument at `index`
fn column_range(parsed: &ParsedFormula, index: usize) -> Option<&RangeRef> {
    parsed
        .arguments
        .get(index)?
        .as_range()
        .filter(|r| r.is_column_range)
}

/// Shape of a parsed formula evaluated on `home`, or `None` when no cache
/// could answer it
pub fn pattern_of(home: &str, parsed: &ParsedFormula) -> Option<FormulaPattern> {
    let args = &parsed.arguments;
    let family = parsed.function_name.as_str();

    let (aggregated, criteria): (&RangeRef, Vec<&RangeRef>) = match family {
        "SUMIFS" | "AVERAGEIFS" if args.len() >= 3 && args.len() % 2 == 1 => (
            column_range(parsed, 0)?,
            (1..args.len()).step_by(2).map(|i| column_range(parsed, i)).collect::<Option<_>>()?,
        ),
        "COUNTIFS" if args.len() >= 2 && args.len() % 2 == 0 => {
            let criteria: Vec<&RangeRef> = (0..args.len())
                .step_by(2)
                .map(|i| column_range(parsed, i))
                .collect::<Option<_>>()?;
            (criteria[0], criteria)
        }
        "SUMIF" | "AVERAGEIF" if (2..=3).contains(&args.len()) => {
            let criteria = column_range(parsed, 0)?;
            let aggregated = if args.len() == 3 { column_range(parsed, 2)? } else { criteria };
            (aggregated, vec![criteria])
        }
        "COUNTIF" if args.len() == 2 => {
            let criteria = column_range(parsed, 0)?;
            (criteria, vec![criteria])
        }
        "VLOOKUP" | "MATCH" if args.len() >= 2 => (column_range(parsed, 1)?, Vec::new()),
        "INDEX" => match args.get(1) {
            Some(FormulaArg::NestedFormula(inner)) if inner.function_name == "MATCH" => {
                return pattern_of(home, inner).map(|mut p| {
                    p.function_family = "INDEX".to_string();
                    p
                })
            }
            _ => return None,
        },
        _ => return None,
    };

    let sheet = aggregated.target_sheet(home);
    if criteria.iter().any(|c| c.target_sheet(home) != sheet) {
        return None;
    }

    Some(FormulaPattern {
        function_family: family.to_string(),
        aggregated_column: aggregated.start_col.clone(),
        criteria_columns: criteria.iter().map(|c| c.start_col.clone()).collect(),
        sheet: sheet.to_string(),
        occurrence_count: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::formula::parse;
    use pretty_assertions::assert_eq;

    fn shape(formula: &str) -> Option<FormulaPattern> {
        pattern_of("Home", &parse(formula))
    }

    #[test]
    fn test_sumifs_shape() {
        let p = shape("=SUMIFS(A:A, B:B, \"x\", C:C, \"y\")").unwrap();
        assert_eq!(p.function_family, "SUMIFS");
        assert_eq!(p.aggregated_column, "A");
        assert_eq!(p.criteria_columns, vec!["B", "C"]);
        assert_eq!(p.sheet, "Home");
    }

    #[test]
    fn test_countifs_aggregates_first_criteria_column() {
        let p = shape("=COUNTIFS(C:C, \"East\", B:B, \"A\")").unwrap();
        assert_eq!(p.aggregated_column, "C");
        assert_eq!(p.criteria_columns, vec!["C", "B"]);
    }

    #[test]
    fn test_sumif_shapes() {
        let p = shape("=SUMIF(B:B, \"A\", A:A)").unwrap();
        assert_eq!((p.aggregated_column.as_str(), p.criteria_columns.clone()), ("A", vec!["B".to_string()]));
        let p = shape("=SUMIF(A:A, \">5\")").unwrap();
        assert_eq!(p.aggregated_column, "A");
    }

    #[test]
    fn test_lookup_shapes() {
        let p = shape("=VLOOKUP(\"k\", Data!B:D, 2, FALSE)").unwrap();
        assert_eq!(p.sheet, "Data");
        assert_eq!(p.aggregated_column, "B");
        assert!(p.is_lookup());

        let p = shape("=INDEX(C:C, MATCH(\"k\", A:A, 0))").unwrap();
        assert_eq!(p.function_family, "INDEX");
        assert_eq!(p.aggregated_column, "A");
    }

    #[test]
    fn test_unshaped_formulas() {
        assert!(shape("=SUM(A:A)").is_none());
        assert!(shape("=SUMIFS(A2:A9, B2:B9, \"x\")").is_none());
        assert!(shape("=SUMIFS(A:A, Other!B:B, \"x\")").is_none());
        assert!(shape("=SUMIFS(A:A, B:B)").is_none());
        assert!(shape("=MINIFS(A:A, B:B, \"x\")").is_none());
        assert!(shape("=INDEX(C:C, 4)").is_none());
    }

    #[test]
    fn test_aggregate_kind_from_str() {
        assert_eq!("SUM".parse::<AggregateKind>().unwrap(), AggregateKind::Sum);
        assert_eq!("avg".parse::<AggregateKind>().unwrap(), AggregateKind::Average);
        assert_eq!("average".parse::<AggregateKind>().unwrap(), AggregateKind::Average);
        assert!(matches!(
            "median".parse::<AggregateKind>(),
            Err(SheetError::UnsupportedAggregate(_))
        ));
        assert_eq!(AggregateKind::Average.to_string(), "avg");
    }

    #[test]
    fn test_flags_cover() {
        let all = AggregateFlags { sum: true, count: true, avg: true };
        let count = AggregateFlags { count: true, ..AggregateFlags::default() };
        assert!(all.covers(count));
        assert!(!count.covers(all));
    }

    #[test]
    fn test_pattern_key_display() {
        let key = PatternKey::new("Sales", "sumifs", "a", &["b", "c"]);
        assert_eq!(key.to_string(), "Sales|SUMIFS|A|B,C");
    }
}
