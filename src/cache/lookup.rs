//! Answering criteria tuples from materialized caches
//!
//! Every lookup sums the cache rows whose group columns equal the supplied
//! criteria. Criteria on only some of the group columns therefore still give
//! exact results, and a tuple matching nothing gets the aggregate identity.

use super::{AggregateKind, AggregationCache, CacheManager};
use crate::core::sql::{
    self, CompareOp, COUNT_COLUMN, INDEX_COLUMN, LOOKUP_VALUE_COLUMN, NUMERIC_COUNT_COLUMN,
    POSITION_COLUMN, SUM_COLUMN,
};
use crate::error::{SheetError, SheetResult};
use crate::types::Value;
use std::collections::BTreeMap;

/// Criteria tuples staged per query in [`CacheManager::batch_lookup`]
const BATCH_CHUNK_SIZE: usize = 500;

/// Criteria tuple: column letter → value; `Value::Null` means "no criterion"
pub type CriteriaValues = BTreeMap<String, Value>;

impl CacheManager {
    /// Aggregate over rows matching `criteria`; no match yields 0
    pub fn lookup(
        &self,
        sheet: &str,
        aggregated_column: &str,
        criteria: &CriteriaValues,
        kind: AggregateKind,
    ) -> SheetResult<f64> {
        Ok(self
            .lookup_optional(sheet, aggregated_column, criteria, kind)?
            .unwrap_or(0.0))
    }

    /// [`CacheManager::lookup`] keeping "no data" distinct from zero
    pub fn lookup_optional(
        &self,
        sheet: &str,
        aggregated_column: &str,
        criteria: &CriteriaValues,
        kind: AggregateKind,
    ) -> SheetResult<Option<f64>> {
        let cache = self.cache_for(sheet, aggregated_column, kind)?;

        let predicates: Vec<String> = cache
            .group_columns
            .iter()
            .zip(&cache.physical_group_columns)
            .filter_map(|(letter, physical)| {
                criterion(criteria, letter).map(|value| {
                    sql::compare(&sql::ident(physical), CompareOp::Eq, &sql::typed_literal(value))
                })
            })
            .collect();

        let query = sql::select(
            &aggregate_expr(kind, ""),
            &sql::ident(&cache.materialized_table_id),
            sql::and_all(&predicates).as_deref(),
        );

        let row = self.backend.execute_scalar(&query)?;
        Ok(row.and_then(|r| r.first().and_then(Value::as_f64)))
    }

    /// One aggregate per tuple, `results[i]` answering `criteria_list[i]`
    pub fn batch_lookup(
        &self,
        sheet: &str,
        aggregated_column: &str,
        criteria_list: &[CriteriaValues],
        kind: AggregateKind,
    ) -> SheetResult<Vec<f64>> {
        Ok(self
            .batch_lookup_optional(sheet, aggregated_column, criteria_list, kind)?
            .into_iter()
            .map(|v| v.unwrap_or(0.0))
            .collect())
    }

    /// [`CacheManager::batch_lookup`] keeping "no data" distinct from zero
    ///
    /// Tuples are staged in a per-query CTE tagged with their position and
    /// left-joined to the cache, so concurrent batches never share staging.
    pub fn batch_lookup_optional(
        &self,
        sheet: &str,
        aggregated_column: &str,
        criteria_list: &[CriteriaValues],
        kind: AggregateKind,
    ) -> SheetResult<Vec<Option<f64>>> {
        let cache = self.cache_for(sheet, aggregated_column, kind)?;
        let mut results = vec![None; criteria_list.len()];

        for (chunk_index, chunk) in criteria_list.chunks(BATCH_CHUNK_SIZE).enumerate() {
            let offset = chunk_index * BATCH_CHUNK_SIZE;
            let query = batch_query(&cache, chunk, offset, kind);

            for row in self.backend.execute(&query)? {
                let position = row.first().and_then(Value::as_f64);
                let value = row.get(1).and_then(Value::as_f64);
                if let Some(slot) = position
                    .filter(|p| *p >= 0.0)
                    .and_then(|p| results.get_mut(p as usize))
                {
                    *slot = value;
                }
            }
        }

        Ok(results)
    }

    /// 1-based first position of `value` in `column`, from the match index
    pub fn match_position(&self, sheet: &str, column: &str, value: &Value) -> SheetResult<Option<usize>> {
        let index = self
            .lookup_index(sheet, column)
            .ok_or_else(|| SheetError::CacheNotBuilt {
                sheet: sheet.to_string(),
                column: column.to_string(),
            })?;
        if value.is_null() {
            return Ok(None);
        }

        let query = format!(
            "{} LIMIT 1",
            sql::select(
                &sql::ident(POSITION_COLUMN),
                &sql::ident(&index.materialized_table_id),
                Some(&sql::compare(
                    &sql::ident(LOOKUP_VALUE_COLUMN),
                    CompareOp::Eq,
                    &sql::typed_literal(value)
                )),
            )
        );

        let row = self.backend.execute_scalar(&query)?;
        Ok(row
            .and_then(|r| r.first().and_then(Value::as_f64))
            .filter(|p| *p >= 1.0)
            .map(|p| p as usize))
    }

    fn cache_for(&self, sheet: &str, aggregated_column: &str, kind: AggregateKind) -> SheetResult<AggregationCache> {
        let cache = self
            .aggregation(sheet, aggregated_column)
            .ok_or_else(|| SheetError::CacheNotBuilt {
                sheet: sheet.to_string(),
                column: aggregated_column.to_string(),
            })?;
        if !cache.supports(kind) {
            return Err(SheetError::AggregateNotMaterialized(kind.to_string()));
        }
        Ok(cache)
    }
}

/// The criterion for `letter`, ignoring NULL values
fn criterion<'a>(criteria: &'a CriteriaValues, letter: &str) -> Option<&'a Value> {
    criteria
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(letter))
        .map(|(_, value)| value)
        .filter(|value| !value.is_null())
}

/// Aggregate over cache rows; `qualifier` prefixes column names (`t.`)
fn aggregate_expr(kind: AggregateKind, qualifier: &str) -> String {
    let column = |name: &str| format!("SUM({}{})", qualifier, sql::ident(name));
    match kind {
        AggregateKind::Sum => column(SUM_COLUMN),
        AggregateKind::Count => column(COUNT_COLUMN),
        AggregateKind::Average => sql::safe_divide(&column(SUM_COLUMN), &column(NUMERIC_COUNT_COLUMN)),
    }
}

fn batch_query(cache: &AggregationCache, chunk: &[CriteriaValues], offset: usize, kind: AggregateKind) -> String {
    let keys: Vec<String> = (0..cache.group_columns.len())
        .map(|i| sql::ident(&format!("__k{}", i)))
        .collect();

    let rows: Vec<String> = chunk
        .iter()
        .enumerate()
        .map(|(i, criteria)| {
            let mut values = vec![(offset + i).to_string()];
            values.extend(cache.group_columns.iter().map(|letter| {
                criterion(criteria, letter)
                    .map(sql::typed_literal)
                    .unwrap_or_else(|| "NULL".to_string())
            }));
            format!("({})", values.join(", "))
        })
        .collect();

    let join: Vec<String> = keys
        .iter()
        .zip(&cache.physical_group_columns)
        .map(|(key, physical)| format!("(s.{k} IS NULL OR s.{k} = t.{c})", k = key, c = sql::ident(physical)))
        .collect();

    let mut stage_columns = vec![sql::ident(INDEX_COLUMN)];
    stage_columns.extend(keys.iter().cloned());

    format!(
        "WITH {stage}({columns}) AS (VALUES {rows}) \
         SELECT s.{idx}, {agg} FROM {stage} AS s LEFT JOIN {cache} AS t ON {on} \
         GROUP BY s.{idx} ORDER BY s.{idx}",
        stage = sql::ident("__stage"),
        columns = stage_columns.join(", "),
        rows = rows.join(", "),
        idx = sql::ident(INDEX_COLUMN),
        agg = aggregate_expr(kind, "t."),
        cache = sql::ident(&cache.materialized_table_id),
        on = sql::and_all(&join).unwrap_or_else(|| "TRUE".to_string()),
    )
}
