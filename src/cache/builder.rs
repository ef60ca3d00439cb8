//! Materialization of aggregation caches and match indexes

use super::{AggregateFlags, AggregationCache, LookupIndex};
use crate::core::sql::{self, LOOKUP_VALUE_COLUMN};
use crate::error::{SheetError, SheetResult};
use crate::storage::Backend;
use tracing::{info, warn};

/// Name of the aggregation cache table for `column` of `table`
pub fn aggregation_table_name(table: &str, column: &str) -> String {
    format!("__{}_agg_cache_{}", table, column.to_ascii_lowercase())
}

/// Name of the match index table for `column` of `table`
pub fn match_index_table_name(table: &str, column: &str) -> String {
    format!("__{}_match_idx_{}", table, column.to_ascii_lowercase())
}

fn resolve(backend: &dyn Backend, sheet: &str, column: &str) -> SheetResult<(String, String)> {
    let table = backend
        .resolve_table(sheet)
        .ok_or_else(|| SheetError::SheetNotLoaded(sheet.to_string()))?;
    let physical = backend
        .resolve_column(sheet, column)
        .ok_or_else(|| SheetError::ColumnNotFound {
            sheet: sheet.to_string(),
            column: column.to_string(),
        })?;
    Ok((table, physical))
}

/// GROUP BY `group_columns` over `aggregated_column`, replacing any
/// previous cache for the same column
pub(super) fn build_aggregation(
    backend: &dyn Backend,
    sheet: &str,
    aggregated_column: &str,
    group_columns: &[String],
    flags: AggregateFlags,
) -> SheetResult<AggregationCache> {
    let (table, physical_aggregated) = resolve(backend, sheet, aggregated_column)?;
    let physical_group_columns = group_columns
        .iter()
        .map(|letter| resolve(backend, sheet, letter).map(|(_, physical)| physical))
        .collect::<SheetResult<Vec<_>>>()?;

    let name = aggregation_table_name(&table, aggregated_column);
    let query = sql::aggregation_cache_select(
        backend.dialect(),
        &table,
        &physical_group_columns,
        &physical_aggregated,
        flags.sum,
        flags.count,
        flags.avg,
    );
    backend.materialize(&name, &query)?;
    info!(
        table = %name,
        sheet,
        column = aggregated_column,
        groups = %group_columns.join(","),
        "materialized aggregation cache"
    );

    Ok(AggregationCache {
        materialized_table_id: name,
        aggregated_column: aggregated_column.to_string(),
        group_columns: group_columns.to_vec(),
        physical_group_columns,
        has_sum: flags.sum,
        has_count: flags.count,
        has_avg: flags.avg,
    })
}

/// Plain index on the key column plus a value → first-position table
pub(super) fn build_lookup(backend: &dyn Backend, sheet: &str, column: &str) -> SheetResult<LookupIndex> {
    let (table, physical) = resolve(backend, sheet, column)?;

    if let Err(e) = backend.create_index(&table, &physical) {
        warn!(table = %table, column = %physical, error = %e, "index creation failed");
    }

    let name = match_index_table_name(&table, column);
    backend.materialize(&name, &sql::match_index_select(&table, &physical))?;
    if let Err(e) = backend.create_index(&name, LOOKUP_VALUE_COLUMN) {
        warn!(table = %name, error = %e, "index creation failed");
    }
    info!(table = %name, sheet, column, "materialized match index");

    Ok(LookupIndex {
        materialized_table_id: name,
        source_table: table,
        column: column.to_string(),
        physical_column: physical,
    })
}
