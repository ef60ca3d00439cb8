//! Pattern detection, materialization and cache lookups against SQLite

mod common;

use common::{sales_backend, RecordingBackend};
use pretty_assertions::assert_eq;
use royalbit_sheetsql::cache::{
    aggregation_table_name, AggregateKind, CacheManager, CriteriaValues, PatternKey,
};
use royalbit_sheetsql::core::FormulaCompiler;
use royalbit_sheetsql::error::SheetError;
use royalbit_sheetsql::storage::{Backend, SqliteBackend};
use royalbit_sheetsql::types::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

fn formulas(items: &[(&str, &str)]) -> BTreeMap<String, String> {
    items
        .iter()
        .map(|(cell, formula)| (cell.to_string(), formula.to_string()))
        .collect()
}

fn criteria(items: &[(&str, Value)]) -> CriteriaValues {
    items
        .iter()
        .map(|(letter, value)| (letter.to_string(), value.clone()))
        .collect()
}

fn sumifs_batch() -> BTreeMap<String, String> {
    formulas(&[
        ("E1", "=SUMIFS(A:A, B:B, \"A\", C:C, \"East\")"),
        ("E2", "=SUMIFS(A:A, B:B, \"B\", C:C, \"West\")"),
        ("E3", "=SUMIFS(A:A, B:B, \"C\", C:C, \"East\")"),
    ])
}

/// Execute a formula directly against the raw sheet
fn direct(backend: &SqliteBackend, formula: &str) -> Value {
    let query = FormulaCompiler::new(backend).compile("Sales", formula).unwrap();
    backend
        .execute_scalar(&query.query_text)
        .unwrap()
        .and_then(|row| row.into_iter().next())
        .unwrap_or(Value::Null)
}

// ═══════════════════════════════════════════════════════════════════════════
// OBSERVATION
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_observe_counts_shapes() {
    let manager = CacheManager::new(Arc::new(sales_backend()));
    manager.observe("Sales", &sumifs_batch());

    let patterns = manager.patterns();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].occurrence_count, 3);
    assert_eq!(patterns[0].criteria_columns, vec!["B", "C"]);

    manager.observe("Sales", &sumifs_batch());
    assert_eq!(manager.patterns()[0].occurrence_count, 6);

    let stats = manager.stats();
    assert_eq!(stats.pattern_count, 1);
    assert_eq!(stats.formula_count_by_function.get("SUMIFS"), Some(&6));
    assert_eq!(stats.materialization_count, 0);
}

#[test]
fn test_observe_skips_unsupported_and_bounded_ranges() {
    let manager = CacheManager::new(Arc::new(sales_backend()));
    manager.observe(
        "Sales",
        &formulas(&[
            ("E1", "=FOO(A:A)"),
            ("E2", "=SUMIFS(A2:A5, B2:B5, \"A\")"),
            ("E3", "=SUM(A:A)"),
        ]),
    );

    let stats = manager.stats();
    assert_eq!(stats.pattern_count, 0);
    assert_eq!(stats.formula_count_by_function.get("SUM"), Some(&1));
    assert_eq!(stats.formula_count_by_function.get("FOO"), None);
}

// ═══════════════════════════════════════════════════════════════════════════
// OPTIMIZATION
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_optimize_respects_threshold() {
    let manager = CacheManager::new(Arc::new(sales_backend()));
    manager.observe("Sales", &sumifs_batch());

    let report = manager.optimize(4);
    assert!(report.optimized.is_empty());
    assert!(manager.aggregation("Sales", "A").is_none());

    let report = manager.optimize(3);
    assert_eq!(report.optimized, vec![PatternKey::new("Sales", "SUMIFS", "A", &["B", "C"])]);
    assert!(manager.is_optimized(&PatternKey::new("Sales", "sumifs", "a", &["b", "c"])));
}

#[test]
fn test_optimize_twice_materializes_once() {
    let backend = Arc::new(RecordingBackend::new(sales_backend()));
    let manager = CacheManager::new(backend.clone());
    manager.observe("Sales", &sumifs_batch());

    manager.optimize(1);
    let first = manager.aggregation("Sales", "A").unwrap();
    assert_eq!(backend.materialize_count(), 1);

    let report = manager.optimize(1);
    assert!(report.optimized.is_empty());
    assert_eq!(backend.materialize_count(), 1);
    assert_eq!(manager.aggregation("Sales", "A").unwrap(), first);
    assert_eq!(first.materialized_table_id, aggregation_table_name("sales", "A"));
}

#[test]
fn test_second_shape_widens_existing_cache() {
    let manager = CacheManager::new(Arc::new(sales_backend()));
    manager.observe("Sales", &formulas(&[("E1", "=SUMIFS(A:A, B:B, \"A\")")]));
    manager.optimize(1);
    assert_eq!(manager.aggregation("Sales", "A").unwrap().group_columns, vec!["B"]);

    manager.observe("Sales", &formulas(&[("E2", "=SUMIFS(A:A, C:C, \"East\")")]));
    manager.optimize(1);
    let cache = manager.aggregation("Sales", "A").unwrap();
    assert_eq!(cache.group_columns, vec!["B", "C"]);

    // Both shapes stay answerable from the widened table
    let by_category = manager
        .lookup("Sales", "A", &criteria(&[("B", Value::from("A"))]), AggregateKind::Sum)
        .unwrap();
    let by_region = manager
        .lookup("Sales", "A", &criteria(&[("C", Value::from("East"))]), AggregateKind::Sum)
        .unwrap();
    assert_eq!(by_category, 950.0);
    assert_eq!(by_region, 725.0);
}

#[test]
fn test_failed_materialization_is_reported() {
    let backend = Arc::new(RecordingBackend::failing_on(sales_backend(), "match_idx"));
    let manager = CacheManager::new(backend);
    manager.observe(
        "Sales",
        &formulas(&[
            ("E1", "=MATCH(\"C\", B:B, 0)"),
            ("E2", "=SUMIFS(A:A, B:B, \"A\")"),
        ]),
    );

    let report = manager.optimize(1);
    assert_eq!(report.optimized, vec![PatternKey::new("Sales", "SUMIFS", "A", &["B"])]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, PatternKey::new("Sales", "MATCH", "B", &[]));
    assert!(manager.lookup_index("Sales", "B").is_none());
}

#[test]
fn test_clear_forgets_everything() {
    let manager = CacheManager::new(Arc::new(sales_backend()));
    manager.observe("Sales", &sumifs_batch());
    manager.optimize(1);
    manager.clear();

    assert_eq!(manager.stats(), Default::default());
    assert!(manager.aggregation("Sales", "A").is_none());
}

// ═══════════════════════════════════════════════════════════════════════════
// LOOKUPS
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_lookup_matches_direct_execution() {
    let backend = Arc::new(sales_backend());
    let manager = CacheManager::new(backend.clone());
    manager.observe("Sales", &sumifs_batch());
    manager.observe(
        "Sales",
        &formulas(&[
            ("F1", "=COUNTIFS(B:B, \"A\", C:C, \"East\")"),
            ("G1", "=AVERAGEIFS(A:A, B:B, \"A\", C:C, \"East\")"),
        ]),
    );
    manager.optimize(1);

    let categories = ["A", "B", "C", "Z"];
    let regions = ["East", "West", "North"];
    for category in categories {
        for region in regions {
            let tuple = criteria(&[("B", Value::from(category)), ("C", Value::from(region))]);

            let sum = manager.lookup("Sales", "A", &tuple, AggregateKind::Sum).unwrap();
            let expected = direct(
                &backend,
                &format!("=SUMIFS(A:A, B:B, \"{}\", C:C, \"{}\")", category, region),
            );
            assert_eq!(Value::Number(sum), expected, "SUMIFS {} {}", category, region);

            let count = manager.lookup("Sales", "B", &tuple, AggregateKind::Count).unwrap();
            let expected = direct(
                &backend,
                &format!("=COUNTIFS(B:B, \"{}\", C:C, \"{}\")", category, region),
            );
            assert_eq!(Value::Number(count), expected, "COUNTIFS {} {}", category, region);

            let average = manager
                .lookup_optional("Sales", "A", &tuple, AggregateKind::Average)
                .unwrap();
            let expected = direct(
                &backend,
                &format!("=AVERAGEIFS(A:A, B:B, \"{}\", C:C, \"{}\")", category, region),
            );
            assert_eq!(average.map_or(Value::Null, Value::Number), expected);
        }
    }
}

#[test]
fn test_lookup_absent_tuple_yields_identity() {
    let manager = CacheManager::new(Arc::new(sales_backend()));
    manager.observe("Sales", &sumifs_batch());
    manager.optimize(1);

    let tuple = criteria(&[("B", Value::from("Z")), ("C", Value::from("East"))]);
    assert_eq!(manager.lookup("Sales", "A", &tuple, AggregateKind::Sum).unwrap(), 0.0);
    assert_eq!(manager.lookup("Sales", "A", &tuple, AggregateKind::Average).unwrap(), 0.0);
    assert_eq!(
        manager
            .lookup_optional("Sales", "A", &tuple, AggregateKind::Average)
            .unwrap(),
        None
    );
}

#[test]
fn test_lookup_without_cache_is_an_error() {
    let manager = CacheManager::new(Arc::new(sales_backend()));
    let err = manager
        .lookup("Sales", "A", &CriteriaValues::new(), AggregateKind::Sum)
        .unwrap_err();
    assert!(matches!(err, SheetError::CacheNotBuilt { .. }));
}

#[test]
fn test_lookup_of_missing_aggregate_is_an_error() {
    let manager = CacheManager::new(Arc::new(sales_backend()));
    manager.observe("Sales", &formulas(&[("E1", "=AVERAGEIFS(A:A, B:B, \"A\")")]));
    manager.optimize(1);

    let err = manager
        .lookup("Sales", "A", &CriteriaValues::new(), AggregateKind::Count)
        .unwrap_err();
    assert!(matches!(err, SheetError::AggregateNotMaterialized(_)));
}

#[test]
fn test_batch_lookup_preserves_order() {
    let manager = CacheManager::new(Arc::new(sales_backend()));
    manager.observe("Sales", &sumifs_batch());
    manager.optimize(1);

    let tuples = vec![
        criteria(&[("B", Value::from("C")), ("C", Value::from("West"))]),
        criteria(&[("B", Value::from("Z")), ("C", Value::from("West"))]),
        criteria(&[("B", Value::from("A"))]),
        criteria(&[("B", Value::from("A")), ("C", Value::from("East"))]),
    ];

    let batch = manager.batch_lookup("Sales", "A", &tuples, AggregateKind::Sum).unwrap();
    let single: Vec<f64> = tuples
        .iter()
        .map(|t| manager.lookup("Sales", "A", t, AggregateKind::Sum).unwrap())
        .collect();
    assert_eq!(batch, single);
    assert_eq!(batch, vec![225.0, 0.0, 950.0, 400.0]);
}

#[test]
fn test_batch_lookup_spans_chunks() {
    let manager = CacheManager::new(Arc::new(sales_backend()));
    manager.observe("Sales", &sumifs_batch());
    manager.optimize(1);

    let tuples: Vec<CriteriaValues> = (0..1_203)
        .map(|i| {
            let category = ["A", "B", "C", "Z"][i % 4];
            criteria(&[("B", Value::from(category))])
        })
        .collect();

    let results = manager.batch_lookup("Sales", "A", &tuples, AggregateKind::Sum).unwrap();
    assert_eq!(results.len(), 1_203);
    for (i, result) in results.iter().enumerate() {
        let expected = [950.0, 400.0, 400.0, 0.0][i % 4];
        assert_eq!(*result, expected, "tuple {}", i);
    }
}

#[test]
fn test_match_position_uses_first_occurrence() {
    let manager = CacheManager::new(Arc::new(sales_backend()));
    manager.observe("Sales", &formulas(&[("E1", "=MATCH(\"C\", B:B, 0)")]));
    manager.optimize(1);

    assert_eq!(manager.match_position("Sales", "B", &Value::from("C")).unwrap(), Some(6));
    assert_eq!(manager.match_position("Sales", "B", &Value::from("A")).unwrap(), Some(1));
    assert_eq!(manager.match_position("Sales", "B", &Value::from("Q")).unwrap(), None);

    let err = manager
        .match_position("Sales", "C", &Value::from("East"))
        .unwrap_err();
    assert!(matches!(err, SheetError::CacheNotBuilt { .. }));
}

#[test]
fn test_match_index_agrees_with_direct_match() {
    let backend = Arc::new(sales_backend());
    let manager = CacheManager::new(backend.clone());
    manager.observe(
        "Sales",
        &formulas(&[("E1", "=MATCH(\"C\", B:B, 0)"), ("E2", "=MATCH(\"West\", C:C, 0)")]),
    );
    manager.optimize(1);

    for (column, value) in [("B", "A"), ("B", "B"), ("B", "C"), ("C", "East"), ("C", "West")] {
        let formula = format!("=MATCH(\"{}\", {}:{}, 0)", value, column, column);
        let expected = direct(&backend, &formula).as_f64().map(|p| p as usize);
        let cached = manager.match_position("Sales", column, &Value::from(value)).unwrap();
        assert_eq!(cached, expected, "{}", formula);
    }
}

#[test]
fn test_invalidate_sheet_unregisters_its_caches() {
    let backend = Arc::new(sales_backend());
    let manager = CacheManager::new(backend.clone());
    manager.observe("Sales", &sumifs_batch());
    manager.observe("Sales", &formulas(&[("E9", "=MATCH(\"C\", B:B, 0)")]));
    manager.optimize(1);
    assert_eq!(manager.stats().materialized_lookup_count, 1);

    let mut rows = common::sales_rows();
    rows.reverse();
    backend
        .load_sheet(
            "Sales",
            &["value".to_string(), "category".to_string(), "region".to_string()],
            &rows,
        )
        .unwrap();
    manager.invalidate_sheet("Sales");

    let stats = manager.stats();
    assert_eq!(stats.materialized_aggregation_count, 0);
    assert_eq!(stats.materialized_lookup_count, 0);
    assert!(stats.pattern_count > 0);
    assert!(matches!(
        manager.match_position("Sales", "B", &Value::from("C")),
        Err(SheetError::CacheNotBuilt { .. })
    ));

    manager.optimize(1);
    // Reversed rows put the last "C" (row 7) at row 2
    assert_eq!(manager.match_position("Sales", "B", &Value::from("C")).unwrap(), Some(2));
}

#[test]
fn test_concurrent_lookups() {
    let manager = Arc::new(CacheManager::new(Arc::new(sales_backend())));
    manager.observe("Sales", &sumifs_batch());
    manager.optimize(1);

    let handles: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|category| {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                let tuple = criteria(&[("B", Value::from(category))]);
                (0..20)
                    .map(|_| manager.lookup("Sales", "A", &tuple, AggregateKind::Sum).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let totals: Vec<f64> = handles.into_iter().map(|h| h.join().unwrap()[19]).collect();
    assert_eq!(totals, vec![950.0, 400.0, 400.0]);
}
