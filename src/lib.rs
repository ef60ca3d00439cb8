//! SheetSQL - Excel formulas compiled to SQL, with aggregation and lookup caches
//!
//! Formulas are parsed and compiled to query text over sheet tables held by
//! a [`storage::Backend`]. Formula shapes that repeat across many cells are
//! detected and pre-aggregated into cache tables, so large batches of
//! SUMIFS/COUNTIFS/AVERAGEIFS/MATCH formulas become a handful of lookups.
//!
//! # Example
//!
//! ```no_run
//! use royalbit_sheetsql::core::{Calculator, CalculatorConfig};
//! use royalbit_sheetsql::storage::SqliteBackend;
//! use royalbit_sheetsql::types::Value;
//! use std::sync::Arc;
//!
//! let backend = SqliteBackend::open_in_memory()?;
//! backend.load_sheet(
//!     "Sales",
//!     &["amount".to_string(), "category".to_string()],
//!     &[vec![Value::from(100.0), Value::from("A")]],
//! )?;
//!
//! let calculator = Calculator::new(Arc::new(backend), CalculatorConfig::default());
//! let total = calculator.calc_cell("Sales", "C1", "=SUMIFS(A:A, B:B, \"A\")")?;
//! println!("{}", total);
//! # Ok::<(), royalbit_sheetsql::error::SheetError>(())
//! ```

pub mod cache;
pub mod cli;
pub mod core;
pub mod error;
pub mod parser;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use cache::{AggregateKind, CacheManager, FormulaPattern, PatternKey, ResultMemo};
pub use core::{Calculator, CalculatorConfig, FormulaCompiler};
pub use error::{SheetError, SheetResult};
pub use types::{CompiledQuery, Value};
