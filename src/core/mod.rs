//! Formula parsing and compilation

pub mod calculator;
pub mod compiler;
pub mod criteria;
pub mod formula;
pub mod reference;
pub mod sql;

pub use calculator::{BatchReport, Calculator, CalculatorConfig, CalculatorStats};
pub use compiler::{FormulaCompiler, MatchType};
pub use criteria::Criteria;
pub use formula::{parse, FormulaArg, ParsedFormula};
pub use reference::{parse_cell, parse_range, CellRef, RangeRef};
