//! Workbook files: sheet data plus the formulas to evaluate against it
//!
//! ```yaml
//! config:
//!   optimize_threshold: 2
//! sheets:
//!   Sales:
//!     columns: [amount, category, region]
//!     rows:
//!       - [100, A, East]
//!       - [200, B, West]
//! formulas:
//!   Sales:
//!     E1: =SUMIFS(A:A, B:B, "A")
//! ```

use crate::core::CalculatorConfig;
use crate::error::{SheetError, SheetResult};
use crate::storage::SqliteBackend;
use crate::types::Row;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Column headers and rows of one sheet; row n of the sheet is `rows[n-1]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SheetData {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workbook {
    #[serde(default)]
    pub config: CalculatorConfig,
    #[serde(default)]
    pub sheets: BTreeMap<String, SheetData>,
    /// Sheet name → cell → formula text
    #[serde(default)]
    pub formulas: BTreeMap<String, BTreeMap<String, String>>,
}

impl Workbook {
    pub fn formula_count(&self) -> usize {
        self.formulas.values().map(BTreeMap::len).sum()
    }

    /// Load every sheet into a fresh in-memory SQLite backend
    pub fn load(&self) -> SheetResult<SqliteBackend> {
        let backend = SqliteBackend::open_in_memory()?;
        for (name, sheet) in &self.sheets {
            backend.load_sheet(name, &sheet.columns, &sheet.rows)?;
        }
        Ok(backend)
    }
}

/// Read and validate a workbook file
pub fn parse_workbook(path: &Path) -> SheetResult<Workbook> {
    let content = std::fs::read_to_string(path)?;
    let workbook = parse_workbook_str(&content)?;
    debug!(
        path = %path.display(),
        sheets = workbook.sheets.len(),
        formulas = workbook.formula_count(),
        "workbook parsed"
    );
    Ok(workbook)
}

pub fn parse_workbook_str(content: &str) -> SheetResult<Workbook> {
    let workbook: Workbook = serde_yaml::from_str(content)?;
    validate(&workbook)?;
    Ok(workbook)
}

fn validate(workbook: &Workbook) -> SheetResult<()> {
    for (name, sheet) in &workbook.sheets {
        if sheet.columns.is_empty() {
            return Err(SheetError::Validation(format!("Sheet '{}' has no columns", name)));
        }
        if let Some((index, row)) = sheet
            .rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() > sheet.columns.len())
        {
            return Err(SheetError::Validation(format!(
                "Sheet '{}' row {} has {} values but only {} columns",
                name,
                index + 1,
                row.len(),
                sheet.columns.len()
            )));
        }
    }

    for (sheet, cells) in &workbook.formulas {
        if !workbook.sheets.contains_key(sheet) {
            return Err(SheetError::Validation(format!(
                "Formulas reference unknown sheet '{}'",
                sheet
            )));
        }
        if let Some((cell, _)) = cells.iter().find(|(_, f)| f.trim().is_empty()) {
            return Err(SheetError::Validation(format!(
                "Empty formula in {}!{}",
                sheet, cell
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    const WORKBOOK: &str = r#"
config:
  optimize_threshold: 2
sheets:
  Sales:
    columns: [amount, category]
    rows:
      - [100, A]
      - [~, "B"]
      - [true, 3.5]
formulas:
  Sales:
    C1: =SUM(A:A)
"#;

    #[test]
    fn test_parse_workbook_values() {
        let workbook = parse_workbook_str(WORKBOOK).unwrap();
        assert_eq!(workbook.config.optimize_threshold, 2);
        assert!(workbook.config.auto_optimize);

        let rows = &workbook.sheets["Sales"].rows;
        assert_eq!(rows[0], vec![Value::Number(100.0), Value::from("A")]);
        assert_eq!(rows[1], vec![Value::Null, Value::from("B")]);
        assert_eq!(rows[2], vec![Value::Bool(true), Value::Number(3.5)]);
        assert_eq!(workbook.formula_count(), 1);
    }

    #[test]
    fn test_formulas_for_unknown_sheet() {
        let err = parse_workbook_str("formulas:\n  Missing:\n    A1: =SUM(A:A)\n").unwrap_err();
        assert!(err.to_string().contains("unknown sheet 'Missing'"));
    }

    #[test]
    fn test_row_wider_than_columns() {
        let yaml = "sheets:\n  S:\n    columns: [a]\n    rows:\n      - [1, 2]\n";
        let err = parse_workbook_str(yaml).unwrap_err();
        assert!(matches!(err, SheetError::Validation(_)));
    }

    #[test]
    fn test_load_into_backend() {
        let workbook = parse_workbook_str(WORKBOOK).unwrap();
        let backend = workbook.load().unwrap();
        let sheet = backend.sheet("Sales").unwrap();
        assert_eq!(sheet.row_count, 3);
        assert_eq!(sheet.columns, vec!["amount", "category"]);
    }
}
