//! Cell and range reference parsing
//!
//! Recognizes `A:A`, `$A:$C`, `A1:B10`, `Sheet1!A:A` and `'My Sheet'!A1`.
//! Dollar anchors are accepted and dropped: `$A$1` and `A1` parse to the
//! same reference.

use once_cell::sync::Lazy;
use regex::Regex;

const SHEET_PREFIX: &str = r"(?:'((?:[^']|'')+)'!|([A-Za-z_][A-Za-z0-9_.]*)!)?";

static COLUMN_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^{}\$?([A-Za-z]{{1,3}}):\$?([A-Za-z]{{1,3}})$",
        SHEET_PREFIX
    ))
    .expect("column range pattern is valid")
});

static CELL_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^{}\$?([A-Za-z]{{1,3}})\$?(\d+):\$?([A-Za-z]{{1,3}})\$?(\d+)$",
        SHEET_PREFIX
    ))
    .expect("cell range pattern is valid")
});

static CELL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^{}\$?([A-Za-z]{{1,3}})\$?(\d+)$", SHEET_PREFIX))
        .expect("cell pattern is valid")
});

/// A parsed range reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRef {
    /// Explicit sheet prefix; overrides the formula's home sheet
    pub sheet: Option<String>,
    pub start_col: String,
    pub end_col: String,
    /// 1-based; `None` for whole-column references
    pub start_row: Option<u32>,
    pub end_row: Option<u32>,
    pub is_column_range: bool,
}

impl RangeRef {
    /// The sheet this range lives on, given the formula's home sheet
    pub fn target_sheet<'a>(&'a self, home: &'a str) -> &'a str {
        self.sheet.as_deref().unwrap_or(home)
    }

    /// Column letters spanned by the range, left to right
    pub fn columns(&self) -> Vec<String> {
        match (
            column_letter_to_index(&self.start_col),
            column_letter_to_index(&self.end_col),
        ) {
            (Some(start), Some(end)) => (start..=end).map(column_index_to_letter).collect(),
            _ => vec![self.start_col.clone()],
        }
    }

    /// Row span for row-bounded ranges
    pub fn row_bounds(&self) -> Option<(u32, u32)> {
        match (self.start_row, self.end_row) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }

    /// Range covering exactly one cell
    pub fn from_cell(cell: &CellRef) -> Self {
        Self {
            sheet: cell.sheet.clone(),
            start_col: cell.column.clone(),
            end_col: cell.column.clone(),
            start_row: Some(cell.row),
            end_row: Some(cell.row),
            is_column_range: false,
        }
    }
}

/// A parsed single-cell reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRef {
    pub sheet: Option<String>,
    pub column: String,
    /// 1-based
    pub row: u32,
}

impl CellRef {
    pub fn target_sheet<'a>(&'a self, home: &'a str) -> &'a str {
        self.sheet.as_deref().unwrap_or(home)
    }
}

fn sheet_from(caps: &regex::Captures<'_>) -> Option<String> {
    caps.get(1)
        .map(|m| m.as_str().replace("''", "'"))
        .or_else(|| caps.get(2).map(|m| m.as_str().to_string()))
}

fn parse_row(text: &str) -> Option<u32> {
    text.parse::<u32>().ok().filter(|row| *row > 0)
}

/// Parse a range reference; `None` means "not a range", not an error
pub fn parse_range(text: &str) -> Option<RangeRef> {
    let text = text.trim();

    if let Some(caps) = COLUMN_RANGE_RE.captures(text) {
        let (start_col, end_col) = ordered_columns(&caps[3], &caps[4]);
        return Some(RangeRef {
            sheet: sheet_from(&caps),
            start_col,
            end_col,
            start_row: None,
            end_row: None,
            is_column_range: true,
        });
    }

    if let Some(caps) = CELL_RANGE_RE.captures(text) {
        let (start_col, end_col) = ordered_columns(&caps[3], &caps[5]);
        let first = parse_row(&caps[4])?;
        let second = parse_row(&caps[6])?;
        return Some(RangeRef {
            sheet: sheet_from(&caps),
            start_col,
            end_col,
            start_row: Some(first.min(second)),
            end_row: Some(first.max(second)),
            is_column_range: false,
        });
    }

    None
}

/// Parse a single-cell reference such as `B7`, `$B$7` or `Data!B7`
pub fn parse_cell(text: &str) -> Option<CellRef> {
    let caps = CELL_RE.captures(text.trim())?;
    Some(CellRef {
        sheet: sheet_from(&caps),
        column: caps[3].to_ascii_uppercase(),
        row: parse_row(&caps[4])?,
    })
}

fn ordered_columns(a: &str, b: &str) -> (String, String) {
    let a = a.to_ascii_uppercase();
    let b = b.to_ascii_uppercase();
    match (column_letter_to_index(&a), column_letter_to_index(&b)) {
        (Some(x), Some(y)) if x > y => (b, a),
        _ => (a, b),
    }
}

/// Convert a 0-based column index to its letter (0 → A, 25 → Z, 26 → AA)
pub fn column_index_to_letter(index: usize) -> String {
    let mut result = String::new();
    let mut idx = index;

    loop {
        let remainder = idx % 26;
        result.insert(0, (b'A' + remainder as u8) as char);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }

    result
}

/// Convert a column letter to its 0-based index (A → 0, AA → 26)
///
/// Returns `None` for empty input, non-letters, or overflow.
pub fn column_letter_to_index(letter: &str) -> Option<usize> {
    if letter.is_empty() {
        return None;
    }
    let mut result: usize = 0;
    for c in letter.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        let digit = (c.to_ascii_uppercase() as u8 - b'A') as usize + 1;
        result = result.checked_mul(26)?.checked_add(digit)?;
    }
    Some(result - 1)
}
