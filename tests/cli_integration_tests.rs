//! CLI Integration Tests
//!
//! Tests the CLI binary directly using assert_cmd to exercise main.rs code paths.

#![allow(deprecated)] // Command::cargo_bin deprecation - no stable replacement yet

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const WORKBOOK: &str = r#"
config:
  optimize_threshold: 2
sheets:
  Sales:
    columns: [value, category, region]
    rows:
      - [100, A, East]
      - [200, A, West]
      - [150, B, East]
      - [250, B, West]
      - [300, A, East]
      - [175, C, East]
      - [225, C, West]
      - [350, A, West]
formulas:
  Sales:
    E1: =SUMIFS(A:A, B:B, "A")
    E2: =SUMIFS(A:A, B:B, "A", C:C, "East")
    E3: =COUNTIFS(C:C, "East")
    E4: =AVERAGEIFS(A:A, B:B, "B")
    E5: =SUMIFS(A:A, B:B, "C")
    E6: =MATCH("C", B:B, 0)
"#;

fn write_workbook(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("book.yaml");
    fs::write(&path, content).unwrap();
    path
}

fn sheetsql() -> Command {
    let mut cmd = Command::cargo_bin("sheetsql").unwrap();
    cmd.env("NO_COLOR", "1");
    cmd
}

// ═══════════════════════════════════════════════════════════════════════════
// HELP AND VERSION TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_cli_help() {
    sheetsql()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sheetsql"))
        .stdout(predicate::str::contains("COMMANDS"));
}

#[test]
fn test_cli_version() {
    sheetsql()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sheetsql"));
}

#[test]
fn test_calculate_help() {
    sheetsql()
        .args(["calculate", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--no-optimize"))
        .stdout(predicate::str::contains("--threshold"));
}

// ═══════════════════════════════════════════════════════════════════════════
// CALCULATE
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_calculate_text_output() {
    let dir = TempDir::new().unwrap();
    let path = write_workbook(&dir, WORKBOOK);

    sheetsql()
        .arg("calculate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("E1 = 950"))
        .stdout(predicate::str::contains("E2 = 400"))
        .stdout(predicate::str::contains("E3 = 4"))
        .stdout(predicate::str::contains("E4 = 200"))
        .stdout(predicate::str::contains("E6 = 6"));
}

#[test]
fn test_calculate_json_output() {
    let dir = TempDir::new().unwrap();
    let path = write_workbook(&dir, WORKBOOK);

    let output = sheetsql()
        .arg("calculate")
        .arg(&path)
        .args(["--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let sales = &json["sheets"]["Sales"];
    assert_eq!(sales["values"]["E1"], 950.0);
    assert_eq!(sales["values"]["E5"], 400.0);
    // Only SUMIFS(A, B) reaches the threshold; AVERAGEIFS(A, B) is served from the same table
    assert_eq!(json["stats"]["optimization"]["materialized_aggregation_count"], 1);
    assert_eq!(sales["cache_served"], 3);
}

#[test]
fn test_calculate_without_optimization() {
    let dir = TempDir::new().unwrap();
    let path = write_workbook(&dir, WORKBOOK);

    let output = sheetsql()
        .arg("calculate")
        .arg(&path)
        .args(["--no-optimize", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["sheets"]["Sales"]["cache_served"], 0);
    assert_eq!(json["sheets"]["Sales"]["values"]["E2"], 400.0);
    assert_eq!(json["stats"]["optimization"]["pattern_count"], 0);
}

#[test]
fn test_calculate_reports_failed_formulas() {
    let dir = TempDir::new().unwrap();
    let path = write_workbook(
        &dir,
        "sheets:\n  S:\n    columns: [a]\n    rows:\n      - [1]\nformulas:\n  S:\n    B1: =SUM(A:A)\n    B2: =FOO(A:A)\n",
    );

    sheetsql()
        .arg("calculate")
        .arg(&path)
        .assert()
        .failure()
        .stdout(predicate::str::contains("B1 = 1"))
        .stdout(predicate::str::contains("Unsupported formula"))
        .stderr(predicate::str::contains("1 formula(s) failed"));
}

#[test]
fn test_calculate_missing_file() {
    sheetsql()
        .args(["calculate", "/nonexistent/book.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("IO error"));
}

#[test]
fn test_calculate_invalid_workbook() {
    let dir = TempDir::new().unwrap();
    let path = write_workbook(&dir, "formulas:\n  Ghost:\n    A1: =SUM(A:A)\n");

    sheetsql()
        .arg("calculate")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown sheet 'Ghost'"));
}

// ═══════════════════════════════════════════════════════════════════════════
// COMPILE AND ANALYZE
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_compile_prints_query() {
    let dir = TempDir::new().unwrap();
    let path = write_workbook(&dir, WORKBOOK);

    sheetsql()
        .arg("compile")
        .arg(&path)
        .args(["--sheet", "Sales", "=SUMIFS(A:A, B:B, \"A\")"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "SELECT COALESCE(SUM(try_double(\"value\")), 0) FROM \"sales\" WHERE \"category\" = 'A'",
        ));
}

#[test]
fn test_compile_unsupported_formula() {
    let dir = TempDir::new().unwrap();
    let path = write_workbook(&dir, WORKBOOK);

    sheetsql()
        .arg("compile")
        .arg(&path)
        .args(["--sheet", "Sales", "=UNSUPPORTED(A:A)"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cannot compile"));
}

#[test]
fn test_compile_unknown_sheet() {
    let dir = TempDir::new().unwrap();
    let path = write_workbook(&dir, WORKBOOK);

    sheetsql()
        .arg("compile")
        .arg(&path)
        .args(["--sheet", "Nope", "=SUM(A:A)"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Sheet not loaded: Nope"));
}

#[test]
fn test_analyze_lists_patterns() {
    let dir = TempDir::new().unwrap();
    let path = write_workbook(&dir, WORKBOOK);

    sheetsql()
        .arg("analyze")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Sales|SUMIFS|A|B"))
        .stdout(predicate::str::contains("cached"))
        .stdout(predicate::str::contains("Sales|COUNTIFS|C|C"))
        .stdout(predicate::str::contains("direct"))
        .stdout(predicate::str::contains("1 aggregation cache(s)"));
}
