use crate::core::{BatchReport, Calculator, CalculatorConfig, CalculatorStats};
use crate::error::{SheetError, SheetResult};
use crate::parser::{self, Workbook};
use crate::storage::Backend;
use crate::types::Value;
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Options shared by `calculate` and `analyze`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub threshold: Option<usize>,
    pub no_optimize: bool,
    pub verbose: bool,
}

impl RunOptions {
    /// File config with command-line overrides applied
    fn apply(&self, config: &CalculatorConfig) -> CalculatorConfig {
        let mut config = config.clone();
        if let Some(threshold) = self.threshold {
            config.optimize_threshold = threshold;
        }
        if self.no_optimize {
            config.auto_optimize = false;
        }
        config
    }
}

#[derive(Serialize)]
struct CalculateOutput<'a> {
    sheets: &'a BTreeMap<String, BatchReport>,
    stats: CalculatorStats,
}

fn open(file: &Path, options: &RunOptions) -> SheetResult<(Workbook, Calculator)> {
    let workbook = parser::parse_workbook(file)?;
    let backend: Arc<dyn Backend> = Arc::new(workbook.load()?);
    let calculator = Calculator::new(backend, options.apply(&workbook.config));
    Ok((workbook, calculator))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "(empty)".dimmed().to_string(),
        Value::Text(s) => format!("\"{}\"", s),
        other => other.to_string(),
    }
}

/// Execute the calculate command
pub fn calculate(file: PathBuf, options: RunOptions, format: OutputFormat) -> SheetResult<()> {
    let (workbook, calculator) = open(&file, &options)?;

    let mut reports = BTreeMap::new();
    for (sheet, formulas) in &workbook.formulas {
        reports.insert(sheet.clone(), calculator.calc_cells(sheet, formulas));
    }
    let failed: usize = reports.values().map(|r| r.errors.len()).sum();

    match format {
        OutputFormat::Json => {
            let output = CalculateOutput {
                sheets: &reports,
                stats: calculator.stats(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => print_reports(&file, &workbook, &reports, &calculator, options.verbose),
    }

    if failed > 0 {
        return Err(SheetError::Validation(format!("{} formula(s) failed", failed)));
    }
    Ok(())
}

fn print_reports(
    file: &Path,
    workbook: &Workbook,
    reports: &BTreeMap<String, BatchReport>,
    calculator: &Calculator,
    verbose: bool,
) {
    println!("{}", "SheetSQL - Calculating formulas".bold().green());
    println!("   File: {}", file.display());
    println!(
        "   {} sheet(s), {} formula(s)\n",
        workbook.sheets.len(),
        workbook.formula_count()
    );

    for (sheet, report) in reports {
        println!("   Sheet: {}", sheet.bright_blue().bold());
        for (cell, value) in &report.values {
            println!("      {} = {}", cell.cyan(), display_value(value).bold());
        }
        for (cell, error) in &report.errors {
            println!("      {} {}", cell.cyan(), format!("error: {}", error).red());
        }
        if verbose {
            println!(
                "      {} from cache, {} from memo",
                report.cache_served, report.memo_served
            );
        }
    }
    println!();

    let stats = calculator.stats();
    println!("{}", "Cache:".bold());
    println!(
        "   {} pattern(s), {} aggregation cache(s), {} match index(es)",
        stats.optimization.pattern_count,
        stats.optimization.materialized_aggregation_count,
        stats.optimization.materialized_lookup_count
    );
}

/// Execute the compile command: print the query for one formula
pub fn compile(file: PathBuf, sheet: String, formula: String) -> SheetResult<()> {
    let (_, calculator) = open(&file, &RunOptions::default())?;
    if !calculator.is_sheet_loaded(&sheet) {
        return Err(SheetError::SheetNotLoaded(sheet));
    }

    match calculator.compile(&sheet, &formula) {
        Ok(query) => {
            println!("{}", query.query_text);
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "Cannot compile:".red().bold(), formula);
            Err(e)
        }
    }
}

/// Execute the analyze command: observe all formulas, optimize, report
pub fn analyze(file: PathBuf, options: RunOptions) -> SheetResult<()> {
    let (workbook, calculator) = open(&file, &options)?;
    let threshold = calculator.config().optimize_threshold;

    for (sheet, formulas) in &workbook.formulas {
        calculator.cache().observe(sheet, formulas);
    }
    let report = calculator.cache().optimize(threshold);

    println!("{}", "SheetSQL - Formula patterns".bold().green());
    println!("   File: {}", file.display());
    println!("   Threshold: {}\n", threshold);

    let patterns = calculator.cache().patterns();
    if patterns.is_empty() {
        println!("   {}", "No cacheable formula shapes found".yellow());
    }
    for pattern in &patterns {
        let key = pattern.key();
        let status = if calculator.cache().is_optimized(&key) {
            "cached".green()
        } else {
            "direct".yellow()
        };
        println!(
            "   {:>5}x  {:<40} {}",
            pattern.occurrence_count,
            key.to_string().bright_blue(),
            status
        );
    }
    for (key, error) in &report.failed {
        println!("   {} {}: {}", "failed".red().bold(), key, error);
    }

    let stats = calculator.cache().stats();
    println!();
    println!("{}", "Formulas by function:".bold());
    for (function, count) in &stats.formula_count_by_function {
        println!("   {:<12} {}", function.cyan(), count);
    }
    println!();
    println!(
        "   {} aggregation cache(s), {} match index(es), {} materialization(s)",
        stats.materialized_aggregation_count,
        stats.materialized_lookup_count,
        stats.materialization_count
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_options_override_config() {
        let options = RunOptions {
            threshold: Some(2),
            no_optimize: true,
            verbose: false,
        };
        let config = options.apply(&CalculatorConfig::default());
        assert_eq!(config.optimize_threshold, 2);
        assert!(!config.auto_optimize);
        assert!(config.enable_result_cache);
    }

    #[test]
    fn test_run_options_keep_file_config() {
        let file = CalculatorConfig {
            optimize_threshold: 4,
            ..CalculatorConfig::default()
        };
        assert_eq!(RunOptions::default().apply(&file), file);
    }
}
