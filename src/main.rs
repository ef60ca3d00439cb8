use clap::{Parser, Subcommand};
use royalbit_sheetsql::cli::{self, OutputFormat, RunOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sheetsql")]
#[command(about = "Compile spreadsheet formulas to SQL and serve them from materialized caches.")]
#[command(long_about = "SheetSQL - Excel formulas as SQL queries

Formulas such as SUMIFS, COUNTIFS, AVERAGEIFS, VLOOKUP, INDEX and MATCH are
compiled to queries over sheet data loaded into an embedded SQL engine.
Shapes that repeat across many cells are pre-aggregated into cache tables
and answered in batches.

COMMANDS:
  calculate   - Evaluate every formula in a workbook file
  compile     - Print the query for one formula
  analyze     - Show repeated formula shapes and the caches they get

EXAMPLES:
  sheetsql calculate book.yaml --threshold 2
  sheetsql calculate book.yaml --format json
  sheetsql compile book.yaml --sheet Sales '=SUMIFS(A:A, B:B, \"A\")'

Set RUST_LOG to control logging (default: royalbit_sheetsql=warn).")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate every formula in a workbook file
    Calculate {
        /// Path to workbook YAML file
        file: PathBuf,
        /// Minimum occurrences before a formula shape is cached
        #[arg(short, long)]
        threshold: Option<usize>,
        /// Evaluate every formula directly, without building caches
        #[arg(long)]
        no_optimize: bool,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Show per-sheet cache usage and debug logging
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print the query a formula compiles to
    Compile {
        /// Path to workbook YAML file
        file: PathBuf,
        /// Sheet the formula lives on
        #[arg(short, long)]
        sheet: String,
        /// Formula text, e.g. =SUM(A:A)
        formula: String,
    },
    /// Show repeated formula shapes and the caches built for them
    Analyze {
        /// Path to workbook YAML file
        file: PathBuf,
        /// Minimum occurrences before a formula shape is cached
        #[arg(short, long)]
        threshold: Option<usize>,
        #[arg(short, long)]
        verbose: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "royalbit_sheetsql=debug"
    } else {
        "royalbit_sheetsql=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Calculate {
            file,
            threshold,
            no_optimize,
            format,
            verbose,
        } => {
            init_tracing(verbose);
            let options = RunOptions {
                threshold,
                no_optimize,
                verbose,
            };
            cli::calculate(file, options, format)?;
        }

        Commands::Compile {
            file,
            sheet,
            formula,
        } => {
            init_tracing(false);
            cli::compile(file, sheet, formula)?;
        }

        Commands::Analyze {
            file,
            threshold,
            verbose,
        } => {
            init_tracing(verbose);
            let options = RunOptions {
                threshold,
                no_optimize: false,
                verbose,
            };
            cli::analyze(file, options)?;
        }
    }

    Ok(())
}
