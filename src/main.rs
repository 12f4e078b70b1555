//! maintcost: maintenance cost reporting from ERP transaction exports
//!
//! This is the main entrypoint that orchestrates loading, budget/forecast
//! projection, filtering and the breakdown views.

use std::fs::File;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use maintcost::report::{self, Breakdown};
use maintcost::{Args, MonthlySeries, PipelineCache, ProjectionTable, SourceFile};
use polars::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let filter = args.filter()?;
    let start_time = Instant::now();
    let cache = PipelineCache::new();

    // Step 1: Load and normalize
    let files = args
        .inputs
        .iter()
        .map(SourceFile::from_path)
        .collect::<Result<Vec<_>>>()?;
    let table = cache.load(&files, &args.load_options())?;
    println!(
        "✓ Data loaded: {} rows from {} file(s)",
        table.height(),
        files.len()
    );

    // Step 2: Budget and forecast on the full history
    let (budget, forecast) = cache.project(&table)?;
    match (budget.projected(), forecast.projected()) {
        (Some(b), Some(f)) => println!(
            "✓ Projection for {}: budget {:.2}, forecast {:.2}",
            b.period.format("%Y-%m"),
            b.value,
            f.value
        ),
        _ => println!("! Not enough monthly history to project budget and forecast"),
    }

    // Step 3: Filtered views
    let filtered = filter.apply(&table)?;
    if !filter.is_empty() {
        info!(?filter, rows = filtered.height(), "applied filter");
    }
    let actual = MonthlySeries::from_table(&filtered)?;
    let comparison = report::compare(&actual, &budget, &forecast);
    print_comparison(&comparison);

    if let Some(dimension) = args.breakdown {
        println!("\n=== {} ===", dimension.title());
        match report::breakdown(&filtered, dimension)? {
            Breakdown::Rows(rows) => {
                for row in rows.iter().take(args.top) {
                    println!("{:<40} {:>16.2}", row.key.join(" / "), row.cost);
                }
            }
            Breakdown::Unavailable { missing } => {
                println!("Column(s) {} absent from the loaded files", missing.join(", "));
            }
        }
    }

    if let Some(dir) = &args.output_dir {
        write_outputs(Path::new(dir), &budget, &forecast, &comparison)?;
        println!("\nTables saved to: {}", dir);
    }

    println!(
        "\nTotal processing time: {:.2}s",
        start_time.elapsed().as_secs_f64()
    );
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_comparison(rows: &[report::ComparisonRow]) {
    println!("\n=== Overview: Actual vs Budget vs Forecast ===");
    println!(
        "{:<8} {:>16} {:>16} {:>16}",
        "Period", "Actual", "Budget", "Forecast"
    );
    for row in rows {
        println!(
            "{:<8} {:>16.2} {:>16} {:>16}",
            row.period.format("%Y-%m"),
            row.actual,
            format_optional(row.budget),
            format_optional(row.forecast)
        );
    }
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v))
}

fn write_outputs(
    dir: &Path,
    budget: &ProjectionTable,
    forecast: &ProjectionTable,
    comparison: &[report::ComparisonRow],
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;

    write_csv(&dir.join("budget.csv"), &mut budget.to_dataframe()?)?;
    write_csv(&dir.join("forecast.csv"), &mut forecast.to_dataframe()?)?;
    write_csv(
        &dir.join("comparison.csv"),
        &mut report::comparison_frame(comparison)?,
    )?;
    Ok(())
}

fn write_csv(path: &Path, df: &mut DataFrame) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    Ok(())
}
