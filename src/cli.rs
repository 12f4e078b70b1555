//! Command-line interface definitions and argument parsing

use clap::Parser;

use crate::data::{LoadOptions, DEFAULT_AMOUNT_COLUMN, DEFAULT_SHEET, POSTING_DATE};
use crate::report::{Dimension, Filter};

/// Maintenance cost report: actual vs budget vs forecast, with cost breakdowns
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Transaction export to load (xlsx/xls/ods or CSV); repeat for several files
    #[arg(short, long = "input", required = true)]
    pub inputs: Vec<String>,

    /// Worksheet to read from workbook files
    #[arg(long, default_value = DEFAULT_SHEET)]
    pub sheet: String,

    /// Column holding the posting date
    #[arg(long, default_value = POSTING_DATE)]
    pub date_column: String,

    /// Column holding the profit-center local currency amount
    #[arg(long, default_value = DEFAULT_AMOUNT_COLUMN)]
    pub amount_column: String,

    /// Only show this year
    #[arg(short, long)]
    pub year: Option<i32>,

    /// Only show this month (1-12)
    #[arg(short, long)]
    pub month: Option<u32>,

    /// Only show this plant
    #[arg(short, long)]
    pub plant: Option<String>,

    /// Only show this region (business area)
    #[arg(long)]
    pub region: Option<String>,

    /// Only show this country (controlling area)
    #[arg(long)]
    pub country: Option<String>,

    /// Cost breakdown to print
    #[arg(short, long, value_enum)]
    pub breakdown: Option<Dimension>,

    /// Number of breakdown rows to print
    #[arg(long, default_value = "10")]
    pub top: usize,

    /// Directory receiving budget.csv, forecast.csv and comparison.csv
    #[arg(short, long)]
    pub output_dir: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            date_column: self.date_column.clone(),
            amount_column: self.amount_column.clone(),
            sheet: self.sheet.clone(),
        }
    }

    /// Build the row filter from the filter flags
    pub fn filter(&self) -> crate::Result<Filter> {
        if let Some(month) = self.month {
            if !(1..=12).contains(&month) {
                anyhow::bail!("Month must be between 1 and 12, got {}", month);
            }
        }

        Ok(Filter {
            year: self.year,
            month: self.month,
            plant: self.plant.clone(),
            region: self.region.clone(),
            country: self.country.clone(),
        })
    }
}
