//! maintcost: maintenance cost analytics over ERP transaction exports
//!
//! This library loads maintenance-cost line items from spreadsheet exports,
//! aggregates them into monthly series, and projects next month's budget
//! (trailing year-over-year growth) and forecast (Holt linear exponential
//! smoothing). A reporting layer provides the filtered cost breakdowns.

pub mod cache;
pub mod cli;
pub mod data;
pub mod model;
pub mod report;

// Re-export public items for easier access
pub use cache::PipelineCache;
pub use cli::Args;
pub use data::{load, LoadOptions, SourceFile};
pub use model::{
    project_budget_forecast, BudgetTable, FitError, ForecastTable, HoltLinear, MonthlySeries,
    ProjectionKind, ProjectionTable,
};
pub use report::{Breakdown, Dimension, Filter};

/// Common result type used throughout the application
pub type Result<T> = anyhow::Result<T>;
