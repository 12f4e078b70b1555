//! Time-bounded memoization of the load and projection steps
//!
//! Both steps are pure, so a cached result is always identical to a fresh
//! computation; entries simply expire after the time-to-live.

use std::time::Duration;

use moka::sync::Cache;
use polars::prelude::DataFrame;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::data::{self, LoadOptions, SourceFile};
use crate::model::{self, BudgetTable, ForecastTable, MonthlySeries};

/// How long cached tables stay valid
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

const MAX_ENTRIES: u64 = 64;

/// Caches normalized tables by input fingerprint and projections by series fingerprint
#[derive(Clone)]
pub struct PipelineCache {
    tables: Cache<String, DataFrame>,
    projections: Cache<String, (BudgetTable, ForecastTable)>,
}

impl Default for PipelineCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            tables: Cache::builder()
                .max_capacity(MAX_ENTRIES)
                .time_to_live(ttl)
                .build(),
            projections: Cache::builder()
                .max_capacity(MAX_ENTRIES)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// [`data::load`], memoized on the exact files and options
    pub fn load(&self, files: &[SourceFile], options: &LoadOptions) -> crate::Result<DataFrame> {
        let key = files_fingerprint(files, options);
        if let Some(table) = self.tables.get(&key) {
            debug!(key = %key, "table cache hit");
            return Ok(table);
        }

        let table = data::load(files, options)?;
        self.tables.insert(key, table.clone());
        Ok(table)
    }

    /// [`model::project_budget_forecast`], memoized on the table's monthly series
    pub fn project(&self, table: &DataFrame) -> crate::Result<(BudgetTable, ForecastTable)> {
        let series = MonthlySeries::from_table(table)?;
        let key = series_fingerprint(&series);
        if let Some(projection) = self.projections.get(&key) {
            debug!(key = %key, "projection cache hit");
            return Ok(projection);
        }

        let projection = model::project_series(&series);
        self.projections.insert(key, projection.clone());
        Ok(projection)
    }

    pub fn invalidate_all(&self) {
        self.tables.invalidate_all();
        self.projections.invalidate_all();
    }
}

/// SHA-256 over file names, contents (length-prefixed) and load options
pub fn files_fingerprint(files: &[SourceFile], options: &LoadOptions) -> String {
    let mut hasher = Sha256::new();
    for field in [&options.date_column, &options.amount_column, &options.sheet] {
        update_prefixed(&mut hasher, field.as_bytes());
    }
    for file in files {
        update_prefixed(&mut hasher, file.name.as_bytes());
        update_prefixed(&mut hasher, &file.bytes);
    }
    hex::encode(hasher.finalize())
}

/// SHA-256 over the periods and exact bit patterns of the totals
pub fn series_fingerprint(series: &MonthlySeries) -> String {
    let mut hasher = Sha256::new();
    for point in series.points() {
        hasher.update(point.period.to_string().as_bytes());
        hasher.update(point.total.to_bits().to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

fn update_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
