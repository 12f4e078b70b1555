//! Monthly cost aggregation and budget/forecast projection
//!
//! The budget extends the last month by the average trailing twelve-month
//! growth; the forecast comes from Holt's linear (additive trend, no season)
//! exponential smoothing with parameters estimated from the series itself.

use std::collections::BTreeMap;

use chrono::{Datelike, Months, NaiveDate};
use augurs_core::{Fit, Predict};
use augurs_ets::{AutoETS, FittedAutoETS};
use polars::prelude::*;
use tracing::{debug, warn};

use crate::data::{COST, POSTING_DATE};

/// Growth applied when no twelve-month-lagged value exists
pub const DEFAULT_GROWTH_RATE: f64 = 0.05;
/// Lag, in monthly points, of the trailing growth rate
pub const GROWTH_LAG: usize = 12;

/// Output column holding the calendar period (first day of month)
pub const PERIOD: &str = "Period";

const MIN_OBSERVATIONS: usize = 2;

/// Total cost booked in one calendar month
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonthlyPoint {
    /// First day of the month
    pub period: NaiveDate,
    pub total: f64,
}

/// Chronologically ordered monthly cost totals, one point per month present
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonthlySeries {
    points: Vec<MonthlyPoint>,
}

impl MonthlySeries {
    /// Aggregate a normalized table by calendar month of its posting date
    ///
    /// Rows without a posting date contribute to no month.
    pub fn from_table(df: &DataFrame) -> crate::Result<Self> {
        let dates = df.column(POSTING_DATE)?.date()?;
        let costs = df.column(COST)?.f64()?;

        Ok(Self::from_entries(
            dates
                .as_date_iter()
                .zip(costs.into_iter())
                .filter_map(|(date, cost)| date.map(|d| (d, cost.unwrap_or(0.0)))),
        ))
    }

    /// Build a series from dated amounts, summing amounts that share a month
    pub fn from_entries(entries: impl IntoIterator<Item = (NaiveDate, f64)>) -> Self {
        let mut totals: BTreeMap<NaiveDate, f64> = BTreeMap::new();
        for (date, amount) in entries {
            *totals.entry(month_start(date)).or_insert(0.0) += amount;
        }

        Self {
            points: totals
                .into_iter()
                .map(|(period, total)| MonthlyPoint { period, total })
                .collect(),
        }
    }

    pub fn points(&self) -> &[MonthlyPoint] {
        &self.points
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.total).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&MonthlyPoint> {
        self.points.last()
    }

    /// The month following the last historical period
    pub fn next_period(&self) -> Option<NaiveDate> {
        self.last()
            .and_then(|p| p.period.checked_add_months(Months::new(1)))
    }

    /// Total for a given month, if the month is present
    pub fn get(&self, period: NaiveDate) -> Option<f64> {
        let period = month_start(period);
        self.points
            .binary_search_by_key(&period, |p| p.period)
            .ok()
            .map(|idx| self.points[idx].total)
    }

    /// Expose the series as a `Period`/`<value_column>` frame
    pub fn to_dataframe(&self, value_column: &str) -> crate::Result<DataFrame> {
        let periods: Vec<NaiveDate> = self.points.iter().map(|p| p.period).collect();
        Ok(DataFrame::new(vec![
            Series::new(PERIOD.into(), periods).into_column(),
            Series::new(value_column.into(), self.values()).into_column(),
        ])?)
    }
}

/// First day of the month containing `date`
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Which projection a [`ProjectionTable`] carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectionKind {
    Budget,
    Forecast,
}

impl ProjectionKind {
    pub fn column_name(self) -> &'static str {
        match self {
            ProjectionKind::Budget => "Budget",
            ProjectionKind::Forecast => "Forecast",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionRow {
    pub period: NaiveDate,
    pub value: f64,
    pub year: i32,
    pub month: u32,
}

impl ProjectionRow {
    fn new(period: NaiveDate, value: f64) -> Self {
        Self {
            period,
            value,
            year: period.year(),
            month: period.month(),
        }
    }
}

/// Historical monthly totals followed by one projected month
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionTable {
    pub kind: ProjectionKind,
    pub rows: Vec<ProjectionRow>,
}

/// Budget projection: `Period, Budget, Year, Month`
pub type BudgetTable = ProjectionTable;
/// Statistical forecast: `Period, Forecast, Year, Month`
pub type ForecastTable = ProjectionTable;

impl ProjectionTable {
    pub fn empty(kind: ProjectionKind) -> Self {
        Self {
            kind,
            rows: Vec::new(),
        }
    }

    /// Relabel the history and append `projected` at the following month
    fn extend(
        kind: ProjectionKind,
        series: &MonthlySeries,
        next: NaiveDate,
        projected: f64,
    ) -> Self {
        let rows = series
            .points()
            .iter()
            .map(|p| ProjectionRow::new(p.period, p.total))
            .chain(std::iter::once(ProjectionRow::new(next, projected)))
            .collect();
        Self { kind, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The appended future row
    pub fn projected(&self) -> Option<&ProjectionRow> {
        self.rows.last()
    }

    pub fn value_at(&self, period: NaiveDate) -> Option<f64> {
        self.rows
            .iter()
            .find(|row| row.period == period)
            .map(|row| row.value)
    }

    /// Polars view with columns `Period` (Date), value (Float64), `Year` and `Month` (Int32)
    pub fn to_dataframe(&self) -> crate::Result<DataFrame> {
        let periods: Vec<NaiveDate> = self.rows.iter().map(|r| r.period).collect();
        let values: Vec<f64> = self.rows.iter().map(|r| r.value).collect();
        let years: Vec<i32> = self.rows.iter().map(|r| r.year).collect();
        let months: Vec<i32> = self.rows.iter().map(|r| r.month as i32).collect();

        Ok(DataFrame::new(vec![
            Series::new(PERIOD.into(), periods).into_column(),
            Series::new(self.kind.column_name().into(), values).into_column(),
            Series::new(crate::data::YEAR.into(), years).into_column(),
            Series::new(crate::data::MONTH.into(), months).into_column(),
        ])?)
    }
}

/// Project next month's budget and forecast from a normalized table
///
/// # Arguments
/// * `table` - Output of [`crate::data::load`], optionally filtered
///
/// # Returns
/// * `(BudgetTable, ForecastTable)`, both empty when fewer than two months
///   of history exist
pub fn project_budget_forecast(table: &DataFrame) -> crate::Result<(BudgetTable, ForecastTable)> {
    let series = MonthlySeries::from_table(table)?;
    Ok(project_series(&series))
}

/// Project next month's budget and forecast from an aggregated series
pub fn project_series(series: &MonthlySeries) -> (BudgetTable, ForecastTable) {
    let next = match series.next_period() {
        Some(next) if series.len() >= 2 => next,
        _ => {
            debug!(points = series.len(), "not enough history to project");
            return (
                ProjectionTable::empty(ProjectionKind::Budget),
                ProjectionTable::empty(ProjectionKind::Forecast),
            );
        }
    };

    let values = series.values();
    let budget = project_budget(&values);
    let forecast = project_forecast(&values);
    debug!(%next, budget, forecast, "projected next period");

    (
        ProjectionTable::extend(ProjectionKind::Budget, series, next, budget),
        ProjectionTable::extend(ProjectionKind::Forecast, series, next, forecast),
    )
}

/// Percentage change against the value `lag` points earlier
///
/// One entry per point from index `lag` on. A zero base yields a non-finite rate.
pub fn trailing_growth(values: &[f64], lag: usize) -> Vec<f64> {
    if lag == 0 || values.len() <= lag {
        return Vec::new();
    }
    values
        .windows(lag + 1)
        .map(|w| (w[lag] - w[0]) / w[0])
        .collect()
}

/// Mean of the finite trailing twelve-month growth rates
///
/// Falls back to [`DEFAULT_GROWTH_RATE`] when fewer than 13 points exist or
/// no finite rate can be computed.
pub fn mean_growth_12(values: &[f64]) -> f64 {
    let rates: Vec<f64> = trailing_growth(values, GROWTH_LAG)
        .into_iter()
        .filter(|g| g.is_finite())
        .collect();

    if rates.is_empty() {
        DEFAULT_GROWTH_RATE
    } else {
        rates.iter().sum::<f64>() / rates.len() as f64
    }
}

/// Last value grown by the mean trailing twelve-month growth
pub fn project_budget(values: &[f64]) -> f64 {
    let last = values.last().copied().unwrap_or(0.0);
    last * (1.0 + mean_growth_12(values))
}

/// One-step Holt forecast, or the last value when the fit is degenerate
pub fn project_forecast(values: &[f64]) -> f64 {
    let last = values.last().copied().unwrap_or(0.0);
    match HoltLinear::fit(values).and_then(|model| model.forecast(1)) {
        Ok(next) => next,
        Err(err) => {
            warn!(error = %err, "exponential smoothing fit failed, using last value");
            last
        }
    }
}

/// Numerical conditions under which the smoothing model cannot be fitted
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    #[error("at least {required} observations are required, got {actual}")]
    InsufficientData { required: usize, actual: usize },
    #[error("observation {index} is not finite")]
    NonFiniteObservation { index: usize },
    #[error("series has zero variance")]
    ZeroVariance,
    #[error("exponential smoothing estimation failed: {0}")]
    Estimation(String),
    #[error("forecast is not finite")]
    NonFiniteForecast,
}

/// Holt's linear trend exponential smoothing (ETS `AAN`, undamped)
///
/// Smoothing parameters and initial states are estimated by `augurs-ets`.
/// The series is fitted on a copy scaled to unit maximum magnitude and
/// forecasts are scaled back, so tiny or huge cost totals fit alike.
pub struct HoltLinear {
    model: FittedAutoETS,
    scale: f64,
    n_obs: usize,
}

impl std::fmt::Debug for HoltLinear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HoltLinear")
            .field("scale", &self.scale)
            .field("n_obs", &self.n_obs)
            .finish_non_exhaustive()
    }
}

impl HoltLinear {
    /// Fit the model to `values`
    ///
    /// # Arguments
    /// * `values` - Monthly totals in chronological order
    ///
    /// # Returns
    /// * `Ok(HoltLinear)` when the fit and its one-step forecast are finite
    /// * `Err(FitError)` for degenerate input or a failed estimation
    pub fn fit(values: &[f64]) -> Result<Self, FitError> {
        if values.len() < MIN_OBSERVATIONS {
            return Err(FitError::InsufficientData {
                required: MIN_OBSERVATIONS,
                actual: values.len(),
            });
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(FitError::NonFiniteObservation { index });
        }

        let scale = values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max - min <= f64::EPSILON * scale {
            return Err(FitError::ZeroVariance);
        }

        let scaled: Vec<f64> = values.iter().map(|v| v / scale).collect();
        let search =
            AutoETS::new(1, "AAN").map_err(|e| FitError::Estimation(e.to_string()))?;
        let model = search
            .damped(false)
            .map_err(|e| FitError::Estimation(e.to_string()))?
            .fit(&scaled)
            .map_err(|e| FitError::Estimation(e.to_string()))?;

        let fitted = Self {
            model,
            scale,
            n_obs: values.len(),
        };
        let next = fitted.forecast(1)?;
        debug!(n_obs = fitted.n_obs, scale, next, "fitted exponential smoothing");
        Ok(fitted)
    }

    /// Point forecast `horizon` steps past the last observation
    pub fn forecast(&self, horizon: usize) -> Result<f64, FitError> {
        let forecast = self
            .model
            .predict(horizon.max(1), None)
            .map_err(|e| FitError::Estimation(e.to_string()))?;
        let value = forecast
            .point
            .last()
            .map(|v| v * self.scale)
            .ok_or(FitError::NonFiniteForecast)?;
        if !value.is_finite() {
            return Err(FitError::NonFiniteForecast);
        }
        Ok(value)
    }

    /// Number of observations the model was fitted on
    pub fn n_obs(&self) -> usize {
        self.n_obs
    }
}
