//! Filtered views and cost breakdowns over the normalized table
//!
//! One parameterized implementation of the dashboard views: a row filter on
//! year/month/plant/region/country, per-dimension cost rankings, the monthly
//! cost of rows booked without a maintenance order, and the
//! Actual/Budget/Forecast comparison.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use clap::ValueEnum;
use polars::prelude::*;
use tracing::warn;

use crate::data::{column_as_text, COST, MONTH, YEAR};
use crate::model::{MonthlySeries, ProjectionTable, PERIOD};

pub const PLANT: &str = "Plant";
pub const REGION: &str = "Business Area";
pub const COUNTRY: &str = "Controlling Area";
pub const ORDER: &str = "Order";

/// Row selection applied before building a view; `None` matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Filter {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub plant: Option<String>,
    /// Business area
    pub region: Option<String>,
    /// Controlling area
    pub country: Option<String>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Keep the rows matching every criterion that is set
    ///
    /// A criterion on a column the table does not have matches no row.
    pub fn apply(&self, df: &DataFrame) -> crate::Result<DataFrame> {
        if self.is_empty() {
            return Ok(df.clone());
        }

        let mut keep = vec![true; df.height()];

        if let Some(year) = self.year {
            restrict_int(df, YEAR, year, &mut keep)?;
        }
        if let Some(month) = self.month {
            restrict_int(df, MONTH, month as i32, &mut keep)?;
        }
        for (column, wanted) in [
            (PLANT, &self.plant),
            (REGION, &self.region),
            (COUNTRY, &self.country),
        ] {
            if let Some(wanted) = wanted {
                restrict_text(df, column, wanted, &mut keep)?;
            }
        }

        let mask: BooleanChunked = keep.into_iter().collect();
        Ok(df.filter(&mask)?)
    }
}

fn restrict_int(
    df: &DataFrame,
    column: &str,
    wanted: i32,
    keep: &mut [bool],
) -> crate::Result<()> {
    match df.column(column) {
        Ok(values) => {
            let values = values.cast(&DataType::Int32)?;
            for (flag, value) in keep.iter_mut().zip(values.i32()?.into_iter()) {
                *flag &= value == Some(wanted);
            }
        }
        Err(_) => keep.fill(false),
    }
    Ok(())
}

fn restrict_text(
    df: &DataFrame,
    column: &str,
    wanted: &str,
    keep: &mut [bool],
) -> crate::Result<()> {
    match df.column(column) {
        Ok(values) => {
            for (flag, value) in keep.iter_mut().zip(column_as_text(values)?) {
                *flag &= value.as_deref() == Some(wanted);
            }
        }
        Err(_) => {
            warn!(column, "filter column missing, no rows match");
            keep.fill(false);
        }
    }
    Ok(())
}

/// Sorted distinct non-null values of a column, e.g. to populate a selector
///
/// An absent column yields no values.
pub fn distinct_values(df: &DataFrame, column: &str) -> crate::Result<Vec<String>> {
    let Ok(values) = df.column(column) else {
        return Ok(Vec::new());
    };
    let distinct: BTreeSet<String> = column_as_text(values)?.into_iter().flatten().collect();
    Ok(distinct.into_iter().collect())
}

/// Distinct values of `column` among the rows `scope` keeps
///
/// Drives dependent selectors: countries offered for the chosen region,
/// months for the chosen year, plants for the chosen country.
pub fn distinct_values_within(
    df: &DataFrame,
    column: &str,
    scope: &Filter,
) -> crate::Result<Vec<String>> {
    if scope.is_empty() {
        return distinct_values(df, column);
    }
    distinct_values(&scope.apply(df)?, column)
}

/// Years present in the table, ascending
pub fn available_years(df: &DataFrame) -> crate::Result<Vec<i32>> {
    let years: BTreeSet<i32> = df.column(YEAR)?.i32()?.into_iter().flatten().collect();
    Ok(years.into_iter().collect())
}

/// Cost breakdown views
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Dimension {
    Plant,
    /// Functional location
    FunctionalArea,
    Equipment,
    Vendor,
    Material,
    Order,
    /// Stop ID together with its cause
    Stoppage,
}

impl Dimension {
    pub const ALL: [Dimension; 7] = [
        Dimension::Plant,
        Dimension::FunctionalArea,
        Dimension::Equipment,
        Dimension::Vendor,
        Dimension::Material,
        Dimension::Order,
        Dimension::Stoppage,
    ];

    /// Grouping columns of the view
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Dimension::Plant => &[PLANT],
            Dimension::FunctionalArea => &["Functional Area"],
            Dimension::Equipment => &["Equipment"],
            Dimension::Vendor => &["Vendor"],
            Dimension::Material => &["Material"],
            Dimension::Order => &[ORDER],
            Dimension::Stoppage => &["Stop ID", "Stop Cause"],
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Dimension::Plant => "Total Cost by Plant",
            Dimension::FunctionalArea => "Cost at Functional Location",
            Dimension::Equipment => "Cost at Equipment",
            Dimension::Vendor => "Cost at Vendor",
            Dimension::Material => "Cost at Material",
            Dimension::Order => "Cost at Order",
            Dimension::Stoppage => "Cost at Stoppages",
        }
    }
}

/// Total cost of one breakdown key
#[derive(Debug, Clone, PartialEq)]
pub struct BreakdownRow {
    /// One value per grouping column of the dimension
    pub key: Vec<String>,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Breakdown {
    /// Keys ordered by descending cost
    Rows(Vec<BreakdownRow>),
    /// The loaded files lack columns this view needs
    Unavailable { missing: Vec<String> },
}

impl Breakdown {
    pub fn rows(&self) -> &[BreakdownRow] {
        match self {
            Breakdown::Rows(rows) => rows,
            Breakdown::Unavailable { .. } => &[],
        }
    }

    pub fn top(&self, n: usize) -> &[BreakdownRow] {
        let rows = self.rows();
        &rows[..n.min(rows.len())]
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Breakdown::Rows(_))
    }
}

/// Sum cost per key of a dimension, most expensive first
///
/// Rows where any key column is null are left out. Ties are ordered by key.
pub fn breakdown(df: &DataFrame, dimension: Dimension) -> crate::Result<Breakdown> {
    let missing: Vec<String> = dimension
        .columns()
        .iter()
        .filter(|name| df.get_column_index(name).is_none())
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        warn!(?dimension, ?missing, "breakdown unavailable");
        return Ok(Breakdown::Unavailable { missing });
    }

    let keys = dimension
        .columns()
        .iter()
        .map(|name| column_as_text(df.column(name)?))
        .collect::<crate::Result<Vec<_>>>()?;
    let costs = df.column(COST)?.f64()?;

    let mut totals: BTreeMap<Vec<String>, f64> = BTreeMap::new();
    for (row, cost) in costs.into_iter().enumerate() {
        let key: Option<Vec<String>> = keys.iter().map(|column| column[row].clone()).collect();
        if let Some(key) = key {
            *totals.entry(key).or_insert(0.0) += cost.unwrap_or(0.0);
        }
    }

    let mut rows: Vec<BreakdownRow> = totals
        .into_iter()
        .map(|(key, cost)| BreakdownRow { key, cost })
        .collect();
    rows.sort_by(|a, b| b.cost.total_cmp(&a.cost).then_with(|| a.key.cmp(&b.key)));

    Ok(Breakdown::Rows(rows))
}

/// Monthly cost of rows not settled to a maintenance order
///
/// Without an `Order` column no row carries an order, so every row counts.
pub fn cost_without_order(df: &DataFrame) -> crate::Result<MonthlySeries> {
    match df.column(ORDER) {
        Ok(orders) => {
            let mask = orders.is_null();
            MonthlySeries::from_table(&df.filter(&mask)?)
        }
        Err(_) => MonthlySeries::from_table(df),
    }
}

/// One month of the Actual/Budget/Forecast overview
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComparisonRow {
    pub period: NaiveDate,
    pub actual: f64,
    pub budget: Option<f64>,
    pub forecast: Option<f64>,
}

/// Left-join actual monthly cost with the budget and forecast tables by period
pub fn compare(
    actual: &MonthlySeries,
    budget: &ProjectionTable,
    forecast: &ProjectionTable,
) -> Vec<ComparisonRow> {
    actual
        .points()
        .iter()
        .map(|point| ComparisonRow {
            period: point.period,
            actual: point.total,
            budget: budget.value_at(point.period),
            forecast: forecast.value_at(point.period),
        })
        .collect()
}

/// Polars view of the comparison: `Period, Actual, Budget, Forecast`
pub fn comparison_frame(rows: &[ComparisonRow]) -> crate::Result<DataFrame> {
    let periods: Vec<NaiveDate> = rows.iter().map(|r| r.period).collect();
    let actual: Vec<f64> = rows.iter().map(|r| r.actual).collect();
    let budget: Vec<Option<f64>> = rows.iter().map(|r| r.budget).collect();
    let forecast: Vec<Option<f64>> = rows.iter().map(|r| r.forecast).collect();

    Ok(DataFrame::new(vec![
        Series::new(PERIOD.into(), periods).into_column(),
        Series::new("Actual".into(), actual).into_column(),
        Series::new("Budget".into(), budget).into_column(),
        Series::new("Forecast".into(), forecast).into_column(),
    ])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{load, LoadOptions, SourceFile};
    use crate::model::project_series;

    fn sample_table() -> DataFrame {
        let csv = "Posting Date,In profit center local currency,Plant,Business Area,Controlling Area,Vendor,Order,Stop ID,Stop Cause\n\
                   2023-01-10,100,1000,EMEA,FR01,ACME,4000001,S1,Bearing\n\
                   2023-01-20,50,1000,EMEA,FR01,Globex,,S1,Bearing\n\
                   2023-02-05,70,2000,EMEA,DE01,ACME,4000002,,\n\
                   2024-01-15,30,1000,EMEA,FR01,Initech,,S2,Motor\n\
                   2024-02-15,200,3000,APAC,CN01,ACME,4000003,S2,Motor\n\
                   bad-date,10,1000,EMEA,FR01,Globex,4000004,S3,Belt\n";
        load(
            &[SourceFile::new("sample.csv", csv.as_bytes().to_vec())],
            &LoadOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_filter_year_and_plant() {
        let df = sample_table();

        let filter = Filter {
            year: Some(2023),
            plant: Some("1000".to_string()),
            ..Filter::default()
        };
        let filtered = filter.apply(&df).unwrap();
        assert_eq!(filtered.height(), 2);

        let all = Filter::default().apply(&df).unwrap();
        assert_eq!(all.height(), df.height());
    }

    #[test]
    fn test_filter_region_country_month() {
        let df = sample_table();
        let filter = Filter {
            month: Some(2),
            region: Some("EMEA".to_string()),
            country: Some("DE01".to_string()),
            ..Filter::default()
        };
        assert_eq!(filter.apply(&df).unwrap().height(), 1);

        let unknown = Filter {
            plant: Some("9999".to_string()),
            ..Filter::default()
        };
        assert_eq!(unknown.apply(&df).unwrap().height(), 0);
    }

    #[test]
    fn test_filter_on_missing_column_matches_nothing() {
        let csv = "Posting Date,In profit center local currency\n2023-01-01,5\n";
        let df = load(
            &[SourceFile::new("a.csv", csv.as_bytes().to_vec())],
            &LoadOptions::default(),
        )
        .unwrap();
        let filter = Filter {
            plant: Some("1000".to_string()),
            ..Filter::default()
        };
        assert_eq!(filter.apply(&df).unwrap().height(), 0);
    }

    #[test]
    fn test_distinct_values_and_years() {
        let df = sample_table();
        assert_eq!(
            distinct_values(&df, PLANT).unwrap(),
            vec!["1000", "2000", "3000"]
        );
        assert_eq!(distinct_values(&df, REGION).unwrap(), vec!["APAC", "EMEA"]);
        assert!(distinct_values(&df, "Nope").unwrap().is_empty());
        assert_eq!(available_years(&df).unwrap(), vec![2023, 2024]);
    }

    #[test]
    fn test_distinct_values_cascade() {
        let df = sample_table();

        let emea = Filter {
            region: Some("EMEA".to_string()),
            ..Filter::default()
        };
        assert_eq!(
            distinct_values_within(&df, COUNTRY, &emea).unwrap(),
            vec!["DE01", "FR01"]
        );

        let year_2024 = Filter {
            year: Some(2024),
            ..Filter::default()
        };
        assert_eq!(
            distinct_values_within(&df, MONTH, &year_2024).unwrap(),
            vec!["1", "2"]
        );

        let france = Filter {
            country: Some("FR01".to_string()),
            ..Filter::default()
        };
        assert_eq!(
            distinct_values_within(&df, PLANT, &france).unwrap(),
            vec!["1000"]
        );
        assert_eq!(
            distinct_values_within(&df, PLANT, &Filter::default()).unwrap(),
            distinct_values(&df, PLANT).unwrap()
        );
    }

    #[test]
    fn test_breakdown_by_vendor() {
        let df = sample_table();
        let result = breakdown(&df, Dimension::Vendor).unwrap();

        let rows = result.rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].key, vec!["ACME"]);
        assert_eq!(rows[0].cost, 370.0);
        assert_eq!(rows[1].key, vec!["Globex"]);
        assert_eq!(rows[1].cost, 60.0);
        assert_eq!(rows[2].key, vec!["Initech"]);
        assert_eq!(result.top(1).len(), 1);
        assert_eq!(result.top(10).len(), 3);
    }

    #[test]
    fn test_breakdown_by_stoppage_skips_null_keys() {
        let df = sample_table();
        let rows = breakdown(&df, Dimension::Stoppage).unwrap().rows().to_vec();

        assert_eq!(
            rows,
            vec![
                BreakdownRow {
                    key: vec!["S2".to_string(), "Motor".to_string()],
                    cost: 230.0
                },
                BreakdownRow {
                    key: vec!["S1".to_string(), "Bearing".to_string()],
                    cost: 150.0
                },
                BreakdownRow {
                    key: vec!["S3".to_string(), "Belt".to_string()],
                    cost: 10.0
                },
            ]
        );
    }

    #[test]
    fn test_breakdown_unavailable_when_column_missing() {
        let df = sample_table();
        let result = breakdown(&df, Dimension::Equipment).unwrap();
        assert_eq!(
            result,
            Breakdown::Unavailable {
                missing: vec!["Equipment".to_string()]
            }
        );
        assert!(!result.is_available());
        assert!(result.rows().is_empty());
    }

    #[test]
    fn test_cost_without_order() {
        let df = sample_table();
        let series = cost_without_order(&df).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.get(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()), Some(50.0));
        assert_eq!(series.get(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()), Some(30.0));
    }

    #[test]
    fn test_compare_joins_by_period() {
        let df = sample_table();
        let history = MonthlySeries::from_table(&df).unwrap();
        let (budget, forecast) = project_series(&history);

        let filter = Filter {
            year: Some(2024),
            ..Filter::default()
        };
        let actual = MonthlySeries::from_table(&filter.apply(&df).unwrap()).unwrap();
        let rows = compare(&actual, &budget, &forecast);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].actual, 30.0);
        assert_eq!(rows[0].budget, Some(30.0));
        assert_eq!(rows[1].forecast, Some(200.0));

        let frame = comparison_frame(&rows).unwrap();
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.width(), 4);
    }

    #[test]
    fn test_compare_without_projection() {
        let actual = MonthlySeries::from_entries(vec![(NaiveDate::from_ymd_opt(2023, 5, 2).unwrap(), 8.0)]);
        let (budget, forecast) = project_series(&actual);
        let rows = compare(&actual, &budget, &forecast);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].budget, None);
        assert_eq!(rows[0].forecast, None);
    }
}
