//! Integration tests for maintcost

use std::io::Write;

use chrono::NaiveDate;
use maintcost::data::{COST, POSTING_DATE};
use maintcost::report::{self, Dimension, Filter};
use maintcost::{
    load, project_budget_forecast, LoadOptions, MonthlySeries, PipelineCache, SourceFile,
};
use tempfile::NamedTempFile;

const HEADER: &str = "Posting Date,Plant,Business Area,Vendor,Material,Order,In profit center local currency";

/// Create a CSV export with the given data lines
fn create_test_csv(lines: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{}", HEADER).unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    file
}

fn source(file: &NamedTempFile) -> SourceFile {
    SourceFile::from_path(file.path()).unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Five rows across 2022 (two share March)
fn file_2022() -> NamedTempFile {
    create_test_csv(&[
        "2022-01-12,1000,EMEA,ACME,M-1,4000100,120.0",
        "2022-03-02,1000,EMEA,ACME,M-2,4000101,80.5",
        "2022-03-28,2000,EMEA,Globex,M-1,,19.5",
        "2022-07-14,2000,EMEA,Globex,M-3,4000102,300",
        "2022-11-30,1000,EMEA,Initech,M-2,4000103,",
    ])
}

/// Three rows across 2023
fn file_2023() -> NamedTempFile {
    create_test_csv(&[
        "2023-02-01,1000,EMEA,ACME,M-1,4000200,210",
        "2023-05-17,3000,APAC,Initech,M-4,,75.25",
        "2023-09-09,3000,APAC,ACME,M-4,4000201,40",
    ])
}

#[test]
fn test_load_two_files_preserves_rows() {
    let first = file_2022();
    let second = file_2023();

    let table = load(&[source(&first), source(&second)], &LoadOptions::default()).unwrap();
    assert_eq!(table.height(), 8);

    // Every record carries a defined cost
    assert_eq!(table.column(COST).unwrap().null_count(), 0);
    assert_eq!(table.column(POSTING_DATE).unwrap().null_count(), 0);

    let series = MonthlySeries::from_table(&table).unwrap();
    assert_eq!(series.len(), 7);
    assert!(series.len() <= 8);
    assert_eq!(series.get(date(2022, 3, 1)), Some(100.0));
    assert_eq!(series.get(date(2022, 11, 1)), Some(0.0));
    assert_eq!(series.get(date(2023, 5, 1)), Some(75.25));

    let total: f64 = series.values().iter().sum();
    assert!((total - 845.25).abs() < 1e-9);

    let periods: Vec<NaiveDate> = series.points().iter().map(|p| p.period).collect();
    let mut sorted = periods.clone();
    sorted.sort();
    assert_eq!(periods, sorted);
}

#[test]
fn test_load_preserves_upload_order() {
    let first = file_2022();
    let second = file_2023();

    let forward = load(&[source(&first), source(&second)], &LoadOptions::default()).unwrap();
    let reverse = load(&[source(&second), source(&first)], &LoadOptions::default()).unwrap();

    let first_cost = |df: &polars::prelude::DataFrame| {
        df.column(COST).unwrap().f64().unwrap().get(0).unwrap()
    };
    assert_eq!(first_cost(&forward), 120.0);
    assert_eq!(first_cost(&reverse), 210.0);
    assert_eq!(forward.height(), reverse.height());
}

#[test]
fn test_end_to_end_projection() {
    let first = file_2022();
    let second = file_2023();
    let table = load(&[source(&first), source(&second)], &LoadOptions::default()).unwrap();

    let (budget, forecast) = project_budget_forecast(&table).unwrap();
    let series = MonthlySeries::from_table(&table).unwrap();

    // One appended period each, one month after the last history point
    assert_eq!(budget.len(), series.len() + 1);
    assert_eq!(forecast.len(), series.len() + 1);
    assert_eq!(budget.projected().unwrap().period, date(2023, 10, 1));
    assert_eq!(forecast.projected().unwrap().period, date(2023, 10, 1));

    // Fewer than 13 months: default 5% growth
    assert_eq!(budget.projected().unwrap().value, 40.0 * 1.05);
    assert!(forecast.projected().unwrap().value.is_finite());
}

#[test]
fn test_three_month_scenario() {
    let file = create_test_csv(&[
        "2023-01-10,1000,EMEA,ACME,M-1,4000001,100",
        "2023-02-10,1000,EMEA,ACME,M-1,4000002,110",
        "2023-03-10,1000,EMEA,ACME,M-1,4000003,105",
    ]);
    let table = load(&[source(&file)], &LoadOptions::default()).unwrap();
    let (budget, forecast) = project_budget_forecast(&table).unwrap();

    let b = budget.projected().unwrap();
    assert_eq!(b.period, date(2023, 4, 1));
    assert!((b.value - 110.25).abs() < 1e-9);

    let f = forecast.projected().unwrap();
    assert_eq!(f.period, date(2023, 4, 1));
    assert!(f.value.is_finite());
}

#[test]
fn test_short_history_yields_empty_tables() {
    let file = create_test_csv(&[
        "2023-01-10,1000,EMEA,ACME,M-1,4000001,100",
        "2023-01-25,1000,EMEA,ACME,M-1,4000002,50",
        "not-a-date,1000,EMEA,ACME,M-1,4000003,7",
    ]);
    let table = load(&[source(&file)], &LoadOptions::default()).unwrap();
    assert_eq!(table.height(), 3);

    let (budget, forecast) = project_budget_forecast(&table).unwrap();
    assert!(budget.is_empty());
    assert!(forecast.is_empty());

    let budget_df = budget.to_dataframe().unwrap();
    assert_eq!(budget_df.height(), 0);
    assert_eq!(budget_df.width(), 4);
}

#[test]
fn test_flat_series_falls_back_to_last_value() {
    let file = create_test_csv(&[
        "2023-01-10,1000,EMEA,ACME,M-1,4000001,500",
        "2023-02-10,1000,EMEA,ACME,M-1,4000002,500",
        "2023-03-10,1000,EMEA,ACME,M-1,4000003,500",
        "2023-04-10,1000,EMEA,ACME,M-1,4000004,500",
    ]);
    let table = load(&[source(&file)], &LoadOptions::default()).unwrap();

    let (_, forecast) = project_budget_forecast(&table).unwrap();
    assert_eq!(forecast.projected().unwrap().value, 500.0);
}

#[test]
fn test_projection_is_deterministic() {
    let first = file_2022();
    let second = file_2023();
    let table = load(&[source(&first), source(&second)], &LoadOptions::default()).unwrap();

    let a = project_budget_forecast(&table).unwrap();
    let b = project_budget_forecast(&table).unwrap();
    assert_eq!(a, b);
    assert!(a.0.to_dataframe().unwrap().equals(&b.0.to_dataframe().unwrap()));
    assert!(a.1.to_dataframe().unwrap().equals(&b.1.to_dataframe().unwrap()));
}

#[test]
fn test_growth_over_two_years() {
    // 24 months: the second year is exactly 10% above the first
    let mut lines = Vec::new();
    for year in [2022, 2023] {
        for month in 1..=12 {
            let base = 100.0 + month as f64;
            let value = if year == 2022 { base } else { base * 1.1 };
            lines.push(format!("{}-{:02}-15,1000,EMEA,ACME,M-1,4000001,{}", year, month, value));
        }
    }
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let file = create_test_csv(&refs);
    let table = load(&[source(&file)], &LoadOptions::default()).unwrap();

    let (budget, _) = project_budget_forecast(&table).unwrap();
    let projected = budget.projected().unwrap();
    assert_eq!(projected.period, date(2024, 1, 1));
    let expected = 112.0 * 1.1 * 1.1;
    assert!((projected.value - expected).abs() < 1e-6);
}

#[test]
fn test_filtered_dashboard_views() {
    let first = file_2022();
    let second = file_2023();
    let table = load(&[source(&first), source(&second)], &LoadOptions::default()).unwrap();
    let (budget, forecast) = project_budget_forecast(&table).unwrap();

    let filter = Filter {
        year: Some(2022),
        plant: Some("1000".to_string()),
        ..Filter::default()
    };
    let filtered = filter.apply(&table).unwrap();
    assert_eq!(filtered.height(), 3);

    let actual = MonthlySeries::from_table(&filtered).unwrap();
    let comparison = report::compare(&actual, &budget, &forecast);
    assert_eq!(comparison.len(), 3);
    assert!(comparison.iter().all(|row| row.budget.is_some()));

    let vendors = report::breakdown(&filtered, Dimension::Vendor).unwrap();
    assert_eq!(vendors.rows()[0].key, vec!["ACME"]);
    assert!((vendors.rows()[0].cost - 200.5).abs() < 1e-9);

    let equipment = report::breakdown(&filtered, Dimension::Equipment).unwrap();
    assert!(!equipment.is_available());

    let without_order = report::cost_without_order(&table).unwrap();
    assert_eq!(without_order.get(date(2022, 3, 1)), Some(19.5));
    assert_eq!(without_order.get(date(2023, 5, 1)), Some(75.25));
}

#[test]
fn test_cache_matches_direct_pipeline() {
    let first = file_2022();
    let files = vec![source(&first)];
    let cache = PipelineCache::new();

    let cached = cache.load(&files, &LoadOptions::default()).unwrap();
    let direct = load(&files, &LoadOptions::default()).unwrap();
    assert!(cached.equals_missing(&direct));

    assert_eq!(
        cache.project(&cached).unwrap(),
        project_budget_forecast(&direct).unwrap()
    );
}

#[test]
fn test_error_handling_unreadable_workbook() {
    let bogus = SourceFile::new("broken.xlsx", b"PK\x03\x04not really a zip".to_vec());
    assert!(load(&[bogus], &LoadOptions::default()).is_err());
}

#[test]
fn test_plant_filter_spans_numeric_and_text_files() {
    // The first export has only numeric plants, the second mixes in a text plant
    let numeric = create_test_csv(&["2022-01-12,1000,EMEA,ACME,M-1,4000100,100"]);
    let mixed = create_test_csv(&[
        "2022-02-12,1000,EMEA,ACME,M-1,4000101,50",
        "2022-03-12,LYON,EMEA,ACME,M-1,4000102,5",
    ]);
    let table = load(&[source(&numeric), source(&mixed)], &LoadOptions::default()).unwrap();

    assert_eq!(
        report::distinct_values(&table, report::PLANT).unwrap(),
        vec!["1000", "LYON"]
    );

    let filter = Filter {
        plant: Some("1000".to_string()),
        ..Filter::default()
    };
    assert_eq!(filter.apply(&table).unwrap().height(), 2);

    let plants = report::breakdown(&table, Dimension::Plant).unwrap();
    assert_eq!(plants.rows()[0].key, vec!["1000"]);
    assert!((plants.rows()[0].cost - 150.0).abs() < 1e-9);
    assert_eq!(plants.rows().len(), 2);
}
