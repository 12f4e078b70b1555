//! Transaction file loading and normalization using Polars
//!
//! Every uploaded file is read into its own frame, the frames are stacked into
//! one table, and the canonical `Posting Date`, `Year`, `Month` and `Cost`
//! columns are derived from the raw ERP columns.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;

use anyhow::Context;
use calamine::{open_workbook_auto_from_rs, Data, Range, Reader};
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use tracing::{debug, info, warn};

/// Canonical parsed posting date column
pub const POSTING_DATE: &str = "Posting Date";
/// Calendar year derived from the posting date
pub const YEAR: &str = "Year";
/// Calendar month (1-12) derived from the posting date
pub const MONTH: &str = "Month";
/// Canonical cost column, never null
pub const COST: &str = "Cost";

/// Amount column of the profit-center line item export
pub const DEFAULT_AMOUNT_COLUMN: &str = "In profit center local currency";
/// Sheet name written by the ERP spreadsheet export
pub const DEFAULT_SHEET: &str = "Sheet1";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];

/// Largest serial day Excel can represent (9999-12-31)
const MAX_EXCEL_SERIAL: f64 = 2_958_465.0;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%Y/%m/%d", "%m/%d/%Y", "%d/%m/%Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];

/// An uploaded transaction file held fully in memory
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceFile {
    /// Display name, used in error messages and logs
    pub name: String,
    /// Raw file content
    pub bytes: Vec<u8>,
}

/// On-disk layout of a [`SourceFile`], detected from its leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// xlsx/xlsb/ods (zip container) or legacy xls (OLE container)
    Workbook,
    /// Anything else is treated as delimited text
    Csv,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Read a file from disk into memory
    pub fn from_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read input file {}", path.display()))?;
        Ok(Self::new(path.display().to_string(), bytes))
    }

    pub fn format(&self) -> SourceFormat {
        if self.bytes.starts_with(ZIP_MAGIC) || self.bytes.starts_with(OLE_MAGIC) {
            SourceFormat::Workbook
        } else {
            SourceFormat::Csv
        }
    }
}

/// Column and sheet names used when reading ERP exports
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadOptions {
    /// Raw column holding the posting date
    pub date_column: String,
    /// Raw column holding the profit-center local currency amount
    pub amount_column: String,
    /// Worksheet to read from workbook files
    pub sheet: String,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            date_column: POSTING_DATE.to_string(),
            amount_column: DEFAULT_AMOUNT_COLUMN.to_string(),
            sheet: DEFAULT_SHEET.to_string(),
        }
    }
}

/// A single spreadsheet cell after type coercion
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Empty,
    Number(f64),
    Text(String),
}

impl From<&Data> for Cell {
    fn from(value: &Data) -> Self {
        match value {
            Data::Int(v) => Cell::Number(*v as f64),
            Data::Float(v) => Cell::Number(*v),
            Data::String(s) if s.trim().is_empty() => Cell::Empty,
            Data::String(s) => Cell::Text(s.clone()),
            Data::Bool(b) => Cell::Text(b.to_string()),
            Data::DateTime(dt) if dt.is_datetime() => match dt.as_datetime() {
                Some(ts) => Cell::Text(format_timestamp(ts)),
                None => Cell::Number(dt.as_f64()),
            },
            Data::DateTime(dt) => Cell::Number(dt.as_f64()),
            Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
            Data::Error(_) | Data::Empty => Cell::Empty,
        }
    }
}

impl Cell {
    /// Type a text cell; `decimal_comma` also accepts `1.234,56` style numbers
    fn from_text(value: Option<&str>, decimal_comma: bool) -> Self {
        match value.map(str::trim) {
            None | Some("") => Cell::Empty,
            Some(text) => {
                let number = if decimal_comma {
                    parse_decimal_comma(text).or_else(|| text.parse::<f64>().ok())
                } else {
                    text.parse::<f64>().ok()
                };
                match number {
                    Some(number) => Cell::Number(number),
                    None => Cell::Text(text.to_string()),
                }
            }
        }
    }
}

/// Parse a number written with `,` decimals and optional `.` thousands groups
///
/// Dotted dates such as `01.03.2024` are rejected since their groups are not
/// three digits wide.
fn parse_decimal_comma(text: &str) -> Option<f64> {
    let body = text.strip_prefix('-').unwrap_or(text);
    let (integer, fraction) = match body.split_once(',') {
        Some((integer, fraction)) => (integer, Some(fraction)),
        None => (body, None),
    };

    let groups: Vec<&str> = integer.split('.').collect();
    let grouped = match groups.split_first() {
        Some((first, rest)) if rest.is_empty() => all_digits(*first),
        Some((first, rest)) => {
            all_digits(*first)
                && first.len() <= 3
                && rest.iter().all(|g| g.len() == 3 && all_digits(*g))
        }
        None => false,
    };
    if !grouped || !fraction.map_or(true, all_digits) {
        return None;
    }

    let mut normalized = String::with_capacity(text.len());
    if body.len() != text.len() {
        normalized.push('-');
    }
    normalized.extend(groups.concat().chars());
    if let Some(fraction) = fraction {
        normalized.push('.');
        normalized.push_str(fraction);
    }
    normalized.parse().ok()
}

fn all_digits(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

/// Load and normalize one or more transaction files
///
/// # Arguments
/// * `files` - Uploaded files, in upload order
/// * `options` - Names of the raw date/amount columns and the sheet to read
///
/// # Returns
/// * One table holding every input row (upload order, then file order) with
///   the derived `Posting Date`, `Year`, `Month` and `Cost` columns
pub fn load(files: &[SourceFile], options: &LoadOptions) -> crate::Result<DataFrame> {
    if files.is_empty() {
        anyhow::bail!("At least one transaction file is required");
    }

    let frames = files
        .iter()
        .map(|file| read_source(file, options))
        .collect::<crate::Result<Vec<_>>>()?;

    let expected_rows: usize = frames.iter().map(DataFrame::height).sum();
    let combined = concat_frames(frames)?;
    debug_assert_eq!(combined.height(), expected_rows);

    let normalized = normalize(combined, options)?;
    info!(
        files = files.len(),
        rows = normalized.height(),
        columns = normalized.width(),
        "loaded transaction records"
    );
    Ok(normalized)
}

/// Read one file into a raw (un-normalized) frame
pub fn read_source(file: &SourceFile, options: &LoadOptions) -> crate::Result<DataFrame> {
    let frame = match file.format() {
        SourceFormat::Workbook => read_workbook(file, &options.sheet),
        SourceFormat::Csv => read_csv(file),
    }
    .with_context(|| format!("failed to read {}", file.name))?;

    debug!(
        file = %file.name,
        rows = frame.height(),
        columns = frame.width(),
        "read source file"
    );
    Ok(frame)
}

fn read_workbook(file: &SourceFile, sheet: &str) -> crate::Result<DataFrame> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(file.bytes.clone()))?;
    let sheet_names = workbook.sheet_names();

    let selected = if sheet_names.iter().any(|name| name == sheet) {
        sheet.to_string()
    } else {
        let first = sheet_names
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("workbook contains no sheets"))?;
        warn!(
            file = %file.name,
            wanted = sheet,
            using = %first,
            "sheet not found, reading first sheet"
        );
        first
    };

    let range = workbook.worksheet_range(&selected)?;
    range_to_frame(&range)
}

/// Convert a worksheet range (header row first) into a typed frame
fn range_to_frame(range: &Range<Data>) -> crate::Result<DataFrame> {
    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(DataFrame::empty());
    };

    let headers = unique_headers(header_row.iter().map(ToString::to_string));
    let mut cells: Vec<Vec<Cell>> = vec![Vec::with_capacity(range.height()); headers.len()];
    for row in rows {
        for (idx, column) in cells.iter_mut().enumerate() {
            column.push(row.get(idx).map(Cell::from).unwrap_or(Cell::Empty));
        }
    }

    build_frame(headers, cells)
}

fn read_csv(file: &SourceFile) -> crate::Result<DataFrame> {
    let separator = detect_separator(&file.bytes);
    // Locales that separate fields with `;` write decimals with `,`
    let decimal_comma = separator == b';';

    // Read everything as text; numeric columns are re-typed below the same
    // way workbook columns are.
    let raw = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .map_parse_options(|opts| opts.with_separator(separator))
        .into_reader_with_file_handle(Cursor::new(file.bytes.as_slice()))
        .finish()?;

    let headers = unique_headers(raw.get_column_names().into_iter().map(|n| n.to_string()));
    let mut cells = Vec::with_capacity(raw.width());
    for column in raw.get_columns() {
        let text = column.cast(&DataType::String)?;
        cells.push(
            text.str()?
                .into_iter()
                .map(|v| Cell::from_text(v, decimal_comma))
                .collect::<Vec<_>>(),
        );
    }

    build_frame(headers, cells)
}

/// Semicolon-delimited exports are common with European locale settings
fn detect_separator(bytes: &[u8]) -> u8 {
    let header = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let commas = header.iter().filter(|b| **b == b',').count();
    let semicolons = header.iter().filter(|b| **b == b';').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

/// Blank headers get positional names and repeats get a `.N` suffix
fn unique_headers(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    names
        .enumerate()
        .map(|(idx, name)| {
            let base = match name.trim() {
                "" => format!("column_{}", idx + 1),
                trimmed => trimmed.to_string(),
            };
            let count = seen.entry(base.clone()).or_insert(0);
            let unique = if *count == 0 {
                base
            } else {
                format!("{}.{}", base, count)
            };
            *count += 1;
            unique
        })
        .collect()
}

fn build_frame(headers: Vec<String>, cells: Vec<Vec<Cell>>) -> crate::Result<DataFrame> {
    let columns = headers
        .into_iter()
        .zip(cells)
        .map(|(name, values)| column_from_cells(&name, values))
        .collect();
    Ok(DataFrame::new(columns)?)
}

/// A column is numeric when every non-empty cell is a number, text otherwise
fn column_from_cells(name: &str, cells: Vec<Cell>) -> Column {
    let numeric = cells
        .iter()
        .all(|cell| matches!(cell, Cell::Empty | Cell::Number(_)));

    if numeric {
        let values: Vec<Option<f64>> = cells
            .into_iter()
            .map(|cell| match cell {
                Cell::Number(v) => Some(v),
                _ => None,
            })
            .collect();
        Series::new(name.into(), values).into_column()
    } else {
        let values: Vec<Option<String>> = cells
            .into_iter()
            .map(|cell| match cell {
                Cell::Empty => None,
                Cell::Number(v) => Some(format_number(v)),
                Cell::Text(s) => Some(s),
            })
            .collect();
        Series::new(name.into(), values).into_column()
    }
}

/// Stack frames vertically over the union of their columns
///
/// Columns keep first-seen order. A column missing from a frame is null for
/// that frame's rows; a column whose type differs between frames is widened
/// to text.
fn concat_frames(frames: Vec<DataFrame>) -> crate::Result<DataFrame> {
    let mut names: Vec<PlSmallStr> = Vec::new();
    let mut dtypes: HashMap<PlSmallStr, DataType> = HashMap::new();

    for frame in &frames {
        for column in frame.get_columns() {
            let name = column.name().clone();
            // All-null columns carry no type information of their own
            let untyped = column.null_count() == column.len();
            match dtypes.get(&name) {
                None => {
                    names.push(name.clone());
                    dtypes.insert(name, column.dtype().clone());
                }
                Some(_) if untyped => {}
                Some(existing) if existing == column.dtype() => {}
                Some(_) => {
                    dtypes.insert(name, DataType::String);
                }
            }
        }
    }

    let mut combined = DataFrame::empty();
    for frame in frames {
        let height = frame.height();
        let columns = names
            .iter()
            .map(|name| {
                let dtype = &dtypes[name];
                match frame.get_column_index(name) {
                    Some(idx) => conform(&frame.get_columns()[idx], dtype),
                    None => Ok(Column::full_null(name.clone(), height, dtype)),
                }
            })
            .collect::<crate::Result<Vec<_>>>()?;
        combined.vstack_mut(&DataFrame::new(columns)?)?;
    }
    combined.as_single_chunk();

    Ok(combined)
}

/// Bring a column to the merged type
///
/// Numbers widened to text are rendered like numeric text cells (`1000`, not
/// `1000.0`) so the same key reads identically in every file.
fn conform(column: &Column, dtype: &DataType) -> crate::Result<Column> {
    if dtype == &DataType::String && column.dtype() != &DataType::String {
        let text = column_as_text(column)?;
        return Ok(Series::new(column.name().clone(), text).into_column());
    }
    Ok(column.cast(dtype)?)
}

/// Derive the canonical `Posting Date`, `Year`, `Month` and `Cost` columns
pub fn normalize(mut df: DataFrame, options: &LoadOptions) -> crate::Result<DataFrame> {
    let dates = parse_posting_dates(&df, &options.date_column)?;
    let costs = parse_costs(&df, &options.amount_column)?;

    let unparsed = dates.iter().filter(|d| d.is_none()).count();
    if unparsed > 0 {
        warn!(rows = unparsed, column = %options.date_column, "posting dates could not be parsed");
    }

    let years: Vec<Option<i32>> = dates.iter().map(|d| d.map(|d| d.year())).collect();
    let months: Vec<Option<i32>> = dates.iter().map(|d| d.map(|d| d.month() as i32)).collect();

    df.with_column(Series::new(POSTING_DATE.into(), dates))?;
    df.with_column(Series::new(YEAR.into(), years))?;
    df.with_column(Series::new(MONTH.into(), months))?;
    df.with_column(Series::new(COST.into(), costs))?;

    Ok(df)
}

fn parse_posting_dates(df: &DataFrame, column: &str) -> crate::Result<Vec<Option<NaiveDate>>> {
    let raw = df
        .column(column)
        .with_context(|| format!("posting date column '{}' not found", column))?;

    let dates: Vec<Option<NaiveDate>> = match raw.dtype() {
        DataType::Date => raw.date()?.as_date_iter().collect(),
        DataType::Float64 => raw
            .f64()?
            .into_iter()
            .map(|v| v.and_then(excel_serial_to_date))
            .collect(),
        _ => {
            let text = raw.cast(&DataType::String)?;
            text.str()?
                .into_iter()
                .map(|v| v.and_then(parse_posting_date))
                .collect()
        }
    };
    Ok(dates)
}

fn parse_costs(df: &DataFrame, column: &str) -> crate::Result<Vec<f64>> {
    let raw = df
        .column(column)
        .with_context(|| format!("amount column '{}' not found", column))?;

    let values: Vec<f64> = match raw.dtype() {
        DataType::Float64 => raw.f64()?.into_iter().map(cost_or_zero).collect(),
        DataType::String => {
            let mut unparsed = 0usize;
            let values: Vec<f64> = raw
                .str()?
                .into_iter()
                .map(|v| {
                    let text = v.map(str::trim).filter(|s| !s.is_empty());
                    let parsed = text.and_then(|s| s.parse::<f64>().ok());
                    if text.is_some() && parsed.is_none() {
                        unparsed += 1;
                    }
                    cost_or_zero(parsed)
                })
                .collect();
            if unparsed > 0 {
                warn!(rows = unparsed, column, "non-numeric amounts counted as zero cost");
            }
            values
        }
        _ => {
            let numeric = raw.cast(&DataType::Float64)?;
            numeric.f64()?.into_iter().map(cost_or_zero).collect()
        }
    };
    Ok(values)
}

fn cost_or_zero(value: Option<f64>) -> f64 {
    match value {
        Some(v) if !v.is_nan() => v,
        _ => 0.0,
    }
}

/// Parse a posting date as written by ERP exports and spreadsheets
///
/// Returns `None` for anything that is not a recognizable date.
pub fn parse_posting_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
                .map(|ts| ts.date())
        })
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|ts| ts.date_naive())
        })
}

/// Convert an Excel serial day number (1900 date system) to a date
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 || serial > MAX_EXCEL_SERIAL {
        return None;
    }
    // Day 60 is the nonexistent 1900-02-29; earlier serials are shifted by one
    let days = if serial < 60.0 { serial + 1.0 } else { serial };
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_days(Days::new(days.floor() as u64))
}

/// Render every value of a column as text, keeping nulls
///
/// Whole numbers print without a fractional part so numeric ERP keys
/// (plants, orders, vendors) read the way they appear in the export.
pub(crate) fn column_as_text(column: &Column) -> crate::Result<Vec<Option<String>>> {
    let values: Vec<Option<String>> = match column.dtype() {
        DataType::String => column
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect(),
        DataType::Float64 => column
            .f64()?
            .into_iter()
            .map(|v| v.map(format_number))
            .collect(),
        _ => {
            let text = column.cast(&DataType::String)?;
            text.str()?
                .into_iter()
                .map(|v| v.map(str::to_string))
                .collect()
        }
    };
    Ok(values)
}

pub(crate) fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn format_timestamp(ts: NaiveDateTime) -> String {
    if ts.time() == chrono::NaiveTime::MIN {
        ts.date().format("%Y-%m-%d").to_string()
    } else {
        ts.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}
