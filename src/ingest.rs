//! Loading raw consumption series from uploaded files.
//!
//! This is the only boundary where the input is untyped, so the
//! malformed-input errors (`MissingColumn`, `TypeMismatch`) originate here.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub const DATE_COLUMN: &str = "date";
pub const BOROUGH_COLUMN: &str = "borough";

/// Accepted spellings of the consumption column, in lookup order.
pub const CONSUMPTION_COLUMNS: [&str; 3] = ["consumption_(hcf)", "consumption_hcf", "consumption"];

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// A single daily observation for one borough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub date: NaiveDate,
    /// Hour of the observation, only when the raw date carried a time.
    pub hour: Option<u32>,
    pub borough: String,
    /// Consumption in hundred cubic feet.
    pub consumption: f64,
}

impl ConsumptionRecord {
    pub fn new(date: NaiveDate, borough: impl Into<String>, consumption: f64) -> Self {
        Self {
            date,
            hour: None,
            borough: borough.into(),
            consumption,
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required column: {0}")]
    MissingColumn(String),
    #[error("row {row}: cannot parse {column} value {value:?}")]
    TypeMismatch {
        row: usize,
        column: String,
        value: String,
    },
    #[error("row {row}: consumption must be a non-negative finite number, got {value}")]
    InvalidConsumption { row: usize, value: f64 },
    #[error("unsupported input format: {0} (expected .csv or .json)")]
    UnsupportedFormat(String),
}

/// Load records from a `.csv` or `.json` file.
pub fn load_records(path: &Path) -> Result<Vec<ConsumptionRecord>, IngestError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let contents = match extension.as_str() {
        "csv" | "json" => fs::read_to_string(path).map_err(|source| IngestError::Io {
            path: path.to_path_buf(),
            source,
        })?,
        _ => return Err(IngestError::UnsupportedFormat(path.display().to_string())),
    };

    let records = if extension == "csv" {
        parse_csv(&contents)?
    } else {
        parse_json(&contents)?
    };

    debug!(path = %path.display(), records = records.len(), "Loaded consumption records");
    Ok(records)
}

/// Parse CSV text with a header row.
pub fn parse_csv(contents: &str) -> Result<Vec<ConsumptionRecord>, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(contents.as_bytes());

    let headers = reader.headers()?.clone();
    let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));

    let date_idx = find(DATE_COLUMN).ok_or_else(|| IngestError::MissingColumn(DATE_COLUMN.into()))?;
    let borough_idx =
        find(BOROUGH_COLUMN).ok_or_else(|| IngestError::MissingColumn(BOROUGH_COLUMN.into()))?;
    let consumption_idx = CONSUMPTION_COLUMNS
        .iter()
        .find_map(|name| find(name))
        .ok_or_else(|| IngestError::MissingColumn(CONSUMPTION_COLUMNS[0].into()))?;

    let mut records = Vec::new();
    for (i, row) in reader.records().enumerate() {
        let row = row?;
        // Header is line 1.
        let line = row.position().map(|p| p.line() as usize).unwrap_or(i + 2);
        let field = |idx: usize| row.get(idx).unwrap_or_default();

        records.push(build_record(
            line,
            field(date_idx),
            field(borough_idx),
            parse_number(line, field(consumption_idx))?,
        )?);
    }

    Ok(records)
}

/// Parse a JSON array of row objects, or an object wrapping it under `records`.
pub fn parse_json(contents: &str) -> Result<Vec<ConsumptionRecord>, IngestError> {
    let value: Value = serde_json::from_str(contents)?;
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Object(mut map) => match map.remove("records") {
            Some(Value::Array(rows)) => rows,
            _ => return Err(IngestError::MissingColumn("records".into())),
        },
        other => {
            return Err(IngestError::TypeMismatch {
                row: 0,
                column: "records".into(),
                value: other.to_string(),
            });
        }
    };

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let row_no = i + 1;
            let Value::Object(map) = row else {
                return Err(IngestError::TypeMismatch {
                    row: row_no,
                    column: "record".into(),
                    value: row.to_string(),
                });
            };

            let date = json_string(map, DATE_COLUMN, row_no)?;
            let borough = json_string(map, BOROUGH_COLUMN, row_no)?;
            let consumption = CONSUMPTION_COLUMNS
                .iter()
                .find_map(|name| map.get(*name))
                .ok_or_else(|| IngestError::MissingColumn(CONSUMPTION_COLUMNS[0].into()))?;

            let consumption = match consumption {
                Value::Number(n) => n.as_f64().ok_or_else(|| IngestError::TypeMismatch {
                    row: row_no,
                    column: CONSUMPTION_COLUMNS[0].into(),
                    value: n.to_string(),
                })?,
                Value::String(s) => parse_number(row_no, s)?,
                other => {
                    return Err(IngestError::TypeMismatch {
                        row: row_no,
                        column: CONSUMPTION_COLUMNS[0].into(),
                        value: other.to_string(),
                    });
                }
            };

            build_record(row_no, &date, &borough, consumption)
        })
        .collect()
}

/// Distinct borough labels, sorted.
pub fn distinct_boroughs(records: &[ConsumptionRecord]) -> Vec<String> {
    let mut boroughs: Vec<String> = records.iter().map(|r| r.borough.clone()).collect();
    boroughs.sort();
    boroughs.dedup();
    boroughs
}

/// Parse a date or timestamp, returning the calendar date and the hour when
/// a time component was present.
pub fn parse_timestamp(raw: &str) -> Option<(NaiveDate, Option<u32>)> {
    let raw = raw.trim();

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some((date, None));
        }
    }

    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some((dt.date(), Some(dt.hour())));
        }
    }

    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| (dt.date_naive(), Some(dt.hour())))
}

fn build_record(
    row: usize,
    date: &str,
    borough: &str,
    consumption: f64,
) -> Result<ConsumptionRecord, IngestError> {
    let (date, hour) = parse_timestamp(date).ok_or_else(|| IngestError::TypeMismatch {
        row,
        column: DATE_COLUMN.into(),
        value: date.to_string(),
    })?;

    let borough = borough.trim();
    if borough.is_empty() {
        return Err(IngestError::TypeMismatch {
            row,
            column: BOROUGH_COLUMN.into(),
            value: String::new(),
        });
    }

    if !consumption.is_finite() || consumption < 0.0 {
        return Err(IngestError::InvalidConsumption {
            row,
            value: consumption,
        });
    }

    Ok(ConsumptionRecord {
        date,
        hour,
        borough: borough.to_string(),
        consumption,
    })
}

fn parse_number(row: usize, raw: &str) -> Result<f64, IngestError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| IngestError::TypeMismatch {
            row,
            column: CONSUMPTION_COLUMNS[0].into(),
            value: raw.to_string(),
        })
}

fn json_string(map: &Map<String, Value>, key: &str, row: usize) -> Result<String, IngestError> {
    match map.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(IngestError::TypeMismatch {
            row,
            column: key.into(),
            value: other.to_string(),
        }),
        None => Err(IngestError::MissingColumn(key.into())),
    }
}
