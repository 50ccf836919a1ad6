//! Feature engineering for sequence predictions
//!
//! Converts a raw consumption series into the named feature columns the
//! sequence model was trained on: calendar fields, cyclical encodings, and
//! per-borough rolling and lag statistics.

use std::collections::HashMap;
use std::f64::consts::PI;

use chrono::{Datelike, NaiveDate};
use tracing::{debug, warn};

use super::schema::{
    is_fillable, LAGS, LAG_COLUMNS, ROLLING_COLUMNS, ROLLING_WINDOWS, RollingStat, TARGET_COLUMN,
};
use crate::ingest::ConsumptionRecord;

/// One named feature column; `None` marks an undefined value.
pub type Column = Vec<Option<f64>>;

/// Column store of engineered features, rows sorted by date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureFrame {
    dates: Vec<NaiveDate>,
    boroughs: Vec<String>,
    columns: HashMap<String, Column>,
}

impl FeatureFrame {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn boroughs(&self) -> &[String] {
        &self.boroughs
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Value of a column at a row, `None` if the column is absent or the
    /// value undefined.
    pub fn value(&self, name: &str, row: usize) -> Option<f64> {
        self.columns.get(name)?.get(row).copied().flatten()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Insert a column holding the same value on every row.
    pub fn insert_constant(&mut self, name: impl Into<String>, value: f64) {
        self.columns.insert(name.into(), vec![Some(value); self.len()]);
    }

    pub fn remove_column(&mut self, name: &str) -> Option<Column> {
        self.columns.remove(name)
    }

    /// Row indices belonging to a borough, in frame order.
    pub fn rows_for(&self, borough: &str) -> Vec<usize> {
        self.boroughs
            .iter()
            .enumerate()
            .filter(|(_, b)| b.as_str() == borough)
            .map(|(i, _)| i)
            .collect()
    }

    fn insert_column(&mut self, name: impl Into<String>, values: Column) {
        debug_assert_eq!(values.len(), self.len());
        self.columns.insert(name.into(), values);
    }
}

/// Calendar fields derived from an observation date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarFields {
    pub year: i32,
    pub month: u32,
    pub day_of_month: u32,
    /// Monday = 0
    pub day_of_week: u32,
    /// 1-based
    pub day_of_year: u32,
    /// ISO week number
    pub week_of_year: u32,
    /// 0 when the source carried no time component
    pub hour: u32,
}

impl CalendarFields {
    pub fn from_date(date: NaiveDate, hour: Option<u32>) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
            day_of_month: date.day(),
            day_of_week: date.weekday().num_days_from_monday(),
            day_of_year: date.ordinal(),
            week_of_year: date.iso_week().week(),
            hour: hour.unwrap_or(0),
        }
    }
}

/// Derives the engineered feature frame from a raw series.
#[derive(Debug, Clone, Default)]
pub struct FeatureEngineer;

impl FeatureEngineer {
    pub fn new() -> Self {
        Self
    }

    /// Engineer features for every borough in `records`.
    ///
    /// Rows are sorted by date (stable for equal dates). Rolling and lag
    /// statistics are computed per borough; undefined head values of
    /// rolling/lag columns are then filled with the column mean over the
    /// whole frame.
    pub fn derive(&self, records: &[ConsumptionRecord]) -> FeatureFrame {
        let mut sorted = records.to_vec();
        sorted.sort_by_key(|r| r.date);

        let mut frame = FeatureFrame {
            dates: sorted.iter().map(|r| r.date).collect(),
            boroughs: sorted.iter().map(|r| r.borough.clone()).collect(),
            columns: HashMap::new(),
        };

        self.add_calendar_features(&mut frame, &sorted);
        self.add_grouped_features(&mut frame, &sorted);
        frame.insert_column(
            TARGET_COLUMN,
            sorted.iter().map(|r| Some(r.consumption)).collect(),
        );

        fill_head_gaps(&mut frame);

        debug!(
            rows = frame.len(),
            boroughs = sorted
                .iter()
                .map(|r| r.borough.as_str())
                .collect::<std::collections::HashSet<_>>()
                .len(),
            "Engineered feature frame"
        );
        frame
    }

    fn add_calendar_features(&self, frame: &mut FeatureFrame, sorted: &[ConsumptionRecord]) {
        let calendar: Vec<CalendarFields> = sorted
            .iter()
            .map(|r| CalendarFields::from_date(r.date, r.hour))
            .collect();

        let columns: [(&str, fn(&CalendarFields) -> f64); 13] = [
            ("year", |c| c.year as f64),
            ("month", |c| c.month as f64),
            ("day_of_month", |c| c.day_of_month as f64),
            ("day_of_week", |c| c.day_of_week as f64),
            ("day_of_year", |c| c.day_of_year as f64),
            ("week_of_year", |c| c.week_of_year as f64),
            ("hour", |c| c.hour as f64),
            ("day_sin", |c| cyclical_encode(c.day_of_year as f64, 365.0).0),
            ("day_cos", |c| cyclical_encode(c.day_of_year as f64, 365.0).1),
            ("month_sin", |c| cyclical_encode(c.month as f64, 12.0).0),
            ("month_cos", |c| cyclical_encode(c.month as f64, 12.0).1),
            ("week_sin", |c| cyclical_encode(c.week_of_year as f64, 52.0).0),
            ("week_cos", |c| cyclical_encode(c.week_of_year as f64, 52.0).1),
        ];

        for (name, field) in columns {
            frame.insert_column(name, calendar.iter().map(|c| Some(field(c))).collect());
        }
    }

    fn add_grouped_features(&self, frame: &mut FeatureFrame, sorted: &[ConsumptionRecord]) {
        let n = sorted.len();

        // Group row indices by borough, preserving date order within each.
        let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, record) in sorted.iter().enumerate() {
            groups.entry(record.borough.as_str()).or_default().push(i);
        }

        let mut rolling_columns: Vec<Column> = vec![vec![None; n]; ROLLING_WINDOWS.len() * 4];
        let mut lag_columns: Vec<Column> = vec![vec![None; n]; LAGS.len()];

        for indices in groups.values() {
            let series: Vec<f64> = indices.iter().map(|&i| sorted[i].consumption).collect();

            for (w, &window) in ROLLING_WINDOWS.iter().enumerate() {
                for (s, &stat) in RollingStat::ALL.iter().enumerate() {
                    let column = &mut rolling_columns[w * RollingStat::ALL.len() + s];
                    for (&row, value) in indices.iter().zip(rolling(&series, window, stat)) {
                        column[row] = value;
                    }
                }
            }

            for (l, &k) in LAGS.iter().enumerate() {
                for (&row, value) in indices.iter().zip(lag(&series, k)) {
                    lag_columns[l][row] = value;
                }
            }
        }

        let rolling_names = ROLLING_COLUMNS.iter().flatten();
        for (name, values) in rolling_names.zip(rolling_columns) {
            frame.insert_column(*name, values);
        }
        for (name, values) in LAG_COLUMNS.iter().zip(lag_columns) {
            frame.insert_column(*name, values);
        }
    }
}

/// Fill undefined values of rolling/lag columns with the column's mean over
/// all defined values in the frame.
///
/// The mean spans the full series, so early rows see later observations.
/// The deployed model was trained with this fill; changing it shifts the
/// input distribution.
pub fn fill_head_gaps(frame: &mut FeatureFrame) {
    for (name, column) in frame.columns.iter_mut() {
        if !is_fillable(name) || column.iter().all(Option::is_some) {
            continue;
        }

        let defined: Vec<f64> = column.iter().flatten().copied().collect();
        let fill = if defined.is_empty() {
            warn!(column = %name, "Column has no defined values, filling with 0");
            0.0
        } else {
            defined.iter().sum::<f64>() / defined.len() as f64
        };

        for value in column.iter_mut().filter(|v| v.is_none()) {
            *value = Some(fill);
        }
    }
}

/// Trailing-window statistic with a minimum window of one observation.
///
/// `Std` is the sample standard deviation and is undefined until the window
/// holds two observations.
pub fn rolling(values: &[f64], window: usize, stat: RollingStat) -> Column {
    let window = window.max(1);

    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            let slice = &values[start..=i];
            let n = slice.len() as f64;

            match stat {
                RollingStat::Mean => Some(slice.iter().sum::<f64>() / n),
                RollingStat::Std => {
                    if slice.len() < 2 {
                        return None;
                    }
                    let mean = slice.iter().sum::<f64>() / n;
                    let variance =
                        slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                    Some(variance.sqrt())
                }
                RollingStat::Max => slice.iter().copied().reduce(f64::max),
                RollingStat::Min => slice.iter().copied().reduce(f64::min),
            }
        })
        .collect()
}

/// Value `k` rows earlier; undefined for the first `k` rows.
pub fn lag(values: &[f64], k: usize) -> Column {
    (0..values.len())
        .map(|i| i.checked_sub(k).map(|j| values[j]))
        .collect()
}

/// Cyclical encoding for periodic features
/// Returns (sin, cos) encoding to preserve continuity
pub fn cyclical_encode(value: f64, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * value / period;
    (angle.sin(), angle.cos())
}
