//! Fixed-length, fixed-column-order windows for the sequence model.

use chrono::NaiveDate;
use ndarray::{s, Array2, ArrayView2};
use tracing::warn;

use super::features::FeatureFrame;
use super::schema::{FEATURE_COLUMNS, NUM_COLUMNS, SEQUENCE_LENGTH};
use super::PredictError;

/// The trailing feature vectors of one borough, date ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    borough: String,
    dates: Vec<NaiveDate>,
    values: Array2<f64>,
}

impl Sequence {
    /// Wrap a `rows x 30` matrix with its dates.
    pub fn new(
        borough: impl Into<String>,
        dates: Vec<NaiveDate>,
        values: Array2<f64>,
    ) -> Result<Self, PredictError> {
        let expected = (dates.len(), NUM_COLUMNS);
        if dates.is_empty() || values.dim() != expected {
            return Err(PredictError::ShapeMismatch {
                what: "sequence",
                expected,
                found: values.dim(),
            });
        }

        Ok(Self {
            borough: borough.into(),
            dates,
            values,
        })
    }

    pub fn borough(&self) -> &str {
        &self.borough
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Date of the most recent row.
    pub fn last_date(&self) -> NaiveDate {
        // Non-empty by construction.
        self.dates[self.dates.len() - 1]
    }
}

/// Selects the canonical columns for one borough and trims to the trailing
/// window.
#[derive(Debug, Clone)]
pub struct SequenceBuilder {
    sequence_length: usize,
}

impl Default for SequenceBuilder {
    fn default() -> Self {
        Self::new(SEQUENCE_LENGTH)
    }
}

impl SequenceBuilder {
    pub fn new(sequence_length: usize) -> Self {
        Self {
            sequence_length: sequence_length.max(1),
        }
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    /// Full, untrimmed matrix of a borough's rows in canonical column order.
    ///
    /// Columns missing from the frame are inserted as zeros. This keeps the
    /// pipeline running on schema drift at the cost of silently degraded
    /// inputs, so every missing column is logged.
    pub fn matrix(
        &self,
        frame: &FeatureFrame,
        borough: &str,
    ) -> Result<(Vec<NaiveDate>, Array2<f64>), PredictError> {
        let rows = frame.rows_for(borough);
        if rows.is_empty() {
            return Err(PredictError::EmptySeries(borough.to_string()));
        }

        let missing: Vec<&str> = FEATURE_COLUMNS
            .iter()
            .copied()
            .filter(|name| frame.column(name).is_none())
            .collect();
        if !missing.is_empty() {
            warn!(borough, ?missing, "Feature columns absent, inserting zeros");
        }

        let values = Array2::from_shape_fn((rows.len(), NUM_COLUMNS), |(i, j)| {
            frame.value(FEATURE_COLUMNS[j], rows[i]).unwrap_or(0.0)
        });
        let dates = rows.iter().map(|&i| frame.dates()[i]).collect();

        Ok((dates, values))
    }

    /// The trailing `sequence_length` rows of a borough.
    ///
    /// Assumes the frame is sorted by date ascending, as produced by
    /// `FeatureEngineer::derive`.
    pub fn build(&self, frame: &FeatureFrame, borough: &str) -> Result<Sequence, PredictError> {
        let (dates, values) = self.matrix(frame, borough)?;

        if dates.len() < self.sequence_length {
            return Err(PredictError::InsufficientHistory {
                borough: borough.to_string(),
                required: self.sequence_length,
                available: dates.len(),
            });
        }

        let start = dates.len() - self.sequence_length;
        let window = values.slice(s![start.., ..]).to_owned();

        Sequence::new(borough, dates[start..].to_vec(), window)
    }
}
