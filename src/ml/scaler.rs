//! Adapters for the externally fitted normalizer and borough encoder.
//!
//! Neither is fitted here: both are reconstructed from artifact parameters
//! and only expose the transform contract the predictor relies on.

use std::collections::HashSet;
use std::fmt::Debug;

use ndarray::{Array1, Array2, ArrayView2};

use super::persistence::ArtifactError;
use super::PredictError;

/// Numeric normalizer over the canonical feature columns.
pub trait FeatureScaler: Send + Sync + Debug {
    /// Column names in fit-time order.
    fn feature_names(&self) -> &[String];

    fn n_features(&self) -> usize {
        self.feature_names().len()
    }

    fn transform(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, PredictError>;

    fn inverse_transform(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, PredictError>;

    /// True when each output column depends only on the same input column.
    ///
    /// Inverting a single column through a zero-padded row is only sound
    /// for such scalers.
    fn is_column_independent(&self) -> bool;
}

/// Per-column min-max scaling to `feature_range`.
///
/// A column with zero data range keeps a scale of 1 so constant columns
/// map to the lower bound instead of dividing by zero.
#[derive(Debug, Clone, PartialEq)]
pub struct MinMaxScaler {
    feature_names: Vec<String>,
    data_min: Array1<f64>,
    data_max: Array1<f64>,
    feature_range: (f64, f64),
    scale: Array1<f64>,
    offset: Array1<f64>,
}

impl MinMaxScaler {
    /// Rebuild a fitted scaler from its per-column bounds.
    pub fn from_bounds(
        feature_names: Vec<String>,
        data_min: Vec<f64>,
        data_max: Vec<f64>,
        feature_range: (f64, f64),
    ) -> Result<Self, ArtifactError> {
        let n = feature_names.len();
        if data_min.len() != n || data_max.len() != n {
            return Err(ArtifactError::Invalid(format!(
                "scaler bounds length mismatch: {} names, {} minima, {} maxima",
                n,
                data_min.len(),
                data_max.len()
            )));
        }

        let (lo, hi) = feature_range;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(ArtifactError::Invalid(format!(
                "invalid feature range ({}, {})",
                lo, hi
            )));
        }

        for (i, (min, max)) in data_min.iter().zip(&data_max).enumerate() {
            if !(min.is_finite() && max.is_finite() && min <= max) {
                return Err(ArtifactError::Invalid(format!(
                    "invalid bounds for column {} ({}): [{}, {}]",
                    i, feature_names[i], min, max
                )));
            }
        }

        let data_min = Array1::from_vec(data_min);
        let data_max = Array1::from_vec(data_max);
        let scale = (&data_max - &data_min).mapv(|range| {
            let range = if range == 0.0 { 1.0 } else { range };
            (hi - lo) / range
        });
        let offset = lo - &data_min * &scale;

        Ok(Self {
            feature_names,
            data_min,
            data_max,
            feature_range,
            scale,
            offset,
        })
    }

    pub fn data_min(&self) -> &Array1<f64> {
        &self.data_min
    }

    pub fn data_max(&self) -> &Array1<f64> {
        &self.data_max
    }

    pub fn feature_range(&self) -> (f64, f64) {
        self.feature_range
    }

    fn check_width(&self, x: &ArrayView2<'_, f64>) -> Result<(), PredictError> {
        if x.ncols() != self.feature_names.len() {
            return Err(PredictError::ShapeMismatch {
                what: "scaler input",
                expected: (x.nrows(), self.feature_names.len()),
                found: x.dim(),
            });
        }
        Ok(())
    }
}

impl FeatureScaler for MinMaxScaler {
    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn transform(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, PredictError> {
        self.check_width(&x)?;
        let mut out = x.to_owned();
        out *= &self.scale;
        out += &self.offset;
        Ok(out)
    }

    fn inverse_transform(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, PredictError> {
        self.check_width(&x)?;
        let mut out = x.to_owned();
        out -= &self.offset;
        out /= &self.scale;
        Ok(out)
    }

    fn is_column_independent(&self) -> bool {
        true
    }
}

/// Maps borough labels to the integer codes assigned at fit time.
///
/// Codes are positions in `classes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoroughEncoder {
    classes: Vec<String>,
}

impl BoroughEncoder {
    pub fn new(classes: Vec<String>) -> Result<Self, ArtifactError> {
        if classes.is_empty() {
            return Err(ArtifactError::Invalid("encoder has no classes".into()));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = classes.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(ArtifactError::Invalid(format!(
                "duplicate encoder class {:?}",
                dup
            )));
        }

        Ok(Self { classes })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn contains(&self, borough: &str) -> bool {
        self.classes.iter().any(|c| c == borough)
    }

    /// Code for a borough; never falls back to a default.
    pub fn encode(&self, borough: &str) -> Result<usize, PredictError> {
        self.classes
            .iter()
            .position(|c| c == borough)
            .ok_or_else(|| PredictError::UnknownCategory(borough.to_string()))
    }

    pub fn decode(&self, code: usize) -> Option<&str> {
        self.classes.get(code).map(String::as_str)
    }
}
