//! Sequence-model consumption prediction
//!
//! Feature engineering, sequence assembly, artifact-backed scaling and
//! inference for next-day per-borough consumption. Artifacts are fit
//! elsewhere; this module only runs them.

pub mod fallback;
pub mod features;
pub mod model;
pub mod persistence;
pub mod scaler;
pub mod schema;
pub mod sequence;

use chrono::NaiveDate;
use ndarray::{s, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::ingest::ConsumptionRecord;

pub use fallback::{degraded_estimate, degraded_estimates};
pub use features::{FeatureEngineer, FeatureFrame};
pub use model::{LinearSequenceModel, LstmSequenceModel, SequenceModel};
pub use persistence::{load_artifacts, ArtifactError, ArtifactPaths, LoadedArtifacts};
pub use scaler::{BoroughEncoder, FeatureScaler, MinMaxScaler};
pub use schema::{FEATURE_COLUMNS, SEQUENCE_LENGTH};
pub use sequence::{Sequence, SequenceBuilder};

use schema::{BOROUGH_CODE_COLUMN, NUM_COLUMNS, NUM_MODEL_FEATURES, TARGET_INDEX};

/// Errors raised while turning a series into a prediction
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("borough {0:?} was not seen when the encoder was fit")]
    UnknownCategory(String),

    #[error("no rows for borough {0:?}")]
    EmptySeries(String),

    #[error("borough {borough:?} has {available} rows, {required} required")]
    InsufficientHistory {
        borough: String,
        required: usize,
        available: usize,
    },

    #[error("{what} shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("scaler is not column-independent; single-target inverse transform is invalid")]
    ScalerNotColumnIndependent,

    #[error("prediction for {0:?} is not a finite number")]
    NonFiniteOutput(String),

    #[error("prediction for {borough:?} is negative ({value})")]
    NegativeOutput { borough: String, value: f64 },

    #[error("no calendar day follows {0}")]
    DateOutOfRange(NaiveDate),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Configuration for the predictor
#[derive(Debug, Clone)]
pub struct PredictorConfig {
    /// Trailing rows fed to the model
    pub sequence_length: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            sequence_length: SEQUENCE_LENGTH,
        }
    }
}

/// Next-day consumption for one borough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoroughPrediction {
    pub borough: String,
    pub consumption_hcf: f64,
    pub prediction_date: NaiveDate,
}

/// Runs a loaded model over the most recent window of a borough.
///
/// Holds only immutable artifacts, so one instance can serve boroughs in
/// parallel.
#[derive(Debug)]
pub struct Predictor {
    model: Box<dyn SequenceModel>,
    scaler: Box<dyn FeatureScaler>,
    encoder: BoroughEncoder,
    engineer: FeatureEngineer,
    builder: SequenceBuilder,
}

impl Predictor {
    /// Assemble a predictor, validating that the pieces fit together.
    pub fn new(
        model: Box<dyn SequenceModel>,
        scaler: Box<dyn FeatureScaler>,
        encoder: BoroughEncoder,
        config: PredictorConfig,
    ) -> Result<Self, PredictError> {
        if !scaler.is_column_independent() {
            return Err(PredictError::ScalerNotColumnIndependent);
        }

        if scaler.n_features() != NUM_COLUMNS {
            return Err(PredictError::ShapeMismatch {
                what: "scaler",
                expected: (1, NUM_COLUMNS),
                found: (1, scaler.n_features()),
            });
        }

        let builder = SequenceBuilder::new(config.sequence_length);
        let expected = (builder.sequence_length(), NUM_MODEL_FEATURES);
        if model.input_shape() != expected {
            return Err(PredictError::ShapeMismatch {
                what: "model input",
                expected,
                found: model.input_shape(),
            });
        }

        Ok(Self {
            model,
            scaler,
            encoder,
            engineer: FeatureEngineer::new(),
            builder,
        })
    }

    pub fn from_artifacts(
        artifacts: LoadedArtifacts,
        config: PredictorConfig,
    ) -> Result<Self, PredictError> {
        Self::new(artifacts.model, artifacts.scaler, artifacts.encoder, config)
    }

    /// Load model, scaler and encoder from disk.
    pub fn load(paths: &ArtifactPaths, config: PredictorConfig) -> Result<Self, PredictError> {
        let predictor = Self::from_artifacts(load_artifacts(paths)?, config)?;
        info!(
            model = predictor.model.kind(),
            boroughs = predictor.encoder.classes().len(),
            sequence_length = predictor.builder.sequence_length(),
            "Predictor ready"
        );
        Ok(predictor)
    }

    /// Boroughs the encoder was fit on.
    pub fn classes(&self) -> &[String] {
        self.encoder.classes()
    }

    pub fn encoder(&self) -> &BoroughEncoder {
        &self.encoder
    }

    pub fn sequence_length(&self) -> usize {
        self.builder.sequence_length()
    }

    /// Predict the next day for one borough from the full raw series.
    ///
    /// Features are engineered on the borough's own rows, so fill means are
    /// per borough on this path.
    pub fn predict_borough(
        &self,
        records: &[ConsumptionRecord],
        borough: &str,
    ) -> Result<BoroughPrediction, PredictError> {
        let subset: Vec<ConsumptionRecord> = records
            .iter()
            .filter(|r| r.borough == borough)
            .cloned()
            .collect();
        if subset.is_empty() {
            return Err(PredictError::EmptySeries(borough.to_string()));
        }

        let code = self.encoder.encode(borough)?;

        let mut frame = self.engineer.derive(&subset);
        frame.insert_constant(BOROUGH_CODE_COLUMN, code as f64);

        let sequence = self.builder.build(&frame, borough)?;
        self.predict_sequence(&sequence)
    }

    /// Run the model over an assembled sequence.
    pub fn predict_sequence(&self, sequence: &Sequence) -> Result<BoroughPrediction, PredictError> {
        let scaled = self.scaler.transform(sequence.values())?;
        let input = scaled.slice(s![.., ..TARGET_INDEX]);
        let normalized = self.model.infer(input)?;

        // Only the target slot matters; the other columns are padding.
        let mut padded = Array2::<f64>::zeros((1, NUM_COLUMNS));
        padded[[0, TARGET_INDEX]] = normalized;
        let consumption_hcf = self.scaler.inverse_transform(padded.view())?[[0, TARGET_INDEX]];

        if !consumption_hcf.is_finite() {
            return Err(PredictError::NonFiniteOutput(sequence.borough().to_string()));
        }
        if consumption_hcf < 0.0 {
            return Err(PredictError::NegativeOutput {
                borough: sequence.borough().to_string(),
                value: consumption_hcf,
            });
        }

        let last = sequence.last_date();
        let prediction_date = last.succ_opt().ok_or(PredictError::DateOutOfRange(last))?;

        debug!(
            borough = sequence.borough(),
            normalized,
            consumption_hcf,
            %prediction_date,
            "Sequence prediction"
        );

        Ok(BoroughPrediction {
            borough: sequence.borough().to_string(),
            consumption_hcf,
            prediction_date,
        })
    }

    /// Predict every borough in parallel. Fails on the first error.
    pub fn predict_all(
        &self,
        records: &[ConsumptionRecord],
        boroughs: &[String],
    ) -> Result<Vec<BoroughPrediction>, PredictError> {
        boroughs
            .par_iter()
            .map(|borough| self.predict_borough(records, borough))
            .collect()
    }
}
