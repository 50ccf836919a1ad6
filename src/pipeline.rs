//! End-to-end prediction run for one uploaded series
//!
//! Ingests the series, predicts every borough it contains, aggregates the
//! allocation and persists the report. Failures are persisted too, as error
//! artifacts, before the typed error is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::allocation::{AllocationAggregator, AllocationError, AllocationReport, EstimationMethod};
use crate::config::{AppConfig, PipelineConfig};
use crate::ingest::{self, ConsumptionRecord, IngestError};
use crate::ml::{degraded_estimates, BoroughPrediction, PredictError, Predictor};
use crate::report::{ReportError, ReportWriter};
use crate::traits::Clock;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Predict(#[from] PredictError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("input contains no records")]
    EmptyInput,

    #[error("no model loaded")]
    ModelUnavailable,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Where the report was written
    pub artifact: PathBuf,
    pub report: AllocationReport,
}

/// Per-borough values and how they were produced.
#[derive(Debug, Clone)]
pub struct Forecast {
    pub predictions: Vec<BoroughPrediction>,
    pub method: EstimationMethod,
    /// Error that forced a degraded estimate.
    pub degraded_reason: Option<String>,
}

pub struct PredictionPipeline {
    predictor: Option<Predictor>,
    /// Why artifacts failed to load, if they did
    load_error: Option<String>,
    settings: PipelineConfig,
    aggregator: AllocationAggregator,
    writer: ReportWriter,
}

impl PredictionPipeline {
    pub fn new(
        predictor: Option<Predictor>,
        settings: PipelineConfig,
        output_dir: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            predictor,
            load_error: None,
            settings,
            aggregator: AllocationAggregator::new(clock.clone()),
            writer: ReportWriter::new(output_dir, clock),
        }
    }

    /// Build from configuration, loading artifacts from disk.
    ///
    /// Missing or invalid artifacts are fatal only when degraded estimates
    /// are disabled.
    pub fn from_config(config: &AppConfig, clock: Arc<dyn Clock>) -> Result<Self, PipelineError> {
        let (predictor, load_error) =
            match Predictor::load(&config.artifacts.paths(), config.pipeline.predictor()) {
                Ok(predictor) => (Some(predictor), None),
                Err(e) if config.pipeline.fallback_on_error => {
                    warn!(error = %e, "Model unavailable, runs will use degraded estimates");
                    (None, Some(e.to_string()))
                }
                Err(e) => return Err(e.into()),
            };

        let mut pipeline = Self::new(
            predictor,
            config.pipeline.clone(),
            config.output.directory.clone(),
            clock,
        );
        pipeline.load_error = load_error;
        Ok(pipeline)
    }

    pub fn has_model(&self) -> bool {
        self.predictor.is_some()
    }

    pub fn writer(&self) -> &ReportWriter {
        &self.writer
    }

    /// Run on a CSV or JSON file.
    pub fn run(&self, input: &Path) -> Result<PipelineOutcome, PipelineError> {
        info!(input = %input.display(), "Starting prediction run");
        let result = ingest::load_records(input)
            .map_err(PipelineError::from)
            .and_then(|records| self.process(&records));
        self.finish(result)
    }

    /// Run on already ingested records.
    pub fn run_records(&self, records: &[ConsumptionRecord]) -> Result<PipelineOutcome, PipelineError> {
        let result = self.process(records);
        self.finish(result)
    }

    /// Predict every borough in `records` without writing anything.
    pub fn forecast(&self, records: &[ConsumptionRecord]) -> Result<Forecast, PipelineError> {
        if records.is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        let boroughs = ingest::distinct_boroughs(records);

        let model_result = match &self.predictor {
            Some(predictor) => predictor.predict_all(records, &boroughs).map_err(PipelineError::from),
            None => Err(PipelineError::ModelUnavailable),
        };

        match model_result {
            Ok(predictions) => Ok(Forecast {
                predictions,
                method: EstimationMethod::SequenceModel,
                degraded_reason: None,
            }),
            Err(e) if self.settings.fallback_on_error => {
                let reason = match (&e, &self.load_error) {
                    (PipelineError::ModelUnavailable, Some(load_error)) => load_error.clone(),
                    _ => e.to_string(),
                };
                warn!(error = %reason, "Model prediction failed, using degraded estimate");
                let predictions =
                    degraded_estimates(records, &boroughs, self.settings.estimate_window_days)?;
                Ok(Forecast {
                    predictions,
                    method: EstimationMethod::DegradedEstimate,
                    degraded_reason: Some(reason),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn process(&self, records: &[ConsumptionRecord]) -> Result<PipelineOutcome, PipelineError> {
        let forecast = self.forecast(records)?;
        let mut report = self.aggregator.aggregate(&forecast.predictions, forecast.method)?;
        if let Some(reason) = forecast.degraded_reason {
            report = report.with_degraded_reason(reason);
        }
        let artifact = self.writer.write(&report)?;

        info!(
            artifact = %artifact.display(),
            boroughs = report.metadata.number_of_boroughs,
            confidence_score = report.confidence_score,
            method = ?forecast.method,
            "Prediction run complete"
        );

        Ok(PipelineOutcome { artifact, report })
    }

    /// Persist an error artifact for a failed run; the original error wins.
    fn finish(
        &self,
        result: Result<PipelineOutcome, PipelineError>,
    ) -> Result<PipelineOutcome, PipelineError> {
        if let Err(e) = &result {
            error!(error = %e, "Prediction run failed");
            match self.writer.write_error(&e.to_string()) {
                Ok(path) => info!(path = %path.display(), "Recorded failure"),
                Err(write_err) => error!(error = %write_err, "Could not record failure"),
            }
        }
        result
    }
}
