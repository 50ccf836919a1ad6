//! Hydrocast Library
//!
//! Next-day water consumption prediction per borough: feature engineering,
//! sequence-model inference, allocation reports and the attestation
//! hand-off. The binary wraps these components in a small CLI.

pub mod allocation;
pub mod attest;
pub mod config;
pub mod ingest;
pub mod ml;
pub mod pipeline;
pub mod report;
pub mod traits;

// Re-export commonly used types
pub use allocation::{
    AllocationAggregator, AllocationError, AllocationReport, BoroughAllocation, EstimationMethod,
    ReportMetadata, confidence_score,
};
pub use attest::{AttestError, ContentId, LedgerSubmission, SubmissionReceipt, ledger_confidence};
pub use config::AppConfig;
pub use ingest::{ConsumptionRecord, IngestError, load_records};
pub use ml::{
    ArtifactError, ArtifactPaths, BoroughPrediction, PredictError, Predictor, PredictorConfig,
};
pub use pipeline::{Forecast, PipelineError, PipelineOutcome, PredictionPipeline};
pub use report::{ArtifactKind, ErrorReport, ReportError, ReportWriter};
pub use traits::{Clock, MockClock, SystemClock};
