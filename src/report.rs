//! Durable JSON artifacts for reports and failures
//!
//! Every artifact gets a fresh file whose prefix says what it holds, so a
//! consumer can tell model output, degraded estimates and errors apart from
//! the name alone.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocation::{AllocationReport, iso_timestamp};
use crate::traits::Clock;

/// Errors that can occur while persisting artifacts
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize artifact: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// What an artifact file holds, derived from its name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Prediction,
    Estimate,
    Error,
}

impl ArtifactKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ArtifactKind::Prediction => "prediction",
            ArtifactKind::Estimate => "estimate",
            ArtifactKind::Error => "error",
        }
    }

    /// Artifact kind for a report, by how it was estimated.
    pub fn for_report(report: &AllocationReport) -> Self {
        if report.is_degraded() {
            ArtifactKind::Estimate
        } else {
            ArtifactKind::Prediction
        }
    }

    /// Classify a file by its name prefix.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if !name.ends_with(".json") {
            return None;
        }
        [ArtifactKind::Prediction, ArtifactKind::Estimate, ArtifactKind::Error]
            .into_iter()
            .find(|kind| {
                name.strip_prefix(kind.prefix())
                    .is_some_and(|rest| rest.starts_with('_'))
            })
    }
}

/// Body of an error artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error: String,
    #[serde(with = "iso_timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Writes artifacts into one output directory.
#[derive(Clone)]
pub struct ReportWriter {
    output_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl ReportWriter {
    pub fn new(output_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            output_dir: output_dir.into(),
            clock,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Persist a report under the prefix matching its estimation method.
    pub fn write(&self, report: &AllocationReport) -> Result<PathBuf, ReportError> {
        let kind = ArtifactKind::for_report(report);
        let path = self.write_json(kind, report)?;
        info!(
            path = %path.display(),
            prediction_id = %report.prediction_id,
            boroughs = report.metadata.number_of_boroughs,
            "Wrote {} artifact",
            kind.prefix()
        );
        Ok(path)
    }

    /// Persist a failure message.
    pub fn write_error(&self, message: &str) -> Result<PathBuf, ReportError> {
        let report = ErrorReport {
            error: message.to_string(),
            timestamp: self.clock.now_utc(),
        };
        let path = self.write_json(ArtifactKind::Error, &report)?;
        info!(path = %path.display(), "Wrote error artifact");
        Ok(path)
    }

    fn file_name(&self, kind: ArtifactKind) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}_{}_{}.json",
            kind.prefix(),
            self.clock.now_utc().format("%Y%m%d_%H%M%S"),
            &suffix[..8]
        )
    }

    fn write_json<T: Serialize>(&self, kind: ArtifactKind, value: &T) -> Result<PathBuf, ReportError> {
        let bytes = serde_json::to_vec_pretty(value)?;

        fs::create_dir_all(&self.output_dir).map_err(|source| ReportError::Write {
            path: self.output_dir.clone(),
            source,
        })?;

        let path = self.output_dir.join(self.file_name(kind));
        write_atomic(&path, &bytes).map_err(|source| ReportError::Write {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }
}

/// Write `bytes` to a `.tmp` sibling, then rename it into place.
///
/// A `<prefix>_*.json` name only ever holds a complete artifact; on failure
/// the temporary file is removed.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;

    let result = file.write_all(bytes).and_then(|()| file.sync_all());
    drop(file);
    let result = result.and_then(|()| fs::rename(&tmp, path));

    if result.is_err() {
        if let Err(e) = fs::remove_file(&tmp) {
            warn!(path = %tmp.display(), error = %e, "Could not remove partial artifact");
        }
    }
    result
}
