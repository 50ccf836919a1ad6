//! Versioned JSON artifacts for the model, scaler and encoder

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array1;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::model::{matrix_from_rows, LinearSequenceModel, LstmSequenceModel, SequenceModel};
use super::scaler::{BoroughEncoder, FeatureScaler, MinMaxScaler};
use super::schema::FEATURE_COLUMNS;

/// Newest artifact version this build understands.
pub const CURRENT_VERSION: u32 = 1;

/// Errors that can occur while reading or writing artifacts
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("model artifact missing: {0:?}")]
    Missing(PathBuf),

    #[error("artifact I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse artifact {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("artifact version mismatch: supported up to v{expected}, found v{found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("invalid artifact: {0}")]
    Invalid(String),

    #[error("scaler column {index} is {found:?}, expected {expected:?}")]
    SchemaMismatch {
        index: usize,
        expected: String,
        found: String,
    },
}

fn check_version(found: u32) -> Result<(), ArtifactError> {
    if found > CURRENT_VERSION {
        return Err(ArtifactError::VersionMismatch {
            expected: CURRENT_VERSION,
            found,
        });
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    if !path.exists() {
        return Err(ArtifactError::Missing(path.to_path_buf()));
    }

    let bytes = fs::read(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<(), ArtifactError> {
    let io_err = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let bytes = serde_json::to_vec_pretty(value).map_err(|source| ArtifactError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    fs::write(path, bytes).map_err(io_err)
}

/// Exported sequence model weights, tagged by architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    Linear(LinearArtifact),
    Lstm(LstmArtifact),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearArtifact {
    pub version: u32,
    /// `[timestep][feature]`
    pub weights: Vec<Vec<f64>>,
    pub bias: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmArtifact {
    pub version: u32,
    pub sequence_length: usize,
    /// `[feature][4H]`
    pub kernel: Vec<Vec<f64>>,
    /// `[H][4H]`
    pub recurrent_kernel: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    pub dense_kernel: Vec<f64>,
    pub dense_bias: f64,
}

impl ModelArtifact {
    pub fn version(&self) -> u32 {
        match self {
            ModelArtifact::Linear(a) => a.version,
            ModelArtifact::Lstm(a) => a.version,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let artifact: Self = read_json(path)?;
        check_version(artifact.version())?;
        Ok(artifact)
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        write_json(self, path)
    }

    /// Materialize the weights into a runnable model.
    pub fn into_model(self) -> Result<Box<dyn SequenceModel>, ArtifactError> {
        match self {
            ModelArtifact::Linear(a) => Ok(Box::new(LinearSequenceModel::from_rows(
                a.weights, a.bias,
            )?)),
            ModelArtifact::Lstm(a) => {
                let kernel = matrix_from_rows("lstm kernel", a.kernel)?;
                let recurrent = matrix_from_rows("lstm recurrent kernel", a.recurrent_kernel)?;
                Ok(Box::new(LstmSequenceModel::new(
                    a.sequence_length,
                    kernel,
                    recurrent,
                    Array1::from_vec(a.bias),
                    Array1::from_vec(a.dense_kernel),
                    a.dense_bias,
                )?))
            }
        }
    }
}

fn default_feature_range() -> (f64, f64) {
    (0.0, 1.0)
}

/// Fitted min-max scaler parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerArtifact {
    pub version: u32,
    pub feature_names: Vec<String>,
    pub data_min: Vec<f64>,
    pub data_max: Vec<f64>,
    #[serde(default = "default_feature_range")]
    pub feature_range: (f64, f64),
}

impl ScalerArtifact {
    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let artifact: Self = read_json(path)?;
        check_version(artifact.version)?;
        Ok(artifact)
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        write_json(self, path)
    }

    /// Names must match the canonical column order exactly.
    pub fn check_schema(&self) -> Result<(), ArtifactError> {
        for (index, expected) in FEATURE_COLUMNS.iter().enumerate() {
            match self.feature_names.get(index) {
                Some(found) if found == expected => {}
                found => {
                    return Err(ArtifactError::SchemaMismatch {
                        index,
                        expected: expected.to_string(),
                        found: found.cloned().unwrap_or_else(|| "<missing>".into()),
                    });
                }
            }
        }

        if let Some(extra) = self.feature_names.get(FEATURE_COLUMNS.len()) {
            return Err(ArtifactError::SchemaMismatch {
                index: FEATURE_COLUMNS.len(),
                expected: "<end>".into(),
                found: extra.clone(),
            });
        }

        Ok(())
    }

    pub fn into_scaler(self) -> Result<MinMaxScaler, ArtifactError> {
        self.check_schema()?;
        MinMaxScaler::from_bounds(
            self.feature_names,
            self.data_min,
            self.data_max,
            self.feature_range,
        )
    }
}

/// Borough classes in code order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderArtifact {
    pub version: u32,
    pub classes: Vec<String>,
}

impl EncoderArtifact {
    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let artifact: Self = read_json(path)?;
        check_version(artifact.version)?;
        Ok(artifact)
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        write_json(self, path)
    }

    pub fn into_encoder(self) -> Result<BoroughEncoder, ArtifactError> {
        BoroughEncoder::new(self.classes)
    }
}

/// Locations of the three artifacts a predictor needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub model: PathBuf,
    pub scaler: PathBuf,
    pub encoder: PathBuf,
}

impl ArtifactPaths {
    /// Conventional file names inside one directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            model: dir.join("model.json"),
            scaler: dir.join("scaler.json"),
            encoder: dir.join("encoder.json"),
        }
    }

    /// The first configured path that does not exist.
    pub fn first_missing(&self) -> Option<&Path> {
        [&self.model, &self.scaler, &self.encoder]
            .into_iter()
            .map(PathBuf::as_path)
            .find(|p| !p.exists())
    }
}

/// Parsed, validated artifacts ready to back a predictor.
#[derive(Debug)]
pub struct LoadedArtifacts {
    pub model: Box<dyn SequenceModel>,
    pub scaler: Box<dyn FeatureScaler>,
    pub encoder: BoroughEncoder,
}

/// Load all three artifacts. Existence of every file is checked before any
/// of them is parsed.
pub fn load_artifacts(paths: &ArtifactPaths) -> Result<LoadedArtifacts, ArtifactError> {
    if let Some(missing) = paths.first_missing() {
        return Err(ArtifactError::Missing(missing.to_path_buf()));
    }

    let model = ModelArtifact::load(&paths.model)?.into_model()?;
    let scaler = ScalerArtifact::load(&paths.scaler)?.into_scaler()?;
    let encoder = EncoderArtifact::load(&paths.encoder)?.into_encoder()?;

    debug!(
        model = model.kind(),
        classes = encoder.classes().len(),
        "Loaded prediction artifacts"
    );

    Ok(LoadedArtifacts {
        model,
        scaler: Box::new(scaler),
        encoder,
    })
}
