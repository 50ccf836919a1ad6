use std::path::PathBuf;

use anyhow::Result;
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::ml::{ArtifactPaths, PredictorConfig, SEQUENCE_LENGTH};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub artifacts: ArtifactsConfig,
    pub data: DataConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactsConfig {
    pub model_path: PathBuf,
    pub scaler_path: PathBuf,
    pub encoder_path: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/model.json"),
            scaler_path: PathBuf::from("models/scaler.json"),
            encoder_path: PathBuf::from("models/encoder.json"),
        }
    }
}

impl ArtifactsConfig {
    pub fn paths(&self) -> ArtifactPaths {
        ArtifactPaths {
            model: self.model_path.clone(),
            scaler: self.scaler_path.clone(),
            encoder: self.encoder_path.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DataConfig {
    /// Series used when no input file is given on the command line
    pub default_input: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    pub sequence_length: usize,
    /// Produce a labeled degraded estimate when the model path fails
    pub fallback_on_error: bool,
    pub estimate_window_days: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sequence_length: SEQUENCE_LENGTH,
            fallback_on_error: true,
            estimate_window_days: 14,
        }
    }
}

impl PipelineConfig {
    pub fn predictor(&self) -> PredictorConfig {
        PredictorConfig {
            sequence_length: self.sequence_length,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("outputs"),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        // Load .env file (silently ignore if not present)
        let _ = dotenvy::dotenv();

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hydrocast");

        let builder = Config::builder()
            // 1. Load default values
            // Artifacts
            .set_default("artifacts.model_path", "models/model.json")?
            .set_default("artifacts.scaler_path", "models/scaler.json")?
            .set_default("artifacts.encoder_path", "models/encoder.json")?
            // Data
            .set_default("data.default_input", None::<String>)?
            // Pipeline
            .set_default("pipeline.sequence_length", SEQUENCE_LENGTH as u64)?
            .set_default("pipeline.fallback_on_error", true)?
            .set_default("pipeline.estimate_window_days", 14)?
            // Output
            .set_default("output.directory", "outputs")?

            // 2. Load from local config file (optional, lowest priority)
            .add_source(File::from(PathBuf::from("config.toml")).required(false))

            // 3. Load from user config directory (optional, overrides local)
            .add_source(File::from(config_dir.join("config.toml")).required(false))

            // 4. Load from Environment variables (HYDROCAST__OUTPUT__DIRECTORY=...)
            .add_source(Environment::with_prefix("HYDROCAST").separator("__"));

        let s = builder.build()?;
        Ok(s.try_deserialize()?)
    }
}
