//! End-to-end tests: CSV/JSON upload through artifacts on disk to a
//! persisted allocation report.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use approx::assert_relative_eq;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use hydrocast::{
    AllocationReport, ArtifactKind, ErrorReport, EstimationMethod, MockClock, PipelineError,
    PredictError, PredictionPipeline,
    config::{AppConfig, ArtifactsConfig, DataConfig, OutputConfig, PipelineConfig},
    ml::{
        FEATURE_COLUMNS,
        persistence::{CURRENT_VERSION, EncoderArtifact, LinearArtifact, ModelArtifact, ScalerArtifact},
        schema::{NUM_COLUMNS, NUM_MODEL_FEATURES, column_index},
    },
};
use tempfile::{TempDir, tempdir};

const BOROUGHS: [&str; 3] = ["BRONX", "BROOKLYN", "QUEENS"];

/// Writes a linear model that echoes the last row's `consumption_lag_1`,
/// a 0..10_000 min-max scaler and a three-borough encoder.
fn write_artifacts(dir: &Path) -> ArtifactsConfig {
    let mut weights = vec![vec![0.0; NUM_MODEL_FEATURES]; 14];
    weights[13][column_index("consumption_lag_1").unwrap()] = 1.0;

    let config = ArtifactsConfig {
        model_path: dir.join("model.json"),
        scaler_path: dir.join("scaler.json"),
        encoder_path: dir.join("encoder.json"),
    };

    ModelArtifact::Linear(LinearArtifact {
        version: CURRENT_VERSION,
        weights,
        bias: 0.0,
    })
    .save(&config.model_path)
    .unwrap();

    ScalerArtifact {
        version: CURRENT_VERSION,
        feature_names: FEATURE_COLUMNS.iter().map(|s| s.to_string()).collect(),
        data_min: vec![0.0; NUM_COLUMNS],
        data_max: vec![10_000.0; NUM_COLUMNS],
        feature_range: (0.0, 1.0),
    }
    .save(&config.scaler_path)
    .unwrap();

    EncoderArtifact {
        version: CURRENT_VERSION,
        classes: BOROUGHS.iter().map(|s| s.to_string()).collect(),
    }
    .save(&config.encoder_path)
    .unwrap();

    config
}

/// 20 days per borough, interleaved by date. Borough `i` consumes
/// `1000 * (i + 1) + day`.
fn write_csv(path: &Path, boroughs: &[&str]) {
    let start = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
    let mut text = String::from("date,borough,consumption_(hcf)\n");
    for day in 0..20 {
        for (i, borough) in boroughs.iter().enumerate() {
            let date = start + Duration::days(day);
            let value = 1000.0 * (i as f64 + 1.0) + day as f64;
            text.push_str(&format!("{},{},{}\n", date.format("%Y-%m-%d"), borough, value));
        }
    }
    fs::write(path, text).unwrap();
}

struct Fixture {
    _dir: TempDir,
    config: AppConfig,
    input: PathBuf,
}

fn fixture(fallback_on_error: bool) -> Fixture {
    let dir = tempdir().unwrap();
    let artifacts = write_artifacts(&dir.path().join("models"));
    let input = dir.path().join("upload.csv");
    write_csv(&input, &BOROUGHS);

    let config = AppConfig {
        artifacts,
        data: DataConfig::default(),
        pipeline: PipelineConfig {
            fallback_on_error,
            ..PipelineConfig::default()
        },
        output: OutputConfig {
            directory: dir.path().join("outputs"),
        },
    };

    Fixture {
        _dir: dir,
        config,
        input,
    }
}

fn clock() -> Arc<MockClock> {
    Arc::new(MockClock::new(Utc.with_ymd_and_hms(2024, 2, 21, 9, 30, 0).unwrap()))
}

fn artifact_kinds(dir: &Path) -> Vec<ArtifactKind> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| ArtifactKind::from_path(&e.unwrap().path()))
        .collect()
}

// ==================== Model Path ====================

#[test]
fn test_model_report_end_to_end() {
    let fx = fixture(false);
    let pipeline = PredictionPipeline::from_config(&fx.config, clock()).unwrap();
    assert!(pipeline.has_model());

    let outcome = pipeline.run(&fx.input).unwrap();

    // Each borough echoes its day-18 value
    let report = &outcome.report;
    assert_eq!(report.metadata.estimation_method, EstimationMethod::SequenceModel);
    assert_relative_eq!(report.predicted_allocation["BRONX"].consumption_hcf, 1018.0, epsilon = 1e-6);
    assert_relative_eq!(report.predicted_allocation["BROOKLYN"].consumption_hcf, 2018.0, epsilon = 1e-6);
    assert_relative_eq!(report.predicted_allocation["QUEENS"].consumption_hcf, 3018.0, epsilon = 1e-6);
    assert_eq!(report.metadata.total_consumption_hcf, 6054.0);
    assert_eq!(report.metadata.number_of_boroughs, 3);
    assert_eq!(
        report.metadata.prediction_date,
        NaiveDate::from_ymd_opt(2024, 2, 21).unwrap()
    );
    assert!((report.percentage_sum() - 100.0).abs() <= 0.1);

    assert_eq!(ArtifactKind::from_path(&outcome.artifact), Some(ArtifactKind::Prediction));
    let on_disk: AllocationReport =
        serde_json::from_str(&fs::read_to_string(&outcome.artifact).unwrap()).unwrap();
    assert_eq!(on_disk.prediction_id, report.prediction_id);
}

#[test]
fn test_report_wire_format() {
    let fx = fixture(false);
    let pipeline = PredictionPipeline::from_config(&fx.config, clock()).unwrap();

    let outcome = pipeline.run(&fx.input).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&outcome.artifact).unwrap()).unwrap();

    assert_eq!(json["timestamp"], "2024-02-21T09:30:00Z");
    assert_eq!(json["metadata"]["prediction_date"], "2024-02-21T00:00:00Z");
    assert_eq!(json["metadata"]["estimation_method"], "sequence_model");
    assert!(json["predicted_allocation"]["QUEENS"]["percentage"].is_number());
    assert!(json["confidence_score"].is_number());
}

#[test]
fn test_json_upload() {
    let fx = fixture(false);
    let json_input = fx.input.with_extension("json");
    let start = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
    let rows: Vec<serde_json::Value> = (0..14)
        .map(|d| {
            serde_json::json!({
                "date": (start + Duration::days(d)).format("%Y-%m-%d").to_string(),
                "borough": "BRONX",
                "consumption": 500.0 + d as f64,
            })
        })
        .collect();
    fs::write(&json_input, serde_json::to_string(&rows).unwrap()).unwrap();

    let pipeline = PredictionPipeline::from_config(&fx.config, clock()).unwrap();
    let outcome = pipeline.run(&json_input).unwrap();

    assert_relative_eq!(outcome.report.predicted_allocation["BRONX"].consumption_hcf, 512.0, epsilon = 1e-6);
    assert_eq!(outcome.report.confidence_score, 100.0);
}

// ==================== Failure Paths ====================

#[test]
fn test_unknown_borough_without_fallback_writes_error_artifact() {
    let fx = fixture(false);
    write_csv(&fx.input, &["BRONX", "STATEN ISLAND"]);
    let pipeline = PredictionPipeline::from_config(&fx.config, clock()).unwrap();

    let result = pipeline.run(&fx.input);

    assert!(matches!(
        result,
        Err(PipelineError::Predict(PredictError::UnknownCategory(ref b))) if b == "STATEN ISLAND"
    ));

    let out = &fx.config.output.directory;
    assert_eq!(artifact_kinds(out), vec![ArtifactKind::Error]);

    let error_file = fs::read_dir(out).unwrap().next().unwrap().unwrap().path();
    let body: ErrorReport = serde_json::from_str(&fs::read_to_string(error_file).unwrap()).unwrap();
    assert!(body.error.contains("STATEN ISLAND"));
}

#[test]
fn test_unknown_borough_with_fallback_is_labeled() {
    let fx = fixture(true);
    write_csv(&fx.input, &["BRONX", "STATEN ISLAND"]);
    let pipeline = PredictionPipeline::from_config(&fx.config, clock()).unwrap();

    let outcome = pipeline.run(&fx.input).unwrap();

    assert!(outcome.report.is_degraded());
    assert_eq!(ArtifactKind::from_path(&outcome.artifact), Some(ArtifactKind::Estimate));
    // Trailing 14-day mean of days 6..=19
    assert_relative_eq!(outcome.report.predicted_allocation["BRONX"].consumption_hcf, 1012.5, epsilon = 1e-6);

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&outcome.artifact).unwrap()).unwrap();
    let reason = json["metadata"]["degraded_reason"].as_str().unwrap();
    assert!(reason.contains("STATEN ISLAND"), "{}", reason);
}

#[test]
fn test_missing_artifact_without_fallback_fails_to_start() {
    let fx = fixture(false);
    fs::remove_file(&fx.config.artifacts.encoder_path).unwrap();

    let result = PredictionPipeline::from_config(&fx.config, clock());

    match result {
        Err(PipelineError::Predict(PredictError::Artifact(e))) => {
            assert!(e.to_string().contains("encoder.json"), "{}", e);
        }
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("pipeline started without an encoder"),
    }
}

#[test]
fn test_missing_artifact_with_fallback_degrades() {
    let fx = fixture(true);
    fs::remove_file(&fx.config.artifacts.model_path).unwrap();

    let pipeline = PredictionPipeline::from_config(&fx.config, clock()).unwrap();
    let outcome = pipeline.run(&fx.input).unwrap();

    assert!(!pipeline.has_model());
    assert_eq!(outcome.report.metadata.estimation_method, EstimationMethod::DegradedEstimate);
    let reason = outcome.report.metadata.degraded_reason.as_deref().unwrap();
    assert!(reason.contains("model.json"), "{}", reason);
}

#[test]
fn test_model_report_has_no_degraded_reason() {
    let fx = fixture(true);
    let pipeline = PredictionPipeline::from_config(&fx.config, clock()).unwrap();

    let outcome = pipeline.run(&fx.input).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&outcome.artifact).unwrap()).unwrap();

    assert!(!outcome.report.is_degraded());
    assert!(json["metadata"].get("degraded_reason").is_none());
}

#[test]
fn test_malformed_upload_writes_error_artifact() {
    let fx = fixture(true);
    fs::write(&fx.input, "date,borough\n2024-01-01,BRONX\n").unwrap();
    let pipeline = PredictionPipeline::from_config(&fx.config, clock()).unwrap();

    let result = pipeline.run(&fx.input);

    assert!(matches!(result, Err(PipelineError::Ingest(_))));
    assert_eq!(artifact_kinds(&fx.config.output.directory), vec![ArtifactKind::Error]);
}

#[test]
fn test_insufficient_history_without_fallback() {
    let fx = fixture(false);
    let short = "date,borough,consumption_(hcf)\n2024-01-01,BRONX,10\n2024-01-02,BRONX,12\n";
    fs::write(&fx.input, short).unwrap();
    let pipeline = PredictionPipeline::from_config(&fx.config, clock()).unwrap();

    let result = pipeline.run(&fx.input);

    assert!(matches!(
        result,
        Err(PipelineError::Predict(PredictError::InsufficientHistory {
            required: 14,
            available: 2,
            ..
        }))
    ));
}
