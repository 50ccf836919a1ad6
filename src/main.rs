use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hydrocast::{
    AllocationReport, ContentId, LedgerSubmission, PredictionPipeline, SystemClock,
    config::AppConfig, ingest,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "hydrocast")]
#[command(about = "Next-day water consumption prediction per borough")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Predict every borough in a series and write an allocation report
    Predict {
        /// CSV or JSON series (defaults to data.default_input)
        input: Option<PathBuf>,
        /// Directory for report artifacts
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print per-borough predictions without writing anything
    Forecast {
        /// CSV or JSON series (defaults to data.default_input)
        input: Option<PathBuf>,
        /// Only print this borough
        #[arg(long)]
        borough: Option<String>,
    },
    /// Print the ledger submission for a written report
    Attest {
        /// Report artifact produced by `predict`
        report: PathBuf,
        /// Content identifier the report was uploaded under
        cid: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .parse_lossy("hydrocast=debug");

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = AppConfig::load().context("Failed to load configuration")?;

    match args.command {
        Command::Predict { input, output } => {
            if let Some(dir) = output {
                config.output.directory = dir;
            }
            run_predict(&config, input)
        }
        Command::Forecast { input, borough } => run_forecast(&config, input, borough),
        Command::Attest { report, cid } => run_attest(report, &cid),
    }
}

fn resolve_input(config: &AppConfig, input: Option<PathBuf>) -> Result<PathBuf> {
    match input.or_else(|| config.data.default_input.clone()) {
        Some(path) => Ok(path),
        None => bail!("No input file given and data.default_input is not set"),
    }
}

fn build_pipeline(config: &AppConfig) -> Result<PredictionPipeline> {
    PredictionPipeline::from_config(config, Arc::new(SystemClock))
        .context("Failed to initialise prediction pipeline")
}

fn run_predict(config: &AppConfig, input: Option<PathBuf>) -> Result<()> {
    let input = resolve_input(config, input)?;
    let pipeline = build_pipeline(config)?;

    let outcome = pipeline
        .run(&input)
        .with_context(|| format!("Prediction failed for {}", input.display()))?;

    tracing::info!(
        "Report {} written to {}",
        outcome.report.prediction_id,
        outcome.artifact.display()
    );
    println!("{}", outcome.artifact.display());
    Ok(())
}

fn run_forecast(config: &AppConfig, input: Option<PathBuf>, borough: Option<String>) -> Result<()> {
    let input = resolve_input(config, input)?;
    let pipeline = build_pipeline(config)?;

    let records = ingest::load_records(&input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let mut forecast = pipeline.forecast(&records).context("Forecast failed")?;

    if let Some(borough) = borough {
        forecast.predictions.retain(|p| p.borough == borough);
        if forecast.predictions.is_empty() {
            bail!("Borough {:?} is not present in {}", borough, input.display());
        }
    }

    tracing::info!("Estimation method: {:?}", forecast.method);
    if let Some(reason) = &forecast.degraded_reason {
        tracing::warn!("Degraded because: {}", reason);
    }
    println!("{}", serde_json::to_string_pretty(&forecast.predictions)?);
    Ok(())
}

fn run_attest(report_path: PathBuf, cid: &str) -> Result<()> {
    let text = fs::read_to_string(&report_path)
        .with_context(|| format!("Failed to read {}", report_path.display()))?;
    let report: AllocationReport = serde_json::from_str(&text)
        .with_context(|| format!("{} is not an allocation report", report_path.display()))?;

    let content_id = ContentId::parse(cid)?;
    if report.is_degraded() {
        tracing::warn!(
            reason = report.metadata.degraded_reason.as_deref().unwrap_or("unknown"),
            "Report {} is a degraded estimate",
            report.prediction_id
        );
    }

    let submission = LedgerSubmission::from_report(content_id, &report);
    println!("{}", submission.args().join(" "));
    Ok(())
}
