//! Non-model estimate used when the model path is unavailable
//!
//! The result is a trailing mean of observed consumption. Reports built from
//! it are labeled as degraded and never pass for model output.

use tracing::debug;

use super::{BoroughPrediction, PredictError};
use crate::ingest::ConsumptionRecord;

/// Mean of a borough's trailing `window` observations, dated the day after
/// its latest observation.
pub fn degraded_estimate(
    records: &[ConsumptionRecord],
    borough: &str,
    window: usize,
) -> Result<BoroughPrediction, PredictError> {
    let mut series: Vec<&ConsumptionRecord> =
        records.iter().filter(|r| r.borough == borough).collect();
    if series.is_empty() {
        return Err(PredictError::EmptySeries(borough.to_string()));
    }
    series.sort_by_key(|r| r.date);

    let start = series.len().saturating_sub(window.max(1));
    let tail = &series[start..];
    let consumption_hcf = tail.iter().map(|r| r.consumption).sum::<f64>() / tail.len() as f64;

    let last = tail[tail.len() - 1].date;
    let prediction_date = last.succ_opt().ok_or(PredictError::DateOutOfRange(last))?;

    debug!(
        borough,
        observations = tail.len(),
        consumption_hcf,
        "Degraded estimate"
    );

    Ok(BoroughPrediction {
        borough: borough.to_string(),
        consumption_hcf,
        prediction_date,
    })
}

/// Degraded estimates for several boroughs, in the given order.
pub fn degraded_estimates(
    records: &[ConsumptionRecord],
    boroughs: &[String],
    window: usize,
) -> Result<Vec<BoroughPrediction>, PredictError> {
    boroughs
        .iter()
        .map(|b| degraded_estimate(records, b, window))
        .collect()
}
