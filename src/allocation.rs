//! Allocation reports built from per-borough predictions
//!
//! Turns a set of borough predictions into shares of the total, a balance
//! score and the metadata block that accompanies every persisted report.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::ml::BoroughPrediction;
use crate::traits::Clock;

/// Version of the report layout written to disk.
pub const SCHEMA_VERSION: u32 = 1;

/// Wire format for report timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Errors that can occur while aggregating predictions
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("no predictions to aggregate")]
    NoPredictions,

    #[error("borough {0:?} predicted more than once")]
    DuplicateBorough(String),

    #[error("total predicted consumption is zero; percentages are undefined")]
    ZeroTotal,

    #[error("borough {borough:?} has negative predicted consumption {value}")]
    NegativePrediction { borough: String, value: f64 },
}

/// How the per-borough values were produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    /// Pretrained sequence model output
    SequenceModel,
    /// Trailing-mean estimate used when the model path failed
    DegradedEstimate,
}

impl EstimationMethod {
    pub fn is_model(&self) -> bool {
        matches!(self, EstimationMethod::SequenceModel)
    }
}

/// One borough's share of the predicted total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoroughAllocation {
    pub consumption_hcf: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    #[serde(with = "iso_date")]
    pub prediction_date: NaiveDate,
    pub total_consumption_hcf: f64,
    pub number_of_boroughs: usize,
    pub estimation_method: EstimationMethod,
    /// Why the model path was abandoned; only present on degraded reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    pub schema_version: u32,
}

/// A complete, immutable allocation report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationReport {
    pub prediction_id: Uuid,
    #[serde(with = "iso_timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Keyed by borough label, so serialization order is stable.
    pub predicted_allocation: BTreeMap<String, BoroughAllocation>,
    pub confidence_score: f64,
    pub metadata: ReportMetadata,
}

impl AllocationReport {
    pub fn is_degraded(&self) -> bool {
        !self.metadata.estimation_method.is_model()
    }

    /// Record why the model path failed.
    pub fn with_degraded_reason(mut self, reason: impl Into<String>) -> Self {
        self.metadata.degraded_reason = Some(reason.into());
        self
    }

    /// Sum of the rounded percentages; within rounding error of 100.
    pub fn percentage_sum(&self) -> f64 {
        self.predicted_allocation.values().map(|a| a.percentage).sum()
    }
}

/// Round half away from zero to two decimals.
///
/// Python's `round(x, 2)` rounds half to even, so values landing exactly on
/// an `x.xx5` boundary can differ from it by 0.01.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Allocation balance score in `0..=100`.
///
/// This is NOT a statistical confidence in the predictions. It is
/// `100 - 2 * stdev(percentages)` (sample standard deviation), floored at 0
/// and rounded to two decimals, so it only says how evenly the total is
/// split across boroughs. A single borough scores 100.
pub fn confidence_score(percentages: &[f64]) -> f64 {
    let n = percentages.len();
    if n < 2 {
        return 100.0;
    }

    let mean = percentages.iter().sum::<f64>() / n as f64;
    let variance = percentages.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (n - 1) as f64;

    round2((100.0 - 2.0 * variance.sqrt()).max(0.0))
}

/// Builds allocation reports; time comes from the injected clock.
#[derive(Clone)]
pub struct AllocationAggregator {
    clock: Arc<dyn Clock>,
}

impl AllocationAggregator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn aggregate(
        &self,
        predictions: &[BoroughPrediction],
        method: EstimationMethod,
    ) -> Result<AllocationReport, AllocationError> {
        if predictions.is_empty() {
            return Err(AllocationError::NoPredictions);
        }

        let mut by_borough: BTreeMap<&str, &BoroughPrediction> = BTreeMap::new();
        for prediction in predictions {
            match by_borough.entry(prediction.borough.as_str()) {
                Entry::Vacant(slot) => {
                    slot.insert(prediction);
                }
                Entry::Occupied(_) => {
                    return Err(AllocationError::DuplicateBorough(prediction.borough.clone()));
                }
            }
        }

        if let Some(p) = predictions.iter().find(|p| p.consumption_hcf < 0.0) {
            return Err(AllocationError::NegativePrediction {
                borough: p.borough.clone(),
                value: p.consumption_hcf,
            });
        }

        let total: f64 = predictions.iter().map(|p| p.consumption_hcf).sum();
        if total.abs() < f64::EPSILON {
            return Err(AllocationError::ZeroTotal);
        }

        let predicted_allocation: BTreeMap<String, BoroughAllocation> = by_borough
            .iter()
            .map(|(borough, p)| {
                (
                    borough.to_string(),
                    BoroughAllocation {
                        consumption_hcf: round2(p.consumption_hcf),
                        percentage: round2(p.consumption_hcf / total * 100.0),
                    },
                )
            })
            .collect();

        let percentages: Vec<f64> = predicted_allocation.values().map(|a| a.percentage).collect();
        let confidence_score = confidence_score(&percentages);

        // Boroughs may end on different days; report the latest.
        let prediction_date = predictions
            .iter()
            .map(|p| p.prediction_date)
            .max()
            .ok_or(AllocationError::NoPredictions)?;

        debug!(
            boroughs = predictions.len(),
            total,
            confidence_score,
            ?method,
            "Aggregated allocation"
        );

        Ok(AllocationReport {
            prediction_id: Uuid::new_v4(),
            timestamp: self.clock.now_utc(),
            predicted_allocation,
            confidence_score,
            metadata: ReportMetadata {
                prediction_date,
                total_consumption_hcf: round2(total),
                number_of_boroughs: predictions.len(),
                estimation_method: method,
                degraded_reason: None,
                schema_version: SCHEMA_VERSION,
            },
        })
    }
}

/// `YYYY-MM-DDTHH:MM:SSZ`
pub(crate) mod iso_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&value.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(de::Error::custom)
    }
}

/// Dates travel as midnight UTC timestamps.
mod iso_date {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{Deserialize, Deserializer, Serializer, de};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(value: &NaiveDate, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&value.and_time(NaiveTime::MIN).format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
            .map(|naive| naive.date())
            .or_else(|_| NaiveDate::parse_from_str(&raw, "%Y-%m-%d"))
            .map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockClock;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn aggregator() -> AllocationAggregator {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2025, 2, 3, 4, 5, 6).unwrap());
        AllocationAggregator::new(Arc::new(clock))
    }

    fn prediction(borough: &str, value: f64, day: u32) -> BoroughPrediction {
        BoroughPrediction {
            borough: borough.to_string(),
            consumption_hcf: value,
            prediction_date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
        }
    }

    // ==== Percentages ====

    #[test]
    fn test_even_split() {
        let report = aggregator()
            .aggregate(
                &[prediction("BRONX", 50.0, 1), prediction("QUEENS", 50.0, 1)],
                EstimationMethod::SequenceModel,
            )
            .unwrap();

        assert_eq!(report.predicted_allocation["BRONX"].percentage, 50.0);
        assert_eq!(report.predicted_allocation["QUEENS"].percentage, 50.0);
        assert_eq!(report.confidence_score, 100.0);
    }

    #[test]
    fn test_thirds_round_to_two_decimals() {
        let report = aggregator()
            .aggregate(
                &[
                    prediction("A", 1.0, 1),
                    prediction("B", 1.0, 1),
                    prediction("C", 1.0, 1),
                ],
                EstimationMethod::SequenceModel,
            )
            .unwrap();

        assert_eq!(report.predicted_allocation["A"].percentage, 33.33);
        assert_relative_eq!(report.percentage_sum(), 99.99, epsilon = 1e-9);
    }

    #[test]
    fn test_consumption_rounded_in_report() {
        let report = aggregator()
            .aggregate(&[prediction("A", 123.456_78, 1)], EstimationMethod::SequenceModel)
            .unwrap();

        assert_eq!(report.predicted_allocation["A"].consumption_hcf, 123.46);
        assert_eq!(report.metadata.total_consumption_hcf, 123.46);
        assert_eq!(report.predicted_allocation["A"].percentage, 100.0);
    }

    // ==== Confidence ====

    #[test]
    fn test_confidence_single_borough() {
        assert_eq!(confidence_score(&[100.0]), 100.0);
        assert_eq!(confidence_score(&[]), 100.0);
    }

    #[test]
    fn test_confidence_uses_sample_stdev() {
        // mean 50, sample variance ((−40)² + 40²) / 1 = 3200, stdev ≈ 56.57
        let score = confidence_score(&[10.0, 90.0]);
        assert_eq!(score, 0.0);

        // stdev of [40, 60] is 14.142..., 100 - 28.28 = 71.72
        assert_eq!(confidence_score(&[40.0, 60.0]), 71.72);
    }

    #[test]
    fn test_confidence_floored_at_zero() {
        assert_eq!(confidence_score(&[0.0, 0.0, 100.0]), 0.0);
    }

    // ==== Errors ====

    #[test]
    fn test_empty_predictions() {
        let result = aggregator().aggregate(&[], EstimationMethod::SequenceModel);
        assert!(matches!(result, Err(AllocationError::NoPredictions)));
    }

    #[test]
    fn test_zero_total() {
        let result = aggregator().aggregate(
            &[prediction("A", 0.0, 1), prediction("B", 0.0, 1)],
            EstimationMethod::SequenceModel,
        );
        assert!(matches!(result, Err(AllocationError::ZeroTotal)));
    }

    #[test]
    fn test_duplicate_borough() {
        let result = aggregator().aggregate(
            &[prediction("A", 1.0, 1), prediction("A", 2.0, 1)],
            EstimationMethod::SequenceModel,
        );
        assert!(matches!(result, Err(AllocationError::DuplicateBorough(b)) if b == "A"));
    }

    #[test]
    fn test_negative_prediction_rejected() {
        let result = aggregator().aggregate(
            &[prediction("BRONX", 100.0, 1), prediction("QUEENS", -50.0, 1)],
            EstimationMethod::SequenceModel,
        );

        assert!(matches!(
            result,
            Err(AllocationError::NegativePrediction { ref borough, value })
                if borough == "QUEENS" && value == -50.0
        ));
    }

    #[test]
    fn test_zero_prediction_alongside_positive_is_allowed() {
        let report = aggregator()
            .aggregate(
                &[prediction("BRONX", 0.0, 1), prediction("QUEENS", 10.0, 1)],
                EstimationMethod::SequenceModel,
            )
            .unwrap();

        assert_eq!(report.predicted_allocation["BRONX"].percentage, 0.0);
        assert_eq!(report.predicted_allocation["QUEENS"].percentage, 100.0);
    }

    // ==== Metadata ====

    #[test]
    fn test_metadata() {
        let report = aggregator()
            .aggregate(
                &[prediction("A", 10.0, 4), prediction("B", 30.0, 9)],
                EstimationMethod::DegradedEstimate,
            )
            .unwrap();

        assert_eq!(
            report.metadata.prediction_date,
            NaiveDate::from_ymd_opt(2025, 1, 9).unwrap()
        );
        assert_eq!(report.metadata.number_of_boroughs, 2);
        assert_eq!(report.metadata.total_consumption_hcf, 40.0);
        assert_eq!(report.metadata.schema_version, SCHEMA_VERSION);
        assert!(report.is_degraded());
    }

    #[test]
    fn test_wire_format() {
        let report = aggregator()
            .aggregate(&[prediction("BRONX", 10.0, 2)], EstimationMethod::SequenceModel)
            .unwrap();

        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["timestamp"], "2025-02-03T04:05:06Z");
        assert_eq!(json["metadata"]["prediction_date"], "2025-01-02T00:00:00Z");
        assert_eq!(json["metadata"]["estimation_method"], "sequence_model");
        assert_eq!(json["metadata"]["schema_version"], 1);
        assert_eq!(json["predicted_allocation"]["BRONX"]["percentage"], 100.0);
        assert!(json["prediction_id"].is_string());
        assert!(json["metadata"].get("degraded_reason").is_none());
    }

    #[test]
    fn test_degraded_reason_serialized() {
        let report = aggregator()
            .aggregate(&[prediction("BRONX", 10.0, 2)], EstimationMethod::DegradedEstimate)
            .unwrap()
            .with_degraded_reason("unknown borough \"STATEN ISLAND\"");

        let json = serde_json::to_value(&report).unwrap();
        let parsed: AllocationReport = serde_json::from_value(json.clone()).unwrap();

        assert_eq!(
            json["metadata"]["degraded_reason"],
            "unknown borough \"STATEN ISLAND\""
        );
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_report_deserializes() {
        let report = aggregator()
            .aggregate(
                &[prediction("A", 1.0, 2), prediction("B", 1.0, 2)],
                EstimationMethod::DegradedEstimate,
            )
            .unwrap();

        let text = serde_json::to_string(&report).unwrap();
        let parsed: AllocationReport = serde_json::from_str(&text).unwrap();

        assert_eq!(parsed, report);
    }

    #[test]
    fn test_unique_prediction_ids() {
        let agg = aggregator();
        let predictions = [prediction("A", 1.0, 1)];

        let a = agg.aggregate(&predictions, EstimationMethod::SequenceModel).unwrap();
        let b = agg.aggregate(&predictions, EstimationMethod::SequenceModel).unwrap();

        assert_ne!(a.prediction_id, b.prediction_id);
        assert_eq!(a.timestamp, b.timestamp);
    }

    // ==== Property-Based Tests ====

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn percentages_sum_to_one_hundred(
                values in prop::collection::vec(0.01f64..1_000_000.0, 1..8)
            ) {
                let predictions: Vec<BoroughPrediction> = values
                    .iter()
                    .enumerate()
                    .map(|(i, &v)| prediction(&format!("B{}", i), v, 1))
                    .collect();

                let report = aggregator()
                    .aggregate(&predictions, EstimationMethod::SequenceModel)
                    .unwrap();

                prop_assert!((report.percentage_sum() - 100.0).abs() <= 0.1);
            }

            #[test]
            fn confidence_in_range(
                percentages in prop::collection::vec(0.0f64..=100.0, 0..10)
            ) {
                let score = confidence_score(&percentages);
                prop_assert!((0.0..=100.0).contains(&score));
            }

            #[test]
            fn single_borough_is_full_confidence(value in 0.01f64..1e6) {
                let report = aggregator()
                    .aggregate(&[prediction("ONLY", value, 1)], EstimationMethod::SequenceModel)
                    .unwrap();
                prop_assert_eq!(report.confidence_score, 100.0);
                prop_assert_eq!(report.predicted_allocation["ONLY"].percentage, 100.0);
            }
        }
    }
}
