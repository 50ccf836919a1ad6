//! Canonical feature column order.
//!
//! The scaler artifact is fit over exactly this order. Feature engineering,
//! sequence assembly and artifact validation all read from these constants,
//! so reordering a column here is a model-breaking change.

/// Trailing windows (in rows) for rolling statistics.
pub const ROLLING_WINDOWS: [usize; 3] = [7, 14, 30];

/// Lags (in rows) for lag features.
pub const LAGS: [usize; 3] = [1, 7, 14];

/// Number of trailing rows fed to the sequence model.
pub const SEQUENCE_LENGTH: usize = 14;

pub const BOROUGH_CODE_COLUMN: &str = "borough_encoded";
pub const TARGET_COLUMN: &str = "consumption_(hcf)";

/// Rolling statistic columns, indexed `[window][stat]` following
/// `ROLLING_WINDOWS` and `RollingStat::ALL`.
pub const ROLLING_COLUMNS: [[&str; 4]; 3] = [
    [
        "rolling_mean_7d",
        "rolling_std_7d",
        "rolling_max_7d",
        "rolling_min_7d",
    ],
    [
        "rolling_mean_14d",
        "rolling_std_14d",
        "rolling_max_14d",
        "rolling_min_14d",
    ],
    [
        "rolling_mean_30d",
        "rolling_std_30d",
        "rolling_max_30d",
        "rolling_min_30d",
    ],
];

/// Lag columns following `LAGS`.
pub const LAG_COLUMNS: [&str; 3] = ["consumption_lag_1", "consumption_lag_7", "consumption_lag_14"];

pub const NUM_COLUMNS: usize = 30;

/// Model input width: every column except the target.
pub const NUM_MODEL_FEATURES: usize = NUM_COLUMNS - 1;

/// Index of the target column; always last.
pub const TARGET_INDEX: usize = NUM_COLUMNS - 1;

pub const FEATURE_COLUMNS: [&str; NUM_COLUMNS] = [
    "year",
    "month",
    "day_of_month",
    "day_of_week",
    "day_of_year",
    "week_of_year",
    BOROUGH_CODE_COLUMN,
    "hour",
    "day_sin",
    "day_cos",
    "month_sin",
    "month_cos",
    "week_sin",
    "week_cos",
    "rolling_mean_7d",
    "rolling_std_7d",
    "rolling_max_7d",
    "rolling_min_7d",
    "rolling_mean_14d",
    "rolling_std_14d",
    "rolling_max_14d",
    "rolling_min_14d",
    "rolling_mean_30d",
    "rolling_std_30d",
    "rolling_max_30d",
    "rolling_min_30d",
    "consumption_lag_1",
    "consumption_lag_7",
    "consumption_lag_14",
    TARGET_COLUMN,
];

/// Aggregates computed over each rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollingStat {
    Mean,
    Std,
    Max,
    Min,
}

impl RollingStat {
    pub const ALL: [RollingStat; 4] = [
        RollingStat::Mean,
        RollingStat::Std,
        RollingStat::Max,
        RollingStat::Min,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RollingStat::Mean => "mean",
            RollingStat::Std => "std",
            RollingStat::Max => "max",
            RollingStat::Min => "min",
        }
    }
}

/// Position of a column in the canonical order.
pub fn column_index(name: &str) -> Option<usize> {
    FEATURE_COLUMNS.iter().position(|c| *c == name)
}

/// Columns that receive the mean-fill for undefined head values.
pub fn is_fillable(name: &str) -> bool {
    name.contains("rolling") || name.contains("lag")
}
