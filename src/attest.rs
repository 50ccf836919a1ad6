//! Attestation hand-off: content identifiers and ledger arguments
//!
//! Uploading and submitting happen outside this crate. What lives here is
//! the narrow contract with those collaborators: a validated content
//! identifier, the confidence score squeezed into the ledger's integer
//! range, and parsing of the submitter's console output.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allocation::AllocationReport;

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const CID_V0_LEN: usize = 46;
const CID_V1_MIN_LEN: usize = 59;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttestError {
    #[error("invalid content identifier {0:?}")]
    InvalidContentId(String),
}

/// A content identifier for an uploaded report.
///
/// Accepts CIDv0 (`Qm` + 44 base58btc characters) and base32 CIDv1
/// (`b` + at least 58 lowercase `[a-z2-7]` characters). Only the textual
/// shape is checked; the multihash is not decoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    pub fn parse(raw: &str) -> Result<Self, AttestError> {
        let raw = raw.trim();
        if is_cid_v0(raw) || is_cid_v1(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(AttestError::InvalidContentId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn version(&self) -> u8 {
        if self.0.starts_with("Qm") { 0 } else { 1 }
    }
}

fn is_cid_v0(raw: &str) -> bool {
    raw.len() == CID_V0_LEN
        && raw.starts_with("Qm")
        && raw.chars().all(|c| BASE58_ALPHABET.contains(c))
}

fn is_cid_v1(raw: &str) -> bool {
    raw.len() >= CID_V1_MIN_LEN
        && raw.starts_with('b')
        && raw[1..]
            .chars()
            .all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c))
}

impl FromStr for ContentId {
    type Err = AttestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentId {
    type Error = AttestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentId> for String {
    fn from(value: ContentId) -> Self {
        value.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Confidence score as the ledger's small unsigned integer.
///
/// Rounds half to even, then clamps to `0..=100`. Non-finite scores map
/// to 0.
pub fn ledger_confidence(score: f64) -> u8 {
    if !score.is_finite() {
        return 0;
    }
    score.round_ties_even().clamp(0.0, 100.0) as u8
}

/// The argument pair an external ledger submitter expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSubmission {
    pub content_id: ContentId,
    pub confidence: u8,
}

impl LedgerSubmission {
    pub fn from_report(content_id: ContentId, report: &AllocationReport) -> Self {
        Self {
            content_id,
            confidence: ledger_confidence(report.confidence_score),
        }
    }

    /// Positional arguments, in submission order.
    pub fn args(&self) -> [String; 2] {
        [self.content_id.to_string(), self.confidence.to_string()]
    }
}

/// Identifiers reported by the submitter on stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub transaction: Option<String>,
    pub ledger_prediction_id: Option<String>,
}

impl SubmissionReceipt {
    /// Pick the transaction and ledger ids out of the submitter's output.
    /// Lines it does not recognise are ignored.
    pub fn parse(stdout: &str) -> Self {
        let mut receipt = Self::default();
        for line in stdout.lines() {
            if let Some((_, tx)) = line.split_once("Transaction submitted:") {
                receipt.transaction = Some(tx.trim().to_string());
            } else if let Some((_, id)) = line.split_once("Prediction submitted with ID:") {
                receipt.ledger_prediction_id = Some(id.trim().to_string());
            }
        }
        receipt
    }
}
