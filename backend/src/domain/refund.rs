//! # Refund Policy
//!
//! Tutor-fault and admin-forced cancellations return the whole escrow.
//! Student-initiated cancellations follow a tier table keyed by the hours
//! left before the next scheduled lesson.
//!
//! The table is read from `STUDENT_REFUND_POLICY` as
//! `min_hours:percent` pairs, highest threshold first:
//!
//! ```text
//! 48:100,24:50,0:0
//!   >= 48h before next lesson -> 100% back
//!   >= 24h                    ->  50% back
//!   otherwise                 ->   0% back
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::db::CancellationReason;

/// One row of the student tier table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundTier {
    pub min_hours_before: i64,
    pub percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundPolicy {
    /// Sorted by `min_hours_before`, descending.
    pub student_tiers: Vec<RefundTier>,
}

/// Error from parsing or validating a tier table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid refund policy: {0}")]
pub struct RefundPolicyError(pub String);

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            student_tiers: vec![
                RefundTier { min_hours_before: 48, percent: 100 },
                RefundTier { min_hours_before: 24, percent: 50 },
                RefundTier { min_hours_before: 0, percent: 0 },
            ],
        }
    }
}

impl RefundPolicy {
    pub fn new(student_tiers: Vec<RefundTier>) -> Result<Self, RefundPolicyError> {
        if student_tiers.is_empty() {
            return Err(RefundPolicyError("at least one tier is required".into()));
        }
        for tier in &student_tiers {
            if tier.percent > 100 {
                return Err(RefundPolicyError(format!("percent {} exceeds 100", tier.percent)));
            }
            if tier.min_hours_before < 0 {
                return Err(RefundPolicyError(format!(
                    "threshold {} is negative",
                    tier.min_hours_before
                )));
            }
        }
        if student_tiers
            .windows(2)
            .any(|w| w[0].min_hours_before <= w[1].min_hours_before)
        {
            return Err(RefundPolicyError(
                "tiers must be sorted by hours, highest first".into(),
            ));
        }
        Ok(Self { student_tiers })
    }

    /// Percent of the escrow returned to the payer.
    ///
    /// `until_next` is `None` when no scheduled lesson remains; the last
    /// tier applies then, as it does for a lesson already under way. The
    /// comparison is on the exact duration, so 47h59m stays below a 48h
    /// threshold.
    pub fn percent_for(&self, reason: CancellationReason, until_next: Option<Duration>) -> u8 {
        match reason {
            CancellationReason::TutorFault | CancellationReason::AdminForced => 100,
            CancellationReason::StudentInitiated => {
                let last = self.student_tiers.last().map(|t| t.percent).unwrap_or(0);
                match until_next {
                    Some(until) => self
                        .student_tiers
                        .iter()
                        .find(|t| until >= Duration::hours(t.min_hours_before))
                        .map(|t| t.percent)
                        .unwrap_or(last),
                    None => last,
                }
            }
        }
    }
}

/// Share of `amount` for `percent`, rounded down.
pub fn refund_amount(amount: i64, percent: u8) -> i64 {
    (i128::from(amount) * i128::from(percent) / 100) as i64
}

impl FromStr for RefundPolicy {
    type Err = RefundPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tiers = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                let (hours, percent) = part
                    .split_once(':')
                    .ok_or_else(|| RefundPolicyError(format!("expected hours:percent, got '{}'", part)))?;
                let min_hours_before = hours
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| RefundPolicyError(format!("hours '{}': {}", hours, e)))?;
                let percent = percent
                    .trim()
                    .parse::<u8>()
                    .map_err(|e| RefundPolicyError(format!("percent '{}': {}", percent, e)))?;
                Ok(RefundTier { min_hours_before, percent })
            })
            .collect::<Result<Vec<_>, RefundPolicyError>>()?;
        RefundPolicy::new(tiers)
    }
}

impl fmt::Display for RefundPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .student_tiers
            .iter()
            .map(|t| format!("{}:{}", t.min_hours_before, t.percent))
            .collect();
        f.write_str(&parts.join(","))
    }
}
