//! # Commission Calculator
//!
//! Resolves the platform's cut for a gross amount. The configuration row is
//! always passed in by the caller after an explicit lookup.

use serde::{Deserialize, Serialize};

use crate::db::{CommissionConfig, DeliveryMode};
use crate::errors::CoreError;

/// 100% in basis points.
pub const BPS_DENOMINATOR: i64 = 10_000;

/// Result of a commission calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionBreakdown {
    pub rate_bps: i32,
    pub commission_amount: i64,
    pub net_amount: i64,
}

/// Rate configured for a delivery mode.
pub fn rate_for(config: &CommissionConfig, mode: DeliveryMode) -> i32 {
    match mode {
        DeliveryMode::OneToOneOnline => config.one_to_one_online_bps,
        DeliveryMode::OneToOneOffline => config.one_to_one_offline_bps,
        DeliveryMode::GroupOnline => config.group_online_bps,
        DeliveryMode::GroupOffline => config.group_offline_bps,
    }
}

/// Split `gross` into commission and net. Commission rounds down.
pub fn calculate_commission(
    config: &CommissionConfig,
    mode: DeliveryMode,
    gross: i64,
) -> Result<CommissionBreakdown, CoreError> {
    if gross < 0 {
        return Err(CoreError::Validation(format!("gross amount {} is negative", gross)));
    }
    let rate_bps = rate_for(config, mode);
    split(gross, rate_bps)
}

/// Split `gross` at a fixed rate, used when settling an escrow against its
/// rate snapshot.
pub fn split(gross: i64, rate_bps: i32) -> Result<CommissionBreakdown, CoreError> {
    if !(0..=BPS_DENOMINATOR as i32).contains(&rate_bps) {
        return Err(CoreError::Validation(format!("commission rate {} bps out of range", rate_bps)));
    }
    let commission_amount = (i128::from(gross) * i128::from(rate_bps) / i128::from(BPS_DENOMINATOR)) as i64;
    Ok(CommissionBreakdown {
        rate_bps,
        commission_amount,
        net_amount: gross - commission_amount,
    })
}

/// Check a set of rates before it becomes a configuration row.
pub fn validate_rates(rates: [i32; 4]) -> Result<(), CoreError> {
    for rate in rates {
        if !(0..=BPS_DENOMINATOR as i32).contains(&rate) {
            return Err(CoreError::Validation(format!("commission rate {} bps out of range", rate)));
        }
    }
    Ok(())
}
