//! # Payment Gateway
//!
//! The core asks the gateway to collect money for a payment context and
//! later receives a `PaymentConfirmed(contextId)` callback through
//! [`WalletService::confirm_payment`](super::WalletService::confirm_payment).
//! The wire protocol (signatures, redirects) stays outside the core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::db::new_id;

/// Kind of business object a payment settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentContext {
    WalletTopUp,
}

impl PaymentContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentContext::WalletTopUp => "WalletTopUp",
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Gateway rejected payment: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open a payment for `amount` and return the gateway's payment id.
    async fn settle_payment(
        &self,
        context: PaymentContext,
        context_id: &str,
        amount: i64,
    ) -> Result<String, GatewayError>;
}

/// Gateway for local runs: accepts every payment and logs it. The
/// confirmation arrives through `/payments/confirm`.
#[derive(Debug, Clone, Default)]
pub struct LoggingGateway;

#[async_trait]
impl PaymentGateway for LoggingGateway {
    async fn settle_payment(
        &self,
        context: PaymentContext,
        context_id: &str,
        amount: i64,
    ) -> Result<String, GatewayError> {
        if amount <= 0 {
            return Err(GatewayError::Rejected(format!("amount {} must be positive", amount)));
        }
        let payment_id = format!("pay_{}", new_id());
        info!(
            "Opened payment {} for {} {} (amount {})",
            payment_id,
            context.as_str(),
            context_id,
            amount
        );
        Ok(payment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_gateway() {
        let gateway = LoggingGateway;
        let id = gateway
            .settle_payment(PaymentContext::WalletTopUp, "tx1", 1000)
            .await
            .unwrap();
        assert!(id.starts_with("pay_"));
        assert!(gateway.settle_payment(PaymentContext::WalletTopUp, "tx1", 0).await.is_err());
    }
}
