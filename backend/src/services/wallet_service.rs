//! # Wallet Service
//!
//! Per-user balances: lazy creation, gateway top-ups, the idempotent
//! payment confirmation callback, freezing and history queries.
//!
//! ## Top-up Flow
//!
//! ```text
//! 1. request_top_up      -> Pending TopUp row committed, returned at once
//!              ↓
//! 2. background task: gateway.settle_payment(WalletTopUp, txId, amount)
//!    with retry
//!              ↓
//! 3. PaymentConfirmed(txId) -> confirm_payment
//!              ↓
//! 4. First call: wallet credited, row Completed
//!    Later calls: already_applied, nothing written
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::{
    new_id, LedgerTransaction, LockKey, Store, TransactionStatus, TransactionType, Wallet,
};
use crate::errors::CoreError;

use super::identity::Actor;
use super::ledger::Ledger;
use super::payment_gateway::{PaymentContext, PaymentGateway};
use super::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopUpOutcome {
    /// Stays Pending until the gateway confirms the payment.
    pub transaction: LedgerTransaction,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmOutcome {
    pub transaction: LedgerTransaction,
    pub already_applied: bool,
    pub balance: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSummary {
    pub wallet: Wallet,
    pub pending_top_ups: i64,
    pub transaction_count: usize,
}

#[derive(Clone)]
pub struct WalletService {
    store: Arc<dyn Store>,
    ledger: Ledger,
    gateway: Arc<dyn PaymentGateway>,
    retry: RetryPolicy,
}

impl WalletService {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Ledger,
        gateway: Arc<dyn PaymentGateway>,
        retry: RetryPolicy,
    ) -> Self {
        Self { store, ledger, gateway, retry }
    }

    /// Create the user's wallet if missing.
    pub async fn ensure_wallet(&self, user_id: &str, now: DateTime<Utc>) -> Result<Wallet, CoreError> {
        let mut tx = self.store.begin(vec![LockKey::Wallet(user_id.to_string())]).await?;
        let wallet = self.ledger.load_or_create_wallet(tx.as_mut(), user_id, now).await?;
        tx.commit().await?;
        Ok(wallet)
    }

    /// Create the escrow and platform wallets. Run once at startup.
    pub async fn ensure_system_wallets(&self, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.ensure_wallet(&self.ledger.escrow_account, now).await?;
        self.ensure_wallet(&self.ledger.platform_account, now).await?;
        Ok(())
    }

    /// Record a Pending top-up and open a gateway payment for it.
    pub async fn request_top_up(
        &self,
        actor: &Actor,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<TopUpOutcome, CoreError> {
        info!("Top-up of {} requested by {}", amount, actor.user_id);
        if amount <= 0 {
            return Err(CoreError::Validation(format!("top-up amount {} must be positive", amount)));
        }

        let mut tx = self.store.begin(vec![LockKey::Wallet(actor.user_id.clone())]).await?;
        let wallet = self.ledger.load_or_create_wallet(tx.as_mut(), &actor.user_id, now).await?;
        let row = LedgerTransaction {
            id: new_id(),
            wallet_id: wallet.id.clone(),
            transaction_type: TransactionType::TopUp,
            amount,
            status: TransactionStatus::Pending,
            reference_id: None,
            note: Some("Awaiting payment confirmation".to_string()),
            created_at: now,
            completed_at: None,
        };
        tx.upsert_transaction(&row).await?;
        tx.commit().await?;

        // Not awaited: confirmation arrives through confirm_payment.
        self.spawn_settlement(row.id.clone(), amount);
        Ok(TopUpOutcome { transaction: row })
    }

    /// Open the gateway payment on a background task. The handle yields the
    /// payment id, or `None` once every attempt failed.
    fn spawn_settlement(&self, context_id: String, amount: i64) -> JoinHandle<Option<String>> {
        let gateway = self.gateway.clone();
        let retry = self.retry.clone();
        tokio::spawn(async move {
            let result = retry
                .retry_async("settle_payment", |_| {
                    let gateway = gateway.clone();
                    let context_id = context_id.clone();
                    async move {
                        gateway
                            .settle_payment(PaymentContext::WalletTopUp, &context_id, amount)
                            .await
                    }
                })
                .await;
            match result {
                Ok(payment_id) => {
                    debug!("Top-up {} opened as payment {}", context_id, payment_id);
                    Some(payment_id)
                }
                Err(e) => {
                    warn!("Top-up {} left pending, gateway failed: {}", context_id, e);
                    None
                }
            }
        })
    }

    /// Handle `PaymentConfirmed(contextId)`. Safe to call any number of times.
    pub async fn confirm_payment(&self, context_id: &str, now: DateTime<Utc>) -> Result<ConfirmOutcome, CoreError> {
        info!("Payment confirmed for context {}", context_id);

        let mut tx = self.store.begin(vec![]).await?;
        let row = tx
            .transaction(context_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Transaction", context_id))?;
        if row.transaction_type != TransactionType::TopUp {
            return Err(CoreError::Validation(format!("transaction {} is not a top-up", context_id)));
        }

        // Lock the wallet, then look at the row again: a confirmation that
        // committed while we waited must be seen here.
        let mut wallet = tx
            .wallet(&row.wallet_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Wallet", &row.wallet_id))?;
        let mut row = tx
            .transaction(context_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Transaction", context_id))?;

        match row.status {
            TransactionStatus::Completed => {
                debug!("Payment {} already applied", context_id);
                return Ok(ConfirmOutcome { transaction: row, already_applied: true, balance: wallet.balance });
            }
            TransactionStatus::Failed => {
                return Err(CoreError::invalid_transition("Transaction", context_id, row.status, "confirm"));
            }
            TransactionStatus::Pending => {}
        }

        wallet.balance += row.amount;
        wallet.updated_at = now;
        row.status = TransactionStatus::Completed;
        row.completed_at = Some(now);
        tx.upsert_transaction(&row).await?;
        tx.upsert_wallet(&wallet).await?;
        tx.commit().await?;

        info!("Wallet {} credited {} (balance {})", wallet.id, row.amount, wallet.balance);
        Ok(ConfirmOutcome { transaction: row, already_applied: false, balance: wallet.balance })
    }

    pub async fn set_frozen(
        &self,
        actor: &Actor,
        user_id: &str,
        frozen: bool,
        now: DateTime<Utc>,
    ) -> Result<Wallet, CoreError> {
        actor.require_admin()?;
        info!("{} wallet of {}", if frozen { "Freezing" } else { "Unfreezing" }, user_id);

        let mut tx = self.store.begin(vec![LockKey::Wallet(user_id.to_string())]).await?;
        let mut wallet = self.ledger.load_or_create_wallet(tx.as_mut(), user_id, now).await?;
        wallet.is_frozen = frozen;
        wallet.updated_at = now;
        tx.upsert_wallet(&wallet).await?;
        tx.commit().await?;
        Ok(wallet)
    }

    pub async fn wallet_summary(&self, user_id: &str) -> Result<WalletSummary, CoreError> {
        debug!("Fetching wallet summary for {}", user_id);
        let mut tx = self.store.begin(vec![]).await?;
        let wallet = tx
            .wallet_by_user(user_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Wallet", user_id))?;
        let rows = tx.transactions_for_wallet(&wallet.id).await?;
        let pending_top_ups = rows
            .iter()
            .filter(|t| t.transaction_type == TransactionType::TopUp && t.status == TransactionStatus::Pending)
            .map(|t| t.amount)
            .sum();
        Ok(WalletSummary { wallet, pending_top_ups, transaction_count: rows.len() })
    }

    /// Ledger rows of a user's wallet, oldest first.
    pub async fn transactions(&self, user_id: &str) -> Result<Vec<LedgerTransaction>, CoreError> {
        let mut tx = self.store.begin(vec![]).await?;
        let wallet = tx
            .wallet_by_user(user_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Wallet", user_id))?;
        Ok(tx.transactions_for_wallet(&wallet.id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::db::{MemoryStore, Role};
    use crate::services::payment_gateway::{GatewayError, LoggingGateway};

    struct DownGateway;

    #[async_trait]
    impl PaymentGateway for DownGateway {
        async fn settle_payment(&self, _: PaymentContext, _: &str, _: i64) -> Result<String, GatewayError> {
            Err(GatewayError::Unavailable("connection refused".into()))
        }
    }

    /// Never answers.
    struct HangingGateway;

    #[async_trait]
    impl PaymentGateway for HangingGateway {
        async fn settle_payment(&self, _: PaymentContext, _: &str, _: i64) -> Result<String, GatewayError> {
            std::future::pending().await
        }
    }

    fn service(gateway: Arc<dyn PaymentGateway>) -> WalletService {
        WalletService::new(
            Arc::new(MemoryStore::new()),
            Ledger::new("system:escrow", "system:platform"),
            gateway,
            RetryPolicy::new(2, 1),
        )
    }

    #[tokio::test]
    async fn test_confirm_payment_is_idempotent() {
        let wallets = service(Arc::new(LoggingGateway));
        let student = Actor::new("s1", Role::Student);

        let outcome = wallets.request_top_up(&student, 5_000, Utc::now()).await.unwrap();
        assert_eq!(outcome.transaction.status, TransactionStatus::Pending);
        assert_eq!(wallets.wallet_summary("s1").await.unwrap().pending_top_ups, 5_000);

        let first = wallets.confirm_payment(&outcome.transaction.id, Utc::now()).await.unwrap();
        assert!(!first.already_applied);
        assert_eq!(first.balance, 5_000);

        let second = wallets.confirm_payment(&outcome.transaction.id, Utc::now()).await.unwrap();
        assert!(second.already_applied);
        assert_eq!(second.balance, 5_000);

        let rows = wallets.transactions("s1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_gateway_failure_keeps_pending_row() {
        let wallets = service(Arc::new(DownGateway));
        let student = Actor::new("s1", Role::Student);

        let outcome = wallets.request_top_up(&student, 700, Utc::now()).await.unwrap();
        let settled = wallets.spawn_settlement(outcome.transaction.id.clone(), 700).await.unwrap();
        assert!(settled.is_none());

        let summary = wallets.wallet_summary("s1").await.unwrap();
        assert_eq!(summary.wallet.balance, 0);
        assert_eq!(summary.pending_top_ups, 700);
    }

    #[tokio::test]
    async fn test_top_up_does_not_wait_for_the_gateway() {
        let wallets = service(Arc::new(HangingGateway));
        let student = Actor::new("s1", Role::Student);

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            wallets.request_top_up(&student, 300, Utc::now()),
        )
        .await
        .expect("top-up blocked on the gateway")
        .unwrap();
        assert_eq!(outcome.transaction.status, TransactionStatus::Pending);

        let settled = service(Arc::new(LoggingGateway)).spawn_settlement("ctx-1".into(), 300).await.unwrap();
        assert!(settled.unwrap().starts_with("pay_"));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let wallets = service(Arc::new(LoggingGateway));
        let student = Actor::new("s1", Role::Student);

        assert!(matches!(
            wallets.request_top_up(&student, 0, Utc::now()).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            wallets.confirm_payment("missing", Utc::now()).await,
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            wallets.set_frozen(&student, "s2", true, Utc::now()).await,
            Err(CoreError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_freeze_by_admin() {
        let wallets = service(Arc::new(LoggingGateway));
        let admin = Actor::new("a1", Role::Admin);
        let wallet = wallets.set_frozen(&admin, "s1", true, Utc::now()).await.unwrap();
        assert!(wallet.is_frozen);
        assert!(wallets.wallet_summary("s1").await.unwrap().wallet.is_frozen);
    }
}
