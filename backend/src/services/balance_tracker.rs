//! # Balance Tracker Service
//!
//! The BalanceTracker checks that every stored wallet balance equals what
//! its ledger rows say it should be.
//!
//! ## Reconciliation Flow
//!
//! ```text
//! Open one read-only snapshot, then for every wallet:
//! 1. Load the Completed ledger rows
//!               ↓
//! 2. Recompute Σcredits − Σdebits
//!               ↓
//! 3. Compare with the stored balance
//!               ↓
//! 4. If different: log at error and report the discrepancy
//! ```
//!
//! ## Why Not Auto-correct?
//!
//! The ledger rows are the source of truth and the balance column is
//! derived from them inside the same unit of work. A mismatch means a bug
//! or a manual edit; it goes to an operator instead of being overwritten.
//!
//! The wallet rows and the ledger rows must come from the same snapshot.
//! Read separately, a top-up committing between the two reads would look
//! like a discrepancy.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::db::{Store, StoreTx, Wallet};
use crate::errors::CoreError;

use super::ledger::ledger_balance;

/// A wallet whose stored balance disagrees with its ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletDiscrepancy {
    pub wallet_id: String,
    pub user_id: String,
    pub stored_balance: i64,
    pub ledger_balance: i64,
    /// `ledger_balance - stored_balance`
    pub difference: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub wallets_checked: usize,
    pub discrepancies: Vec<WalletDiscrepancy>,
    /// Sum of stored balances, system accounts included.
    pub total_balance: i64,
}

/// The Balance Tracker service.
///
/// ## Usage
///
/// ```rust,ignore
/// let tracker = BalanceTracker::new(store);
///
/// // Every wallet
/// let report = tracker.reconcile_all().await?;
///
/// // Or a specific user
/// let discrepancy = tracker.reconcile_wallet("user-1").await?;
/// ```
#[derive(Clone)]
pub struct BalanceTracker {
    store: Arc<dyn Store>,
}

impl BalanceTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Reconcile all wallets.
    pub async fn reconcile_all(&self) -> Result<ReconciliationReport, CoreError> {
        info!("Starting full reconciliation of all wallets");

        let mut tx = self.store.begin_snapshot().await?;
        let mut report = ReconciliationReport::default();
        for wallet in tx.wallets().await? {
            report.wallets_checked += 1;
            report.total_balance += wallet.balance;
            if let Some(discrepancy) = check_wallet(tx.as_mut(), &wallet).await? {
                report.discrepancies.push(discrepancy);
            }
        }

        info!(
            "Reconciliation complete: checked {} wallets, found {} discrepancies, total balance {}",
            report.wallets_checked,
            report.discrepancies.len(),
            report.total_balance
        );
        Ok(report)
    }

    /// Reconcile one user's wallet.
    ///
    /// ## Returns
    ///
    /// * `Ok(None)` - Balance matches the ledger
    /// * `Ok(Some(..))` - Discrepancy found (logged, not corrected)
    pub async fn reconcile_wallet(&self, user_id: &str) -> Result<Option<WalletDiscrepancy>, CoreError> {
        debug!("Reconciling wallet of {}", user_id);

        let mut tx = self.store.begin_snapshot().await?;
        let wallet = tx
            .wallet_by_user(user_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Wallet", user_id))?;
        check_wallet(tx.as_mut(), &wallet).await
    }
}

async fn check_wallet(tx: &mut dyn StoreTx, wallet: &Wallet) -> Result<Option<WalletDiscrepancy>, CoreError> {
    let rows = tx.transactions_for_wallet(&wallet.id).await?;
    let expected = ledger_balance(&rows);
    if expected == wallet.balance {
        debug!("Wallet {} balance matches: {}", wallet.id, wallet.balance);
        return Ok(None);
    }

    let difference = expected - wallet.balance;
    error!(
        "Balance discrepancy for wallet {} ({}): stored={}, ledger={}, diff={}",
        wallet.id, wallet.user_id, wallet.balance, expected, difference
    );
    Ok(Some(WalletDiscrepancy {
        wallet_id: wallet.id.clone(),
        user_id: wallet.user_id.clone(),
        stored_balance: wallet.balance,
        ledger_balance: expected,
        difference,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::db::{MemoryStore, TransactionType};
    use crate::services::ledger::Ledger;

    #[tokio::test]
    async fn test_reports_without_correcting() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new("system:escrow", "system:platform");
        let now = Utc::now();

        let mut tx = store.begin(vec![]).await.unwrap();
        ledger.post_to_user(tx.as_mut(), "u1", TransactionType::TopUp, 500, None, now).await.unwrap();
        ledger.post_to_user(tx.as_mut(), "u2", TransactionType::TopUp, 300, None, now).await.unwrap();
        tx.commit().await.unwrap();

        let tracker = BalanceTracker::new(store.clone());
        let clean = tracker.reconcile_all().await.unwrap();
        assert_eq!(clean.wallets_checked, 2);
        assert!(clean.discrepancies.is_empty());
        assert_eq!(clean.total_balance, 800);

        // Edit a balance behind the ledger's back.
        let mut tx = store.begin(vec![]).await.unwrap();
        let mut wallet = tx.wallet_by_user("u1").await.unwrap().unwrap();
        wallet.balance = 450;
        tx.upsert_wallet(&wallet).await.unwrap();
        tx.commit().await.unwrap();

        let found = tracker.reconcile_wallet("u1").await.unwrap().unwrap();
        assert_eq!(found.ledger_balance, 500);
        assert_eq!(found.difference, 50);

        // Still wrong on the next pass: nothing was overwritten.
        let report = tracker.reconcile_all().await.unwrap();
        assert_eq!(report.discrepancies.len(), 1);
        assert_eq!(report.discrepancies[0].stored_balance, 450);
        assert!(tracker.reconcile_wallet("u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconciliation_reads_one_snapshot() {
        let store = Arc::new(MemoryStore::recording());
        let tracker = BalanceTracker::new(store.clone());
        let ledger = Ledger::new("system:escrow", "system:platform");

        let mut tx = store.begin(vec![]).await.unwrap();
        ledger.post_to_user(tx.as_mut(), "u1", TransactionType::TopUp, 500, None, Utc::now()).await.unwrap();
        tx.commit().await.unwrap();
        store.clear_lock_log();

        tracker.reconcile_all().await.unwrap();
        tracker.reconcile_wallet("u1").await.unwrap();
        assert_eq!(store.snapshot_count(), 2);
        assert!(store.lock_log().is_empty());
    }

    #[tokio::test]
    async fn test_no_false_alerts_while_wallets_move() {
        let store = Arc::new(MemoryStore::new());
        let tracker = BalanceTracker::new(store.clone());

        let writers: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let ledger = Ledger::new("system:escrow", "system:platform");
                    let user = format!("u{}", i % 4);
                    let mut tx = store.begin(vec![]).await.unwrap();
                    ledger.post_to_user(tx.as_mut(), &user, TransactionType::TopUp, 100, None, Utc::now()).await.unwrap();
                    tx.commit().await.unwrap();
                })
            })
            .collect();

        for _ in 0..10 {
            let report = tracker.reconcile_all().await.unwrap();
            assert!(report.discrepancies.is_empty());
            tokio::task::yield_now().await;
        }
        for writer in writers {
            writer.await.unwrap();
        }
        let report = tracker.reconcile_all().await.unwrap();
        assert_eq!(report.total_balance, 2_000);
        assert!(report.discrepancies.is_empty());
    }

    #[tokio::test]
    async fn test_missing_wallet() {
        let tracker = BalanceTracker::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            tracker.reconcile_wallet("nobody").await,
            Err(CoreError::NotFound { .. })
        ));
    }
}
