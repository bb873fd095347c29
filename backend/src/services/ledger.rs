//! # Ledger Primitives
//!
//! Money movement inside an open unit of work. Every balance change goes
//! through [`Ledger::post`], which writes one Completed transaction row and
//! the new wallet balance together, so `balance == Σcredits − Σdebits`
//! holds at every commit.
//!
//! ## Escrow Flows
//!
//! ```text
//! hold:     student  ──EscrowPayment──>  escrow account  (EscrowHold)
//! release:  escrow account ──EscrowSettlement──> tutor (Payout, net)
//!                                             └> platform (Commission)
//! refund:   escrow account ──EscrowSettlement──> student (Refund, refunded part)
//!                                             ├> tutor (Payout, retained net)
//!                                             └> platform (Commission, retained cut)
//! ```
//!
//! These helpers never commit. The calling service owns the unit of work.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::db::{
    new_id, Class, Direction, Escrow, EscrowStatus, LedgerTransaction, StoreTx, TransactionStatus,
    TransactionType, Wallet,
};
use crate::domain::commission::{self, CommissionBreakdown};
use crate::domain::refund::refund_amount;
use crate::errors::CoreError;

/// Owner ids of the two system wallets.
#[derive(Debug, Clone)]
pub struct Ledger {
    pub escrow_account: String,
    pub platform_account: String,
}

/// What a refund moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundSplit {
    pub refunded: i64,
    pub tutor_payout: i64,
    pub platform_commission: i64,
}

impl Ledger {
    pub fn new(escrow_account: impl Into<String>, platform_account: impl Into<String>) -> Self {
        Self {
            escrow_account: escrow_account.into(),
            platform_account: platform_account.into(),
        }
    }

    /// System wallets may run any balance through them but never go negative.
    pub fn is_system_account(&self, user_id: &str) -> bool {
        user_id == self.escrow_account || user_id == self.platform_account
    }

    pub async fn load_or_create_wallet(
        &self,
        tx: &mut dyn StoreTx,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Wallet, CoreError> {
        if let Some(wallet) = tx.wallet_by_user(user_id).await? {
            return Ok(wallet);
        }
        let wallet = Wallet {
            id: new_id(),
            user_id: user_id.to_string(),
            balance: 0,
            is_frozen: false,
            created_at: now,
            updated_at: now,
        };
        tx.upsert_wallet(&wallet).await?;
        debug!("Created wallet {} for {}", wallet.id, user_id);
        Ok(wallet)
    }

    /// Apply one completed ledger row to `wallet`.
    ///
    /// Debits fail on frozen wallets and when the balance would go negative.
    /// Zero amounts write nothing.
    pub async fn post(
        &self,
        tx: &mut dyn StoreTx,
        wallet: &mut Wallet,
        transaction_type: TransactionType,
        amount: i64,
        reference_id: Option<&str>,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerTransaction>, CoreError> {
        if amount < 0 {
            return Err(CoreError::Validation(format!("ledger amount {} is negative", amount)));
        }
        if amount == 0 {
            return Ok(None);
        }

        match transaction_type.direction() {
            Direction::Debit => {
                if wallet.is_frozen {
                    return Err(CoreError::WalletFrozen(wallet.id.clone()));
                }
                if wallet.balance < amount {
                    return Err(CoreError::InsufficientBalance {
                        wallet_id: wallet.id.clone(),
                        available: wallet.balance,
                        requested: amount,
                    });
                }
                wallet.balance -= amount;
            }
            Direction::Credit => wallet.balance += amount,
        }
        wallet.updated_at = now;

        let row = LedgerTransaction {
            id: new_id(),
            wallet_id: wallet.id.clone(),
            transaction_type,
            amount,
            status: TransactionStatus::Completed,
            reference_id: reference_id.map(str::to_string),
            note,
            created_at: now,
            completed_at: Some(now),
        };
        tx.upsert_transaction(&row).await?;
        tx.upsert_wallet(wallet).await?;
        Ok(Some(row))
    }

    /// Load (or create) the owner's wallet and post one row to it.
    pub async fn post_to_user(
        &self,
        tx: &mut dyn StoreTx,
        user_id: &str,
        transaction_type: TransactionType,
        amount: i64,
        reference_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Wallet, CoreError> {
        let mut wallet = self.load_or_create_wallet(tx, user_id, now).await?;
        self.post(tx, &mut wallet, transaction_type, amount, reference_id, None, now)
            .await?;
        Ok(wallet)
    }

    /// Move `gross` from the student into the escrow account and open a Held
    /// escrow carrying the commission snapshot.
    pub async fn hold_escrow(
        &self,
        tx: &mut dyn StoreTx,
        class: &Class,
        student_id: &str,
        gross: i64,
        breakdown: CommissionBreakdown,
        now: DateTime<Utc>,
    ) -> Result<Escrow, CoreError> {
        if gross <= 0 {
            return Err(CoreError::Validation(format!("escrow amount {} must be positive", gross)));
        }

        let escrow = Escrow {
            id: new_id(),
            class_id: class.id.clone(),
            student_id: student_id.to_string(),
            tutor_id: class.tutor_id.clone(),
            amount: gross,
            commission_rate_bps: breakdown.rate_bps,
            commission_amount: breakdown.commission_amount,
            net_amount: breakdown.net_amount,
            refunded_amount: 0,
            status: EscrowStatus::Held,
            created_at: now,
            updated_at: now,
            settled_at: None,
        };

        // The escrow account row is always locked first.
        let mut account = self.load_or_create_wallet(tx, &self.escrow_account, now).await?;
        let mut payer = self.load_or_create_wallet(tx, student_id, now).await?;
        self.post(
            tx,
            &mut payer,
            TransactionType::EscrowPayment,
            gross,
            Some(&escrow.id),
            Some(format!("Escrow for class {}", class.id)),
            now,
        )
        .await?;
        self.post(tx, &mut account, TransactionType::EscrowHold, gross, Some(&escrow.id), None, now)
            .await?;

        tx.upsert_escrow(&escrow).await?;
        debug!("Escrow {} held {} for class {}", escrow.id, gross, class.id);
        Ok(escrow)
    }

    /// Pay a Held escrow out to the tutor and the platform.
    pub async fn release_escrow(
        &self,
        tx: &mut dyn StoreTx,
        escrow: &mut Escrow,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        ensure_held(escrow, "release")?;

        self.settle_out(tx, escrow, now).await?;
        self.post_to_user(tx, &escrow.tutor_id, TransactionType::Payout, escrow.net_amount, Some(&escrow.id), now)
            .await?;
        self.post_to_user(
            tx,
            &self.platform_account,
            TransactionType::Commission,
            escrow.commission_amount,
            Some(&escrow.id),
            now,
        )
        .await?;

        escrow.status = EscrowStatus::Released;
        escrow.updated_at = now;
        escrow.settled_at = Some(now);
        tx.upsert_escrow(escrow).await?;
        Ok(())
    }

    /// Return `percent` of a Held escrow to the payer. The retained part is
    /// split between tutor and platform at the escrow's rate snapshot.
    pub async fn refund_escrow(
        &self,
        tx: &mut dyn StoreTx,
        escrow: &mut Escrow,
        percent: u8,
        now: DateTime<Utc>,
    ) -> Result<RefundSplit, CoreError> {
        ensure_held(escrow, "refund")?;

        let refunded = refund_amount(escrow.amount, percent.min(100));
        let retained = commission::split(escrow.amount - refunded, escrow.commission_rate_bps)?;

        self.settle_out(tx, escrow, now).await?;
        self.post_to_user(tx, &escrow.student_id, TransactionType::Refund, refunded, Some(&escrow.id), now)
            .await?;
        self.post_to_user(tx, &escrow.tutor_id, TransactionType::Payout, retained.net_amount, Some(&escrow.id), now)
            .await?;
        self.post_to_user(
            tx,
            &self.platform_account,
            TransactionType::Commission,
            retained.commission_amount,
            Some(&escrow.id),
            now,
        )
        .await?;

        escrow.status = EscrowStatus::Refunded;
        escrow.refunded_amount = refunded;
        escrow.updated_at = now;
        escrow.settled_at = Some(now);
        tx.upsert_escrow(escrow).await?;

        Ok(RefundSplit {
            refunded,
            tutor_payout: retained.net_amount,
            platform_commission: retained.commission_amount,
        })
    }

    async fn settle_out(&self, tx: &mut dyn StoreTx, escrow: &Escrow, now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut account = self.load_or_create_wallet(tx, &self.escrow_account, now).await?;
        self.post(
            tx,
            &mut account,
            TransactionType::EscrowSettlement,
            escrow.amount,
            Some(&escrow.id),
            None,
            now,
        )
        .await?;
        Ok(())
    }
}

fn ensure_held(escrow: &Escrow, action: &'static str) -> Result<(), CoreError> {
    if escrow.status != EscrowStatus::Held {
        return Err(CoreError::invalid_transition("Escrow", &escrow.id, escrow.status, action));
    }
    Ok(())
}

/// Σcredits − Σdebits over the Completed rows.
pub fn ledger_balance(rows: &[LedgerTransaction]) -> i64 {
    rows.iter()
        .filter(|t| t.status == TransactionStatus::Completed)
        .map(|t| match t.transaction_type.direction() {
            Direction::Credit => t.amount,
            Direction::Debit => -t.amount,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::db::{ClassStatus, DeliveryMode, MemoryStore, Store};

    fn ledger() -> Ledger {
        Ledger::new("system:escrow", "system:platform")
    }

    fn class() -> Class {
        let now = Utc::now();
        Class {
            id: "c1".into(),
            tutor_id: "t1".into(),
            request_id: None,
            title: "Physics".into(),
            mode: DeliveryMode::OneToOneOnline,
            price: 1_000_000,
            student_limit: 1,
            current_student_count: 0,
            rules: vec![],
            start_date: NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            status: ClassStatus::Active,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn funded(store: &MemoryStore, user: &str, amount: i64) {
        let mut tx = store.begin(vec![]).await.unwrap();
        ledger()
            .post_to_user(tx.as_mut(), user, TransactionType::TopUp, amount, None, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    async fn balance(tx: &mut dyn StoreTx, user: &str) -> i64 {
        tx.wallet_by_user(user).await.unwrap().map(|w| w.balance).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_hold_then_release_splits_commission() {
        let store = MemoryStore::new();
        funded(&store, "s1", 1_000_000).await;

        let mut tx = store.begin(vec![]).await.unwrap();
        let breakdown = commission::split(1_000_000, 1200).unwrap();
        let mut escrow = ledger()
            .hold_escrow(tx.as_mut(), &class(), "s1", 1_000_000, breakdown, Utc::now())
            .await
            .unwrap();
        assert_eq!(balance(tx.as_mut(), "s1").await, 0);
        assert_eq!(balance(tx.as_mut(), "system:escrow").await, 1_000_000);

        ledger().release_escrow(tx.as_mut(), &mut escrow, Utc::now()).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Released);
        assert_eq!(balance(tx.as_mut(), "t1").await, 880_000);
        assert_eq!(balance(tx.as_mut(), "system:platform").await, 120_000);
        assert_eq!(balance(tx.as_mut(), "system:escrow").await, 0);

        let err = ledger().refund_escrow(tx.as_mut(), &mut escrow, 100, Utc::now()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_partial_refund_pays_retained_part() {
        let store = MemoryStore::new();
        funded(&store, "s1", 1_000_000).await;

        let mut tx = store.begin(vec![]).await.unwrap();
        let breakdown = commission::split(1_000_000, 1000).unwrap();
        let mut escrow = ledger()
            .hold_escrow(tx.as_mut(), &class(), "s1", 1_000_000, breakdown, Utc::now())
            .await
            .unwrap();

        let split = ledger().refund_escrow(tx.as_mut(), &mut escrow, 50, Utc::now()).await.unwrap();
        assert_eq!(split.refunded, 500_000);
        assert_eq!(split.tutor_payout, 450_000);
        assert_eq!(split.platform_commission, 50_000);
        assert_eq!(escrow.refunded_amount, 500_000);
        assert_eq!(balance(tx.as_mut(), "s1").await, 500_000);
        assert_eq!(balance(tx.as_mut(), "system:escrow").await, 0);
    }

    #[tokio::test]
    async fn test_debit_guards() {
        let store = MemoryStore::new();
        funded(&store, "s1", 100).await;

        let mut tx = store.begin(vec![]).await.unwrap();
        let mut wallet = tx.wallet_by_user("s1").await.unwrap().unwrap();
        let err = ledger()
            .post(tx.as_mut(), &mut wallet, TransactionType::EscrowPayment, 101, None, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientBalance { available: 100, requested: 101, .. }));

        wallet.is_frozen = true;
        let err = ledger()
            .post(tx.as_mut(), &mut wallet, TransactionType::EscrowPayment, 10, None, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::WalletFrozen(_)));

        // Frozen wallets still take credits.
        ledger()
            .post(tx.as_mut(), &mut wallet, TransactionType::Refund, 10, None, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(wallet.balance, 110);

        let rows = tx.transactions_for_wallet(&wallet.id).await.unwrap();
        assert_eq!(ledger_balance(&rows), wallet.balance);
    }
}
