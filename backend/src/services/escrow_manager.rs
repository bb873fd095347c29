//! # Escrow Manager
//!
//! Holds class payments until the class completes, then pays the tutor and
//! the platform; refunds them on cancellation according to the refund
//! policy. Also owns the commission configuration.
//!
//! Every escrow write holds the owning class's lock, which serializes it
//! against cancellation and the completion sweep.
//!
//! ## Operations
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | `pay_escrow` | payer debited, escrow account credited, Escrow Held |
//! | `release_escrow` | tutor gets net, platform gets commission, Released |
//! | `refund_escrow` | payer gets policy share, rest split, Refunded |

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::db::{
    new_id, CancellationReason, Class, ClassAssign, CommissionConfig, DeliveryMode, Escrow,
    LessonStatus, LockKey, PaymentStatus, Store, StoreTx,
};
use crate::domain::commission::{self, calculate_commission, CommissionBreakdown};
use crate::domain::refund::RefundPolicy;
use crate::errors::CoreError;

use super::identity::Actor;
use super::ledger::{Ledger, RefundSplit};
use super::notifications::{dispatch_all, CoreEvent, NotificationSink};

/// Rates for a new configuration row, in basis points.
#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionRates {
    pub one_to_one_online_bps: i32,
    pub one_to_one_offline_bps: i32,
    pub group_online_bps: i32,
    pub group_offline_bps: i32,
}

#[derive(Clone)]
pub struct EscrowManager {
    store: Arc<dyn Store>,
    ledger: Ledger,
    refund_policy: RefundPolicy,
    notifier: Arc<dyn NotificationSink>,
}

impl EscrowManager {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Ledger,
        refund_policy: RefundPolicy,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self { store, ledger, refund_policy, notifier }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn refund_policy(&self) -> &RefundPolicy {
        &self.refund_policy
    }

    // ==========================================
    // COMMISSION CONFIGURATION
    // ==========================================

    /// The single active configuration row.
    pub async fn active_commission_config(&self) -> Result<CommissionConfig, CoreError> {
        let mut tx = self.store.begin(vec![]).await?;
        active_config(tx.as_mut()).await
    }

    /// Insert a new active configuration; the previous one is deactivated in
    /// the same unit of work.
    pub async fn set_active_commission_config(
        &self,
        actor: &Actor,
        rates: CommissionRates,
        now: DateTime<Utc>,
    ) -> Result<CommissionConfig, CoreError> {
        actor.require_admin()?;
        commission::validate_rates([
            rates.one_to_one_online_bps,
            rates.one_to_one_offline_bps,
            rates.group_online_bps,
            rates.group_offline_bps,
        ])?;

        let config = CommissionConfig {
            id: new_id(),
            one_to_one_online_bps: rates.one_to_one_online_bps,
            one_to_one_offline_bps: rates.one_to_one_offline_bps,
            group_online_bps: rates.group_online_bps,
            group_offline_bps: rates.group_offline_bps,
            is_active: true,
            created_at: now,
        };

        let mut tx = self.store.begin(vec![]).await?;
        tx.insert_commission_config(&config).await?;
        tx.commit().await?;

        info!("Commission config {} is now active", config.id);
        Ok(config)
    }

    /// Commission for `gross` under the active configuration.
    pub async fn quote(&self, mode: DeliveryMode, gross: i64) -> Result<CommissionBreakdown, CoreError> {
        let config = self.active_commission_config().await?;
        calculate_commission(&config, mode, gross)
    }

    // ==========================================
    // ESCROW OPERATIONS
    // ==========================================

    /// Hold `gross` from `payer_id` for a class.
    pub async fn pay_escrow(
        &self,
        actor: &Actor,
        class_id: &str,
        gross: i64,
        payer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Escrow, CoreError> {
        actor.require_owner(payer_id, "the paying wallet")?;
        info!("Paying escrow of {} for class {} from {}", gross, class_id, payer_id);

        let mut tx = self
            .store
            .begin(vec![LockKey::Class(class_id.to_string()), LockKey::Wallet(payer_id.to_string())])
            .await?;
        let class = load_class(tx.as_mut(), class_id).await?;
        if class.status.is_terminal() {
            return Err(CoreError::invalid_transition("Class", &class.id, class.status, "pay for"));
        }
        let escrow = self.pay_escrow_in(tx.as_mut(), &class, payer_id, gross, now).await?;
        tx.commit().await?;

        self.notifier.dispatch(held_event(&escrow));
        Ok(escrow)
    }

    /// Release a Held escrow to the tutor and the platform.
    pub async fn release_escrow(&self, actor: &Actor, escrow_id: &str, now: DateTime<Utc>) -> Result<Escrow, CoreError> {
        actor.require_admin()?;
        info!("Releasing escrow {}", escrow_id);

        let class_id = self.escrow_class(escrow_id).await?;
        let mut tx = self.store.begin(vec![LockKey::Class(class_id)]).await?;
        let mut escrow = load_escrow(tx.as_mut(), escrow_id).await?;
        self.ledger.release_escrow(tx.as_mut(), &mut escrow, now).await?;
        tx.commit().await?;

        self.notifier.dispatch(released_event(&escrow));
        Ok(escrow)
    }

    /// Refund a Held escrow for `reason`.
    pub async fn refund_escrow(
        &self,
        actor: &Actor,
        escrow_id: &str,
        reason: CancellationReason,
        now: DateTime<Utc>,
    ) -> Result<Escrow, CoreError> {
        actor.require_admin()?;
        info!("Refunding escrow {} ({})", escrow_id, reason);

        let class_id = self.escrow_class(escrow_id).await?;
        let mut tx = self.store.begin(vec![LockKey::Class(class_id)]).await?;
        let mut escrow = load_escrow(tx.as_mut(), escrow_id).await?;
        let until_next = time_until_next_lesson(tx.as_mut(), &escrow.class_id, now).await?;
        let percent = self.refund_policy.percent_for(reason, until_next);
        self.refund_in(tx.as_mut(), &mut escrow, percent, now).await?;
        tx.commit().await?;

        dispatch_all(self.notifier.as_ref(), vec![refunded_event(&escrow)]);
        Ok(escrow)
    }

    pub async fn escrows_for_class(&self, class_id: &str) -> Result<Vec<Escrow>, CoreError> {
        let mut tx = self.store.begin(vec![]).await?;
        Ok(tx.escrows_for_class(class_id).await?)
    }

    // ==========================================
    // IN-UNIT HELPERS
    // ==========================================

    /// Look up the active rate, snapshot it and hold the funds.
    pub(crate) async fn pay_escrow_in(
        &self,
        tx: &mut dyn StoreTx,
        class: &Class,
        payer_id: &str,
        gross: i64,
        now: DateTime<Utc>,
    ) -> Result<Escrow, CoreError> {
        let config = active_config(tx).await?;
        let breakdown = calculate_commission(&config, class.mode, gross)?;
        debug!(
            "Commission for class {}: {} bps, {} of {}",
            class.id, breakdown.rate_bps, breakdown.commission_amount, gross
        );
        self.ledger.hold_escrow(tx, class, payer_id, gross, breakdown, now).await
    }

    /// Refund and mark the matching enrollment Refunded.
    pub(crate) async fn refund_in(
        &self,
        tx: &mut dyn StoreTx,
        escrow: &mut Escrow,
        percent: u8,
        now: DateTime<Utc>,
    ) -> Result<RefundSplit, CoreError> {
        let split = self.ledger.refund_escrow(tx, escrow, percent, now).await?;
        if let Some(mut assign) = tx.class_assign(&escrow.class_id, &escrow.student_id).await? {
            if assign.escrow_id.as_deref() == Some(escrow.id.as_str()) {
                mark_refunded(&mut assign, now);
                tx.upsert_class_assign(&assign).await?;
            }
        }
        Ok(split)
    }

    async fn escrow_class(&self, escrow_id: &str) -> Result<String, CoreError> {
        let mut tx = self.store.begin(vec![]).await?;
        Ok(load_escrow(tx.as_mut(), escrow_id).await?.class_id)
    }
}

fn mark_refunded(assign: &mut ClassAssign, now: DateTime<Utc>) {
    assign.payment_status = PaymentStatus::Refunded;
    assign.updated_at = now;
}

pub(crate) async fn active_config(tx: &mut dyn StoreTx) -> Result<CommissionConfig, CoreError> {
    tx.active_commission_config()
        .await?
        .ok_or_else(|| CoreError::not_found("CommissionConfig", "active"))
}

pub(crate) async fn load_class(tx: &mut dyn StoreTx, class_id: &str) -> Result<Class, CoreError> {
    tx.class(class_id).await?.ok_or_else(|| CoreError::not_found("Class", class_id))
}

async fn load_escrow(tx: &mut dyn StoreTx, escrow_id: &str) -> Result<Escrow, CoreError> {
    tx.escrow(escrow_id).await?.ok_or_else(|| CoreError::not_found("Escrow", escrow_id))
}

/// Time until the next Scheduled lesson of the class starts, or `None`
/// when no scheduled lesson lies ahead.
pub(crate) async fn time_until_next_lesson(
    tx: &mut dyn StoreTx,
    class_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Duration>, CoreError> {
    let mut next: Option<DateTime<Utc>> = None;
    for lesson in tx.lessons_for_class(class_id).await? {
        if lesson.status != LessonStatus::Scheduled {
            continue;
        }
        if let Some(entry) = tx.schedule_entry(&lesson.schedule_entry_id).await? {
            if !entry.is_deleted && entry.start > now && next.map_or(true, |n| entry.start < n) {
                next = Some(entry.start);
            }
        }
    }
    Ok(next.map(|start| start - now))
}

pub(crate) fn held_event(escrow: &Escrow) -> CoreEvent {
    CoreEvent::EscrowHeld {
        escrow_id: escrow.id.clone(),
        class_id: escrow.class_id.clone(),
        student_id: escrow.student_id.clone(),
        amount: escrow.amount,
    }
}

pub(crate) fn released_event(escrow: &Escrow) -> CoreEvent {
    CoreEvent::EscrowReleased {
        escrow_id: escrow.id.clone(),
        class_id: escrow.class_id.clone(),
        tutor_id: escrow.tutor_id.clone(),
        net_amount: escrow.net_amount,
        commission_amount: escrow.commission_amount,
    }
}

pub(crate) fn refunded_event(escrow: &Escrow) -> CoreEvent {
    CoreEvent::EscrowRefunded {
        escrow_id: escrow.id.clone(),
        class_id: escrow.class_id.clone(),
        student_id: escrow.student_id.clone(),
        refunded_amount: escrow.refunded_amount,
    }
}
