//! # Storage Seam
//!
//! Services never talk to PostgreSQL directly. They open a unit of work
//! with [`Store::begin`], read and write through [`StoreTx`], and finish with
//! [`StoreTx::commit`]. A unit of work that is dropped without committing is
//! rolled back, so an early `?` return leaves no partial writes behind.
//!
//! ## Exclusivity
//!
//! `begin` takes the lock keys the unit of work needs. They are acquired in
//! sorted order before the first read and held until commit or rollback:
//!
//! | Key | Serializes |
//! |-----|------------|
//! | `tutor:<id>` | conflict-check-then-insert on a tutor's calendar |
//! | `wallet:<userId>` | debit/credit pairs on one wallet |
//! | `request:<id>` | application acceptance (sibling auto-reject) |
//! | `class:<id>` | enrollment, cancellation, progress |
//! | `lesson:<id>` | reschedule negotiation |

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::*;
use super::DatabaseError;

/// A named exclusivity scope held for the duration of a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Tutor(String),
    Wallet(String),
    Request(String),
    Class(String),
    Lesson(String),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Tutor(id) => write!(f, "tutor:{}", id),
            LockKey::Wallet(id) => write!(f, "wallet:{}", id),
            LockKey::Request(id) => write!(f, "request:{}", id),
            LockKey::Class(id) => write!(f, "class:{}", id),
            LockKey::Lesson(id) => write!(f, "lesson:{}", id),
        }
    }
}

/// Sort and deduplicate lock keys so every unit of work acquires them in
/// the same global order.
pub fn normalize_locks(mut locks: Vec<LockKey>) -> Vec<LockKey> {
    locks.sort();
    locks.dedup();
    locks
}

/// Factory for units of work.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a unit of work holding the given lock keys.
    async fn begin(&self, locks: Vec<LockKey>) -> Result<Box<dyn StoreTx>, DatabaseError>;

    /// Open a read-only unit whose reads all come from one snapshot, for
    /// cross-row checks such as ledger reconciliation. Takes no locks.
    async fn begin_snapshot(&self) -> Result<Box<dyn StoreTx>, DatabaseError>;

    /// Cheap liveness check for the health endpoint.
    async fn ping(&self) -> bool;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// One unit of work. Every read sees the writes made earlier in the same
/// unit; nothing is visible to other units until `commit`.
#[async_trait]
pub trait StoreTx: Send {
    // ---- wallets ----
    async fn wallet(&mut self, id: &str) -> Result<Option<Wallet>, DatabaseError>;
    async fn wallet_by_user(&mut self, user_id: &str) -> Result<Option<Wallet>, DatabaseError>;
    /// Every wallet, for reconciliation.
    async fn wallets(&mut self) -> Result<Vec<Wallet>, DatabaseError>;
    async fn upsert_wallet(&mut self, wallet: &Wallet) -> Result<(), DatabaseError>;

    // ---- transactions ----
    async fn transaction(&mut self, id: &str) -> Result<Option<LedgerTransaction>, DatabaseError>;
    async fn transactions_for_wallet(
        &mut self,
        wallet_id: &str,
    ) -> Result<Vec<LedgerTransaction>, DatabaseError>;
    async fn upsert_transaction(&mut self, tx: &LedgerTransaction) -> Result<(), DatabaseError>;

    // ---- escrows ----
    async fn escrow(&mut self, id: &str) -> Result<Option<Escrow>, DatabaseError>;
    async fn escrows_for_class(&mut self, class_id: &str) -> Result<Vec<Escrow>, DatabaseError>;
    async fn upsert_escrow(&mut self, escrow: &Escrow) -> Result<(), DatabaseError>;

    // ---- commission ----
    async fn active_commission_config(&mut self) -> Result<Option<CommissionConfig>, DatabaseError>;
    /// Inserts the row; when it is active, every other row is deactivated.
    async fn insert_commission_config(&mut self, config: &CommissionConfig) -> Result<(), DatabaseError>;

    // ---- class requests ----
    async fn class_request(&mut self, id: &str) -> Result<Option<ClassRequest>, DatabaseError>;
    /// Pending requests whose `expires_at` is at or before `now`.
    async fn expirable_requests(&mut self, now: DateTime<Utc>) -> Result<Vec<ClassRequest>, DatabaseError>;
    async fn upsert_class_request(&mut self, request: &ClassRequest) -> Result<(), DatabaseError>;

    // ---- applications ----
    async fn application(&mut self, id: &str) -> Result<Option<TutorApplication>, DatabaseError>;
    async fn applications_for_request(
        &mut self,
        request_id: &str,
    ) -> Result<Vec<TutorApplication>, DatabaseError>;
    async fn upsert_application(&mut self, application: &TutorApplication) -> Result<(), DatabaseError>;

    // ---- classes ----
    async fn class(&mut self, id: &str) -> Result<Option<Class>, DatabaseError>;
    /// Classes in Active or Ongoing status.
    async fn classes_in_progress(&mut self) -> Result<Vec<Class>, DatabaseError>;
    async fn upsert_class(&mut self, class: &Class) -> Result<(), DatabaseError>;

    // ---- enrollments ----
    async fn class_assign(
        &mut self,
        class_id: &str,
        student_id: &str,
    ) -> Result<Option<ClassAssign>, DatabaseError>;
    async fn assigns_for_class(&mut self, class_id: &str) -> Result<Vec<ClassAssign>, DatabaseError>;
    async fn upsert_class_assign(&mut self, assign: &ClassAssign) -> Result<(), DatabaseError>;

    // ---- lessons ----
    async fn lesson(&mut self, id: &str) -> Result<Option<Lesson>, DatabaseError>;
    /// Lessons of a class ordered by sequence.
    async fn lessons_for_class(&mut self, class_id: &str) -> Result<Vec<Lesson>, DatabaseError>;
    async fn upsert_lesson(&mut self, lesson: &Lesson) -> Result<(), DatabaseError>;

    // ---- schedule entries ----
    async fn schedule_entry(&mut self, id: &str) -> Result<Option<ScheduleEntry>, DatabaseError>;
    /// Non-deleted entries of a tutor overlapping `[from, to)`, ordered by start.
    async fn entries_for_tutor(
        &mut self,
        tutor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ScheduleEntry>, DatabaseError>;
    /// Non-deleted entries materialized from one availability block.
    async fn entries_for_block(&mut self, block_id: &str) -> Result<Vec<ScheduleEntry>, DatabaseError>;
    async fn upsert_schedule_entry(&mut self, entry: &ScheduleEntry) -> Result<(), DatabaseError>;

    // ---- reschedule requests ----
    async fn reschedule_request(&mut self, id: &str) -> Result<Option<RescheduleRequest>, DatabaseError>;
    async fn pending_reschedule_for_lesson(
        &mut self,
        lesson_id: &str,
    ) -> Result<Option<RescheduleRequest>, DatabaseError>;
    async fn upsert_reschedule_request(&mut self, request: &RescheduleRequest) -> Result<(), DatabaseError>;

    // ---- availability ----
    async fn availability_block(&mut self, id: &str) -> Result<Option<AvailabilityBlock>, DatabaseError>;
    async fn availability_blocks(&mut self, tutor_id: &str) -> Result<Vec<AvailabilityBlock>, DatabaseError>;
    async fn insert_availability_block(&mut self, block: &AvailabilityBlock) -> Result<(), DatabaseError>;
    async fn delete_availability_block(&mut self, id: &str) -> Result<(), DatabaseError>;

    /// Make every write of this unit visible atomically.
    async fn commit(&mut self) -> Result<(), DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_keys_are_sorted_and_deduplicated() {
        let locks = normalize_locks(vec![
            LockKey::Wallet("b".into()),
            LockKey::Tutor("t".into()),
            LockKey::Wallet("a".into()),
            LockKey::Tutor("t".into()),
        ]);
        assert_eq!(
            locks,
            vec![
                LockKey::Tutor("t".into()),
                LockKey::Wallet("a".into()),
                LockKey::Wallet("b".into()),
            ]
        );
        assert_eq!(locks[0].to_string(), "tutor:t");
    }
}
