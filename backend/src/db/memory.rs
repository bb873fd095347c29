//! # In-Memory Store
//!
//! Process-local implementation of the storage seam. Used by the test suite
//! and by local runs started with `DATABASE_URL=memory://`.
//!
//! A unit of work holds the table mutex from `begin` until it is dropped and
//! works on a staged copy; `commit` swaps the copy in. Holding the single
//! mutex is stricter than the per-key scopes PostgreSQL uses, so the lock
//! keys passed to `begin` do not change behavior here. A store built with
//! [`MemoryStore::recording`] keeps them so tests can check which scopes
//! each operation asks for.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use super::models::*;
use super::store::{normalize_locks, LockKey, Store, StoreTx};
use super::DatabaseError;

#[derive(Debug, Clone, Default)]
struct Tables {
    wallets: BTreeMap<String, Wallet>,
    /// Insertion order is history order.
    transactions: Vec<LedgerTransaction>,
    escrows: BTreeMap<String, Escrow>,
    commission_configs: Vec<CommissionConfig>,
    class_requests: BTreeMap<String, ClassRequest>,
    applications: BTreeMap<String, TutorApplication>,
    classes: BTreeMap<String, Class>,
    assigns: BTreeMap<String, ClassAssign>,
    lessons: BTreeMap<String, Lesson>,
    entries: BTreeMap<String, ScheduleEntry>,
    reschedules: BTreeMap<String, RescheduleRequest>,
    blocks: BTreeMap<String, AvailabilityBlock>,
}

/// Lock keys of every unit opened so far, plus the snapshot count.
#[derive(Default)]
struct UnitLog {
    locks: StdMutex<Vec<Vec<LockKey>>>,
    snapshots: AtomicUsize,
}

/// Shared in-memory tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    log: Option<Arc<UnitLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`MemoryStore::new`], but remembers the lock keys of every unit.
    pub fn recording() -> Self {
        Self { log: Some(Arc::new(UnitLog::default())), ..Self::default() }
    }

    /// Normalized lock keys per unit, oldest first. Empty unless built with
    /// [`MemoryStore::recording`].
    pub fn lock_log(&self) -> Vec<Vec<LockKey>> {
        self.log
            .as_ref()
            .and_then(|log| log.locks.lock().ok().map(|units| units.clone()))
            .unwrap_or_default()
    }

    pub fn clear_lock_log(&self) {
        if let Some(log) = &self.log {
            if let Ok(mut units) = log.locks.lock() {
                units.clear();
            }
            log.snapshots.store(0, Ordering::SeqCst);
        }
    }

    /// Read-only snapshot units opened so far.
    pub fn snapshot_count(&self) -> usize {
        self.log.as_ref().map_or(0, |log| log.snapshots.load(Ordering::SeqCst))
    }

    async fn open(&self) -> Box<dyn StoreTx> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Box::new(MemoryTx { guard, staged })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, locks: Vec<LockKey>) -> Result<Box<dyn StoreTx>, DatabaseError> {
        let locks = normalize_locks(locks);
        trace!("memory unit of work opened with {:?}", locks);
        if let Some(log) = &self.log {
            if let Ok(mut units) = log.locks.lock() {
                units.push(locks);
            }
        }
        Ok(self.open().await)
    }

    /// The table mutex already gives every unit one consistent view.
    async fn begin_snapshot(&self) -> Result<Box<dyn StoreTx>, DatabaseError> {
        trace!("memory snapshot unit opened");
        if let Some(log) = &self.log {
            log.snapshots.fetch_add(1, Ordering::SeqCst);
        }
        Ok(self.open().await)
    }

    async fn ping(&self) -> bool {
        true
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

fn sorted<T: Clone>(items: impl Iterator<Item = T>, key: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    let mut out: Vec<T> = items.collect();
    out.sort_by_key(|item| key(item));
    out
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn wallet_by_user(&mut self, user_id: &str) -> Result<Option<Wallet>, DatabaseError> {
        Ok(self.staged.wallets.values().find(|w| w.user_id == user_id).cloned())
    }

    async fn wallet(&mut self, id: &str) -> Result<Option<Wallet>, DatabaseError> {
        Ok(self.staged.wallets.get(id).cloned())
    }

    async fn wallets(&mut self) -> Result<Vec<Wallet>, DatabaseError> {
        Ok(sorted(self.staged.wallets.values().cloned(), |w| w.created_at))
    }

    async fn upsert_wallet(&mut self, wallet: &Wallet) -> Result<(), DatabaseError> {
        self.staged.wallets.insert(wallet.id.clone(), wallet.clone());
        Ok(())
    }

    async fn transaction(&mut self, id: &str) -> Result<Option<LedgerTransaction>, DatabaseError> {
        Ok(self.staged.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn transactions_for_wallet(
        &mut self,
        wallet_id: &str,
    ) -> Result<Vec<LedgerTransaction>, DatabaseError> {
        Ok(self
            .staged
            .transactions
            .iter()
            .filter(|t| t.wallet_id == wallet_id)
            .cloned()
            .collect())
    }

    async fn upsert_transaction(&mut self, tx: &LedgerTransaction) -> Result<(), DatabaseError> {
        match self.staged.transactions.iter_mut().find(|t| t.id == tx.id) {
            Some(existing) => *existing = tx.clone(),
            None => self.staged.transactions.push(tx.clone()),
        }
        Ok(())
    }

    async fn escrow(&mut self, id: &str) -> Result<Option<Escrow>, DatabaseError> {
        Ok(self.staged.escrows.get(id).cloned())
    }

    async fn escrows_for_class(&mut self, class_id: &str) -> Result<Vec<Escrow>, DatabaseError> {
        Ok(sorted(
            self.staged.escrows.values().filter(|e| e.class_id == class_id).cloned(),
            |e| e.created_at,
        ))
    }

    async fn upsert_escrow(&mut self, escrow: &Escrow) -> Result<(), DatabaseError> {
        self.staged.escrows.insert(escrow.id.clone(), escrow.clone());
        Ok(())
    }

    async fn active_commission_config(&mut self) -> Result<Option<CommissionConfig>, DatabaseError> {
        Ok(self.staged.commission_configs.iter().rev().find(|c| c.is_active).cloned())
    }

    async fn insert_commission_config(&mut self, config: &CommissionConfig) -> Result<(), DatabaseError> {
        if config.is_active {
            for existing in self.staged.commission_configs.iter_mut() {
                existing.is_active = false;
            }
        }
        self.staged.commission_configs.push(config.clone());
        Ok(())
    }

    async fn class_request(&mut self, id: &str) -> Result<Option<ClassRequest>, DatabaseError> {
        Ok(self.staged.class_requests.get(id).cloned())
    }

    async fn expirable_requests(&mut self, now: DateTime<Utc>) -> Result<Vec<ClassRequest>, DatabaseError> {
        Ok(sorted(
            self.staged
                .class_requests
                .values()
                .filter(|r| r.status == ClassRequestStatus::Pending && r.expires_at <= now)
                .cloned(),
            |r| r.expires_at,
        ))
    }

    async fn upsert_class_request(&mut self, request: &ClassRequest) -> Result<(), DatabaseError> {
        self.staged.class_requests.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn application(&mut self, id: &str) -> Result<Option<TutorApplication>, DatabaseError> {
        Ok(self.staged.applications.get(id).cloned())
    }

    async fn applications_for_request(
        &mut self,
        request_id: &str,
    ) -> Result<Vec<TutorApplication>, DatabaseError> {
        Ok(sorted(
            self.staged.applications.values().filter(|a| a.request_id == request_id).cloned(),
            |a| a.created_at,
        ))
    }

    async fn upsert_application(&mut self, application: &TutorApplication) -> Result<(), DatabaseError> {
        self.staged.applications.insert(application.id.clone(), application.clone());
        Ok(())
    }

    async fn class(&mut self, id: &str) -> Result<Option<Class>, DatabaseError> {
        Ok(self.staged.classes.get(id).cloned())
    }

    async fn classes_in_progress(&mut self) -> Result<Vec<Class>, DatabaseError> {
        Ok(sorted(
            self.staged
                .classes
                .values()
                .filter(|c| matches!(c.status, ClassStatus::Active | ClassStatus::Ongoing))
                .cloned(),
            |c| c.created_at,
        ))
    }

    async fn upsert_class(&mut self, class: &Class) -> Result<(), DatabaseError> {
        self.staged.classes.insert(class.id.clone(), class.clone());
        Ok(())
    }

    async fn class_assign(
        &mut self,
        class_id: &str,
        student_id: &str,
    ) -> Result<Option<ClassAssign>, DatabaseError> {
        Ok(self
            .staged
            .assigns
            .values()
            .find(|a| a.class_id == class_id && a.student_id == student_id)
            .cloned())
    }

    async fn assigns_for_class(&mut self, class_id: &str) -> Result<Vec<ClassAssign>, DatabaseError> {
        Ok(sorted(
            self.staged.assigns.values().filter(|a| a.class_id == class_id).cloned(),
            |a| a.created_at,
        ))
    }

    async fn upsert_class_assign(&mut self, assign: &ClassAssign) -> Result<(), DatabaseError> {
        let duplicate = self.staged.assigns.values().any(|a| {
            a.id != assign.id && a.class_id == assign.class_id && a.student_id == assign.student_id
        });
        if duplicate {
            return Err(DatabaseError::UniqueViolation("class_assigns_class_student_key".into()));
        }
        self.staged.assigns.insert(assign.id.clone(), assign.clone());
        Ok(())
    }

    async fn lesson(&mut self, id: &str) -> Result<Option<Lesson>, DatabaseError> {
        Ok(self.staged.lessons.get(id).cloned())
    }

    async fn lessons_for_class(&mut self, class_id: &str) -> Result<Vec<Lesson>, DatabaseError> {
        let mut lessons: Vec<Lesson> =
            self.staged.lessons.values().filter(|l| l.class_id == class_id).cloned().collect();
        lessons.sort_by_key(|l| l.sequence);
        Ok(lessons)
    }

    async fn upsert_lesson(&mut self, lesson: &Lesson) -> Result<(), DatabaseError> {
        self.staged.lessons.insert(lesson.id.clone(), lesson.clone());
        Ok(())
    }

    async fn schedule_entry(&mut self, id: &str) -> Result<Option<ScheduleEntry>, DatabaseError> {
        Ok(self.staged.entries.get(id).cloned())
    }

    async fn entries_for_tutor(
        &mut self,
        tutor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ScheduleEntry>, DatabaseError> {
        Ok(sorted(
            self.staged
                .entries
                .values()
                .filter(|e| e.tutor_id == tutor_id && !e.is_deleted && e.start < to && e.end > from)
                .cloned(),
            |e| e.start,
        ))
    }

    async fn entries_for_block(&mut self, block_id: &str) -> Result<Vec<ScheduleEntry>, DatabaseError> {
        Ok(sorted(
            self.staged
                .entries
                .values()
                .filter(|e| {
                    !e.is_deleted
                        && matches!(&e.kind, EntryKind::Block { block_id: b } if b == block_id)
                })
                .cloned(),
            |e| e.start,
        ))
    }

    async fn upsert_schedule_entry(&mut self, entry: &ScheduleEntry) -> Result<(), DatabaseError> {
        self.staged.entries.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn reschedule_request(&mut self, id: &str) -> Result<Option<RescheduleRequest>, DatabaseError> {
        Ok(self.staged.reschedules.get(id).cloned())
    }

    async fn pending_reschedule_for_lesson(
        &mut self,
        lesson_id: &str,
    ) -> Result<Option<RescheduleRequest>, DatabaseError> {
        Ok(self
            .staged
            .reschedules
            .values()
            .find(|r| r.lesson_id == lesson_id && r.status == RescheduleStatus::Pending)
            .cloned())
    }

    async fn upsert_reschedule_request(&mut self, request: &RescheduleRequest) -> Result<(), DatabaseError> {
        if request.status == RescheduleStatus::Pending {
            let duplicate = self.staged.reschedules.values().any(|r| {
                r.id != request.id
                    && r.lesson_id == request.lesson_id
                    && r.status == RescheduleStatus::Pending
            });
            if duplicate {
                return Err(DatabaseError::UniqueViolation(
                    "reschedule_requests_one_pending_per_lesson".into(),
                ));
            }
        }
        self.staged.reschedules.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn availability_block(&mut self, id: &str) -> Result<Option<AvailabilityBlock>, DatabaseError> {
        Ok(self.staged.blocks.get(id).cloned())
    }

    async fn availability_blocks(&mut self, tutor_id: &str) -> Result<Vec<AvailabilityBlock>, DatabaseError> {
        Ok(sorted(
            self.staged.blocks.values().filter(|b| b.tutor_id == tutor_id).cloned(),
            |b| b.created_at,
        ))
    }

    async fn insert_availability_block(&mut self, block: &AvailabilityBlock) -> Result<(), DatabaseError> {
        self.staged.blocks.insert(block.id.clone(), block.clone());
        Ok(())
    }

    async fn delete_availability_block(&mut self, id: &str) -> Result<(), DatabaseError> {
        self.staged
            .blocks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DatabaseError::NotFound(format!("availability block {}", id)))
    }

    async fn commit(&mut self) -> Result<(), DatabaseError> {
        *self.guard = std::mem::take(&mut self.staged);
        Ok(())
    }
}
