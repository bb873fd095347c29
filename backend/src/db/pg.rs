//! # PostgreSQL Store
//!
//! Each unit of work owns one pooled connection. `begin` issues `BEGIN` and
//! takes a transaction-scoped advisory lock per lock key, in sorted order,
//! so two units that need the same tutor or wallet run one after the other.
//! `commit` issues `COMMIT`; a unit dropped before committing hands its
//! connection to a background task that issues `ROLLBACK` before the
//! connection returns to the pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Object;
use tracing::{debug, warn};

use super::models::*;
use super::queries;
use super::store::{normalize_locks, LockKey, Store, StoreTx};
use super::{Database, DatabaseError};

/// Store backed by the PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self, locks: Vec<LockKey>) -> Result<Box<dyn StoreTx>, DatabaseError> {
        let client = self
            .db
            .pool()
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        client.batch_execute("BEGIN ISOLATION LEVEL READ COMMITTED").await?;
        let mut tx = PgTx { client: Some(client), committed: false };

        for key in normalize_locks(locks) {
            let key = key.to_string();
            debug!("Acquiring advisory lock {}", key);
            tx.client()?
                .execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&key])
                .await?;
        }

        Ok(Box::new(tx))
    }

    async fn begin_snapshot(&self) -> Result<Box<dyn StoreTx>, DatabaseError> {
        let client = self
            .db
            .pool()
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        // READ COMMITTED would take a fresh snapshot per statement, letting a
        // wallet row and its ledger rows come from different commits.
        client.batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY").await?;
        Ok(Box::new(PgTx { client: Some(client), committed: false }))
    }

    async fn ping(&self) -> bool {
        match self.db.pool().get().await {
            Ok(client) => client.query("SELECT 1", &[]).await.is_ok(),
            Err(_) => false,
        }
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

struct PgTx {
    client: Option<Object>,
    committed: bool,
}

impl PgTx {
    fn client(&self) -> Result<&Object, DatabaseError> {
        self.client
            .as_ref()
            .ok_or_else(|| DatabaseError::ConnectionError("unit of work already finished".into()))
    }
}

impl Drop for PgTx {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(client) = self.client.take() {
            tokio::spawn(async move {
                if let Err(e) = client.batch_execute("ROLLBACK").await {
                    warn!("Rollback failed: {}", e);
                }
            });
        }
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn wallet_by_user(&mut self, user_id: &str) -> Result<Option<Wallet>, DatabaseError> {
        queries::get_wallet_by_user(self.client()?, user_id).await
    }

    async fn wallet(&mut self, id: &str) -> Result<Option<Wallet>, DatabaseError> {
        queries::get_wallet(self.client()?, id).await
    }

    async fn wallets(&mut self) -> Result<Vec<Wallet>, DatabaseError> {
        queries::get_all_wallets(self.client()?).await
    }

    async fn upsert_wallet(&mut self, wallet: &Wallet) -> Result<(), DatabaseError> {
        queries::upsert_wallet(self.client()?, wallet).await
    }

    async fn transaction(&mut self, id: &str) -> Result<Option<LedgerTransaction>, DatabaseError> {
        queries::get_transaction(self.client()?, id).await
    }

    async fn transactions_for_wallet(
        &mut self,
        wallet_id: &str,
    ) -> Result<Vec<LedgerTransaction>, DatabaseError> {
        queries::get_wallet_transactions(self.client()?, wallet_id).await
    }

    async fn upsert_transaction(&mut self, tx: &LedgerTransaction) -> Result<(), DatabaseError> {
        queries::upsert_transaction(self.client()?, tx).await
    }

    async fn escrow(&mut self, id: &str) -> Result<Option<Escrow>, DatabaseError> {
        queries::get_escrow(self.client()?, id).await
    }

    async fn escrows_for_class(&mut self, class_id: &str) -> Result<Vec<Escrow>, DatabaseError> {
        queries::get_class_escrows(self.client()?, class_id).await
    }

    async fn upsert_escrow(&mut self, escrow: &Escrow) -> Result<(), DatabaseError> {
        queries::upsert_escrow(self.client()?, escrow).await
    }

    async fn active_commission_config(&mut self) -> Result<Option<CommissionConfig>, DatabaseError> {
        queries::get_active_commission_config(self.client()?).await
    }

    async fn insert_commission_config(&mut self, config: &CommissionConfig) -> Result<(), DatabaseError> {
        queries::insert_commission_config(self.client()?, config).await
    }

    async fn class_request(&mut self, id: &str) -> Result<Option<ClassRequest>, DatabaseError> {
        queries::get_class_request(self.client()?, id).await
    }

    async fn expirable_requests(&mut self, now: DateTime<Utc>) -> Result<Vec<ClassRequest>, DatabaseError> {
        queries::get_expirable_requests(self.client()?, now).await
    }

    async fn upsert_class_request(&mut self, request: &ClassRequest) -> Result<(), DatabaseError> {
        queries::upsert_class_request(self.client()?, request).await
    }

    async fn application(&mut self, id: &str) -> Result<Option<TutorApplication>, DatabaseError> {
        queries::get_application(self.client()?, id).await
    }

    async fn applications_for_request(
        &mut self,
        request_id: &str,
    ) -> Result<Vec<TutorApplication>, DatabaseError> {
        queries::get_request_applications(self.client()?, request_id).await
    }

    async fn upsert_application(&mut self, application: &TutorApplication) -> Result<(), DatabaseError> {
        queries::upsert_application(self.client()?, application).await
    }

    async fn class(&mut self, id: &str) -> Result<Option<Class>, DatabaseError> {
        queries::get_class(self.client()?, id).await
    }

    async fn classes_in_progress(&mut self) -> Result<Vec<Class>, DatabaseError> {
        queries::get_classes_in_progress(self.client()?).await
    }

    async fn upsert_class(&mut self, class: &Class) -> Result<(), DatabaseError> {
        queries::upsert_class(self.client()?, class).await
    }

    async fn class_assign(
        &mut self,
        class_id: &str,
        student_id: &str,
    ) -> Result<Option<ClassAssign>, DatabaseError> {
        queries::get_class_assign(self.client()?, class_id, student_id).await
    }

    async fn assigns_for_class(&mut self, class_id: &str) -> Result<Vec<ClassAssign>, DatabaseError> {
        queries::get_class_assigns(self.client()?, class_id).await
    }

    async fn upsert_class_assign(&mut self, assign: &ClassAssign) -> Result<(), DatabaseError> {
        queries::upsert_class_assign(self.client()?, assign).await
    }

    async fn lesson(&mut self, id: &str) -> Result<Option<Lesson>, DatabaseError> {
        queries::get_lesson(self.client()?, id).await
    }

    async fn lessons_for_class(&mut self, class_id: &str) -> Result<Vec<Lesson>, DatabaseError> {
        queries::get_class_lessons(self.client()?, class_id).await
    }

    async fn upsert_lesson(&mut self, lesson: &Lesson) -> Result<(), DatabaseError> {
        queries::upsert_lesson(self.client()?, lesson).await
    }

    async fn schedule_entry(&mut self, id: &str) -> Result<Option<ScheduleEntry>, DatabaseError> {
        queries::get_schedule_entry(self.client()?, id).await
    }

    async fn entries_for_tutor(
        &mut self,
        tutor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ScheduleEntry>, DatabaseError> {
        queries::get_tutor_entries(self.client()?, tutor_id, from, to).await
    }

    async fn entries_for_block(&mut self, block_id: &str) -> Result<Vec<ScheduleEntry>, DatabaseError> {
        queries::get_block_entries(self.client()?, block_id).await
    }

    async fn upsert_schedule_entry(&mut self, entry: &ScheduleEntry) -> Result<(), DatabaseError> {
        queries::upsert_schedule_entry(self.client()?, entry).await
    }

    async fn reschedule_request(&mut self, id: &str) -> Result<Option<RescheduleRequest>, DatabaseError> {
        queries::get_reschedule_request(self.client()?, id).await
    }

    async fn pending_reschedule_for_lesson(
        &mut self,
        lesson_id: &str,
    ) -> Result<Option<RescheduleRequest>, DatabaseError> {
        queries::get_pending_reschedule(self.client()?, lesson_id).await
    }

    async fn upsert_reschedule_request(&mut self, request: &RescheduleRequest) -> Result<(), DatabaseError> {
        queries::upsert_reschedule_request(self.client()?, request).await
    }

    async fn availability_block(&mut self, id: &str) -> Result<Option<AvailabilityBlock>, DatabaseError> {
        queries::get_availability_block(self.client()?, id).await
    }

    async fn availability_blocks(&mut self, tutor_id: &str) -> Result<Vec<AvailabilityBlock>, DatabaseError> {
        queries::get_tutor_availability(self.client()?, tutor_id).await
    }

    async fn insert_availability_block(&mut self, block: &AvailabilityBlock) -> Result<(), DatabaseError> {
        queries::insert_availability_block(self.client()?, block).await
    }

    async fn delete_availability_block(&mut self, id: &str) -> Result<(), DatabaseError> {
        queries::delete_availability_block(self.client()?, id).await
    }

    async fn commit(&mut self) -> Result<(), DatabaseError> {
        self.client()?.batch_execute("COMMIT").await?;
        self.committed = true;
        Ok(())
    }
}
