//! Shared wiring for service tests: every service over one in-memory
//! store, with a recording notification sink.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};

use crate::db::{DeliveryMode, MemoryStore, RecurringRule, Role, Store, StoreTx};
use crate::domain::{HorizonPolicy, RefundPolicy};

use super::balance_tracker::BalanceTracker;
use super::class_lifecycle::{AcceptOutcome, ClassLifecycleService, NewClassRequest};
use super::escrow_manager::{CommissionRates, EscrowManager};
use super::identity::Actor;
use super::ledger::Ledger;
use super::lifecycle_monitor::LifecycleMonitor;
use super::notifications::{NotificationSink, RecordingSink};
use super::payment_gateway::LoggingGateway;
use super::reschedule::RescheduleService;
use super::retry::RetryPolicy;
use super::schedule_service::ScheduleService;
use super::wallet_service::WalletService;

pub const ESCROW_ACCOUNT: &str = "system:escrow";
pub const PLATFORM_ACCOUNT: &str = "system:platform";

/// 2025-01-`day` at `hour`:00 UTC. January 6th 2025 is a Monday.
pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).unwrap()
}

pub fn first_monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()
}

pub fn rule(day: Weekday, start_hour: u32, end_hour: u32) -> RecurringRule {
    RecurringRule {
        day_of_week: day,
        start_time: NaiveTime::from_hms_opt(start_hour, 0, 0).unwrap(),
        end_time: NaiveTime::from_hms_opt(end_hour, 0, 0).unwrap(),
    }
}

pub struct TestCore {
    pub store: Arc<MemoryStore>,
    pub sink: RecordingSink,
    pub wallets: WalletService,
    pub escrows: EscrowManager,
    pub schedule: ScheduleService,
    pub lifecycle: ClassLifecycleService,
    pub reschedules: RescheduleService,
    pub tracker: BalanceTracker,
}

impl TestCore {
    /// Commission 12% / 10% / 15% / 8%, default refund tiers, 72h request TTL.
    /// The store records the lock keys of every unit.
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::recording());
        let sink = RecordingSink::new();
        let notifier: Arc<dyn NotificationSink> = Arc::new(sink.clone());
        let ledger = Ledger::new(ESCROW_ACCOUNT, PLATFORM_ACCOUNT);

        let wallets = WalletService::new(store.clone(), ledger.clone(), Arc::new(LoggingGateway), RetryPolicy::new(2, 1));
        let escrows = EscrowManager::new(store.clone(), ledger, RefundPolicy::default(), notifier.clone());
        let schedule = ScheduleService::new(store.clone(), HorizonPolicy::default());
        let lifecycle =
            ClassLifecycleService::new(store.clone(), escrows.clone(), schedule.clone(), notifier.clone(), 72);
        let reschedules = RescheduleService::new(store.clone(), notifier);
        let tracker = BalanceTracker::new(store.clone());

        wallets.ensure_system_wallets(at(1, 0)).await.unwrap();
        escrows
            .set_active_commission_config(
                &Actor::new("admin", Role::Admin),
                CommissionRates {
                    one_to_one_online_bps: 1200,
                    one_to_one_offline_bps: 1000,
                    group_online_bps: 1500,
                    group_offline_bps: 800,
                },
                at(1, 0),
            )
            .await
            .unwrap();

        Self { store, sink, wallets, escrows, schedule, lifecycle, reschedules, tracker }
    }

    /// Credit through the gateway flow: pending top-up, then confirmation.
    pub async fn top_up(&self, user: &str, amount: i64) {
        let outcome = self
            .wallets
            .request_top_up(&Actor::new(user, Role::Student), amount, at(1, 0))
            .await
            .unwrap();
        self.wallets.confirm_payment(&outcome.transaction.id, at(1, 0)).await.unwrap();
    }

    pub async fn balance(&self, user: &str) -> i64 {
        let mut tx = self.store.begin(vec![]).await.unwrap();
        tx.wallet_by_user(user).await.unwrap().map(|w| w.balance).unwrap_or(0)
    }

    /// Fund `student`, open a one-to-one request, let `tutor` apply and
    /// accept, all on January 1st.
    pub async fn accepted_class(
        &self,
        student: &str,
        tutor: &str,
        rules: Vec<RecurringRule>,
        price: i64,
    ) -> AcceptOutcome {
        self.top_up(student, price).await;
        let student_actor = Actor::new(student, Role::Student);
        let request = self
            .lifecycle
            .create_request(
                &student_actor,
                NewClassRequest {
                    tutor_id: None,
                    title: "Lesson plan".into(),
                    mode: DeliveryMode::OneToOneOnline,
                    budget: price,
                    rules,
                    start_date: first_monday(),
                },
                at(1, 0),
            )
            .await
            .unwrap();
        let application = self
            .lifecycle
            .apply_to_request(&Actor::new(tutor, Role::Tutor), &request.id, None, None, at(1, 1))
            .await
            .unwrap();
        self.lifecycle.accept_application(&student_actor, &application.id, at(1, 2)).await.unwrap()
    }

    pub fn monitor(&self, sweep_interval_secs: u64, reconciliation_interval_secs: u64) -> LifecycleMonitor {
        LifecycleMonitor::new(
            self.store.clone(),
            self.lifecycle.clone(),
            self.tracker.clone(),
            sweep_interval_secs,
            reconciliation_interval_secs,
        )
    }
}
