//! End-to-end checks of the core's guarantees across services: calendar
//! exclusivity, batch atomicity, ledger conservation, escrow finality and
//! the concurrent acceptance race.

use chrono::{DateTime, TimeZone, Utc, Weekday};

use crate::db::{
    ApplicationStatus, CancellationReason, DeliveryMode, EscrowStatus, LockKey, Role, ScheduleEntry,
    Store, StoreTx, TransactionType,
};
use crate::errors::CoreError;
use crate::services::class_lifecycle::{NewClass, NewClassRequest};
use crate::services::identity::Actor;
use crate::services::testing::{at, first_monday, rule, TestCore, ESCROW_ACCOUNT, PLATFORM_ACCOUNT};

fn group_class(price: i64, limit: i32, day: Weekday, start: u32, end: u32) -> NewClass {
    NewClass {
        title: "Group session".into(),
        mode: DeliveryMode::GroupOnline,
        price,
        student_limit: limit,
        rules: vec![rule(day, start, end)],
        start_date: first_monday(),
    }
}

async fn live_entries(core: &TestCore, tutor: &str) -> Vec<ScheduleEntry> {
    let from: DateTime<Utc> = at(1, 0);
    let to = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
    core.schedule.tutor_schedule(tutor, from, to).await.unwrap()
}

fn assert_no_overlap(entries: &[ScheduleEntry]) {
    for (i, a) in entries.iter().enumerate() {
        for b in entries.iter().skip(i + 1) {
            assert!(
                !(a.start < b.end && a.end > b.start),
                "entries {} and {} overlap",
                a.id,
                b.id
            );
        }
    }
}

async fn assert_ledger_conserved(core: &TestCore) {
    let report = core.tracker.reconcile_all().await.unwrap();
    assert!(report.discrepancies.is_empty(), "{:?}", report.discrepancies);
}

/// Some unit since the last check held every key in `expected`.
fn assert_locked_together(core: &TestCore, expected: &[LockKey]) {
    let log = core.store.lock_log();
    assert!(
        log.iter().any(|unit| expected.iter().all(|key| unit.contains(key))),
        "no unit held {:?}; units: {:?}",
        expected,
        log
    );
    core.store.clear_lock_log();
}

async fn refund_rows(core: &TestCore, user: &str) -> usize {
    core.wallets
        .transactions(user)
        .await
        .unwrap()
        .iter()
        .filter(|t| t.transaction_type == TransactionType::Refund)
        .count()
}

#[tokio::test]
async fn test_overlapping_rule_reports_existing_entry() {
    let core = TestCore::new().await;
    let first = core.accepted_class("s1", "t1", vec![rule(Weekday::Mon, 8, 10)], 1_000).await;

    let err = core
        .lifecycle
        .create_class(&Actor::new("t1", Role::Tutor), group_class(100, 4, Weekday::Mon, 9, 11), at(2, 0))
        .await
        .unwrap_err();
    match err {
        CoreError::ScheduleConflict { existing_entry_id, candidate_start, .. } => {
            assert_eq!(existing_entry_id, first.lessons[0].schedule_entry_id);
            assert_eq!(candidate_start, at(6, 9));
        }
        other => panic!("expected ScheduleConflict, got {:?}", other),
    }

    // Nothing from the failed batch was kept.
    assert_eq!(live_entries(&core, "t1").await.len(), 4);
}

#[tokio::test]
async fn test_release_pays_tutor_and_platform() {
    let core = TestCore::new().await;
    let accepted = core.accepted_class("s1", "t1", vec![rule(Weekday::Mon, 8, 10)], 1_000_000).await;
    assert_eq!(accepted.escrow.amount, 1_000_000);
    assert_eq!(core.balance(ESCROW_ACCOUNT).await, 1_000_000);

    let released = core
        .escrows
        .release_escrow(&Actor::new("admin", Role::Admin), &accepted.escrow.id, at(2, 0))
        .await
        .unwrap();
    assert_eq!(released.status, EscrowStatus::Released);
    assert_eq!(core.balance("t1").await, 880_000);
    assert_eq!(core.balance(PLATFORM_ACCOUNT).await, 120_000);
    assert_eq!(core.balance(ESCROW_ACCOUNT).await, 0);
    assert_ledger_conserved(&core).await;
}

#[tokio::test]
async fn test_admin_cancel_refunds_only_paid_escrow() {
    let core = TestCore::new().await;
    let tutor = Actor::new("t1", Role::Tutor);
    let admin = Actor::new("admin", Role::Admin);
    let class = core
        .lifecycle
        .create_class(&tutor, group_class(500_000, 2, Weekday::Thu, 15, 16), at(1, 0))
        .await
        .unwrap()
        .class;

    core.top_up("s1", 500_000).await;
    core.lifecycle.enroll(&Actor::new("s1", Role::Student), &class.id, at(1, 1)).await.unwrap();
    core.lifecycle.approve_enrollment(&tutor, &class.id, "s1", at(1, 2)).await.unwrap();
    core.lifecycle.enroll_waived(&admin, &class.id, "s2", at(1, 2)).await.unwrap();

    let outcome = core
        .lifecycle
        .cancel_class(&admin, &class.id, CancellationReason::AdminForced, at(3, 0))
        .await
        .unwrap();
    assert_eq!(outcome.refunded_escrows_count, 1);
    assert_eq!(outcome.total_refunded_amount, 500_000);
    assert_eq!(core.balance("s1").await, 500_000);
    assert!(live_entries(&core, "t1").await.is_empty());
    assert_ledger_conserved(&core).await;
}

#[tokio::test]
async fn test_concurrent_acceptance_creates_one_class() {
    let core = TestCore::new().await;
    core.top_up("s1", 2_000).await;
    let student = Actor::new("s1", Role::Student);
    let request = core
        .lifecycle
        .create_request(
            &student,
            NewClassRequest {
                tutor_id: None,
                title: "Biology".into(),
                mode: DeliveryMode::OneToOneOffline,
                budget: 1_000,
                rules: vec![rule(Weekday::Fri, 16, 18)],
                start_date: first_monday(),
            },
            at(1, 0),
        )
        .await
        .unwrap();
    let a = core
        .lifecycle
        .apply_to_request(&Actor::new("t1", Role::Tutor), &request.id, None, None, at(1, 1))
        .await
        .unwrap();
    let b = core
        .lifecycle
        .apply_to_request(&Actor::new("t2", Role::Tutor), &request.id, None, None, at(1, 1))
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        core.lifecycle.accept_application(&student, &a.id, at(1, 2)),
        core.lifecycle.accept_application(&student, &b.id, at(1, 2)),
    );
    let winners = [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(winners, 1);
    let loser = if first.is_ok() { second } else { first };
    assert!(matches!(loser, Err(CoreError::InvalidTransition { .. })));

    let details = core.lifecycle.request_details(&request.id).await.unwrap();
    let accepted = details.applications.iter().filter(|x| x.status == ApplicationStatus::Accepted).count();
    let rejected = details.applications.iter().filter(|x| x.status == ApplicationStatus::Rejected).count();
    assert_eq!((accepted, rejected), (1, 1));
    assert_eq!(core.sink.count("class_created"), 1);
    assert_eq!(core.balance("s1").await, 1_000);
}

#[tokio::test]
async fn test_concurrent_generation_for_one_tutor() {
    let core = TestCore::new().await;
    let tutor = Actor::new("t1", Role::Tutor);

    let (first, second) = tokio::join!(
        core.lifecycle.create_class(&tutor, group_class(100, 3, Weekday::Wed, 10, 12), at(1, 0)),
        core.lifecycle.create_class(&tutor, group_class(100, 3, Weekday::Wed, 11, 13), at(1, 0)),
    );
    assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);

    let entries = live_entries(&core, "t1").await;
    assert_eq!(entries.len(), 4);
    assert_no_overlap(&entries);
}

#[tokio::test]
async fn test_cancelled_class_is_never_refunded_twice() {
    let core = TestCore::new().await;
    let accepted = core.accepted_class("s1", "t1", vec![rule(Weekday::Mon, 8, 10)], 800).await;
    let tutor = Actor::new("t1", Role::Tutor);

    let (a, b) = tokio::join!(
        core.lifecycle.cancel_class(&tutor, &accepted.class.id, CancellationReason::TutorFault, at(2, 0)),
        core.lifecycle.cancel_class(&tutor, &accepted.class.id, CancellationReason::TutorFault, at(2, 0)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.already_cancelled != b.already_cancelled);
    assert_eq!(a.total_refunded_amount + b.total_refunded_amount, 800);
    assert_eq!(refund_rows(&core, "s1").await, 1);

    core.lifecycle
        .cancel_class(&Actor::new("admin", Role::Admin), &accepted.class.id, CancellationReason::AdminForced, at(3, 0))
        .await
        .unwrap();
    assert_eq!(refund_rows(&core, "s1").await, 1);
    assert_eq!(core.balance("s1").await, 800);
    assert_ledger_conserved(&core).await;
}

#[tokio::test]
async fn test_escrow_stays_terminal() {
    let core = TestCore::new().await;
    let admin = Actor::new("admin", Role::Admin);
    let accepted = core.accepted_class("s1", "t1", vec![rule(Weekday::Mon, 8, 10)], 1_000).await;

    core.escrows.release_escrow(&admin, &accepted.escrow.id, at(2, 0)).await.unwrap();
    let refund = core
        .escrows
        .refund_escrow(&admin, &accepted.escrow.id, CancellationReason::AdminForced, at(2, 1))
        .await
        .unwrap_err();
    assert!(matches!(refund, CoreError::InvalidTransition { .. }));
    let again = core.escrows.release_escrow(&admin, &accepted.escrow.id, at(2, 1)).await.unwrap_err();
    assert!(matches!(again, CoreError::InvalidTransition { .. }));

    // A cancellation after release finds nothing Held to refund.
    let outcome = core
        .lifecycle
        .cancel_class(&admin, &accepted.class.id, CancellationReason::AdminForced, at(3, 0))
        .await
        .unwrap();
    assert_eq!(outcome.refunded_escrows_count, 0);
    let escrows = core.escrows.escrows_for_class(&accepted.class.id).await.unwrap();
    assert_eq!(escrows[0].status, EscrowStatus::Released);
    assert_ledger_conserved(&core).await;
}

#[tokio::test]
async fn test_ledger_conserved_through_mixed_operations() {
    let core = TestCore::new().await;
    let tutor = Actor::new("t2", Role::Tutor);

    let accepted = core.accepted_class("s1", "t1", vec![rule(Weekday::Mon, 8, 10)], 1_000).await;
    let group = core
        .lifecycle
        .create_class(&tutor, group_class(300, 2, Weekday::Tue, 8, 9), at(1, 0))
        .await
        .unwrap()
        .class;
    core.top_up("s2", 1_000).await;
    core.top_up("s3", 1_000).await;
    core.lifecycle.enroll(&Actor::new("s2", Role::Student), &group.id, at(1, 3)).await.unwrap();
    core.lifecycle.enroll(&Actor::new("s3", Role::Student), &group.id, at(1, 3)).await.unwrap();
    core.lifecycle.approve_enrollment(&tutor, &group.id, "s2", at(1, 4)).await.unwrap();
    core.lifecycle.reject_enrollment(&tutor, &group.id, "s3", at(1, 4)).await.unwrap();

    // Student cancels the one-to-one class 24 hours ahead: half back.
    core.lifecycle
        .cancel_request(&Actor::new("s1", Role::Student), &accepted.request.id, at(5, 8))
        .await
        .unwrap();
    assert_ledger_conserved(&core).await;

    // The group class runs to completion.
    core.lifecycle.advance_classes(at(29, 0)).await.unwrap();
    assert_ledger_conserved(&core).await;

    let total: i64 = {
        let mut tx = core.store.begin(vec![]).await.unwrap();
        tx.wallets().await.unwrap().iter().map(|w| w.balance).sum()
    };
    assert_eq!(total, 3_000);
    assert_eq!(core.balance(ESCROW_ACCOUNT).await, 0);
    assert_eq!(core.balance("s1").await, 500);
    assert_eq!(core.balance("s3").await, 1_000);
    assert_eq!(core.balance("t2").await, 255);
    assert_no_overlap(&live_entries(&core, "t1").await);
}

#[tokio::test]
async fn test_writers_lock_what_they_write() {
    let core = TestCore::new().await;
    let accepted = core.accepted_class("s1", "t1", vec![rule(Weekday::Mon, 8, 10)], 1_000).await;
    let class_id = accepted.class.id.clone();
    assert_locked_together(
        &core,
        &[
            LockKey::Request(accepted.request.id.clone()),
            LockKey::Tutor("t1".into()),
            LockKey::Wallet("s1".into()),
            LockKey::Class(class_id.clone()),
        ],
    );

    let lesson_id = accepted.lessons[0].lesson_id.clone();
    let proposal = core
        .reschedules
        .propose(&Actor::new("s1", Role::Student), &lesson_id, at(7, 8), at(7, 10), None, at(2, 0))
        .await
        .unwrap();
    assert_locked_together(&core, &[LockKey::Lesson(lesson_id.clone()), LockKey::Tutor("t1".into())]);

    core.reschedules.accept(&Actor::new("t1", Role::Tutor), &proposal.id, at(2, 1)).await.unwrap();
    assert_locked_together(&core, &[LockKey::Lesson(lesson_id), LockKey::Tutor("t1".into())]);

    core.lifecycle
        .cancel_class(&Actor::new("t1", Role::Tutor), &class_id, CancellationReason::TutorFault, at(2, 2))
        .await
        .unwrap();
    assert_locked_together(
        &core,
        &[
            LockKey::Class(class_id),
            LockKey::Tutor("t1".into()),
            LockKey::Wallet("t1".into()),
            LockKey::Wallet("s1".into()),
        ],
    );

    core.top_up("s2", 100).await;
    let group = core
        .lifecycle
        .create_class(&Actor::new("t2", Role::Tutor), group_class(100, 4, Weekday::Tue, 8, 10), at(2, 3))
        .await
        .unwrap();
    assert_locked_together(&core, &[LockKey::Tutor("t2".into()), LockKey::Class(group.class.id.clone())]);

    core.lifecycle.enroll(&Actor::new("s2", Role::Student), &group.class.id, at(2, 4)).await.unwrap();
    assert_locked_together(&core, &[LockKey::Class(group.class.id.clone()), LockKey::Wallet("s2".into())]);
}
