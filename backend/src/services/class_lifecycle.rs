//! # Class Lifecycle Service
//!
//! Drives requests, applications, classes and enrollments through their
//! state machines and ties each money-moving transition to the escrow
//! ledger inside the same unit of work.
//!
//! ## Request to Class
//!
//! ```text
//! Student                      Tutor                        Core
//!    │ create_request             │                           │
//!    │───────────────────────────────────────────────────────>│ Pending, expires_at
//!    │                            │ apply_to_request          │
//!    │                            │──────────────────────────>│ Application Pending
//!    │ accept_application         │                           │
//!    │───────────────────────────────────────────────────────>│ one unit of work:
//!    │                            │                           │  application Accepted
//!    │                            │                           │  siblings Rejected
//!    │                            │                           │  Class Pending -> Active
//!    │                            │                           │  lessons generated
//!    │                            │                           │  escrow Held
//!    │                            │                           │  ClassAssign Approved+Paid
//! ```
//!
//! ## Sweeps
//!
//! `expire_requests` and `advance_classes` are idempotent batch operations.
//! Each item runs in its own unit of work; a failing item is logged and the
//! batch moves on.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::db::{
    new_id, ApplicationStatus, ApprovalStatus, CancellationReason, Class, ClassAssign,
    ClassRequest, ClassRequestStatus, ClassStatus, DatabaseError, DeliveryMode, Escrow,
    EscrowStatus, Lesson, LessonStatus, LockKey, PaymentStatus, RecurringRule, RescheduleStatus,
    Role, Store, StoreTx, TutorApplication,
};
use crate::domain::expander::validate_rules;
use crate::domain::lifecycle::{
    ensure_application_pending, ensure_class_enrollable, ensure_class_has_seat,
    ensure_reason_allowed, ensure_request_open, next_class_status,
};
use crate::errors::CoreError;

use super::escrow_manager::{
    held_event, load_class, refunded_event, released_event, time_until_next_lesson,
    EscrowManager,
};
use super::identity::Actor;
use super::notifications::{dispatch_all, CoreEvent, NotificationSink};
use super::schedule_service::{GeneratedLesson, ScheduleService};

/// Seats on a group class spawned from a request. The requesting student
/// takes the first one; the tutor fills the rest through enrollment.
pub const GROUP_REQUEST_STUDENT_LIMIT: i32 = 10;

// ============================================
// INPUTS
// ============================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClassRequest {
    /// Directs the request at a single tutor.
    pub tutor_id: Option<String>,
    pub title: String,
    pub mode: DeliveryMode,
    pub budget: i64,
    pub rules: Vec<RecurringRule>,
    pub start_date: NaiveDate,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClass {
    pub title: String,
    pub mode: DeliveryMode,
    pub price: i64,
    pub student_limit: i32,
    pub rules: Vec<RecurringRule>,
    pub start_date: NaiveDate,
}

// ============================================
// OUTCOMES
// ============================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptOutcome {
    pub request: ClassRequest,
    pub application: TutorApplication,
    pub class: Class,
    pub lessons: Vec<GeneratedLesson>,
    pub escrow: Escrow,
    pub assign: ClassAssign,
    pub rejected_application_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassWithLessons {
    pub class: Class,
    pub lessons: Vec<GeneratedLesson>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub assign: ClassAssign,
    pub escrow: Option<Escrow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub class_id: String,
    /// The class was already Cancelled; nothing was written.
    pub already_cancelled: bool,
    pub refunded_escrows_count: usize,
    /// Sum of `refunded_amount` over the escrows refunded by this call.
    pub total_refunded_amount: i64,
}

impl CancelOutcome {
    fn noop(class_id: &str) -> Self {
        Self {
            class_id: class_id.to_string(),
            already_cancelled: true,
            refunded_escrows_count: 0,
            total_refunded_amount: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequestOutcome {
    pub request: ClassRequest,
    pub class_cancellation: Option<CancelOutcome>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDetails {
    pub request: ClassRequest,
    pub applications: Vec<TutorApplication>,
}

/// A lesson with the window of its calendar entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonSlot {
    #[serde(flatten)]
    pub lesson: Lesson,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassDetails {
    pub class: Class,
    pub lessons: Vec<LessonSlot>,
    /// Enrollments counting toward `current_student_count`.
    pub roster: Vec<ClassAssign>,
    /// Every enrollment, whatever its status.
    pub enrollments: Vec<ClassAssign>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryReport {
    pub expired: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceReport {
    pub lessons_completed: usize,
    pub classes_started: usize,
    pub classes_completed: usize,
    pub escrows_released: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expiry: ExpiryReport,
    pub advance: AdvanceReport,
}

/// What one class contributed to an advance sweep.
#[derive(Debug, Default)]
struct AdvanceStep {
    lessons_completed: usize,
    started: bool,
    completed: bool,
    escrows_released: usize,
}

#[derive(Clone)]
pub struct ClassLifecycleService {
    store: Arc<dyn Store>,
    escrows: EscrowManager,
    schedule: ScheduleService,
    notifier: Arc<dyn NotificationSink>,
    request_ttl_hours: i64,
}

impl ClassLifecycleService {
    pub fn new(
        store: Arc<dyn Store>,
        escrows: EscrowManager,
        schedule: ScheduleService,
        notifier: Arc<dyn NotificationSink>,
        request_ttl_hours: i64,
    ) -> Self {
        Self { store, escrows, schedule, notifier, request_ttl_hours }
    }

    // ==========================================
    // REQUESTS AND APPLICATIONS
    // ==========================================

    pub async fn create_request(
        &self,
        actor: &Actor,
        input: NewClassRequest,
        now: DateTime<Utc>,
    ) -> Result<ClassRequest, CoreError> {
        actor.require_role(Role::Student)?;
        validate_rules(&input.rules)?;
        if input.budget <= 0 {
            return Err(CoreError::Validation(format!("budget {} must be positive", input.budget)));
        }
        if input.title.trim().is_empty() {
            return Err(CoreError::Validation("title is required".into()));
        }
        if input.tutor_id.as_deref() == Some(actor.user_id.as_str()) {
            return Err(CoreError::Validation("a request cannot be directed at its author".into()));
        }

        let request = ClassRequest {
            id: new_id(),
            student_id: actor.user_id.clone(),
            tutor_id: input.tutor_id,
            title: input.title,
            mode: input.mode,
            budget: input.budget,
            rules: input.rules,
            start_date: input.start_date,
            status: ClassRequestStatus::Pending,
            expires_at: now + Duration::hours(self.request_ttl_hours),
            class_id: None,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.store.begin(vec![LockKey::Request(request.id.clone())]).await?;
        tx.upsert_class_request(&request).await?;
        tx.commit().await?;

        info!("Student {} opened request {} (expires {})", request.student_id, request.id, request.expires_at);
        Ok(request)
    }

    pub async fn apply_to_request(
        &self,
        actor: &Actor,
        request_id: &str,
        proposed_price: Option<i64>,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TutorApplication, CoreError> {
        actor.require_role(Role::Tutor)?;
        if let Some(price) = proposed_price {
            if price <= 0 {
                return Err(CoreError::Validation(format!("proposed price {} must be positive", price)));
            }
        }

        let mut tx = self.store.begin(vec![LockKey::Request(request_id.to_string())]).await?;
        let request = load_request(tx.as_mut(), request_id).await?;
        ensure_request_open(&request, now, "apply to")?;
        if let Some(directed) = &request.tutor_id {
            if directed != &actor.user_id {
                return Err(CoreError::Forbidden(format!(
                    "request {} is directed at another tutor",
                    request.id
                )));
            }
        }

        let live = tx
            .applications_for_request(request_id)
            .await?
            .into_iter()
            .any(|a| {
                a.tutor_id == actor.user_id
                    && matches!(a.status, ApplicationStatus::Pending | ApplicationStatus::Accepted)
            });
        if live {
            return Err(CoreError::Validation(format!(
                "tutor {} already applied to request {}",
                actor.user_id, request_id
            )));
        }

        let application = TutorApplication {
            id: new_id(),
            request_id: request.id.clone(),
            tutor_id: actor.user_id.clone(),
            proposed_price,
            message,
            status: ApplicationStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        tx.upsert_application(&application).await?;
        tx.commit().await?;

        info!("Tutor {} applied to request {}", application.tutor_id, request_id);
        Ok(application)
    }

    /// Accept one application. Everything the acceptance implies commits
    /// together or not at all.
    pub async fn accept_application(
        &self,
        actor: &Actor,
        application_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AcceptOutcome, CoreError> {
        info!("Accepting application {}", application_id);
        let (request_id, tutor_id, student_id) = self.application_parties(application_id).await?;
        actor.require_owner(&student_id, "the class request")?;

        let class_id = new_id();
        let mut tx = self
            .store
            .begin(vec![
                LockKey::Request(request_id),
                LockKey::Tutor(tutor_id),
                LockKey::Wallet(student_id),
                LockKey::Class(class_id.clone()),
            ])
            .await?;

        let mut application = load_application(tx.as_mut(), application_id).await?;
        ensure_application_pending(&application, "accept")?;
        let mut request = load_request(tx.as_mut(), &application.request_id).await?;
        ensure_request_open(&request, now, "accept an application on")?;

        let price = application.proposed_price.unwrap_or(request.budget);
        let mut class = Class {
            id: class_id,
            tutor_id: application.tutor_id.clone(),
            request_id: Some(request.id.clone()),
            title: request.title.clone(),
            mode: request.mode,
            price,
            student_limit: request_student_limit(request.mode),
            current_student_count: 0,
            rules: request.rules.clone(),
            start_date: request.start_date,
            status: ClassStatus::Pending,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };
        tx.upsert_class(&class).await?;

        let lessons = self.schedule.generate_lessons(tx.as_mut(), &class, now).await?;
        class.status = ClassStatus::Active;

        let escrow = self
            .escrows
            .pay_escrow_in(tx.as_mut(), &class, &request.student_id, price, now)
            .await?;
        let assign = ClassAssign {
            id: new_id(),
            class_id: class.id.clone(),
            student_id: request.student_id.clone(),
            approval_status: ApprovalStatus::Approved,
            payment_status: PaymentStatus::Paid,
            escrow_id: Some(escrow.id.clone()),
            payment_waived: false,
            created_at: now,
            updated_at: now,
        };
        tx.upsert_class_assign(&assign).await?;
        recount(tx.as_mut(), &mut class, now).await?;

        application.status = ApplicationStatus::Accepted;
        application.updated_at = now;
        tx.upsert_application(&application).await?;
        let rejected = reject_pending_applications(tx.as_mut(), &request.id, Some(&application.id), now).await?;

        request.status = ClassRequestStatus::Accepted;
        request.class_id = Some(class.id.clone());
        request.updated_at = now;
        tx.upsert_class_request(&request).await?;
        tx.commit().await?;

        info!(
            "Request {} accepted: class {} with {} lessons, escrow {} held",
            request.id,
            class.id,
            lessons.len(),
            escrow.id
        );

        let mut events = vec![
            CoreEvent::RequestAccepted {
                request_id: request.id.clone(),
                application_id: application.id.clone(),
                class_id: class.id.clone(),
                student_id: request.student_id.clone(),
                tutor_id: class.tutor_id.clone(),
            },
            CoreEvent::ClassCreated {
                class_id: class.id.clone(),
                tutor_id: class.tutor_id.clone(),
                student_id: Some(request.student_id.clone()),
                lesson_count: lessons.len(),
            },
            held_event(&escrow),
        ];
        events.extend(rejected.iter().map(application_rejected_event));
        dispatch_all(self.notifier.as_ref(), events);

        Ok(AcceptOutcome {
            request,
            application,
            class,
            lessons,
            escrow,
            assign,
            rejected_application_ids: rejected.into_iter().map(|a| a.id).collect(),
        })
    }

    pub async fn reject_application(
        &self,
        actor: &Actor,
        application_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TutorApplication, CoreError> {
        let (request_id, _, student_id) = self.application_parties(application_id).await?;
        actor.require_owner(&student_id, "the class request")?;

        let mut tx = self.store.begin(vec![LockKey::Request(request_id)]).await?;
        let mut application = load_application(tx.as_mut(), application_id).await?;
        ensure_application_pending(&application, "reject")?;
        application.status = ApplicationStatus::Rejected;
        application.updated_at = now;
        tx.upsert_application(&application).await?;
        tx.commit().await?;

        info!("Application {} rejected by {}", application.id, actor.user_id);
        self.notifier.dispatch(application_rejected_event(&application));
        Ok(application)
    }

    pub async fn withdraw_application(
        &self,
        actor: &Actor,
        application_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TutorApplication, CoreError> {
        let (request_id, tutor_id, _) = self.application_parties(application_id).await?;
        actor.require_owner(&tutor_id, "the application")?;

        let mut tx = self.store.begin(vec![LockKey::Request(request_id)]).await?;
        let mut application = load_application(tx.as_mut(), application_id).await?;
        ensure_application_pending(&application, "withdraw")?;
        application.status = ApplicationStatus::Withdrawn;
        application.updated_at = now;
        tx.upsert_application(&application).await?;
        tx.commit().await?;

        info!("Application {} withdrawn", application.id);
        Ok(application)
    }

    /// Pending requests are closed; accepted ones take their class down
    /// with a student-initiated cancellation.
    pub async fn cancel_request(
        &self,
        actor: &Actor,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CancelRequestOutcome, CoreError> {
        info!("Cancelling request {}", request_id);

        // The class (and its tutor) must be locked along with the request.
        // An acceptance may land between the lookup and the lock; retry
        // with the new class when it does.
        loop {
            let (student_id, class_id, class_locks) = {
                let mut tx = self.store.begin(vec![]).await?;
                let request = load_request(tx.as_mut(), request_id).await?;
                let class_locks = match &request.class_id {
                    Some(id) => cancel_locks(tx.as_mut(), id).await?,
                    None => Vec::new(),
                };
                (request.student_id, request.class_id, class_locks)
            };
            actor.require_owner(&student_id, "the class request")?;
            ensure_reason_allowed(actor.role, CancellationReason::StudentInitiated)?;

            let mut locks = vec![LockKey::Request(request_id.to_string())];
            locks.extend(class_locks);
            let mut tx = self.store.begin(locks).await?;
            let mut request = load_request(tx.as_mut(), request_id).await?;
            if request.class_id != class_id {
                debug!("Request {} changed while locking, retrying", request_id);
                continue;
            }

            let mut events = Vec::new();
            let class_cancellation = match request.status {
                ClassRequestStatus::Pending => {
                    let rejected = reject_pending_applications(tx.as_mut(), &request.id, None, now).await?;
                    events.extend(rejected.iter().map(application_rejected_event));
                    None
                }
                ClassRequestStatus::Accepted => match &request.class_id {
                    Some(class_id) => {
                        let mut class = load_class(tx.as_mut(), class_id).await?;
                        let (outcome, cancel_events) = self
                            .cancel_in(tx.as_mut(), &mut class, CancellationReason::StudentInitiated, now)
                            .await?;
                        events.extend(cancel_events);
                        Some(outcome)
                    }
                    None => None,
                },
                status => {
                    return Err(CoreError::invalid_transition("ClassRequest", &request.id, status, "cancel"));
                }
            };

            request.status = ClassRequestStatus::Cancelled;
            request.updated_at = now;
            tx.upsert_class_request(&request).await?;
            tx.commit().await?;

            info!("Request {} cancelled", request.id);
            dispatch_all(self.notifier.as_ref(), events);
            return Ok(CancelRequestOutcome { request, class_cancellation });
        }
    }

    // ==========================================
    // CLASSES AND ENROLLMENT
    // ==========================================

    /// Tutor-created class, open for enrollment once its schedule exists.
    pub async fn create_class(
        &self,
        actor: &Actor,
        input: NewClass,
        now: DateTime<Utc>,
    ) -> Result<ClassWithLessons, CoreError> {
        actor.require_role(Role::Tutor)?;
        validate_rules(&input.rules)?;
        if input.price <= 0 {
            return Err(CoreError::Validation(format!("price {} must be positive", input.price)));
        }
        if input.student_limit < 1 {
            return Err(CoreError::Validation("student limit must be at least 1".into()));
        }
        if is_one_to_one(input.mode) && input.student_limit != 1 {
            return Err(CoreError::Validation(format!(
                "{} classes take exactly one student",
                input.mode
            )));
        }

        let mut class = Class {
            id: new_id(),
            tutor_id: actor.user_id.clone(),
            request_id: None,
            title: input.title,
            mode: input.mode,
            price: input.price,
            student_limit: input.student_limit,
            current_student_count: 0,
            rules: input.rules,
            start_date: input.start_date,
            status: ClassStatus::Pending,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self
            .store
            .begin(vec![LockKey::Tutor(class.tutor_id.clone()), LockKey::Class(class.id.clone())])
            .await?;
        tx.upsert_class(&class).await?;
        let lessons = self.schedule.generate_lessons(tx.as_mut(), &class, now).await?;
        class.status = ClassStatus::Active;
        class.updated_at = now;
        tx.upsert_class(&class).await?;
        tx.commit().await?;

        info!("Tutor {} created class {} with {} lessons", class.tutor_id, class.id, lessons.len());
        self.notifier.dispatch(CoreEvent::ClassCreated {
            class_id: class.id.clone(),
            tutor_id: class.tutor_id.clone(),
            student_id: None,
            lesson_count: lessons.len(),
        });
        Ok(ClassWithLessons { class, lessons })
    }

    /// The student pays the class price into escrow and waits for the
    /// tutor's approval.
    pub async fn enroll(&self, actor: &Actor, class_id: &str, now: DateTime<Utc>) -> Result<Enrollment, CoreError> {
        actor.require_role(Role::Student)?;
        info!("Student {} enrolling in class {}", actor.user_id, class_id);

        let mut tx = self
            .store
            .begin(vec![LockKey::Class(class_id.to_string()), LockKey::Wallet(actor.user_id.clone())])
            .await?;
        let class = load_class(tx.as_mut(), class_id).await?;
        ensure_class_enrollable(&class)?;
        ensure_class_has_seat(&class)?;
        if class.tutor_id == actor.user_id {
            return Err(CoreError::Validation("a tutor cannot enroll in their own class".into()));
        }

        let existing = tx.class_assign(class_id, &actor.user_id).await?;
        if let Some(assign) = &existing {
            if assign.approval_status != ApprovalStatus::Rejected {
                return Err(already_enrolled(class_id, &actor.user_id));
            }
        }

        let escrow = self
            .escrows
            .pay_escrow_in(tx.as_mut(), &class, &actor.user_id, class.price, now)
            .await?;
        let assign = ClassAssign {
            id: existing.as_ref().map(|a| a.id.clone()).unwrap_or_else(new_id),
            class_id: class.id.clone(),
            student_id: actor.user_id.clone(),
            approval_status: ApprovalStatus::Pending,
            payment_status: PaymentStatus::Paid,
            escrow_id: Some(escrow.id.clone()),
            payment_waived: false,
            created_at: existing.as_ref().map(|a| a.created_at).unwrap_or(now),
            updated_at: now,
        };
        tx.upsert_class_assign(&assign)
            .await
            .map_err(|e| unique_as_enrolled(e, class_id, &actor.user_id))?;
        tx.commit().await?;

        self.notifier.dispatch(held_event(&escrow));
        Ok(Enrollment { assign, escrow: Some(escrow) })
    }

    pub async fn approve_enrollment(
        &self,
        actor: &Actor,
        class_id: &str,
        student_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClassAssign, CoreError> {
        let mut tx = self.store.begin(vec![LockKey::Class(class_id.to_string())]).await?;
        let mut class = load_class(tx.as_mut(), class_id).await?;
        actor.require_owner(&class.tutor_id, "the class")?;
        ensure_class_enrollable(&class)?;

        let mut assign = load_assign(tx.as_mut(), class_id, student_id).await?;
        if assign.approval_status != ApprovalStatus::Pending {
            return Err(CoreError::invalid_transition("ClassAssign", &assign.id, assign.approval_status, "approve"));
        }
        ensure_class_has_seat(&class)?;

        assign.approval_status = ApprovalStatus::Approved;
        assign.updated_at = now;
        tx.upsert_class_assign(&assign).await?;
        recount(tx.as_mut(), &mut class, now).await?;
        tx.commit().await?;

        info!(
            "Enrollment of {} in class {} approved ({}/{})",
            student_id, class_id, class.current_student_count, class.student_limit
        );
        Ok(assign)
    }

    /// Reject a pending enrollment and refund its escrow in full.
    pub async fn reject_enrollment(
        &self,
        actor: &Actor,
        class_id: &str,
        student_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, CoreError> {
        let mut tx = self.store.begin(vec![LockKey::Class(class_id.to_string())]).await?;
        let class = load_class(tx.as_mut(), class_id).await?;
        actor.require_owner(&class.tutor_id, "the class")?;

        let mut assign = load_assign(tx.as_mut(), class_id, student_id).await?;
        if assign.approval_status != ApprovalStatus::Pending {
            return Err(CoreError::invalid_transition("ClassAssign", &assign.id, assign.approval_status, "reject"));
        }
        assign.approval_status = ApprovalStatus::Rejected;
        assign.updated_at = now;
        tx.upsert_class_assign(&assign).await?;

        let mut refunded = None;
        if let Some(escrow_id) = assign.escrow_id.clone() {
            if let Some(mut escrow) = tx.escrow(&escrow_id).await? {
                if escrow.status == EscrowStatus::Held {
                    self.escrows.refund_in(tx.as_mut(), &mut escrow, 100, now).await?;
                    assign.payment_status = PaymentStatus::Refunded;
                    refunded = Some(escrow);
                }
            }
        }
        tx.commit().await?;

        info!("Enrollment of {} in class {} rejected", student_id, class_id);
        if let Some(escrow) = &refunded {
            self.notifier.dispatch(refunded_event(escrow));
        }
        Ok(Enrollment { assign, escrow: refunded })
    }

    /// Admin enrollment with the payment waived.
    pub async fn enroll_waived(
        &self,
        actor: &Actor,
        class_id: &str,
        student_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClassAssign, CoreError> {
        actor.require_admin()?;
        info!("Enrolling {} in class {} with payment waived", student_id, class_id);

        let mut tx = self.store.begin(vec![LockKey::Class(class_id.to_string())]).await?;
        let mut class = load_class(tx.as_mut(), class_id).await?;
        ensure_class_enrollable(&class)?;

        let existing = tx.class_assign(class_id, student_id).await?;
        if existing.as_ref().map_or(false, |a| a.approval_status == ApprovalStatus::Approved) {
            return Err(already_enrolled(class_id, student_id));
        }
        ensure_class_has_seat(&class)?;

        let assign = match existing {
            Some(mut assign) => {
                assign.approval_status = ApprovalStatus::Approved;
                assign.payment_waived = true;
                assign.updated_at = now;
                assign
            }
            None => ClassAssign {
                id: new_id(),
                class_id: class_id.to_string(),
                student_id: student_id.to_string(),
                approval_status: ApprovalStatus::Approved,
                payment_status: PaymentStatus::Unpaid,
                escrow_id: None,
                payment_waived: true,
                created_at: now,
                updated_at: now,
            },
        };
        tx.upsert_class_assign(&assign)
            .await
            .map_err(|e| unique_as_enrolled(e, class_id, student_id))?;
        recount(tx.as_mut(), &mut class, now).await?;
        tx.commit().await?;
        Ok(assign)
    }

    /// Cancel a class and refund every held escrow per the refund policy.
    /// Cancelling a cancelled class is a no-op.
    pub async fn cancel_class(
        &self,
        actor: &Actor,
        class_id: &str,
        reason: CancellationReason,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, CoreError> {
        info!("Cancelling class {} ({}) by {}", class_id, reason, actor.user_id);
        ensure_reason_allowed(actor.role, reason)?;

        let locks = {
            let mut tx = self.store.begin(vec![]).await?;
            cancel_locks(tx.as_mut(), class_id).await?
        };
        let mut tx = self.store.begin(locks).await?;
        let mut class = load_class(tx.as_mut(), class_id).await?;
        authorize_cancel(tx.as_mut(), actor, &class).await?;

        let (outcome, events) = self.cancel_in(tx.as_mut(), &mut class, reason, now).await?;
        tx.commit().await?;

        if outcome.already_cancelled {
            debug!("Class {} was already cancelled", class_id);
        } else {
            info!(
                "Class {} cancelled: {} escrows refunded, {} returned",
                class_id, outcome.refunded_escrows_count, outcome.total_refunded_amount
            );
        }
        dispatch_all(self.notifier.as_ref(), events);
        Ok(outcome)
    }

    async fn cancel_in(
        &self,
        tx: &mut dyn StoreTx,
        class: &mut Class,
        reason: CancellationReason,
        now: DateTime<Utc>,
    ) -> Result<(CancelOutcome, Vec<CoreEvent>), CoreError> {
        match class.status {
            ClassStatus::Cancelled => return Ok((CancelOutcome::noop(&class.id), Vec::new())),
            ClassStatus::Completed => {
                return Err(CoreError::invalid_transition("Class", &class.id, class.status, "cancel"));
            }
            _ => {}
        }

        // Measured before the lessons below are cancelled.
        let until_next = time_until_next_lesson(tx, &class.id, now).await?;
        let percent = self.escrows.refund_policy().percent_for(reason, until_next);
        debug!(
            "Refunding class {} at {}% (next lesson in {:?} min)",
            class.id,
            percent,
            until_next.map(|d| d.num_minutes())
        );

        for mut lesson in tx.lessons_for_class(&class.id).await? {
            if lesson.status != LessonStatus::Scheduled {
                continue;
            }
            let entry = tx.schedule_entry(&lesson.schedule_entry_id).await?;

            // Lessons that already ended but were not swept yet keep their
            // slot and count as delivered.
            if entry.as_ref().map_or(false, |e| !e.is_deleted && e.end <= now) {
                lesson.status = LessonStatus::Completed;
                lesson.updated_at = now;
                tx.upsert_lesson(&lesson).await?;
                continue;
            }

            lesson.status = LessonStatus::Cancelled;
            lesson.updated_at = now;
            tx.upsert_lesson(&lesson).await?;
            if let Some(mut entry) = entry {
                entry.is_deleted = true;
                entry.updated_at = now;
                tx.upsert_schedule_entry(&entry).await?;
            }
            if let Some(mut pending) = tx.pending_reschedule_for_lesson(&lesson.id).await? {
                pending.status = RescheduleStatus::Rejected;
                pending.responded_at = Some(now);
                tx.upsert_reschedule_request(&pending).await?;
            }
        }

        let mut outcome = CancelOutcome {
            class_id: class.id.clone(),
            already_cancelled: false,
            refunded_escrows_count: 0,
            total_refunded_amount: 0,
        };
        let mut events = Vec::new();
        for mut escrow in tx.escrows_for_class(&class.id).await? {
            if escrow.status != EscrowStatus::Held {
                continue;
            }
            self.escrows.refund_in(tx, &mut escrow, percent, now).await?;
            outcome.refunded_escrows_count += 1;
            outcome.total_refunded_amount += escrow.refunded_amount;
            events.push(refunded_event(&escrow));
        }

        let student_ids = tx
            .assigns_for_class(&class.id)
            .await?
            .into_iter()
            .filter(|a| a.approval_status != ApprovalStatus::Rejected)
            .map(|a| a.student_id)
            .collect();

        class.status = ClassStatus::Cancelled;
        class.cancellation_reason = Some(reason);
        recount(tx, class, now).await?;

        events.insert(
            0,
            CoreEvent::ClassCancelled {
                class_id: class.id.clone(),
                tutor_id: class.tutor_id.clone(),
                reason,
                student_ids,
            },
        );
        Ok((outcome, events))
    }

    // ==========================================
    // SWEEPS
    // ==========================================

    /// Expire every Pending request past its deadline.
    pub async fn expire_requests(&self, now: DateTime<Utc>) -> Result<ExpiryReport, CoreError> {
        let candidates = {
            let mut tx = self.store.begin(vec![]).await?;
            tx.expirable_requests(now).await?
        };
        debug!("Expiry sweep found {} candidate requests", candidates.len());

        let mut report = ExpiryReport::default();
        for request in candidates {
            match self.expire_one(&request.id, now).await {
                Ok(Some(events)) => {
                    report.expired += 1;
                    dispatch_all(self.notifier.as_ref(), events);
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Failed to expire request {}: {}", request.id, e);
                    report.failed += 1;
                }
            }
        }

        if report.expired > 0 || report.failed > 0 {
            info!("Expiry sweep: {} expired, {} failed", report.expired, report.failed);
        }
        Ok(report)
    }

    async fn expire_one(&self, request_id: &str, now: DateTime<Utc>) -> Result<Option<Vec<CoreEvent>>, CoreError> {
        let mut tx = self.store.begin(vec![LockKey::Request(request_id.to_string())]).await?;
        let mut request = load_request(tx.as_mut(), request_id).await?;
        if request.status != ClassRequestStatus::Pending || request.expires_at > now {
            return Ok(None);
        }

        let rejected = reject_pending_applications(tx.as_mut(), &request.id, None, now).await?;
        request.status = ClassRequestStatus::Expired;
        request.updated_at = now;
        tx.upsert_class_request(&request).await?;
        tx.commit().await?;

        let mut events = vec![CoreEvent::RequestExpired {
            request_id: request.id.clone(),
            student_id: request.student_id.clone(),
        }];
        events.extend(rejected.iter().map(application_rejected_event));
        Ok(Some(events))
    }

    /// Complete past lessons, start and complete classes, release escrows
    /// of completed classes.
    pub async fn advance_classes(&self, now: DateTime<Utc>) -> Result<AdvanceReport, CoreError> {
        let candidates = {
            let mut tx = self.store.begin(vec![]).await?;
            tx.classes_in_progress().await?
        };
        debug!("Advance sweep found {} classes in progress", candidates.len());

        let mut report = AdvanceReport::default();
        for class in candidates {
            match self.advance_one(&class.id, &class.tutor_id, now).await {
                Ok(step) => {
                    report.lessons_completed += step.lessons_completed;
                    report.classes_started += usize::from(step.started);
                    report.classes_completed += usize::from(step.completed);
                    report.escrows_released += step.escrows_released;
                }
                Err(e) => {
                    error!("Failed to advance class {}: {}", class.id, e);
                    report.failed += 1;
                }
            }
        }

        if report.lessons_completed > 0 || report.classes_completed > 0 || report.failed > 0 {
            info!(
                "Advance sweep: {} lessons completed, {} classes started, {} completed, {} escrows released, {} failed",
                report.lessons_completed,
                report.classes_started,
                report.classes_completed,
                report.escrows_released,
                report.failed
            );
        }
        Ok(report)
    }

    async fn advance_one(&self, class_id: &str, tutor_id: &str, now: DateTime<Utc>) -> Result<AdvanceStep, CoreError> {
        let mut tx = self
            .store
            .begin(vec![LockKey::Class(class_id.to_string()), LockKey::Tutor(tutor_id.to_string())])
            .await?;
        let mut class = load_class(tx.as_mut(), class_id).await?;
        let mut step = AdvanceStep::default();
        if !matches!(class.status, ClassStatus::Active | ClassStatus::Ongoing) {
            return Ok(step);
        }

        let mut windows = Vec::new();
        for mut lesson in tx.lessons_for_class(class_id).await? {
            if lesson.status == LessonStatus::Cancelled {
                continue;
            }
            let entry = tx
                .schedule_entry(&lesson.schedule_entry_id)
                .await?
                .ok_or_else(|| CoreError::not_found("ScheduleEntry", &lesson.schedule_entry_id))?;
            if lesson.status == LessonStatus::Scheduled && entry.end <= now {
                lesson.status = LessonStatus::Completed;
                lesson.updated_at = now;
                tx.upsert_lesson(&lesson).await?;
                step.lessons_completed += 1;
            }
            windows.push((entry.start, entry.end, lesson.status == LessonStatus::Scheduled));
        }

        let mut events = Vec::new();
        match next_class_status(&class, &windows, now) {
            Some(ClassStatus::Ongoing) => {
                class.status = ClassStatus::Ongoing;
                step.started = true;
            }
            Some(ClassStatus::Completed) => {
                for mut escrow in tx.escrows_for_class(class_id).await? {
                    if escrow.status != EscrowStatus::Held {
                        continue;
                    }
                    self.escrows.ledger().release_escrow(tx.as_mut(), &mut escrow, now).await?;
                    step.escrows_released += 1;
                    events.push(released_event(&escrow));
                }
                class.status = ClassStatus::Completed;
                step.completed = true;
            }
            _ => {}
        }

        if step.started || step.completed {
            class.updated_at = now;
            tx.upsert_class(&class).await?;
        }
        tx.commit().await?;

        if step.completed {
            info!("Class {} completed, {} escrows released", class_id, step.escrows_released);
        }
        dispatch_all(self.notifier.as_ref(), events);
        Ok(step)
    }

    /// Expiry then advance, as one externally triggered batch.
    pub async fn run_sweeps(&self, actor: &Actor, now: DateTime<Utc>) -> Result<SweepReport, CoreError> {
        actor.require_admin()?;
        let expiry = self.expire_requests(now).await?;
        let advance = self.advance_classes(now).await?;
        Ok(SweepReport { expiry, advance })
    }

    // ==========================================
    // QUERIES
    // ==========================================

    pub async fn request_details(&self, request_id: &str) -> Result<RequestDetails, CoreError> {
        let mut tx = self.store.begin(vec![]).await?;
        let request = load_request(tx.as_mut(), request_id).await?;
        let applications = tx.applications_for_request(request_id).await?;
        Ok(RequestDetails { request, applications })
    }

    pub async fn class_details(&self, class_id: &str) -> Result<ClassDetails, CoreError> {
        let mut tx = self.store.begin(vec![]).await?;
        let class = load_class(tx.as_mut(), class_id).await?;

        let mut lessons = Vec::new();
        for lesson in tx.lessons_for_class(class_id).await? {
            match tx.schedule_entry(&lesson.schedule_entry_id).await? {
                Some(entry) => lessons.push(LessonSlot { start: entry.start, end: entry.end, lesson }),
                None => warn!("Lesson {} has no schedule entry", lesson.id),
            }
        }

        let enrollments = tx.assigns_for_class(class_id).await?;
        let roster = enrollments.iter().filter(|a| a.counts_toward_roster()).cloned().collect();
        Ok(ClassDetails { class, lessons, roster, enrollments })
    }

    /// (request id, tutor id, request owner) of an application.
    async fn application_parties(&self, application_id: &str) -> Result<(String, String, String), CoreError> {
        let mut tx = self.store.begin(vec![]).await?;
        let application = load_application(tx.as_mut(), application_id).await?;
        let request = load_request(tx.as_mut(), &application.request_id).await?;
        Ok((request.id, application.tutor_id, request.student_id))
    }
}

fn is_one_to_one(mode: DeliveryMode) -> bool {
    matches!(mode, DeliveryMode::OneToOneOnline | DeliveryMode::OneToOneOffline)
}

fn request_student_limit(mode: DeliveryMode) -> i32 {
    if is_one_to_one(mode) {
        1
    } else {
        GROUP_REQUEST_STUDENT_LIMIT
    }
}

fn already_enrolled(class_id: &str, student_id: &str) -> CoreError {
    CoreError::Validation(format!("student {} is already enrolled in class {}", student_id, class_id))
}

fn unique_as_enrolled(e: DatabaseError, class_id: &str, student_id: &str) -> CoreError {
    match e {
        DatabaseError::UniqueViolation(_) => already_enrolled(class_id, student_id),
        other => other.into(),
    }
}

fn application_rejected_event(application: &TutorApplication) -> CoreEvent {
    CoreEvent::ApplicationRejected {
        application_id: application.id.clone(),
        request_id: application.request_id.clone(),
        tutor_id: application.tutor_id.clone(),
    }
}

/// Tutors cancel their own classes; students only a class spawned from
/// their own request.
async fn authorize_cancel(tx: &mut dyn StoreTx, actor: &Actor, class: &Class) -> Result<(), CoreError> {
    if actor.is_privileged() {
        return Ok(());
    }
    let owner = match actor.role {
        Role::Tutor => Some(class.tutor_id.clone()),
        _ => match &class.request_id {
            Some(request_id) => tx.class_request(request_id).await?.map(|r| r.student_id),
            None => None,
        },
    };
    if owner.as_deref() != Some(actor.user_id.as_str()) {
        return Err(CoreError::Forbidden(format!("{} may not cancel class {}", actor.user_id, class.id)));
    }
    Ok(())
}

/// Reject the request's Pending applications except `keep`.
async fn reject_pending_applications(
    tx: &mut dyn StoreTx,
    request_id: &str,
    keep: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<TutorApplication>, CoreError> {
    let mut rejected = Vec::new();
    for mut application in tx.applications_for_request(request_id).await? {
        if application.status != ApplicationStatus::Pending || Some(application.id.as_str()) == keep {
            continue;
        }
        application.status = ApplicationStatus::Rejected;
        application.updated_at = now;
        tx.upsert_application(&application).await?;
        rejected.push(application);
    }
    Ok(rejected)
}

/// Recompute `current_student_count` from the roster and write the class.
/// Scopes a cancellation writes to: the class, the tutor's calendar and
/// wallet, and the wallet of every student with a held escrow.
async fn cancel_locks(tx: &mut dyn StoreTx, class_id: &str) -> Result<Vec<LockKey>, CoreError> {
    let class = load_class(tx, class_id).await?;
    let mut locks = vec![
        LockKey::Class(class.id.clone()),
        LockKey::Tutor(class.tutor_id.clone()),
        LockKey::Wallet(class.tutor_id.clone()),
    ];
    for escrow in tx.escrows_for_class(class_id).await? {
        if escrow.status == EscrowStatus::Held {
            locks.push(LockKey::Wallet(escrow.student_id));
        }
    }
    Ok(locks)
}

async fn recount(tx: &mut dyn StoreTx, class: &mut Class, now: DateTime<Utc>) -> Result<(), CoreError> {
    let count = tx
        .assigns_for_class(&class.id)
        .await?
        .iter()
        .filter(|a| a.counts_toward_roster())
        .count();
    class.current_student_count = count as i32;
    class.updated_at = now;
    tx.upsert_class(class).await?;
    Ok(())
}

async fn load_request(tx: &mut dyn StoreTx, request_id: &str) -> Result<ClassRequest, CoreError> {
    tx.class_request(request_id)
        .await?
        .ok_or_else(|| CoreError::not_found("ClassRequest", request_id))
}

async fn load_application(tx: &mut dyn StoreTx, application_id: &str) -> Result<TutorApplication, CoreError> {
    tx.application(application_id)
        .await?
        .ok_or_else(|| CoreError::not_found("TutorApplication", application_id))
}

async fn load_assign(tx: &mut dyn StoreTx, class_id: &str, student_id: &str) -> Result<ClassAssign, CoreError> {
    tx.class_assign(class_id, student_id)
        .await?
        .ok_or_else(|| CoreError::not_found("ClassAssign", format!("{}/{}", class_id, student_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Weekday};

    use crate::db::{MemoryStore, TransactionType};
    use crate::domain::{HorizonPolicy, RefundPolicy};
    use crate::services::escrow_manager::CommissionRates;
    use crate::services::ledger::Ledger;
    use crate::services::notifications::RecordingSink;

    struct Fixture {
        store: Arc<MemoryStore>,
        sink: RecordingSink,
        lifecycle: ClassLifecycleService,
        escrows: EscrowManager,
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).unwrap()
    }

    fn monday_rule() -> RecurringRule {
        RecurringRule {
            day_of_week: Weekday::Mon,
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        }
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = RecordingSink::new();
        let notifier: Arc<dyn NotificationSink> = Arc::new(sink.clone());
        let escrows = EscrowManager::new(
            store.clone(),
            Ledger::new("system:escrow", "system:platform"),
            RefundPolicy::default(),
            notifier.clone(),
        );
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
        let schedule = ScheduleService::new(store.clone(), HorizonPolicy::default());
        let lifecycle = ClassLifecycleService::new(store.clone(), escrows.clone(), schedule, notifier, 72);
        Fixture { store, sink, lifecycle, escrows }
    }

    async fn top_up(f: &Fixture, user: &str, amount: i64) {
        let mut tx = f.store.begin(vec![]).await.unwrap();
        f.escrows
            .ledger()
            .post_to_user(tx.as_mut(), user, TransactionType::TopUp, amount, None, at(1, 0))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    async fn balance(f: &Fixture, user: &str) -> i64 {
        let mut tx = f.store.begin(vec![]).await.unwrap();
        tx.wallet_by_user(user).await.unwrap().map(|w| w.balance).unwrap_or(0)
    }

    fn request_input(budget: i64) -> NewClassRequest {
        NewClassRequest {
            tutor_id: None,
            title: "Physics".into(),
            mode: DeliveryMode::OneToOneOnline,
            budget,
            rules: vec![monday_rule()],
            start_date: NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
        }
    }

    /// Request by s1, application by t1, accepted at Jan 1.
    async fn accepted_class(f: &Fixture) -> AcceptOutcome {
        let student = Actor::new("s1", Role::Student);
        let tutor = Actor::new("t1", Role::Tutor);
        let request = f.lifecycle.create_request(&student, request_input(1_000_000), at(1, 0)).await.unwrap();
        let application = f
            .lifecycle
            .apply_to_request(&tutor, &request.id, None, None, at(1, 1))
            .await
            .unwrap();
        f.lifecycle.accept_application(&student, &application.id, at(1, 2)).await.unwrap()
    }

    #[tokio::test]
    async fn test_accept_application_spawns_paid_class() {
        let f = fixture().await;
        top_up(&f, "s1", 1_000_000).await;

        let outcome = accepted_class(&f).await;
        assert_eq!(outcome.class.status, ClassStatus::Active);
        assert_eq!(outcome.class.current_student_count, 1);
        assert_eq!(outcome.class.student_limit, 1);
        assert_eq!(outcome.lessons.len(), 4);
        assert_eq!(outcome.escrow.status, EscrowStatus::Held);
        assert_eq!(outcome.escrow.amount, 1_000_000);
        assert_eq!(outcome.assign.approval_status, ApprovalStatus::Approved);
        assert_eq!(outcome.request.status, ClassRequestStatus::Accepted);
        assert_eq!(outcome.request.class_id.as_deref(), Some(outcome.class.id.as_str()));
        assert_eq!(balance(&f, "s1").await, 0);
        assert_eq!(balance(&f, "system:escrow").await, 1_000_000);

        assert_eq!(f.sink.count("request_accepted"), 1);
        assert_eq!(f.sink.count("class_created"), 1);
        assert_eq!(f.sink.count("escrow_held"), 1);
    }

    #[tokio::test]
    async fn test_second_acceptance_sees_sibling_rejected() {
        let f = fixture().await;
        top_up(&f, "s1", 2_000_000).await;
        let student = Actor::new("s1", Role::Student);
        let request = f.lifecycle.create_request(&student, request_input(500_000), at(1, 0)).await.unwrap();
        let first = f
            .lifecycle
            .apply_to_request(&Actor::new("t1", Role::Tutor), &request.id, Some(400_000), None, at(1, 1))
            .await
            .unwrap();
        let second = f
            .lifecycle
            .apply_to_request(&Actor::new("t2", Role::Tutor), &request.id, None, None, at(1, 1))
            .await
            .unwrap();

        let outcome = f.lifecycle.accept_application(&student, &first.id, at(1, 2)).await.unwrap();
        assert_eq!(outcome.class.price, 400_000);
        assert_eq!(outcome.rejected_application_ids, vec![second.id.clone()]);

        let err = f.lifecycle.accept_application(&student, &second.id, at(1, 3)).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        let details = f.lifecycle.request_details(&request.id).await.unwrap();
        let statuses: Vec<_> = details.applications.iter().map(|a| (a.id.clone(), a.status)).collect();
        assert!(statuses.contains(&(first.id, ApplicationStatus::Accepted)));
        assert!(statuses.contains(&(second.id, ApplicationStatus::Rejected)));
        assert_eq!(f.sink.count("class_created"), 1);
        assert_eq!(f.sink.count("application_rejected"), 1);
    }

    #[tokio::test]
    async fn test_accept_rolls_back_without_funds() {
        let f = fixture().await;
        let student = Actor::new("s1", Role::Student);
        let request = f.lifecycle.create_request(&student, request_input(1_000_000), at(1, 0)).await.unwrap();
        let application = f
            .lifecycle
            .apply_to_request(&Actor::new("t1", Role::Tutor), &request.id, None, None, at(1, 1))
            .await
            .unwrap();

        let err = f.lifecycle.accept_application(&student, &application.id, at(1, 2)).await.unwrap_err();
        assert!(matches!(err, CoreError::InsufficientBalance { .. }));

        let details = f.lifecycle.request_details(&request.id).await.unwrap();
        assert_eq!(details.request.status, ClassRequestStatus::Pending);
        assert_eq!(details.applications[0].status, ApplicationStatus::Pending);

        let mut tx = f.store.begin(vec![]).await.unwrap();
        assert!(tx.entries_for_tutor("t1", at(1, 0), at(31, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_application_guards() {
        let f = fixture().await;
        let student = Actor::new("s1", Role::Student);
        let mut input = request_input(100);
        input.tutor_id = Some("t1".into());
        let request = f.lifecycle.create_request(&student, input, at(1, 0)).await.unwrap();

        let err = f
            .lifecycle
            .apply_to_request(&Actor::new("t2", Role::Tutor), &request.id, None, None, at(1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));

        let tutor = Actor::new("t1", Role::Tutor);
        f.lifecycle.apply_to_request(&tutor, &request.id, None, None, at(1, 1)).await.unwrap();
        let err = f.lifecycle.apply_to_request(&tutor, &request.id, None, None, at(1, 2)).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        // Past the deadline the request takes no applications, swept or not.
        let late = f
            .lifecycle
            .apply_to_request(&tutor, &request.id, None, None, at(10, 0))
            .await
            .unwrap_err();
        assert!(matches!(late, CoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_class_is_idempotent() {
        let f = fixture().await;
        top_up(&f, "s1", 1_000_000).await;
        let outcome = accepted_class(&f).await;
        let tutor = Actor::new("t1", Role::Tutor);

        let first = f
            .lifecycle
            .cancel_class(&tutor, &outcome.class.id, CancellationReason::TutorFault, at(2, 0))
            .await
            .unwrap();
        assert!(!first.already_cancelled);
        assert_eq!(first.refunded_escrows_count, 1);
        assert_eq!(first.total_refunded_amount, 1_000_000);
        assert_eq!(balance(&f, "s1").await, 1_000_000);

        let second = f
            .lifecycle
            .cancel_class(&tutor, &outcome.class.id, CancellationReason::TutorFault, at(2, 1))
            .await
            .unwrap();
        assert!(second.already_cancelled);
        assert_eq!(second.total_refunded_amount, 0);
        assert_eq!(balance(&f, "s1").await, 1_000_000);

        let details = f.lifecycle.class_details(&outcome.class.id).await.unwrap();
        assert!(details.lessons.iter().all(|l| l.lesson.status == LessonStatus::Cancelled));
        assert!(details.roster.is_empty());
        assert_eq!(details.class.cancellation_reason, Some(CancellationReason::TutorFault));
        assert_eq!(f.sink.count("class_cancelled"), 1);
        assert_eq!(f.sink.count("escrow_refunded"), 1);
    }

    #[tokio::test]
    async fn test_cancel_keeps_lessons_that_already_ended() {
        let f = fixture().await;
        top_up(&f, "s1", 1_000_000).await;
        let outcome = accepted_class(&f).await;

        // Jan 14: the Jan 6 and Jan 13 lessons are over but no sweep ran.
        let cancelled = f
            .lifecycle
            .cancel_class(&Actor::new("t1", Role::Tutor), &outcome.class.id, CancellationReason::TutorFault, at(14, 0))
            .await
            .unwrap();
        assert_eq!(cancelled.total_refunded_amount, 1_000_000);

        let mut details = f.lifecycle.class_details(&outcome.class.id).await.unwrap();
        details.lessons.sort_by_key(|l| l.start);
        let statuses: Vec<_> = details.lessons.iter().map(|l| (l.start, l.lesson.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (at(6, 8), LessonStatus::Completed),
                (at(13, 8), LessonStatus::Completed),
                (at(20, 8), LessonStatus::Cancelled),
                (at(27, 8), LessonStatus::Cancelled),
            ]
        );

        let mut tx = f.store.begin(vec![]).await.unwrap();
        let kept: Vec<_> = tx
            .entries_for_tutor("t1", at(1, 0), at(31, 0))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.start)
            .collect();
        assert_eq!(kept, vec![at(6, 8), at(13, 8)]);
    }

    #[tokio::test]
    async fn test_cancel_permissions() {
        let f = fixture().await;
        top_up(&f, "s1", 1_000_000).await;
        let outcome = accepted_class(&f).await;

        let wrong_reason = f
            .lifecycle
            .cancel_class(&Actor::new("t1", Role::Tutor), &outcome.class.id, CancellationReason::AdminForced, at(2, 0))
            .await
            .unwrap_err();
        assert!(matches!(wrong_reason, CoreError::Forbidden(_)));

        let stranger = f
            .lifecycle
            .cancel_class(
                &Actor::new("s2", Role::Student),
                &outcome.class.id,
                CancellationReason::StudentInitiated,
                at(2, 0),
            )
            .await
            .unwrap_err();
        assert!(matches!(stranger, CoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_student_cancellation_keeps_deposit() {
        let f = fixture().await;
        top_up(&f, "s1", 1_000_000).await;
        let outcome = accepted_class(&f).await;

        // First lesson Jan 6 08:00, exactly 24 hours later: 50% tier.
        let cancelled = f
            .lifecycle
            .cancel_request(&Actor::new("s1", Role::Student), &outcome.request.id, at(5, 8))
            .await
            .unwrap();
        assert_eq!(cancelled.request.status, ClassRequestStatus::Cancelled);
        let class_outcome = cancelled.class_cancellation.unwrap();
        assert_eq!(class_outcome.total_refunded_amount, 500_000);

        // The retained half is split at the 12% snapshot.
        assert_eq!(balance(&f, "s1").await, 500_000);
        assert_eq!(balance(&f, "t1").await, 440_000);
        assert_eq!(balance(&f, "system:platform").await, 60_000);
        assert_eq!(balance(&f, "system:escrow").await, 0);
    }

    #[tokio::test]
    async fn test_group_enrollment_flow() {
        let f = fixture().await;
        top_up(&f, "s1", 300).await;
        top_up(&f, "s2", 300).await;
        let tutor = Actor::new("t1", Role::Tutor);
        let created = f
            .lifecycle
            .create_class(
                &tutor,
                NewClass {
                    title: "Chess".into(),
                    mode: DeliveryMode::GroupOnline,
                    price: 300,
                    student_limit: 1,
                    rules: vec![monday_rule()],
                    start_date: NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
                },
                at(1, 0),
            )
            .await
            .unwrap();
        let class_id = created.class.id.clone();
        assert_eq!(created.class.status, ClassStatus::Active);

        let first = f.lifecycle.enroll(&Actor::new("s1", Role::Student), &class_id, at(1, 1)).await.unwrap();
        assert_eq!(first.assign.approval_status, ApprovalStatus::Pending);
        assert_eq!(first.assign.payment_status, PaymentStatus::Paid);
        f.lifecycle.enroll(&Actor::new("s2", Role::Student), &class_id, at(1, 1)).await.unwrap();

        let again = f.lifecycle.enroll(&Actor::new("s1", Role::Student), &class_id, at(1, 2)).await.unwrap_err();
        assert!(matches!(again, CoreError::Validation(_)));

        f.lifecycle.approve_enrollment(&tutor, &class_id, "s1", at(1, 2)).await.unwrap();
        let full = f.lifecycle.approve_enrollment(&tutor, &class_id, "s2", at(1, 2)).await.unwrap_err();
        assert!(matches!(full, CoreError::Validation(_)));

        let rejected = f.lifecycle.reject_enrollment(&tutor, &class_id, "s2", at(1, 3)).await.unwrap();
        assert_eq!(rejected.assign.payment_status, PaymentStatus::Refunded);
        assert_eq!(rejected.escrow.unwrap().refunded_amount, 300);
        assert_eq!(balance(&f, "s2").await, 300);

        let details = f.lifecycle.class_details(&class_id).await.unwrap();
        assert_eq!(details.class.current_student_count, 1);
        assert_eq!(details.roster.len(), 1);
        assert_eq!(details.enrollments.len(), 2);
    }

    #[tokio::test]
    async fn test_waived_enrollment_counts_without_escrow() {
        let f = fixture().await;
        let created = f
            .lifecycle
            .create_class(
                &Actor::new("t1", Role::Tutor),
                NewClass {
                    title: "Art".into(),
                    mode: DeliveryMode::GroupOffline,
                    price: 100,
                    student_limit: 3,
                    rules: vec![monday_rule()],
                    start_date: NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
                },
                at(1, 0),
            )
            .await
            .unwrap();

        let admin = Actor::new("admin", Role::Admin);
        let assign = f.lifecycle.enroll_waived(&admin, &created.class.id, "s9", at(1, 1)).await.unwrap();
        assert!(assign.payment_waived);
        assert!(assign.counts_toward_roster());
        assert!(f.escrows.escrows_for_class(&created.class.id).await.unwrap().is_empty());

        let err = f
            .lifecycle
            .enroll_waived(&Actor::new("t1", Role::Tutor), &created.class.id, "s8", at(1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_sweeps_expire_and_complete() {
        let f = fixture().await;
        top_up(&f, "s1", 1_000_000).await;
        let outcome = accepted_class(&f).await;
        let stale = f
            .lifecycle
            .create_request(&Actor::new("s2", Role::Student), request_input(50), at(1, 0))
            .await
            .unwrap();

        // Jan 6 09:00: the first lesson is running.
        let report = f.lifecycle.run_sweeps(&Actor::system(), at(6, 9)).await.unwrap();
        assert_eq!(report.expiry.expired, 1);
        assert_eq!(report.advance.classes_started, 1);
        assert_eq!(report.advance.lessons_completed, 0);
        assert_eq!(f.lifecycle.request_details(&stale.id).await.unwrap().request.status, ClassRequestStatus::Expired);

        // Running again changes nothing.
        let again = f.lifecycle.run_sweeps(&Actor::system(), at(6, 9)).await.unwrap();
        assert_eq!(again.expiry.expired, 0);
        assert_eq!(again.advance.classes_started, 0);

        // After the fourth Monday every lesson has passed.
        let done = f.lifecycle.advance_classes(at(28, 0)).await.unwrap();
        assert_eq!(done.lessons_completed, 4);
        assert_eq!(done.classes_completed, 1);
        assert_eq!(done.escrows_released, 1);
        assert_eq!(balance(&f, "t1").await, 880_000);
        assert_eq!(balance(&f, "system:platform").await, 120_000);

        let details = f.lifecycle.class_details(&outcome.class.id).await.unwrap();
        assert_eq!(details.class.status, ClassStatus::Completed);

        let err = f
            .lifecycle
            .cancel_class(&Actor::new("admin", Role::Admin), &outcome.class.id, CancellationReason::AdminForced, at(28, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(f.sink.count("request_expired"), 1);
        assert_eq!(f.sink.count("escrow_released"), 1);

        let forbidden = f.lifecycle.run_sweeps(&Actor::new("s1", Role::Student), at(28, 0)).await.unwrap_err();
        assert!(matches!(forbidden, CoreError::Forbidden(_)));
    }
}
