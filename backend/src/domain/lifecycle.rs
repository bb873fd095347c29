//! # Class Lifecycle Rules
//!
//! Pure transition guards for requests, applications, classes and
//! enrollments. Services load the rows, ask these functions whether the
//! move is allowed, then write.
//!
//! ```text
//! ClassRequest   Pending ──accept──> Accepted
//!                   ├──────expire──> Expired
//!                   └──────cancel──> Cancelled <──cancel── Accepted
//!
//! Class          Pending ─> Active ─> Ongoing ─> Completed
//!                   └─────────┴─────────┴──────> Cancelled
//! ```

use chrono::{DateTime, Utc};

use crate::db::{
    ApplicationStatus, CancellationReason, Class, ClassRequest, ClassRequestStatus, ClassStatus,
    Role, TutorApplication,
};
use crate::errors::CoreError;

pub fn ensure_request_pending(request: &ClassRequest, action: &'static str) -> Result<(), CoreError> {
    if request.status != ClassRequestStatus::Pending {
        return Err(CoreError::invalid_transition("ClassRequest", &request.id, request.status, action));
    }
    Ok(())
}

/// A request past its `expires_at` no longer takes applications, even if the
/// sweep has not run yet.
pub fn ensure_request_open(
    request: &ClassRequest,
    now: DateTime<Utc>,
    action: &'static str,
) -> Result<(), CoreError> {
    ensure_request_pending(request, action)?;
    if request.expires_at <= now {
        return Err(CoreError::invalid_transition("ClassRequest", &request.id, "expired", action));
    }
    Ok(())
}

pub fn ensure_application_pending(
    application: &TutorApplication,
    action: &'static str,
) -> Result<(), CoreError> {
    if application.status != ApplicationStatus::Pending {
        return Err(CoreError::invalid_transition(
            "TutorApplication",
            &application.id,
            application.status,
            action,
        ));
    }
    Ok(())
}

/// Classes taking new enrollments.
pub fn ensure_class_enrollable(class: &Class) -> Result<(), CoreError> {
    match class.status {
        ClassStatus::Active | ClassStatus::Ongoing => Ok(()),
        status => Err(CoreError::invalid_transition("Class", &class.id, status, "enroll in")),
    }
}

pub fn ensure_class_has_seat(class: &Class) -> Result<(), CoreError> {
    if class.current_student_count >= class.student_limit {
        return Err(CoreError::Validation(format!(
            "class {} is full ({} of {})",
            class.id, class.current_student_count, class.student_limit
        )));
    }
    Ok(())
}

/// Which cancellation reasons a role may give.
pub fn ensure_reason_allowed(role: Role, reason: CancellationReason) -> Result<(), CoreError> {
    let allowed = match role {
        Role::Admin | Role::System => true,
        Role::Tutor => reason == CancellationReason::TutorFault,
        Role::Student => reason == CancellationReason::StudentInitiated,
    };
    if !allowed {
        return Err(CoreError::Forbidden(format!(
            "role {} cannot cancel with reason {}",
            role, reason
        )));
    }
    Ok(())
}

/// Status a class should hold given its lesson windows at `now`.
///
/// `lessons` holds `(start, end, still_scheduled)` for every non-cancelled
/// lesson. Returns `None` when the class stays where it is.
pub fn next_class_status(
    class: &Class,
    lessons: &[(DateTime<Utc>, DateTime<Utc>, bool)],
    now: DateTime<Utc>,
) -> Option<ClassStatus> {
    if !matches!(class.status, ClassStatus::Active | ClassStatus::Ongoing) || lessons.is_empty() {
        return None;
    }
    let all_done = lessons.iter().all(|(_, end, scheduled)| !scheduled || *end <= now);
    if all_done {
        return Some(ClassStatus::Completed);
    }
    let started = lessons.iter().any(|(start, _, _)| *start <= now);
    if class.status == ClassStatus::Active && started {
        return Some(ClassStatus::Ongoing);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};

    use crate::db::DeliveryMode;

    fn class(status: ClassStatus) -> Class {
        let now = Utc::now();
        Class {
            id: "c1".into(),
            tutor_id: "t1".into(),
            request_id: None,
            title: "Algebra".into(),
            mode: DeliveryMode::GroupOnline,
            price: 100,
            student_limit: 2,
            current_student_count: 0,
            rules: vec![],
            start_date: NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            status,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_reason_by_role() {
        assert!(ensure_reason_allowed(Role::Admin, CancellationReason::StudentInitiated).is_ok());
        assert!(ensure_reason_allowed(Role::Tutor, CancellationReason::TutorFault).is_ok());
        assert!(ensure_reason_allowed(Role::Tutor, CancellationReason::AdminForced).is_err());
        assert!(ensure_reason_allowed(Role::Student, CancellationReason::TutorFault).is_err());
    }

    #[test]
    fn test_class_progression() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap();
        let lessons = [
            (t0, t0 + Duration::hours(2), true),
            (t0 + Duration::days(7), t0 + Duration::days(7) + Duration::hours(2), true),
        ];

        let active = class(ClassStatus::Active);
        assert_eq!(next_class_status(&active, &lessons, t0 - Duration::hours(1)), None);
        assert_eq!(next_class_status(&active, &lessons, t0), Some(ClassStatus::Ongoing));

        let ongoing = class(ClassStatus::Ongoing);
        assert_eq!(next_class_status(&ongoing, &lessons, t0 + Duration::days(1)), None);
        assert_eq!(
            next_class_status(&ongoing, &lessons, t0 + Duration::days(8)),
            Some(ClassStatus::Completed)
        );
    }

    #[test]
    fn test_terminal_and_pending_classes_do_not_move() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap();
        let lessons = [(t0, t0 + Duration::hours(1), true)];
        let later = t0 + Duration::days(30);
        assert_eq!(next_class_status(&class(ClassStatus::Pending), &lessons, later), None);
        assert_eq!(next_class_status(&class(ClassStatus::Cancelled), &lessons, later), None);
        assert_eq!(next_class_status(&class(ClassStatus::Active), &[], later), None);
    }

    #[test]
    fn test_seat_limit() {
        let mut c = class(ClassStatus::Active);
        assert!(ensure_class_has_seat(&c).is_ok());
        c.current_student_count = 2;
        assert!(ensure_class_has_seat(&c).is_err());
    }
}
