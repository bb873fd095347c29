//! # API Request Models
//!
//! Structures for incoming API request bodies and query strings.
//! Bodies that map one-to-one onto a service input (`NewClassRequest`,
//! `NewClass`, `CommissionRates`) are deserialized straight into it.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::db::{AvailabilityKind, CancellationReason, DeliveryMode};

/// Request to top up the caller's wallet.
///
/// ## Example JSON
///
/// ```json
/// {
///     "amount": 500000
/// }
/// ```
///
/// `amount` is in minor currency units and must be positive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopUpRequest {
    pub amount: i64,
}

/// `PaymentConfirmed` callback from the payment gateway.
///
/// ## Example JSON
///
/// ```json
/// {
///     "contextId": "4f7c0c7e-..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentRequest {
    /// Id of the pending top-up transaction.
    pub context_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreezeRequest {
    pub frozen: bool,
}

/// Query for `GET /commission/quote`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteQuery {
    pub mode: DeliveryMode,
    pub gross: i64,
}

/// Window for `GET /tutors/{id}/schedule`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Request to check a candidate interval against a tutor's calendar.
///
/// ## Example JSON
///
/// ```json
/// {
///     "tutorId": "tutor-1",
///     "start": "2025-01-06T10:00:00Z",
///     "end": "2025-01-06T11:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckConflictRequest {
    pub tutor_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,

    /// Entry to leave out of the check (the one being moved).
    pub ignore_entry_id: Option<String>,
}

/// Request to add a weekly availability block for the calling tutor.
///
/// ## Example JSON
///
/// ```json
/// {
///     "dayOfWeek": "Mon",
///     "startTime": "09:00:00",
///     "endTime": "12:00:00",
///     "kind": "busy"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAvailabilityRequest {
    pub day_of_week: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub kind: AvailabilityKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitBlockRequest {
    /// First day the block is materialized from.
    pub start_date: NaiveDate,
}

/// A tutor's application to a class request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    /// Price offered; the request budget when absent.
    pub proposed_price: Option<i64>,
    pub message: Option<String>,
}

/// Body of `POST /classes/{id}/cancel` and `POST /admin/escrows/{id}/refund`.
///
/// ## Example JSON
///
/// ```json
/// {
///     "reason": "student_initiated"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub reason: CancellationReason,
}

/// Proposal to move a lesson.
///
/// ## Example JSON
///
/// ```json
/// {
///     "lessonId": "a1c0...",
///     "newStart": "2025-01-08T14:00:00Z",
///     "newEnd": "2025-01-08T15:00:00Z",
///     "reason": "Conference on Monday"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeRescheduleRequest {
    pub lesson_id: String,
    pub new_start: DateTime<Utc>,
    pub new_end: DateTime<Utc>,
    pub reason: Option<String>,
}
