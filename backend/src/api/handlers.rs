//! # API Request Handlers
//!
//! This module contains the handler functions for each API endpoint.
//! Each handler:
//! 1. Extracts the caller (`Actor`) and request data
//! 2. Calls the appropriate service
//! 3. Returns the result in the standard envelope
//!
//! ## Error Handling
//!
//! Handlers return `Result<HttpResponse, CoreError>`; every error is
//! rendered as JSON with a stable code:
//!
//! ```json
//! {
//!     "success": false,
//!     "error": {
//!         "code": "SCHEDULE_CONFLICT",
//!         "message": "Schedule conflict: ..."
//!     }
//! }
//! ```

use std::sync::Arc;

use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::errors::CoreError;
use crate::models::{
    AddAvailabilityRequest, ApiResponse, ApplyRequest, CancelRequest, CheckConflictRequest, CommitBlockRequest,
    ConfirmPaymentRequest, ConflictCheckResponse, FreezeRequest, HealthResponse, ProposeRescheduleRequest,
    QuoteQuery, ReleasedEntriesResponse, ScheduleQuery, TopUpRequest,
};
use crate::services::class_lifecycle::{NewClass, NewClassRequest};
use crate::services::escrow_manager::CommissionRates;
use crate::services::Actor;
use crate::AppState;

type State = web::Data<Arc<AppState>>;
type ApiResult = Result<HttpResponse, CoreError>;

fn ok<T: Serialize>(data: T) -> ApiResult {
    Ok(HttpResponse::Ok().json(ApiResponse::success(data)))
}

fn created<T: Serialize>(data: T) -> ApiResult {
    Ok(HttpResponse::Created().json(ApiResponse::success(data)))
}

// ============================================
// SYSTEM
// ============================================

/// API information endpoint (root).
///
/// ## Endpoint
///
/// `GET /`
pub async fn api_info() -> HttpResponse {
    let info = json!({
        "name": "Tutoring Scheduling & Escrow API",
        "version": env!("CARGO_PKG_VERSION"),
        "identity": "X-User-Id and X-User-Role headers",
        "groups": ["/wallets", "/commission", "/schedule", "/availability", "/requests",
                   "/applications", "/classes", "/reschedules", "/admin", "/ws/{user}"]
    });

    HttpResponse::Ok().json(ApiResponse::success(info))
}

/// Health check endpoint.
///
/// ## Endpoint
///
/// `GET /health`
///
/// ## Example
///
/// ```bash
/// curl http://127.0.0.1:8080/health
/// ```
///
/// Answers 503 when the store does not respond.
pub async fn health_check(state: State) -> HttpResponse {
    let status = state.monitor.system_status().await;

    let response = HealthResponse {
        status: if status.healthy { "healthy" } else { "unhealthy" }.to_string(),
        store: status.backend,
        sweeps_enabled: status.sweeps_enabled,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: status.last_check,
    };

    let status_code = if status.healthy {
        actix_web::http::StatusCode::OK
    } else {
        actix_web::http::StatusCode::SERVICE_UNAVAILABLE
    };

    HttpResponse::build(status_code).json(ApiResponse::success(response))
}

// ============================================
// WALLETS
// ============================================

/// The caller's wallet, created on first access.
///
/// ## Endpoint
///
/// `GET /wallets/me`
pub async fn my_wallet(actor: Actor, state: State) -> ApiResult {
    state.wallets.ensure_wallet(&actor.user_id, Utc::now()).await?;
    ok(state.wallets.wallet_summary(&actor.user_id).await?)
}

/// `GET /wallets/me/transactions`
pub async fn my_transactions(actor: Actor, state: State) -> ApiResult {
    ok(state.wallets.transactions(&actor.user_id).await?)
}

/// Start a top-up through the payment gateway.
///
/// ## Endpoint
///
/// `POST /wallets/top-up`
///
/// ## Example
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/wallets/top-up \
///   -H "X-User-Id: student-1" -H "X-User-Role: student" \
///   -H "Content-Type: application/json" \
///   -d '{"amount": 500000}'
/// ```
///
/// The wallet is credited only once the gateway confirms the payment.
pub async fn top_up(actor: Actor, state: State, body: web::Json<TopUpRequest>) -> ApiResult {
    info!("Top-up request from {} for {}", actor.user_id, body.amount);
    created(state.wallets.request_top_up(&actor, body.amount, Utc::now()).await?)
}

/// `PaymentConfirmed` callback. The gateway calls it with an admin identity.
///
/// ## Endpoint
///
/// `POST /payments/confirm`
pub async fn confirm_payment(actor: Actor, state: State, body: web::Json<ConfirmPaymentRequest>) -> ApiResult {
    actor.require_admin()?;
    ok(state.wallets.confirm_payment(&body.context_id, Utc::now()).await?)
}

/// `POST /admin/wallets/{user}/freeze`
pub async fn freeze_wallet(
    actor: Actor,
    state: State,
    path: web::Path<String>,
    body: web::Json<FreezeRequest>,
) -> ApiResult {
    let user = path.into_inner();
    ok(state.wallets.set_frozen(&actor, &user, body.frozen, Utc::now()).await?)
}

/// Recompute every wallet from its ledger rows.
///
/// ## Endpoint
///
/// `POST /admin/wallets/reconcile`
pub async fn reconcile_wallets(actor: Actor, state: State) -> ApiResult {
    actor.require_admin()?;
    ok(state.tracker.reconcile_all().await?)
}

// ============================================
// COMMISSION
// ============================================

/// `GET /admin/commission-config`
pub async fn get_commission_config(actor: Actor, state: State) -> ApiResult {
    actor.require_admin()?;
    ok(state.escrows.active_commission_config().await?)
}

/// Replace the active commission rates.
///
/// ## Endpoint
///
/// `POST /admin/commission-config`
///
/// ## Request Body
///
/// ```json
/// {
///     "oneToOneOnlineBps": 1200,
///     "oneToOneOfflineBps": 1000,
///     "groupOnlineBps": 1500,
///     "groupOfflineBps": 800
/// }
/// ```
pub async fn set_commission_config(actor: Actor, state: State, body: web::Json<CommissionRates>) -> ApiResult {
    created(state.escrows.set_active_commission_config(&actor, body.into_inner(), Utc::now()).await?)
}

/// `GET /commission/quote?mode=group_online&gross=1000000`
pub async fn quote_commission(state: State, query: web::Query<QuoteQuery>) -> ApiResult {
    ok(state.escrows.quote(query.mode, query.gross).await?)
}

// ============================================
// SCHEDULE AND AVAILABILITY
// ============================================

/// `GET /tutors/{id}/schedule?from=...&to=...`
pub async fn tutor_schedule(state: State, path: web::Path<String>, query: web::Query<ScheduleQuery>) -> ApiResult {
    let tutor_id = path.into_inner();
    ok(state.schedule.tutor_schedule(&tutor_id, query.from, query.to).await?)
}

/// Check a candidate interval against a tutor's calendar.
///
/// ## Endpoint
///
/// `POST /schedule/check-conflict`
///
/// A collision is reported in the body, not as an error status.
pub async fn check_conflict(state: State, body: web::Json<CheckConflictRequest>) -> ApiResult {
    let existing = state
        .schedule
        .check_conflict(&body.tutor_id, body.start, body.end, body.ignore_entry_id.as_deref())
        .await?;
    ok(ConflictCheckResponse { conflict: existing.is_some(), existing_entry: existing })
}

/// `POST /availability`
pub async fn add_availability(actor: Actor, state: State, body: web::Json<AddAvailabilityRequest>) -> ApiResult {
    let body = body.into_inner();
    created(
        state
            .schedule
            .add_block(&actor, body.day_of_week, body.start_time, body.end_time, body.kind, Utc::now())
            .await?,
    )
}

/// `GET /tutors/{id}/availability`
pub async fn list_availability(state: State, path: web::Path<String>) -> ApiResult {
    let tutor_id = path.into_inner();
    ok(state.schedule.list_blocks(&tutor_id).await?)
}

/// `DELETE /availability/{id}`
pub async fn remove_availability(actor: Actor, state: State, path: web::Path<String>) -> ApiResult {
    let block_id = path.into_inner();
    let released = state.schedule.remove_block(&actor, &block_id, Utc::now()).await?;
    ok(ReleasedEntriesResponse { block_id, released_entries: released })
}

/// Materialize a busy block into calendar entries.
///
/// ## Endpoint
///
/// `POST /availability/{id}/commit`
pub async fn commit_availability(
    actor: Actor,
    state: State,
    path: web::Path<String>,
    body: web::Json<CommitBlockRequest>,
) -> ApiResult {
    let block_id = path.into_inner();
    created(state.schedule.commit_busy_block(&actor, &block_id, body.start_date, Utc::now()).await?)
}

/// `POST /availability/{id}/release`
pub async fn release_availability(actor: Actor, state: State, path: web::Path<String>) -> ApiResult {
    let block_id = path.into_inner();
    let released = state.schedule.release_block(&actor, &block_id, Utc::now()).await?;
    ok(ReleasedEntriesResponse { block_id, released_entries: released })
}

// ============================================
// CLASS REQUESTS AND APPLICATIONS
// ============================================

/// Open a class request.
///
/// ## Endpoint
///
/// `POST /requests`
///
/// ## Request Body
///
/// ```json
/// {
///     "title": "Calculus II",
///     "mode": "one_to_one_online",
///     "budget": 1000000,
///     "rules": [{"dayOfWeek": "Mon", "startTime": "10:00:00", "endTime": "11:00:00"}],
///     "startDate": "2025-01-06"
/// }
/// ```
pub async fn create_request(actor: Actor, state: State, body: web::Json<NewClassRequest>) -> ApiResult {
    created(state.lifecycle.create_request(&actor, body.into_inner(), Utc::now()).await?)
}

/// `GET /requests/{id}`
pub async fn get_request(state: State, path: web::Path<String>) -> ApiResult {
    ok(state.lifecycle.request_details(&path.into_inner()).await?)
}

/// `POST /requests/{id}/applications`
pub async fn apply_to_request(
    actor: Actor,
    state: State,
    path: web::Path<String>,
    body: web::Json<ApplyRequest>,
) -> ApiResult {
    let request_id = path.into_inner();
    let body = body.into_inner();
    created(
        state
            .lifecycle
            .apply_to_request(&actor, &request_id, body.proposed_price, body.message, Utc::now())
            .await?,
    )
}

/// `POST /requests/{id}/cancel`
pub async fn cancel_request(actor: Actor, state: State, path: web::Path<String>) -> ApiResult {
    ok(state.lifecycle.cancel_request(&actor, &path.into_inner(), Utc::now()).await?)
}

/// Accept an application: creates the class, its lessons and the escrow.
///
/// ## Endpoint
///
/// `POST /applications/{id}/accept`
///
/// Fails as a whole with `SCHEDULE_CONFLICT` or `INSUFFICIENT_BALANCE`.
pub async fn accept_application(actor: Actor, state: State, path: web::Path<String>) -> ApiResult {
    ok(state.lifecycle.accept_application(&actor, &path.into_inner(), Utc::now()).await?)
}

/// `POST /applications/{id}/reject`
pub async fn reject_application(actor: Actor, state: State, path: web::Path<String>) -> ApiResult {
    ok(state.lifecycle.reject_application(&actor, &path.into_inner(), Utc::now()).await?)
}

/// `POST /applications/{id}/withdraw`
pub async fn withdraw_application(actor: Actor, state: State, path: web::Path<String>) -> ApiResult {
    ok(state.lifecycle.withdraw_application(&actor, &path.into_inner(), Utc::now()).await?)
}

// ============================================
// CLASSES AND ENROLLMENTS
// ============================================

/// `POST /classes`
pub async fn create_class(actor: Actor, state: State, body: web::Json<NewClass>) -> ApiResult {
    created(state.lifecycle.create_class(&actor, body.into_inner(), Utc::now()).await?)
}

/// `GET /classes/{id}`
pub async fn get_class(state: State, path: web::Path<String>) -> ApiResult {
    ok(state.lifecycle.class_details(&path.into_inner()).await?)
}

/// `GET /classes/{id}/escrows`
pub async fn class_escrows(actor: Actor, state: State, path: web::Path<String>) -> ApiResult {
    let class_id = path.into_inner();
    let details = state.lifecycle.class_details(&class_id).await?;
    actor.require_owner(&details.class.tutor_id, "the class")?;
    ok(state.escrows.escrows_for_class(&class_id).await?)
}

/// Enroll in a group class. The price is held in escrow immediately.
///
/// ## Endpoint
///
/// `POST /classes/{id}/enroll`
pub async fn enroll(actor: Actor, state: State, path: web::Path<String>) -> ApiResult {
    created(state.lifecycle.enroll(&actor, &path.into_inner(), Utc::now()).await?)
}

/// `POST /classes/{id}/enrollments/{student}/approve`
pub async fn approve_enrollment(actor: Actor, state: State, path: web::Path<(String, String)>) -> ApiResult {
    let (class_id, student_id) = path.into_inner();
    ok(state.lifecycle.approve_enrollment(&actor, &class_id, &student_id, Utc::now()).await?)
}

/// `POST /classes/{id}/enrollments/{student}/reject`
pub async fn reject_enrollment(actor: Actor, state: State, path: web::Path<(String, String)>) -> ApiResult {
    let (class_id, student_id) = path.into_inner();
    ok(state.lifecycle.reject_enrollment(&actor, &class_id, &student_id, Utc::now()).await?)
}

/// Cancel a class and refund every held escrow per policy.
///
/// ## Endpoint
///
/// `POST /classes/{id}/cancel`
///
/// ## Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "classId": "c7d2...",
///         "alreadyCancelled": false,
///         "refundedEscrowsCount": 1,
///         "totalRefundedAmount": 500000
///     }
/// }
/// ```
pub async fn cancel_class(
    actor: Actor,
    state: State,
    path: web::Path<String>,
    body: web::Json<CancelRequest>,
) -> ApiResult {
    let class_id = path.into_inner();
    info!("Cancel request for class {} by {} ({})", class_id, actor.user_id, body.reason);
    ok(state.lifecycle.cancel_class(&actor, &class_id, body.reason, Utc::now()).await?)
}

// ============================================
// RESCHEDULES
// ============================================

/// `POST /reschedules`
pub async fn propose_reschedule(actor: Actor, state: State, body: web::Json<ProposeRescheduleRequest>) -> ApiResult {
    let body = body.into_inner();
    created(
        state
            .reschedules
            .propose(&actor, &body.lesson_id, body.new_start, body.new_end, body.reason, Utc::now())
            .await?,
    )
}

/// `GET /reschedules/{id}`
pub async fn get_reschedule(state: State, path: web::Path<String>) -> ApiResult {
    ok(state.reschedules.get(&path.into_inner()).await?)
}

/// `POST /reschedules/{id}/accept`
pub async fn accept_reschedule(actor: Actor, state: State, path: web::Path<String>) -> ApiResult {
    ok(state.reschedules.accept(&actor, &path.into_inner(), Utc::now()).await?)
}

/// `POST /reschedules/{id}/reject`
pub async fn reject_reschedule(actor: Actor, state: State, path: web::Path<String>) -> ApiResult {
    ok(state.reschedules.reject(&actor, &path.into_inner(), Utc::now()).await?)
}

// ============================================
// ADMINISTRATION
// ============================================

/// `POST /admin/escrows/{id}/release`
pub async fn release_escrow(actor: Actor, state: State, path: web::Path<String>) -> ApiResult {
    ok(state.escrows.release_escrow(&actor, &path.into_inner(), Utc::now()).await?)
}

/// `POST /admin/escrows/{id}/refund`
pub async fn refund_escrow(
    actor: Actor,
    state: State,
    path: web::Path<String>,
    body: web::Json<CancelRequest>,
) -> ApiResult {
    ok(state.escrows.refund_escrow(&actor, &path.into_inner(), body.reason, Utc::now()).await?)
}

/// `POST /admin/classes/{id}/enrollments/{student}/waive`
pub async fn enroll_waived(actor: Actor, state: State, path: web::Path<(String, String)>) -> ApiResult {
    let (class_id, student_id) = path.into_inner();
    created(state.lifecycle.enroll_waived(&actor, &class_id, &student_id, Utc::now()).await?)
}

/// Run request expiry and class advancement now.
///
/// ## Endpoint
///
/// `POST /admin/sweeps/run`
pub async fn run_sweeps(actor: Actor, state: State) -> ApiResult {
    ok(state.lifecycle.run_sweeps(&actor, Utc::now()).await?)
}
