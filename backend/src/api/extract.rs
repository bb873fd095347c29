//! # Request Identity and Error Rendering
//!
//! The upstream authentication gateway resolves the caller and forwards it
//! as two headers:
//!
//! | Header | Example |
//! |--------|---------|
//! | `X-User-Id` | `student-1` |
//! | `X-User-Role` | `student`, `tutor` or `admin` |
//!
//! Handlers take an [`Actor`] argument and return `Result<_, CoreError>`;
//! the impls below turn both into HTTP.

use actix_web::dev::Payload;
use actix_web::http::StatusCode;
use actix_web::{FromRequest, HttpRequest, HttpResponse, ResponseError};
use futures::future::{ready, Ready};
use tracing::{error, warn};

use crate::db::Role;
use crate::errors::CoreError;
use crate::models::ApiResponse;
use crate::services::Actor;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const USER_ROLE_HEADER: &str = "X-User-Role";

/// Build the caller from the forwarded identity headers.
pub fn actor_from_headers(req: &HttpRequest) -> Result<Actor, CoreError> {
    let user_id = header(req, USER_ID_HEADER)?;
    let role: Role = header(req, USER_ROLE_HEADER)?
        .parse()
        .map_err(|e| CoreError::Validation(format!("{}: {}", USER_ROLE_HEADER, e)))?;

    // Sweeps and callbacks run in-process as the system actor; no client may claim it.
    if role == Role::System {
        return Err(CoreError::Forbidden("the system role cannot be asserted by a client".to_string()));
    }
    Ok(Actor::new(user_id, role))
}

fn header(req: &HttpRequest, name: &str) -> Result<String, CoreError> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CoreError::Forbidden(format!("missing {} header", name)))
}

impl FromRequest for Actor {
    type Error = CoreError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(actor_from_headers(req))
    }
}

impl ResponseError for CoreError {
    fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::ScheduleConflict { .. }
            | CoreError::RescheduleConflict { .. }
            | CoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
            CoreError::InsufficientBalance { .. } | CoreError::WalletFrozen(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::Gateway(_) => StatusCode::BAD_GATEWAY,
            CoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected ({}): {}", self.code(), self);
        }
        HttpResponse::build(status).json(ApiResponse::<()>::error(self.code(), &self.to_string()))
    }
}
