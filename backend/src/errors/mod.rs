//! # Error Handling Module
//!
//! Every service operation returns `Result<T, CoreError>`. The variants
//! follow the failure taxonomy of the core:
//!
//! | Category | Variants | Meaning |
//! |----------|----------|---------|
//! | Validation | `Validation` | Malformed input, rejected before any write |
//! | Conflict | `ScheduleConflict`, `RescheduleConflict` | Collision, reported with the colliding reference |
//! | State | `InvalidTransition` | Transition not allowed from the current status |
//! | Ledger | `InsufficientBalance`, `WalletFrozen` | Blocks the operation, no partial debit |
//! | Lookup | `NotFound` | Referenced entity missing |
//! | Access | `Forbidden` | Actor may not perform the operation |
//! | External | `Gateway`, `Database` | Infrastructure failures |
//!
//! The API layer maps each variant to a stable code through [`CoreError::code`].

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::DatabaseError;

/// Failure of a core operation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input (e.g. end not after start).
    #[error("Invalid input: {0}")]
    Validation(String),

    /// A candidate interval collides with a committed schedule entry.
    #[error(
        "Schedule conflict: {candidate_start}..{candidate_end} overlaps entry {existing_entry_id} \
         ({existing_start}..{existing_end})"
    )]
    ScheduleConflict {
        candidate_start: DateTime<Utc>,
        candidate_end: DateTime<Utc>,
        existing_entry_id: String,
        existing_start: DateTime<Utc>,
        existing_end: DateTime<Utc>,
    },

    /// Another reschedule request is already pending for the lesson.
    #[error("Lesson {lesson_id} already has a pending reschedule request {pending_request_id}")]
    RescheduleConflict { lesson_id: String, pending_request_id: String },

    /// The entity is not in a status that allows the action.
    #[error("Cannot {action} {entity} {id} in status {status}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        status: String,
        action: &'static str,
    },

    /// Not enough balance for a debit.
    #[error("Insufficient balance in wallet {wallet_id}: available {available}, requested {requested}")]
    InsufficientBalance { wallet_id: String, available: i64, requested: i64 },

    /// The wallet is frozen and cannot be debited.
    #[error("Wallet {0} is frozen")]
    WalletFrozen(String),

    /// Referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The actor may not perform this operation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Payment gateway call failed after retries.
    #[error("Payment gateway error: {0}")]
    Gateway(String),

    /// Storage failure.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound { entity, id: id.into() }
    }

    pub fn invalid_transition(
        entity: &'static str,
        id: impl Into<String>,
        status: impl ToString,
        action: &'static str,
    ) -> Self {
        CoreError::InvalidTransition {
            entity,
            id: id.into(),
            status: status.to_string(),
            action,
        }
    }

    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::ScheduleConflict { .. } => "SCHEDULE_CONFLICT",
            CoreError::RescheduleConflict { .. } => "RESCHEDULE_CONFLICT",
            CoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CoreError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            CoreError::WalletFrozen(_) => "WALLET_FROZEN",
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::Forbidden(_) => "FORBIDDEN",
            CoreError::Gateway(_) => "GATEWAY_ERROR",
            CoreError::Database(_) => "DATABASE_ERROR",
        }
    }
}
