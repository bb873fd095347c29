//! # API Response Models
//!
//! Structures for outgoing API response bodies.
//! All responses are wrapped in a standard format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::ScheduleEntry;

/// Standard API response wrapper.
///
/// All API responses follow this format:
///
/// ## Success Response
///
/// ```json
/// {
///     "success": true,
///     "data": { ... },
///     "error": null
/// }
/// ```
///
/// ## Error Response
///
/// ```json
/// {
///     "success": false,
///     "data": null,
///     "error": {
///         "code": "INSUFFICIENT_BALANCE",
///         "message": "Insufficient balance in wallet ..."
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    /// Whether the request was successful.
    pub success: bool,

    /// Response data (null on error).
    pub data: Option<T>,

    /// Error information (null on success).
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response with data.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

/// API error information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Error code (e.g., "SCHEDULE_CONFLICT").
    pub code: String,

    /// Human-readable error message.
    pub message: String,
}

/// Result of `POST /schedule/check-conflict`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCheckResponse {
    pub conflict: bool,

    /// The first colliding entry, when there is one.
    pub existing_entry: Option<ScheduleEntry>,
}

/// Number of calendar entries a block operation soft-deleted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleasedEntriesResponse {
    pub block_id: String,
    pub released_entries: usize,
}

/// Health check response.
///
/// ## Example
///
/// ```json
/// {
///     "status": "healthy",
///     "store": "postgres",
///     "sweepsEnabled": true,
///     "version": "0.1.0",
///     "timestamp": "2025-01-06T12:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Service status: "healthy" or "unhealthy".
    pub status: String,

    /// Storage backend in use.
    pub store: &'static str,

    /// Whether the in-process sweep ticker runs.
    pub sweeps_enabled: bool,

    /// Crate version.
    pub version: String,

    pub timestamp: DateTime<Utc>,
}
