//! # REST API Module
//!
//! This module defines the HTTP endpoints of the scheduling and escrow
//! core. The layer is thin: handlers resolve the caller, call one service
//! operation and wrap the result.
//!
//! ## Endpoint Overview
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/wallets/me` | Caller's wallet |
//! | POST | `/wallets/top-up` | Start a gateway top-up |
//! | POST | `/requests` | Open a class request |
//! | POST | `/applications/:id/accept` | Create the class and hold the escrow |
//! | POST | `/classes/:id/cancel` | Cancel and refund |
//! | POST | `/reschedules` | Propose a lesson move |
//! | POST | `/admin/sweeps/run` | Expire requests, advance classes |
//! | GET | `/health` | Health check |
//!
//! See [`routes::configure_routes`] for the full tree.
//!
//! ## Request/Response Format
//!
//! All requests and responses use JSON:
//!
//! ```json
//! // Success response
//! {
//!     "success": true,
//!     "data": { ... }
//! }
//!
//! // Error response
//! {
//!     "success": false,
//!     "error": {
//!         "code": "ERROR_CODE",
//!         "message": "Human readable message"
//!     }
//! }
//! ```
//!
//! Every mutating endpoint needs the `X-User-Id` and `X-User-Role` headers.

pub mod extract;
pub mod handlers;
pub mod routes;

pub use routes::configure_routes;
