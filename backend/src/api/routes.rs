//! # API Route Configuration
//!
//! This module sets up all the HTTP routes for the API.

use actix_web::web;

use super::handlers;

/// Configure all API routes.
///
/// ## Route Structure
///
/// ```text
/// /
/// ├── /health                                  GET  - Health check
/// ├── /wallets
/// │   ├── /me                                  GET  - Caller's wallet
/// │   ├── /me/transactions                     GET  - Caller's ledger rows
/// │   └── /top-up                              POST - Start a gateway top-up
/// ├── /payments/confirm                        POST - Gateway confirmation
/// ├── /commission/quote                        GET  - Commission for a price
/// ├── /tutors/{id}
/// │   ├── /schedule                            GET  - Calendar window
/// │   └── /availability                        GET  - Availability blocks
/// ├── /schedule/check-conflict                 POST - Conflict check
/// ├── /availability                            POST - Add block
/// │   └── /{id}                                DELETE - Remove block
/// │       ├── /commit                          POST - Materialize busy block
/// │       └── /release                         POST - Release its entries
/// ├── /requests                                POST - Open a class request
/// │   └── /{id}                                GET  - Request with applications
/// │       ├── /applications                    POST - Apply (tutor)
/// │       └── /cancel                          POST - Cancel (student)
/// ├── /applications/{id}
/// │   ├── /accept | /reject | /withdraw        POST
/// ├── /classes                                 POST - Create group class
/// │   └── /{id}                                GET  - Class with lessons
/// │       ├── /escrows                         GET  - Escrows (tutor)
/// │       ├── /enroll                          POST - Enroll (student)
/// │       ├── /enrollments/{student}/approve   POST
/// │       ├── /enrollments/{student}/reject    POST
/// │       └── /cancel                          POST - Cancel with reason
/// ├── /reschedules                             POST - Propose
/// │   └── /{id}                                GET
/// │       ├── /accept | /reject                POST
/// └── /admin
///     ├── /wallets/{user}/freeze               POST
///     ├── /wallets/reconcile                   POST
///     ├── /commission-config                   GET | POST
///     ├── /escrows/{id}/release                POST
///     ├── /escrows/{id}/refund                 POST
///     ├── /classes/{id}/enrollments/{student}/waive  POST
///     └── /sweeps/run                          POST
/// ```
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Root endpoint - API information
        .route("/", web::get().to(handlers::api_info))

        // Health check endpoint
        .route("/health", web::get().to(handlers::health_check))

        // Wallets
        .service(
            web::scope("/wallets")
                .route("/me", web::get().to(handlers::my_wallet))
                .route("/me/transactions", web::get().to(handlers::my_transactions))
                .route("/top-up", web::post().to(handlers::top_up)),
        )
        .route("/payments/confirm", web::post().to(handlers::confirm_payment))

        // Commission
        .route("/commission/quote", web::get().to(handlers::quote_commission))

        // Schedule and availability
        .service(
            web::scope("/tutors/{id}")
                .route("/schedule", web::get().to(handlers::tutor_schedule))
                .route("/availability", web::get().to(handlers::list_availability)),
        )
        .route("/schedule/check-conflict", web::post().to(handlers::check_conflict))
        .service(
            web::scope("/availability")
                .route("", web::post().to(handlers::add_availability))
                .route("/{id}", web::delete().to(handlers::remove_availability))
                .route("/{id}/commit", web::post().to(handlers::commit_availability))
                .route("/{id}/release", web::post().to(handlers::release_availability)),
        )

        // Requests and applications
        .service(
            web::scope("/requests")
                .route("", web::post().to(handlers::create_request))
                .route("/{id}", web::get().to(handlers::get_request))
                .route("/{id}/applications", web::post().to(handlers::apply_to_request))
                .route("/{id}/cancel", web::post().to(handlers::cancel_request)),
        )
        .service(
            web::scope("/applications/{id}")
                .route("/accept", web::post().to(handlers::accept_application))
                .route("/reject", web::post().to(handlers::reject_application))
                .route("/withdraw", web::post().to(handlers::withdraw_application)),
        )

        // Classes and enrollments
        .service(
            web::scope("/classes")
                .route("", web::post().to(handlers::create_class))
                .route("/{id}", web::get().to(handlers::get_class))
                .route("/{id}/escrows", web::get().to(handlers::class_escrows))
                .route("/{id}/enroll", web::post().to(handlers::enroll))
                .route(
                    "/{id}/enrollments/{student}/approve",
                    web::post().to(handlers::approve_enrollment),
                )
                .route(
                    "/{id}/enrollments/{student}/reject",
                    web::post().to(handlers::reject_enrollment),
                )
                .route("/{id}/cancel", web::post().to(handlers::cancel_class)),
        )

        // Reschedules
        .service(
            web::scope("/reschedules")
                .route("", web::post().to(handlers::propose_reschedule))
                .route("/{id}", web::get().to(handlers::get_reschedule))
                .route("/{id}/accept", web::post().to(handlers::accept_reschedule))
                .route("/{id}/reject", web::post().to(handlers::reject_reschedule)),
        )

        // Administration
        .service(
            web::scope("/admin")
                .route("/wallets/reconcile", web::post().to(handlers::reconcile_wallets))
                .route("/wallets/{user}/freeze", web::post().to(handlers::freeze_wallet))
                .service(
                    web::resource("/commission-config")
                        .route(web::get().to(handlers::get_commission_config))
                        .route(web::post().to(handlers::set_commission_config)),
                )
                .route("/escrows/{id}/release", web::post().to(handlers::release_escrow))
                .route("/escrows/{id}/refund", web::post().to(handlers::refund_escrow))
                .route(
                    "/classes/{id}/enrollments/{student}/waive",
                    web::post().to(handlers::enroll_waived),
                )
                .route("/sweeps/run", web::post().to(handlers::run_sweeps)),
        );
}
