//! # Tutoring Scheduling & Escrow Core
//!
//! Library half of the backend service. The binary (`main.rs`) loads the
//! configuration, picks a store and serves [`api`] and [`websocket`] over
//! the state built here.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        BACKEND SERVICE                           │
//! │                                                                  │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  REST API   │  │  WebSocket  │  │   Background Services   │  │
//! │  │  (Actix)    │  │  Registry   │  │  • Lifecycle sweeps     │  │
//! │  │             │  │             │  │  • Reconciliation       │  │
//! │  │  /requests  │  │  /ws/{user} │  │  • Health check         │  │
//! │  │  /classes   │  │             │  │                         │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! │         │                ▲                     │                 │
//! │         └────────────────┼─────────────────────┘                 │
//! │                          │ events                                │
//! │  ┌───────────────────────┴───────────────────────────────────┐  │
//! │  │                    SERVICE LAYER                           │  │
//! │  │  Wallets · Escrow · Schedule · Class lifecycle · Reschedule│  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                          │                                       │
//! │         ┌────────────────┴────────────────┐                     │
//! │  ┌──────┴──────┐                   ┌──────┴──────┐              │
//! │  │  PostgreSQL │                   │  In-memory  │              │
//! │  │  (PgStore)  │                   │ MemoryStore │              │
//! │  └─────────────┘                   └─────────────┘              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod errors;
pub mod models;
pub mod services;
pub mod websocket;

use std::sync::Arc;

use chrono::Utc;

use config::AppConfig;
use db::Store;
use errors::CoreError;
use services::{
    BalanceTracker, ClassLifecycleService, EscrowManager, Ledger, LifecycleMonitor, LoggingGateway,
    NotificationSink, RescheduleService, ScheduleService, WalletService,
};
use websocket::WsRegistry;

/// Application state shared across all handlers.
///
/// Every service is cheap to clone; they share the store and the
/// WebSocket registry through `Arc`s.
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,

    /// Storage backend (PostgreSQL or in-memory)
    pub store: Arc<dyn Store>,

    pub wallets: WalletService,
    pub escrows: EscrowManager,
    pub schedule: ScheduleService,
    pub lifecycle: ClassLifecycleService,
    pub reschedules: RescheduleService,
    pub tracker: BalanceTracker,
    pub monitor: LifecycleMonitor,

    /// WebSocket connection registry; also the notification sink
    pub ws_registry: WsRegistry,
}

impl AppState {
    /// Wire every service over `store` and create the system wallets.
    pub async fn build(config: AppConfig, store: Arc<dyn Store>) -> Result<Self, CoreError> {
        let ws_registry = WsRegistry::new();
        let notifier: Arc<dyn NotificationSink> = Arc::new(ws_registry.clone());
        let ledger = Ledger::new(config.escrow_account_id.clone(), config.platform_account_id.clone());

        let wallets = WalletService::new(
            store.clone(),
            ledger.clone(),
            Arc::new(LoggingGateway),
            config.gateway_retry_policy(),
        );
        let escrows = EscrowManager::new(
            store.clone(),
            ledger,
            config.student_refund_policy.clone(),
            notifier.clone(),
        );
        let schedule = ScheduleService::new(store.clone(), config.horizon_policy());
        let lifecycle = ClassLifecycleService::new(
            store.clone(),
            escrows.clone(),
            schedule.clone(),
            notifier.clone(),
            config.class_request_ttl_hours,
        );
        let reschedules = RescheduleService::new(store.clone(), notifier);
        let tracker = BalanceTracker::new(store.clone());
        let monitor = LifecycleMonitor::new(
            store.clone(),
            lifecycle.clone(),
            tracker.clone(),
            config.sweep_interval_secs,
            config.reconciliation_interval_secs,
        );

        wallets.ensure_system_wallets(Utc::now()).await?;

        Ok(Self {
            config,
            store,
            wallets,
            escrows,
            schedule,
            lifecycle,
            reschedules,
            tracker,
            monitor,
            ws_registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use actix_web::{test, web, App};
    use serde_json::{json, Value};

    use crate::db::MemoryStore;

    async fn state() -> Arc<AppState> {
        let config = AppConfig { sweep_interval_secs: 0, ..AppConfig::default() };
        Arc::new(AppState::build(config, Arc::new(MemoryStore::new())).await.unwrap())
    }

    #[actix_rt::test]
    async fn test_top_up_through_the_api() {
        let app = test::init_service(
            App::new().app_data(web::Data::new(state().await)).configure(api::configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/wallets/top-up")
            .insert_header(("X-User-Id", "student-1"))
            .insert_header(("X-User-Role", "student"))
            .set_json(json!({ "amount": 500000 }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);
        let context_id = body["data"]["transaction"]["id"].as_str().unwrap().to_string();

        let req = test::TestRequest::post()
            .uri("/payments/confirm")
            .insert_header(("X-User-Id", "gateway"))
            .insert_header(("X-User-Role", "admin"))
            .set_json(json!({ "contextId": context_id }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["alreadyApplied"], false);
        assert_eq!(body["data"]["balance"], 500000);

        let req = test::TestRequest::get()
            .uri("/wallets/me")
            .insert_header(("X-User-Id", "student-1"))
            .insert_header(("X-User-Role", "student"))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["wallet"]["balance"], 500000);
    }

    #[actix_rt::test]
    async fn test_errors_use_the_envelope() {
        let app = test::init_service(
            App::new().app_data(web::Data::new(state().await)).configure(api::configure_routes),
        )
        .await;

        let anonymous = test::TestRequest::post().uri("/admin/sweeps/run").to_request();
        let resp = test::call_service(&app, anonymous).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::get().uri("/classes/missing").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["store"], "memory");
        assert_eq!(body["data"]["sweepsEnabled"], false);
    }
}
