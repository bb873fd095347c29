//! # Tutoring Scheduling & Escrow Service
//!
//! This is the main entry point for the backend service. It provides:
//!
//! - REST API for students, tutors and admins
//! - WebSocket connections streaming core events
//! - Background sweeps (request expiry, class advancement) and ledger
//!   reconciliation
//!
//! ## Quick Start
//!
//! 1. Copy `.env.example` to `.env` and configure
//! 2. Point `DATABASE_URL` at PostgreSQL, or set it to `memory://`
//! 3. Start the server: `cargo run`
//!
//! The schema is applied on startup.

use std::io;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tutoring_backend::config::AppConfig;
use tutoring_backend::db::{Database, MemoryStore, PgStore, Store};
use tutoring_backend::{api, websocket, AppState};

const MEMORY_URL: &str = "memory://";

fn startup_error(what: &str, e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", what, e))
}

/// Main entry point for the backend service.
///
/// This function:
/// 1. Loads configuration from environment
/// 2. Initializes logging
/// 3. Opens the store and applies the schema
/// 4. Starts the lifecycle monitor
/// 5. Launches the HTTP server
#[actix_web::main]
async fn main() -> io::Result<()> {
    // =========================================
    // STEP 1: Load Configuration
    // =========================================
    dotenvy::dotenv().ok(); // It's okay if .env doesn't exist

    let config = AppConfig::from_env().map_err(|e| startup_error("Failed to load configuration", e))?;

    // =========================================
    // STEP 2: Initialize Logging
    // =========================================
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| startup_error("Failed to set tracing subscriber", e))?;

    info!("🚀 Starting Tutoring Scheduling & Escrow Service");
    info!("📋 Configuration loaded");
    info!(
        "   Horizon: {} occurrences / {} days, request TTL: {}h",
        config.schedule_occurrences_per_rule, config.schedule_horizon_days, config.class_request_ttl_hours
    );

    // =========================================
    // STEP 3: Initialize Store
    // =========================================
    let store: Arc<dyn Store> = if config.database_url == MEMORY_URL {
        info!("🗄️  Using in-memory store (state is lost on exit)");
        Arc::new(MemoryStore::new())
    } else {
        let db = Database::connect(&config.database_url)
            .await
            .map_err(|e| startup_error("Failed to connect to database", e))?;
        info!("🗄️  Database connected");

        db.run_migrations()
            .await
            .map_err(|e| startup_error("Failed to run migrations", e))?;
        info!("📦 Database migrations complete");

        Arc::new(PgStore::new(db))
    };

    // =========================================
    // STEP 4: Initialize Services
    // =========================================
    let app_state = Arc::new(
        AppState::build(config.clone(), store)
            .await
            .map_err(|e| startup_error("Failed to initialize services", e))?,
    );

    info!("🔧 Services initialized");

    // =========================================
    // STEP 5: Start Background Services
    // =========================================
    let monitor = app_state.monitor.clone();
    tokio::spawn(async move {
        monitor.start().await;
    });

    info!("👁️  Lifecycle monitor started");

    // =========================================
    // STEP 6: Start HTTP Server
    // =========================================
    let server_host = config.server_host.clone();
    let server_port = config.server_port;

    info!("🌐 Starting HTTP server on {}:{}", server_host, server_port);

    HttpServer::new(move || {
        App::new()
            // Attach shared application state
            .app_data(web::Data::new(app_state.clone()))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .configure(api::configure_routes)
            .configure(websocket::configure_routes)
    })
    .bind((server_host, server_port))?
    .run()
    .await
}
