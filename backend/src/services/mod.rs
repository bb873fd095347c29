//! # Services Module
//!
//! This module contains the business logic of the scheduling and escrow
//! core. Each service owns one concern and reaches storage through the
//! [`Store`](crate::db::Store) seam.
//!
//! ## Services Overview
//!
//! | Service | Responsibility |
//! |---------|---------------|
//! | `WalletService` | Wallets, gateway top-ups, freezing |
//! | `EscrowManager` | Commission config, escrow hold / release / refund |
//! | `ScheduleService` | Conflict checks, lesson generation, availability |
//! | `ClassLifecycleService` | Requests, applications, classes, enrollments, sweeps |
//! | `RescheduleService` | Lesson move negotiation |
//! | `BalanceTracker` | Ledger reconciliation |
//! | `LifecycleMonitor` | Background sweeps, reconciliation, health |
//!
//! ## Service Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SERVICES LAYER                            │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                 ClassLifecycleService                     │   │
//! │  │  • accept_application()  • enroll()  • cancel_class()     │   │
//! │  │  • expire_requests()     • advance_classes()              │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                              │                                   │
//! │         ┌────────────────────┼────────────────────┐             │
//! │         ▼                    ▼                    ▼             │
//! │  ┌────────────┐      ┌────────────┐       ┌────────────┐       │
//! │  │  Escrow    │      │ Schedule   │       │Notification│       │
//! │  │  Manager   │      │ Service    │       │   Sink     │       │
//! │  │            │      │            │       │            │       │
//! │  │ Ledger     │      │ Expander   │       │ WebSocket  │       │
//! │  │ Commission │      │ Conflicts  │       │ registry   │       │
//! │  └────────────┘      └────────────┘       └────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod balance_tracker;
pub mod class_lifecycle;
pub mod escrow_manager;
pub mod identity;
pub mod ledger;
pub mod lifecycle_monitor;
pub mod notifications;
pub mod payment_gateway;
pub mod reschedule;
pub mod retry;
pub mod schedule_service;
pub mod wallet_service;

#[cfg(test)]
pub mod testing;

#[cfg(test)]
mod scenarios;

pub use balance_tracker::BalanceTracker;
pub use class_lifecycle::ClassLifecycleService;
pub use escrow_manager::EscrowManager;
pub use identity::Actor;
pub use ledger::Ledger;
pub use lifecycle_monitor::LifecycleMonitor;
pub use notifications::{CoreEvent, NotificationSink};
pub use payment_gateway::{LoggingGateway, PaymentGateway};
pub use reschedule::RescheduleService;
pub use retry::RetryPolicy;
pub use schedule_service::ScheduleService;
pub use wallet_service::WalletService;
