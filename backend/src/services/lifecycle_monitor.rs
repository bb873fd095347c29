//! # Lifecycle Monitor Service
//!
//! The deployment's clock for the core. The sweeps themselves are plain
//! operations on [`ClassLifecycleService`]; this task only ticks them.
//!
//! ## Monitoring Flow
//!
//! ```text
//! LifecycleMonitor (background task)
//!              │
//!              ├── Every SWEEP_INTERVAL_SECS: expire requests, advance classes
//!              │
//!              ├── Every RECONCILIATION_INTERVAL_SECS: reconcile wallets
//!              │
//!              └── Every 2m: store health check
//! ```
//!
//! An interval of 0 disables that ticker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::db::Store;
use crate::errors::CoreError;

use super::balance_tracker::{BalanceTracker, ReconciliationReport};
use super::class_lifecycle::{ClassLifecycleService, SweepReport};
use super::identity::Actor;

const HEALTH_CHECK_INTERVAL_SECS: u64 = 120;

/// The Lifecycle Monitor service.
///
/// ## Usage
///
/// ```rust,ignore
/// let monitor = LifecycleMonitor::new(store, lifecycle, tracker, 60, 300);
///
/// // Start monitoring (runs forever)
/// tokio::spawn(async move {
///     monitor.start().await;
/// });
/// ```
#[derive(Clone)]
pub struct LifecycleMonitor {
    store: Arc<dyn Store>,
    lifecycle: ClassLifecycleService,
    tracker: BalanceTracker,
    sweep_interval_secs: u64,
    reconciliation_interval_secs: u64,
}

impl LifecycleMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        lifecycle: ClassLifecycleService,
        tracker: BalanceTracker,
        sweep_interval_secs: u64,
        reconciliation_interval_secs: u64,
    ) -> Self {
        Self { store, lifecycle, tracker, sweep_interval_secs, reconciliation_interval_secs }
    }

    /// Start the monitoring loop.
    ///
    /// | Check | Interval | Description |
    /// |-------|----------|-------------|
    /// | Sweeps | `SWEEP_INTERVAL_SECS` | Expire requests, advance classes |
    /// | Reconciliation | `RECONCILIATION_INTERVAL_SECS` | Ledger vs. stored balances |
    /// | Health Check | 2 minutes | Store connectivity |
    pub async fn start(&self) {
        info!(
            "Starting Lifecycle Monitor (sweeps: {}s, reconciliation: {}s)",
            self.sweep_interval_secs, self.reconciliation_interval_secs
        );

        let sweeps_enabled = self.sweep_interval_secs > 0;
        let reconciliation_enabled = self.reconciliation_interval_secs > 0;
        if !sweeps_enabled {
            warn!("Periodic sweeps are disabled; trigger them through /admin/sweeps/run");
        }

        let mut sweep_ticker = interval(Duration::from_secs(self.sweep_interval_secs.max(1)));
        let mut reconciliation_ticker = interval(Duration::from_secs(self.reconciliation_interval_secs.max(1)));
        let mut health_ticker = interval(Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = sweep_ticker.tick(), if sweeps_enabled => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        error!("Sweep failed: {}", e);
                    }
                }

                _ = reconciliation_ticker.tick(), if reconciliation_enabled => {
                    if let Err(e) = self.reconcile_once().await {
                        error!("Reconciliation failed: {}", e);
                    }
                }

                _ = health_ticker.tick() => {
                    self.perform_health_check().await;
                }
            }
        }
    }

    /// One sweep pass as the system actor.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, CoreError> {
        debug!("Running scheduled sweeps");
        self.lifecycle.run_sweeps(&Actor::system(), now).await
    }

    pub async fn reconcile_once(&self) -> Result<ReconciliationReport, CoreError> {
        let report = self.tracker.reconcile_all().await?;
        if !report.discrepancies.is_empty() {
            error!(
                "ALERT [ledger_mismatch]: {} wallets disagree with their ledger",
                report.discrepancies.len()
            );
        }
        Ok(report)
    }

    async fn perform_health_check(&self) {
        debug!("Performing health check");
        if !self.store.ping().await {
            error!("ALERT [store_unhealthy]: {} store is not responding", self.store.backend());
        }
    }

    /// Summary of system health for the API.
    pub async fn system_status(&self) -> SystemStatus {
        SystemStatus {
            healthy: self.store.ping().await,
            backend: self.store.backend(),
            sweeps_enabled: self.sweep_interval_secs > 0,
            last_check: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub healthy: bool,
    pub backend: &'static str,
    pub sweeps_enabled: bool,
    pub last_check: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    use crate::services::testing::{at, rule, TestCore};

    #[tokio::test]
    async fn test_sweep_and_reconcile_once() {
        let core = TestCore::new().await;
        core.accepted_class("s1", "t1", vec![rule(Weekday::Tue, 10, 11)], 2_000).await;

        let monitor = core.monitor(60, 300);
        let report = monitor.sweep_once(at(31, 0)).await.unwrap();
        assert_eq!(report.advance.classes_completed, 1);
        assert_eq!(report.advance.escrows_released, 1);

        let reconciliation = monitor.reconcile_once().await.unwrap();
        assert!(reconciliation.discrepancies.is_empty());
        assert_eq!(reconciliation.total_balance, 2_000);

        let status = monitor.system_status().await;
        assert!(status.healthy);
        assert_eq!(status.backend, "memory");
    }
}
