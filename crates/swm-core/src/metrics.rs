//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Prometheus counters for the orchestration pipeline."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// Counters describing operation and report flow.
#[derive(Clone)]
pub struct OrchestratorMetrics {
    dispatched: IntCounterVec,
    completed: IntCounterVec,
    expired: IntCounter,
    reports: IntCounter,
}

impl OrchestratorMetrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let dispatched = IntCounterVec::new(
            Opts::new("swm_operations_dispatched_total", "Operations sent to executors"),
            &["operation"],
        )?;
        registry.register(Box::new(dispatched.clone()))?;

        let completed = IntCounterVec::new(
            Opts::new(
                "swm_operations_completed_total",
                "Operation results accepted from executors",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(completed.clone()))?;

        let expired = IntCounter::with_opts(Opts::new(
            "swm_operations_expired_total",
            "Operations failed after their deadline passed",
        ))?;
        registry.register(Box::new(expired.clone()))?;

        let reports = IntCounter::with_opts(Opts::new(
            "swm_update_reports_total",
            "Update reports distributed to the HMI and update source",
        ))?;
        registry.register(Box::new(reports.clone()))?;

        Ok(Self {
            dispatched,
            completed,
            expired,
            reports,
        })
    }

    pub fn record_dispatched(&self, operation: &str) {
        self.dispatched.with_label_values(&[operation]).inc();
    }

    pub fn record_completed(&self, operation: &str, succeeded: bool) {
        let outcome = if succeeded { "ok" } else { "failed" };
        self.completed
            .with_label_values(&[operation, outcome])
            .inc();
    }

    pub fn record_expired(&self) {
        self.expired.inc();
    }

    pub fn record_report(&self) {
        self.reports.inc();
    }

    pub fn reports(&self) -> u64 {
        self.reports.get()
    }

    pub fn dispatched(&self, operation: &str) -> u64 {
        self.dispatched.with_label_values(&[operation]).get()
    }
}

impl std::fmt::Debug for OrchestratorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorMetrics").finish_non_exhaustive()
    }
}
