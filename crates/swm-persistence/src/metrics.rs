//! ---
//! swm_section: "03-persistence-logging"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Prometheus counters for store transitions."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{IntCounterVec, Opts, Registry};

use crate::status::Status;
use crate::Result;

/// Metrics published by the persistence subsystem.
#[derive(Clone)]
pub struct PersistenceMetrics {
    transitions: IntCounterVec,
    #[allow(dead_code)]
    registry: Arc<Registry>,
}

impl PersistenceMetrics {
    /// Register all persistence metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let transitions = IntCounterVec::new(
            Opts::new(
                "swm_store_transitions_total",
                "Status transitions committed to the update store",
            ),
            &["entity", "status"],
        )?;
        registry.register(Box::new(transitions.clone()))?;

        Ok(Self {
            transitions,
            registry,
        })
    }

    /// Record a committed transition of an update.
    pub fn record_update(&self, status: Status) {
        self.transitions
            .with_label_values(&["update", status.as_str()])
            .inc();
    }

    /// Record a committed transition of an operation.
    pub fn record_operation(&self, status: Status) {
        self.transitions
            .with_label_values(&["operation", status.as_str()])
            .inc();
    }

    /// Current count for an entity and status pair.
    pub fn transitions(&self, entity: &str, status: Status) -> u64 {
        self.transitions
            .with_label_values(&[entity, status.as_str()])
            .get()
    }
}

impl std::fmt::Debug for PersistenceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMetrics").finish_non_exhaustive()
    }
}
