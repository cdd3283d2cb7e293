//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Shared primitives and utilities for the core runtime."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
//! Shared primitives for the software loading manager workspace.
//! This crate exposes configuration loading and tracing setup consumed by
//! the daemon, the control CLI, and the orchestration core.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, BusConfig, DatabaseConfig, InventoryConfig, LoggingConfig, MetricsConfig,
    OperationsConfig, StorageConfig,
};
pub use logging::{init_tracing, LogFormat, LogRotation};
