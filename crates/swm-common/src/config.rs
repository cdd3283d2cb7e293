//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Shared primitives and utilities for the core runtime."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::{LogFormat, LogRotation};

/// Placeholder substituted with the update image path in mount templates.
pub const IMAGE_PATH_PLACEHOLDER: &str = "{image_path}";
/// Placeholder substituted with the mount point in mount/unmount templates.
pub const MOUNT_POINT_PLACEHOLDER: &str = "{mount_point}";

fn default_database_path() -> PathBuf {
    PathBuf::from("/tmp/swlm.sqlite")
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/tmp/swlm")
}

fn default_manifest_file() -> String {
    "update_manifest.json".to_owned()
}

fn default_mount_command() -> Vec<String> {
    vec![
        "/usr/local/bin/squashfuse".to_owned(),
        IMAGE_PATH_PLACEHOLDER.to_owned(),
        MOUNT_POINT_PLACEHOLDER.to_owned(),
    ]
}

fn default_unmount_command() -> Vec<String> {
    vec![
        "/bin/fusermount".to_owned(),
        "-u".to_owned(),
        MOUNT_POINT_PLACEHOLDER.to_owned(),
    ]
}

fn default_bus_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7400))
}

fn default_operation_timeout() -> Option<Duration> {
    Some(Duration::from_secs(600))
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_file() -> bool {
    true
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for the software loading manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "SWM_CONFIG";

    /// Load configuration from disk, respecting the `SWM_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub reset_on_start: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            reset_on_start: false,
        }
    }
}

/// Where update images are mounted and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,
    #[serde(default = "default_mount_command")]
    pub mount_command: Vec<String>,
    #[serde(default = "default_unmount_command")]
    pub unmount_command: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mount_root: default_mount_root(),
            manifest_file: default_manifest_file(),
            mount_command: default_mount_command(),
            unmount_command: default_unmount_command(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mount_root.as_os_str().is_empty() {
            return Err(anyhow!("storage.mount_root must not be empty"));
        }
        if self.manifest_file.trim().is_empty() {
            return Err(anyhow!("storage.manifest_file must not be empty"));
        }
        require_placeholders("mount_command", &self.mount_command, true)?;
        require_placeholders("unmount_command", &self.unmount_command, false)?;
        Ok(())
    }
}

fn require_placeholders(name: &str, argv: &[String], needs_image: bool) -> Result<()> {
    if argv.is_empty() {
        return Err(anyhow!("storage.{} must name a program", name));
    }
    if needs_image && !argv.iter().any(|arg| arg.contains(IMAGE_PATH_PLACEHOLDER)) {
        return Err(anyhow!(
            "storage.{} must reference {}",
            name,
            IMAGE_PATH_PLACEHOLDER
        ));
    }
    if !argv.iter().any(|arg| arg.contains(MOUNT_POINT_PLACEHOLDER)) {
        return Err(anyhow!(
            "storage.{} must reference {}",
            name,
            MOUNT_POINT_PLACEHOLDER
        ));
    }
    Ok(())
}

/// Bus listener and the addresses of collaborating services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub endpoints: IndexMap<String, SocketAddr>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen: default_bus_listen(),
            endpoints: IndexMap::new(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsConfig {
    /// Deadline after which an unanswered operation is failed. `None` waits forever.
    #[serde(default = "default_operation_timeout")]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
    #[serde(default = "default_tick_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tick_interval: Duration,
    #[serde(default)]
    pub blacklisted_packages: Vec<String>,
    #[serde(default)]
    pub blacklisted_partitions: Vec<String>,
    #[serde(default)]
    pub blacklisted_firmware: Vec<String>,
    #[serde(default)]
    pub allow_downgrade: bool,
}

impl OperationsConfig {
    /// Effective per-operation deadline. A zero timeout disables the deadline.
    pub fn deadline(&self) -> Option<Duration> {
        self.timeout.filter(|timeout| !timeout.is_zero())
    }
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            timeout: default_operation_timeout(),
            tick_interval: default_tick_interval(),
            blacklisted_packages: Vec::new(),
            blacklisted_partitions: Vec::new(),
            blacklisted_firmware: Vec::new(),
            allow_downgrade: false,
        }
    }
}

/// Static inventory reported through `getInstalledPackages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryConfig {
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub module_firmware: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Filter used when neither `SWM_LOG` nor `RUST_LOG` is set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write JSON lines to a rolling file under `directory`.
    #[serde(default = "default_log_file")]
    pub file: bool,
    #[serde(default)]
    pub rotation: LogRotation,
    /// File name stem; the service name when unset.
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            level: default_log_level(),
            file: default_log_file(),
            rotation: LogRotation::default(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}
