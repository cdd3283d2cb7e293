//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Tracing setup for the loading manager daemon and tools."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Filter directive consulted before `RUST_LOG` and the configured level.
pub const LOG_ENV: &str = "SWM_LOG";

static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Stdout rendering of log events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// How often the log file rolls over. `Never` disables rotation, not the file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(value: LogRotation) -> Self {
        match value {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Pick the filter directive: `SWM_LOG`, then `RUST_LOG`, then `level`.
pub fn resolve_directive(env: impl Fn(&str) -> Option<String>, level: &str) -> String {
    [LOG_ENV, "RUST_LOG"]
        .into_iter()
        .filter_map(|key| env(key))
        .find(|directive| !directive.trim().is_empty())
        .unwrap_or_else(|| level.to_owned())
}

/// File name stem for `service`; the appender adds the rotation suffix.
pub fn log_file_name(service: &str, config: &LoggingConfig) -> String {
    let prefix = config.file_prefix.as_deref().unwrap_or(service);
    format!("{prefix}.log")
}

fn build_filter(directive: &str, level: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|err| {
        eprintln!("invalid log directive `{directive}` ({err}); using `{level}`");
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Install the global subscriber for `service`.
///
/// Stdout follows [`LoggingConfig::format`]. When [`LoggingConfig::file`] is
/// set, JSON lines also go to a rolling file under
/// [`LoggingConfig::directory`]. A second call keeps the first subscriber.
pub fn init_tracing(service: &str, config: &LoggingConfig) -> Result<()> {
    let directive = resolve_directive(|key| std::env::var(key).ok(), &config.level);
    let filter = build_filter(&directive, &config.level);

    let mut guards = Vec::with_capacity(2);
    let (stdout_writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(guard);
    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = if config.file {
        std::fs::create_dir_all(&config.directory).with_context(|| {
            format!("unable to create log directory {}", config.directory.display())
        })?;
        let appender = RollingFileAppender::new(
            config.rotation.into(),
            &config.directory,
            log_file_name(service, config),
        );
        let (file_writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        Some(
            fmt::layer()
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .with_writer(file_writer)
                .boxed(),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if !installed {
        return Ok(());
    }
    let _ = GUARDS.set(guards);

    let log_file = config
        .file
        .then(|| config.directory.join(log_file_name(service, config)));
    info!(
        service,
        directive = %directive,
        format = ?config.format,
        log_file = ?log_file,
        "tracing initialised"
    );
    Ok(())
}
