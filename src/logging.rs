//! Logging Module
//!
//! Application logging through `tracing`: a compact console layer and a daily
//! rolling file under `{log_dir}/{hostname}`. The configured level applies
//! unless `RUST_LOG` is set.

use crate::config::LoggingConfig;
use crate::{NodeError, Result};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "edge-node.log";

/// Logger manager for application logging
pub struct LoggerManager {
    config: LoggingConfig,
    hostname: String,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    /// Directory the rolling log files are written to
    pub fn host_log_dir(&self) -> PathBuf {
        self.config.log_dir.join(&self.hostname)
    }

    /// Initialize the logging system
    pub fn initialize(&self) -> Result<()> {
        let host_log_dir = self.host_log_dir();
        std::fs::create_dir_all(&host_log_dir).map_err(|e| {
            NodeError::IoError(format!("Failed to create log directory: {}", e))
        })?;

        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, host_log_dir.clone(), LOG_FILE_PREFIX);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.config.log_level))
            .unwrap_or_else(|e| {
                warn!("Invalid log level {:?}: {}", self.config.log_level, e);
                EnvFilter::new("info")
            });

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(()) => {
                info!("Application logging initialized for host: {}", self.hostname);
                info!("Application logs will be written to: {:?}", host_log_dir);
            }
            Err(_) => {
                // Already initialized, likely in tests
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }
}
