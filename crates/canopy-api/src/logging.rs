//! Logging configuration for Canopy.
//!
//! The engine emits structured events through the `tracing` framework;
//! this module wires up a subscriber for applications that do not bring
//! their own. The `RUST_LOG` environment variable overrides the configured
//! level when set.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output destination.
#[derive(Debug, Clone)]
pub enum LogOutput {
    /// Write events to stdout.
    Stdout,
    /// Write events to a daily-rolled file at the given path.
    File(PathBuf),
}

/// Logging configuration.
#[derive(Debug, Clone)]
#[must_use]
pub struct LogConfig {
    /// Minimum level filter, e.g. `"info"` or `"canopy_tree=debug"`.
    pub level: String,
    /// Output destination.
    pub output: LogOutput,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stdout,
        }
    }
}

impl LogConfig {
    /// Config with info-level stdout output.
    pub fn info() -> Self {
        Self::default()
    }

    /// Config with debug-level stdout output.
    pub fn debug() -> Self {
        Self {
            level: "debug".to_string(),
            ..Default::default()
        }
    }

    /// Sets the level filter.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Sends output to a daily-rolled file instead of stdout.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = LogOutput::File(path.into());
        self
    }

    /// Installs this configuration as the global subscriber.
    ///
    /// Returns a guard that must stay alive while logging to a file; when
    /// it drops, the background writer shuts down.
    pub fn init(self) -> Option<WorkerGuard> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        match self.output {
            LogOutput::Stdout => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().compact())
                    .init();
                None
            }
            LogOutput::File(path) => {
                let directory = path.parent().unwrap_or_else(|| Path::new("."));
                let file_name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("canopy.log");
                let appender = tracing_appender::rolling::daily(directory, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(writer).with_ansi(false))
                    .init();
                Some(guard)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_info_to_stdout() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(matches!(config.output, LogOutput::Stdout));
    }

    #[test]
    fn builders_compose() {
        let config = LogConfig::debug().with_file("/tmp/canopy.log");
        assert_eq!(config.level, "debug");
        assert!(matches!(config.output, LogOutput::File(_)));

        let config = LogConfig::info().with_level("canopy_tree=trace");
        assert_eq!(config.level, "canopy_tree=trace");
    }
}
