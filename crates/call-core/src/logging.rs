//! Logging setup for applications embedding call-core
//!
//! The library itself only emits `tracing` events. Binaries and tests that
//! want to see them call [`setup_logging`] once at startup.

use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::{CallError, Result};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// Include file and line information
    pub file_info: bool,
    /// Log span enter/exit events
    pub log_spans: bool,
    /// Print the event target (module path)
    pub with_target: bool,
    /// Single-line compact output
    pub compact: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            file_info: false,
            log_spans: false,
            with_target: true,
            compact: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    pub fn without_target(mut self) -> Self {
        self.with_target = false;
        self
    }

    pub fn compact(mut self) -> Self {
        self.compact = true;
        self
    }
}

/// Install a global fmt subscriber honouring `RUST_LOG` on top of `config.level`.
///
/// Fails with a configuration error when a global subscriber is already set.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .with_target(config.with_target);

    let result = if config.compact {
        builder.compact().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| CallError::config(format!("Failed to install log subscriber: {}", e)))
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| CallError::config(format!("Invalid log level: {}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_builder() {
        let config = LoggingConfig::new(Level::TRACE).with_file_info().with_spans();
        assert!(config.file_info);
        assert!(config.log_spans);
        assert_eq!(config.level, Level::TRACE);
        assert!(!config.compact);
        assert!(LoggingConfig::default().compact().compact);
    }
}
