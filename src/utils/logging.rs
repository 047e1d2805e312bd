//! Logging Module
//!
//! Structured logging setup built on `tracing`. The pipeline logs every
//! dispatch decision (experiment index, fold, fraction) so a failed run
//! can be reproduced from its log alone.

use tracing_subscriber::{fmt, EnvFilter};

/// Logging verbosity presets for the pipeline binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the preset when set. Safe to call once per
/// process; later calls are ignored.
pub fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
