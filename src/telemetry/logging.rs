//! Logging setup.
//!
//! `RUST_LOG` wins when set. Otherwise the `[logging]` section picks the
//! level for this crate (dependencies stay at `warn`) and the output format.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer};

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    /// One JSON object per event; span close events included
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("format '{}'", s)),
        }
    }
}

/// `[logging]` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace
    pub level: String,
    /// pretty, compact or json
    pub format: String,
}

impl LogConfig {
    pub fn new() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }

    /// Configured level; unknown names fall back to info
    pub fn level(&self) -> Level {
        parse_level(&self.level).unwrap_or(Level::INFO)
    }

    /// Configured format; unknown names fall back to pretty
    pub fn log_format(&self) -> LogFormat {
        self.format.parse().unwrap_or(LogFormat::Pretty)
    }

    /// Values that would fall back to a default
    pub fn unknown_fields(&self) -> Vec<String> {
        let mut unknown = Vec::new();
        if parse_level(&self.level).is_none() {
            unknown.push(format!("level '{}'", self.level));
        }
        if let Err(e) = self.format.parse::<LogFormat>() {
            unknown.push(e);
        }
        unknown
    }

    fn directives(&self) -> String {
        let level = self.level().as_str().to_ascii_lowercase();
        format!("warn,{}={}", env!("CARGO_CRATE_NAME"), level)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_level(level: &str) -> Option<Level> {
    match level.to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(config: Option<&LogConfig>) {
    let defaults = LogConfig::new();
    let config = config.unwrap_or(&defaults);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directives()));

    let layer = match config.log_format() {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init();
}
