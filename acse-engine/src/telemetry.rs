//! Logging setup and conventions
//!
//! # Log Levels
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Collaborator failures inside sweeps, invariant violations |
//! | WARN  | Rejected-but-expected conditions: stale price, disagreement, deactivation |
//! | INFO  | State transitions |
//! | DEBUG | Attestor selection and ranking |
//!
//! # Structured Fields
//!
//! Use `request_id`, `attestor_id`, `settlement_id`, `asset_id`, `category`,
//! `status`, `error` and `count` so log queries work across components:
//!
//! ```ignore
//! info!(request_id = %id, status = %status, "Verification finalized");
//! ```

use acse_core::{AcseError, AcseResult};
use serde::{Deserialize, Serialize};
use std::env;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty-printed for development
    #[default]
    Pretty,
    /// JSON for production
    Json,
}

/// Tracing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Full filter directive, overrides `level` (e.g. "acse_engine=debug")
    pub filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Read `ACSE_LOG_LEVEL`, `ACSE_LOG_FORMAT` and `ACSE_LOG_FILTER`
    pub fn from_env() -> Self {
        Self {
            level: env::var("ACSE_LOG_LEVEL")
                .ok()
                .and_then(|s| LogLevel::parse(&s))
                .unwrap_or_default(),
            format: match env::var("ACSE_LOG_FORMAT").map(|s| s.to_lowercase()).as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            filter: env::var("ACSE_LOG_FILTER").ok(),
        }
    }

    fn directive(&self) -> String {
        match &self.filter {
            Some(f) => f.clone(),
            None => format!(
                "acse_engine={level},acse_store={level},acse_core={level}",
                level = self.level
            ),
        }
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing(config: &TelemetryConfig) -> AcseResult<()> {
    let filter = EnvFilter::try_new(config.directive()).map_err(|e| AcseError::InvalidPolicy {
        reason: format!("log filter: {}", e),
    })?;

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .try_init(),
    };
    // already initialised elsewhere
    let _ = result;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("nope"), None);
    }

    #[test]
    fn test_directive() {
        let config = TelemetryConfig {
            level: LogLevel::Debug,
            ..TelemetryConfig::default()
        };
        assert!(config.directive().contains("acse_engine=debug"));

        let custom = TelemetryConfig {
            filter: Some("acse_engine=trace".to_string()),
            ..TelemetryConfig::default()
        };
        assert_eq!(custom.directive(), "acse_engine=trace");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = TelemetryConfig::default();
        assert!(init_tracing(&config).is_ok());
        assert!(init_tracing(&config).is_ok());
    }
}
