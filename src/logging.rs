//! Tracing setup.
//!
//! Structured logging through `tracing` and `tracing-subscriber`:
//! - pretty, compact or JSON output
//! - `RUST_LOG` overrides the configured level
//! - idempotent initialization, so tests and embedding applications can call
//!   [`init`] more than once
//!
//! # Example
//! ```no_run
//! use keithley_didv::{config::Settings, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! logging::init_from_settings(&settings)?;
//! tracing::info!(mode = %settings.acquisition.mode, "Ready");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Multi-line with colors (interactive use)
    #[default]
    Pretty,
    /// Single-line without colors
    Compact,
    /// One JSON object per event
    Json,
}

/// Tracing configuration options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
    /// Emit span NEW and CLOSE events.
    pub with_span_events: bool,
    pub with_file_and_line: bool,
    pub with_thread_names: bool,
    /// ANSI colors (pretty format only).
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(&settings.application.log_level)?,
            format: settings.application.log_format,
            ..Default::default()
        })
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from loaded settings.
pub fn init_from_settings(settings: &Settings) -> AppResult<()> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install the global subscriber. Returns `Ok(())` if one is already set.
pub fn init(config: TracingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let result = match config.format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(base.pretty().with_ansi(config.with_ansi).with_filter(env_filter))
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(base.compact().with_ansi(false).with_filter(env_filter))
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(base.json().with_filter(env_filter))
            .try_init(),
    };
    result.or_else(already_initialized)
}

fn already_initialized(e: TryInitError) -> AppResult<()> {
    // Expected in tests and when an embedding application installed its own.
    if e.to_string().contains("already been set") || e.to_string().contains("already initialized") {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "Failed to initialize tracing: {e}"
        )))
    }
}

/// Parse a log level name (case-insensitive).
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(DaqError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(matches!(
            parse_log_level("verbose"),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_tracing_config_from_settings() {
        let mut settings = Settings::default();
        settings.application.log_level = "debug".to_string();
        settings.application.log_format = OutputFormat::Json;

        let config = TracingConfig::from_settings(&settings).unwrap();
        assert!(matches!(config.level, Level::DEBUG));
        assert_eq!(config.format, OutputFormat::Json);
    }

    #[test]
    fn test_tracing_config_builder() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Compact)
            .with_span_events(true)
            .with_ansi(false);

        assert!(matches!(config.level, Level::WARN));
        assert_eq!(config.format, OutputFormat::Compact);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }

    #[test]
    fn init_is_idempotent() {
        let config = TracingConfig::new(Level::ERROR).with_format(OutputFormat::Compact);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
