//! Tracing setup for the `bias-scan` binary.
//!
//! Uses `tracing` and `tracing-subscriber` to provide:
//! - Structured events with fields (`bias`, `current`, `step`)
//! - Pretty, compact or JSON output
//! - `RUST_LOG` filtering that takes precedence over the configured level
//!
//! # Example
//! ```no_run
//! use bias_scan::{config::ScanSettings, logging};
//!
//! let settings = ScanSettings::load_env_only()?;
//! logging::init_from_settings(&settings)?;
//! tracing::info!(bias = 10.0, "Bias set");
//! # Ok::<(), bias_scan::error::ScanError>(())
//! ```

use crate::config::ScanSettings;
use crate::error::{ScanError, ScanResult};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line output with colors (for interactive use)
    Pretty,
    /// Single-line output without colors
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl FromStr for OutputFormat {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(ScanError::config(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Minimum level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to enable ANSI colors (Pretty only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Logging config with the given level and default formatting.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Build from the `[application]` section of the scan settings.
    pub fn from_settings(settings: &ScanSettings) -> ScanResult<Self> {
        Ok(Self {
            level: parse_log_level(&settings.application.log_level)?,
            format: settings.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize logging from the scan settings.
pub fn init_from_settings(settings: &ScanSettings) -> ScanResult<()> {
    init(LoggingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a global subscriber is already set this returns `Ok(())`.
pub fn init(config: LoggingConfig) -> ScanResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| ScanError::config(format!("Failed to initialize tracing: {e}")))
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> ScanResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ScanError::config(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}
