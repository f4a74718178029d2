//! Scan settings loaded with Figment.
//!
//! Settings come from a TOML file, overridden by environment variables prefixed with
//! `BIAS_SCAN_` (nested keys separated by `__`, e.g. `BIAS_SCAN_TIMING__SETTLE=5s`).
//!
//! # Example
//! ```no_run
//! use bias_scan::config::ScanSettings;
//!
//! let settings = ScanSettings::load_from("config/bias_scan.toml")?;
//! settings.validate()?;
//! println!("Settle delay: {:?}", settings.timing.settle);
//! # Ok::<(), bias_scan::error::ScanError>(())
//! ```

use crate::error::{ScanError, ScanResult};
use crate::storage::OutputKind;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "BIAS_SCAN_";

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Delays used by the scan controller
    #[serde(default)]
    pub timing: Timing,
    /// Output file defaults
    #[serde(default)]
    pub output: OutputConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Delays threaded into the scan controller.
///
/// All delays are blocking waits between instrument operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    /// Wait after a new bias voltage before taking a trustworthy reading
    #[serde(with = "humantime_serde", default = "default_settle")]
    pub settle: Duration,
    /// Wait between consecutive sub-measurements when averaging
    #[serde(with = "humantime_serde", default = "default_measurement")]
    pub measurement: Duration,
    /// Wait between voltage steps while ramping
    #[serde(with = "humantime_serde", default = "default_ramp_step")]
    pub ramp_step: Duration,
    /// Wait between measurements while lingering at the final bias
    #[serde(with = "humantime_serde", default = "default_linger_interval")]
    pub linger_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle: default_settle(),
            measurement: default_measurement(),
            ramp_step: default_ramp_step(),
            linger_interval: default_linger_interval(),
        }
    }
}

impl Timing {
    /// Timing with every delay set to zero. Used by simulations.
    pub fn immediate() -> Self {
        Self {
            settle: Duration::ZERO,
            measurement: Duration::ZERO,
            ramp_step: Duration::ZERO,
            linger_interval: Duration::ZERO,
        }
    }
}

/// Output file defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory relative output paths are resolved against
    #[serde(default = "default_output_dir")]
    pub directory: PathBuf,
    /// Output format ("csv" or "arrow")
    #[serde(default = "default_format")]
    pub format: String,
    /// Whether existing files may be replaced
    #[serde(default)]
    pub overwrite: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            format: default_format(),
            overwrite: false,
        }
    }
}

impl OutputConfig {
    /// Parsed output kind.
    pub fn kind(&self) -> ScanResult<OutputKind> {
        self.format.parse()
    }
}

/// Instrument definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument name used for selection (e.g. "Sourcemeter")
    pub name: String,
    /// Instrument type tag (e.g. "keithley2410", "hp4284a", "mock_smu")
    pub r#type: String,
    /// Whether this instrument is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Serial port path, required for serial instruments
    #[serde(default)]
    pub port: Option<String>,
    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Response timeout
    #[serde(with = "humantime_serde", default = "default_io_timeout")]
    pub timeout: Duration,
    /// Driver-specific options (terminators, simulated values)
    #[serde(default)]
    pub options: toml::Table,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_measurement() -> Duration {
    Duration::from_millis(100)
}

fn default_ramp_step() -> Duration {
    Duration::from_secs(1)
}

fn default_linger_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_format() -> String {
    "csv".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    19200
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            timing: Timing::default(),
            output: OutputConfig::default(),
            instruments: Vec::new(),
        }
    }
}

impl ScanSettings {
    /// Load settings from a specific file path, then apply environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let settings = Self::figment()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Defaults plus environment overrides, for runs without a settings file.
    pub fn load_env_only() -> ScanResult<Self> {
        let settings = Self::figment()
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(ScanSettings::default()))
    }

    /// Validate settings after loading
    pub fn validate(&self) -> ScanResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ScanError::config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ScanError::config(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        self.output.kind()?;

        let mut names = std::collections::HashSet::new();
        for instrument in &self.instruments {
            if !names.insert(&instrument.name) {
                return Err(ScanError::config(format!(
                    "Duplicate instrument name: {}",
                    instrument.name
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> impl Iterator<Item = &InstrumentDefinition> {
        self.instruments.iter().filter(|inst| inst.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_settings(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn loads_timing_and_instruments() {
        let file = write_settings(
            r#"
            [timing]
            settle = "5s"
            measurement = "200ms"

            [output]
            format = "arrow"

            [[instruments]]
            name = "Sourcemeter"
            type = "keithley2410"
            port = "/dev/ttyUSB0"
            "#,
        );

        let settings = ScanSettings::load_from(file.path()).unwrap();
        assert_eq!(settings.timing.settle, Duration::from_secs(5));
        assert_eq!(settings.timing.measurement, Duration::from_millis(200));
        assert_eq!(settings.timing.ramp_step, Duration::from_secs(1));
        assert_eq!(settings.output.kind().unwrap(), OutputKind::Binary);
        assert_eq!(settings.instruments.len(), 1);
        assert_eq!(settings.instruments[0].baud_rate, 19200);
        assert!(settings.validate().is_ok());
    }

    #[test]
    #[serial]
    fn env_overrides_file() {
        let file = write_settings("[timing]\nsettle = \"5s\"\n");
        std::env::set_var("BIAS_SCAN_TIMING__SETTLE", "250ms");
        let settings = ScanSettings::load_from(file.path());
        std::env::remove_var("BIAS_SCAN_TIMING__SETTLE");

        assert_eq!(settings.unwrap().timing.settle, Duration::from_millis(250));
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut settings = ScanSettings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_instrument_names() {
        let definition = InstrumentDefinition {
            name: "smu".to_string(),
            r#type: "mock_smu".to_string(),
            enabled: true,
            port: None,
            baud_rate: 9600,
            timeout: Duration::from_secs(1),
            options: toml::Table::new(),
        };
        let settings = ScanSettings {
            instruments: vec![definition.clone(), definition],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn defaults_match_module_delays() {
        let timing = Timing::default();
        assert_eq!(timing.settle, Duration::from_secs(1));
        assert_eq!(timing.measurement, Duration::from_millis(100));
    }
}
