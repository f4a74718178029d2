//! Instrument Registry
//!
//! Turns the `[[instruments]]` section of the settings into drivers. Selection by name
//! happens before any device I/O, so an ambiguous configuration fails as a configuration
//! error without touching hardware.
//!
//! # Supported `type` tags
//!
//! | Tag | Role | Driver |
//! |-----|------|--------|
//! | `keithley2410`, `keithley6517a`, `scpi_smu` | source meter | `ScpiSourceMeter` over serial (option: `terminator`) |
//! | `hp4284a` | LCR meter | `ScpiLcrMeter` over serial (option: `terminator`) |
//! | `mock_smu` | source meter | `MockSourceMeter` (options: `leakage`, `trip_voltage`, `trip_current`) |
//! | `mock_lcr` | LCR meter | `MockLcrMeter` (options: `cp`, `rp`) |
//!
//! The SCPI source meter model is always resolved from `*IDN?`; the tag only selects the
//! transport and role.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let registry = InstrumentRegistry::from_settings(&settings)?;
//! let smu = registry.open_source_meter(Some("Sourcemeter")).await?;
//! let lcr = registry.open_lcr_meter(None).await?;
//! ```

use crate::config::{InstrumentDefinition, ScanSettings};
use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::{LcrMeter, SourceMeter};
use crate::hardware::mock::{MockLcrMeter, MockSourceMeter};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// What an instrument is used for in a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentRole {
    /// Bias voltage source with current readback
    SourceMeter,
    /// Impedance meter for CV scans
    LcrMeter,
}

impl fmt::Display for InstrumentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentRole::SourceMeter => write!(f, "source meter"),
            InstrumentRole::LcrMeter => write!(f, "LCR meter"),
        }
    }
}

/// Serial connection parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SerialLink {
    /// Serial port path (e.g., "/dev/ttyUSB0")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Response timeout
    pub timeout: Duration,
    /// Command terminator, `"\r\n"` when unset
    pub terminator: Option<String>,
}

/// Driver configuration for instantiating hardware
#[derive(Debug, Clone, PartialEq)]
pub enum DriverType {
    /// SCPI source meter; the model is resolved from its identity string
    ScpiSourceMeter(SerialLink),
    /// HP 4284A LCR meter
    Hp4284a(SerialLink),
    /// Simulated source meter
    MockSourceMeter {
        /// Leakage current per volt
        leakage: f64,
        /// Bias at which the simulated current jumps to `trip_current`
        trip: Option<(f64, f64)>,
    },
    /// Simulated LCR meter
    MockLcrMeter {
        /// Parallel capacitance in farads
        cp: f64,
        /// Parallel resistance in ohms
        rp: f64,
    },
}

impl DriverType {
    /// Build the driver configuration from an `[[instruments]]` entry.
    pub fn from_definition(definition: &InstrumentDefinition) -> ScanResult<Self> {
        let option = |key: &str| -> ScanResult<Option<f64>> {
            match definition.options.get(key) {
                None => Ok(None),
                Some(toml::Value::Float(v)) => Ok(Some(*v)),
                Some(toml::Value::Integer(v)) => Ok(Some(*v as f64)),
                Some(other) => Err(ScanError::config(format!(
                    "Instrument '{}': option '{}' must be a number, got {}",
                    definition.name, key, other
                ))),
            }
        };

        let serial_link = || -> ScanResult<SerialLink> {
            let port = definition.port.clone().ok_or_else(|| {
                ScanError::config(format!(
                    "Instrument '{}' of type '{}' requires a 'port'",
                    definition.name, definition.r#type
                ))
            })?;
            let terminator = match definition.options.get("terminator") {
                None => None,
                Some(toml::Value::String(t)) => Some(t.clone()),
                Some(other) => {
                    return Err(ScanError::config(format!(
                        "Instrument '{}': option 'terminator' must be a string, got {}",
                        definition.name, other
                    )))
                }
            };
            Ok(SerialLink {
                port,
                baud_rate: definition.baud_rate,
                timeout: definition.timeout,
                terminator,
            })
        };

        match definition.r#type.to_lowercase().as_str() {
            "keithley2410" | "keithley6517a" | "scpi_smu" => {
                Ok(DriverType::ScpiSourceMeter(serial_link()?))
            }
            "hp4284a" => Ok(DriverType::Hp4284a(serial_link()?)),
            "mock_smu" => {
                let trip = match (option("trip_voltage")?, option("trip_current")?) {
                    (Some(v), Some(a)) => Some((v, a)),
                    (None, None) => None,
                    _ => {
                        return Err(ScanError::config(format!(
                            "Instrument '{}': trip_voltage and trip_current go together",
                            definition.name
                        )))
                    }
                };
                Ok(DriverType::MockSourceMeter {
                    leakage: option("leakage")?.unwrap_or(1e-9),
                    trip,
                })
            }
            "mock_lcr" => Ok(DriverType::MockLcrMeter {
                cp: option("cp")?.unwrap_or(50e-12),
                rp: option("rp")?.unwrap_or(1e9),
            }),
            other => Err(ScanError::config(format!(
                "Instrument '{}' has unknown type '{}'",
                definition.name, other
            ))),
        }
    }

    /// Role this driver plays in a scan
    pub fn role(&self) -> InstrumentRole {
        match self {
            DriverType::ScpiSourceMeter(_) | DriverType::MockSourceMeter { .. } => {
                InstrumentRole::SourceMeter
            }
            DriverType::Hp4284a(_) | DriverType::MockLcrMeter { .. } => InstrumentRole::LcrMeter,
        }
    }

    /// Get human-readable driver type name
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverType::ScpiSourceMeter(_) => "scpi_smu",
            DriverType::Hp4284a(_) => "hp4284a",
            DriverType::MockSourceMeter { .. } => "mock_smu",
            DriverType::MockLcrMeter { .. } => "mock_lcr",
        }
    }
}

/// Information about a configured instrument
#[derive(Debug, Clone)]
pub struct InstrumentInfo {
    /// Configured name
    pub name: String,
    /// Role in a scan
    pub role: InstrumentRole,
    /// Driver type name
    pub driver_type: &'static str,
}

/// Configured instruments, keyed by name
pub struct InstrumentRegistry {
    entries: Vec<(String, DriverType)>,
}

impl InstrumentRegistry {
    /// Build from the enabled instruments in the settings.
    pub fn from_settings(settings: &ScanSettings) -> ScanResult<Self> {
        let entries = settings
            .enabled_instruments()
            .map(|def| Ok((def.name.clone(), DriverType::from_definition(def)?)))
            .collect::<ScanResult<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// List configured instruments
    pub fn list(&self) -> Vec<InstrumentInfo> {
        self.entries
            .iter()
            .map(|(name, driver)| InstrumentInfo {
                name: name.clone(),
                role: driver.role(),
                driver_type: driver.driver_name(),
            })
            .collect()
    }

    /// Pick the instrument for `role`.
    ///
    /// With a name, that instrument must exist and have the role. Without one, exactly
    /// one instrument of the role must be configured.
    pub fn select(&self, role: InstrumentRole, name: Option<&str>) -> ScanResult<(&str, &DriverType)> {
        let ambiguous = |reason: String| ScanError::AmbiguousDevice {
            role: role.to_string(),
            reason,
        };

        if let Some(name) = name {
            let (found, driver) = self
                .entries
                .iter()
                .find(|(n, _)| n == name)
                .ok_or_else(|| ambiguous(format!("no enabled instrument named '{}'", name)))?;
            if driver.role() != role {
                return Err(ambiguous(format!("'{}' is a {}", name, driver.role())));
            }
            return Ok((found.as_str(), driver));
        }

        let mut candidates = self.entries.iter().filter(|(_, d)| d.role() == role);
        match (candidates.next(), candidates.next()) {
            (Some((name, driver)), None) => Ok((name.as_str(), driver)),
            (None, _) => Err(ambiguous("none is configured".to_string())),
            (Some(_), Some(_)) => Err(ambiguous(
                "more than one is configured; select one by name".to_string(),
            )),
        }
    }

    /// Instantiate the source meter selected by `name`.
    pub async fn open_source_meter(&self, name: Option<&str>) -> ScanResult<Arc<dyn SourceMeter>> {
        let (name, driver) = self.select(InstrumentRole::SourceMeter, name)?;
        info!(instrument = name, driver = driver.driver_name(), "Opening source meter");

        match driver {
            DriverType::MockSourceMeter { leakage, trip } => {
                let leakage = *leakage;
                let mut smu = MockSourceMeter::new().with_current_model(move |v| v * leakage);
                if let Some((volts, amps)) = trip {
                    smu = smu.with_current_at(*volts, *amps);
                }
                Ok(Arc::new(smu))
            }
            DriverType::ScpiSourceMeter(link) => open_scpi_source_meter(link).await,
            DriverType::Hp4284a(_) | DriverType::MockLcrMeter { .. } => {
                Err(ScanError::config(format!("'{}' is not a source meter", name)))
            }
        }
    }

    /// Instantiate the LCR meter selected by `name`.
    pub async fn open_lcr_meter(&self, name: Option<&str>) -> ScanResult<Arc<dyn LcrMeter>> {
        let (name, driver) = self.select(InstrumentRole::LcrMeter, name)?;
        info!(instrument = name, driver = driver.driver_name(), "Opening LCR meter");

        match driver {
            DriverType::MockLcrMeter { cp, rp } => {
                Ok(Arc::new(MockLcrMeter::new().with_reading(*cp, *rp)))
            }
            DriverType::Hp4284a(link) => open_scpi_lcr_meter(link),
            DriverType::ScpiSourceMeter(_) | DriverType::MockSourceMeter { .. } => {
                Err(ScanError::config(format!("'{}' is not an LCR meter", name)))
            }
        }
    }
}

#[cfg(feature = "instrument_serial")]
fn serial_transport(link: &SerialLink) -> ScanResult<crate::hardware::serial::SerialScpiTransport> {
    let transport = crate::hardware::serial::SerialScpiTransport::open(
        &link.port,
        link.baud_rate,
        link.timeout,
    )?;
    Ok(match &link.terminator {
        Some(terminator) => transport.with_terminator(terminator.clone()),
        None => transport,
    })
}

#[cfg(feature = "instrument_serial")]
async fn open_scpi_source_meter(link: &SerialLink) -> ScanResult<Arc<dyn SourceMeter>> {
    use crate::hardware::scpi::ScpiSourceMeter;

    let smu = ScpiSourceMeter::connect(Arc::new(serial_transport(link)?)).await?;
    Ok(Arc::new(smu))
}

#[cfg(not(feature = "instrument_serial"))]
async fn open_scpi_source_meter(_link: &SerialLink) -> ScanResult<Arc<dyn SourceMeter>> {
    Err(ScanError::FeatureNotEnabled("instrument_serial".to_string()))
}

#[cfg(feature = "instrument_serial")]
fn open_scpi_lcr_meter(link: &SerialLink) -> ScanResult<Arc<dyn LcrMeter>> {
    use crate::hardware::scpi::ScpiLcrMeter;

    Ok(Arc::new(ScpiLcrMeter::new(Arc::new(serial_transport(link)?))))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_scpi_lcr_meter(_link: &SerialLink) -> ScanResult<Arc<dyn LcrMeter>> {
    Err(ScanError::FeatureNotEnabled("instrument_serial".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn definition(name: &str, kind: &str) -> InstrumentDefinition {
        InstrumentDefinition {
            name: name.to_string(),
            r#type: kind.to_string(),
            enabled: true,
            port: None,
            baud_rate: 19200,
            timeout: Duration::from_secs(1),
            options: toml::Table::new(),
        }
    }

    fn registry(definitions: Vec<InstrumentDefinition>) -> InstrumentRegistry {
        let settings = ScanSettings {
            instruments: definitions,
            ..Default::default()
        };
        InstrumentRegistry::from_settings(&settings).unwrap()
    }

    #[test]
    fn selects_sole_source_meter_implicitly() {
        let registry = registry(vec![definition("smu", "mock_smu"), definition("lcr", "mock_lcr")]);
        let (name, _) = registry.select(InstrumentRole::SourceMeter, None).unwrap();
        assert_eq!(name, "smu");
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn two_source_meters_need_a_name() {
        let registry = registry(vec![definition("a", "mock_smu"), definition("b", "mock_smu")]);
        let err = registry.select(InstrumentRole::SourceMeter, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(matches!(err, ScanError::AmbiguousDevice { .. }));

        let (name, _) = registry.select(InstrumentRole::SourceMeter, Some("b")).unwrap();
        assert_eq!(name, "b");
    }

    #[test]
    fn name_with_wrong_role_is_rejected() {
        let registry = registry(vec![definition("lcr", "mock_lcr")]);
        assert!(registry.select(InstrumentRole::SourceMeter, Some("lcr")).is_err());
        assert!(registry.select(InstrumentRole::SourceMeter, Some("nope")).is_err());
    }

    #[test]
    fn disabled_instruments_are_ignored() {
        let mut disabled = definition("b", "mock_smu");
        disabled.enabled = false;
        let registry = registry(vec![definition("a", "mock_smu"), disabled]);
        assert!(registry.select(InstrumentRole::SourceMeter, None).is_ok());
    }

    #[test]
    fn serial_types_require_a_port() {
        let err = DriverType::from_definition(&definition("smu", "keithley2410")).unwrap_err();
        assert!(err.to_string().contains("port"));

        let mut with_port = definition("smu", "keithley2410");
        with_port.port = Some("/dev/ttyUSB0".to_string());
        assert_eq!(
            DriverType::from_definition(&with_port).unwrap().role(),
            InstrumentRole::SourceMeter
        );
    }

    #[test]
    fn serial_terminator_option() {
        let mut def = definition("lcr", "hp4284a");
        def.port = Some("/dev/ttyUSB1".to_string());
        def.options
            .insert("terminator".into(), toml::Value::String("\n".into()));
        match DriverType::from_definition(&def).unwrap() {
            DriverType::Hp4284a(link) => assert_eq!(link.terminator.as_deref(), Some("\n")),
            other => panic!("unexpected driver: {other:?}"),
        }

        def.options.insert("terminator".into(), toml::Value::Integer(10));
        assert!(DriverType::from_definition(&def).is_err());
    }

    #[test]
    fn unknown_type_is_a_configuration_error() {
        let err = DriverType::from_definition(&definition("x", "oscilloscope")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn opens_mock_with_trip_point() {
        let mut def = definition("smu", "mock_smu");
        def.options.insert("trip_voltage".into(), toml::Value::Float(3.0));
        def.options.insert("trip_current".into(), toml::Value::Float(2e-6));
        let registry = registry(vec![def]);

        let smu = registry.open_source_meter(None).await.unwrap();
        smu.set_voltage(3.0).await.unwrap();
        assert_eq!(smu.get_current().await.unwrap(), 2e-6);
    }
}
