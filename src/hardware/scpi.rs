//! SCPI source meters and LCR meters.
//!
//! Drivers in this module speak SCPI over an abstract [`ScpiTransport`]. The source meter
//! model is resolved once from the `*IDN?` identity string into an [`SmuModel`] tag; the tag
//! selects the command dialect, the declared capabilities and the reading adapter that
//! turns a raw response into a number.
//!
//! | Model | Current reading | Voltage reading |
//! |-------|-----------------|-----------------|
//! | Keithley 2410 | field 1 of `V,I,R,T,S` | field 0 |
//! | Keithley 6517A | field 0, 4-char unit suffix stripped | field 0 |
//! | Generic | field 0 | field 0 |

use crate::hardware::capabilities::{
    AcLevel, Capability, CapabilitySet, ImpedanceFunction, LcrMeter, SourceMeter, TriggerMode,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Trait for SCPI communication transports.
///
/// Abstracts the underlying communication mechanism (serial, VISA, TCP)
/// so drivers stay protocol-agnostic.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send a query command and return the trimmed response.
    async fn query(&self, command: &str) -> Result<String>;

    /// Send a command without expecting a response.
    async fn command(&self, command: &str) -> Result<()>;

    /// Discard any bytes waiting in the input buffer.
    async fn clear_input(&self) -> Result<()> {
        Ok(())
    }

    /// Close the session.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Parse a floating-point response from a SCPI query.
pub fn parse_f64_response(response: &str) -> Result<f64> {
    response
        .trim()
        .parse::<f64>()
        .with_context(|| format!("Failed to parse SCPI response as f64: '{}'", response))
}

fn field(response: &str, index: usize) -> Result<&str> {
    response
        .split(',')
        .nth(index)
        .ok_or_else(|| anyhow!("SCPI response '{}' has no field {}", response, index))
}

/// Source meter variant, resolved once from the identity string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmuModel {
    /// Keithley 2400-series SourceMeter
    Keithley2410,
    /// Keithley 6517A electrometer with voltage source
    Keithley6517A,
    /// Any other SCPI source meter returning plain numbers
    Generic,
}

impl SmuModel {
    /// Resolve the model from an `*IDN?` response.
    ///
    /// The vendor is the first word of field 0 and the model the last word of field 1,
    /// both compared case-insensitively.
    pub fn from_identity(identity: &str) -> Self {
        let fields: Vec<&str> = identity.split(',').collect();
        if fields.len() < 2 {
            return SmuModel::Generic;
        }

        let vendor = fields[0].split_whitespace().next().unwrap_or("").to_uppercase();
        let model = fields[1]
            .split_whitespace()
            .last()
            .unwrap_or("")
            .to_uppercase();

        match (vendor.as_str(), model.as_str()) {
            ("KEITHLEY", "2410") => SmuModel::Keithley2410,
            ("KEITHLEY", "6517A") => SmuModel::Keithley6517A,
            _ => SmuModel::Generic,
        }
    }

    /// Operations this model supports.
    pub fn capabilities(self) -> CapabilitySet {
        match self {
            SmuModel::Keithley2410 => CapabilitySet::all(),
            SmuModel::Keithley6517A => CapabilitySet::all()
                .without(Capability::CurrentLimit)
                .without(Capability::VoltageSourceMode),
            SmuModel::Generic => CapabilitySet::basic()
                .with(Capability::PowerSwitch)
                .with(Capability::ClearInput),
        }
    }

    /// Convert a current query response into amperes.
    pub fn parse_current(self, response: &str) -> Result<f64> {
        match self {
            SmuModel::Keithley2410 => parse_f64_response(field(response, 1)?),
            SmuModel::Keithley6517A => {
                let value = field(response, 0)?.trim();
                let cut = value
                    .char_indices()
                    .rev()
                    .nth(3)
                    .map(|(i, _)| i)
                    .ok_or_else(|| anyhow!("6517A reading '{}' is too short", value))?;
                parse_f64_response(&value[..cut])
            }
            SmuModel::Generic => parse_f64_response(field(response, 0)?),
        }
    }

    /// Convert a voltage query response into volts.
    pub fn parse_voltage(self, response: &str) -> Result<f64> {
        parse_f64_response(field(response, 0)?)
    }

    fn voltage_query(self) -> &'static str {
        match self {
            SmuModel::Keithley2410 => ":MEAS:VOLT?",
            SmuModel::Keithley6517A | SmuModel::Generic => ":SOUR:VOLT?",
        }
    }

    fn current_query(self) -> &'static str {
        match self {
            SmuModel::Keithley2410 | SmuModel::Generic => ":MEAS:CURR?",
            SmuModel::Keithley6517A => ":READ?",
        }
    }
}

impl fmt::Display for SmuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmuModel::Keithley2410 => write!(f, "KEITHLEY_2410"),
            SmuModel::Keithley6517A => write!(f, "KEITHLEY_6517A"),
            SmuModel::Generic => write!(f, "generic"),
        }
    }
}

/// Source meter driven over SCPI.
pub struct ScpiSourceMeter {
    transport: Arc<dyn ScpiTransport>,
    model: SmuModel,
    identity: String,
}

impl ScpiSourceMeter {
    /// Query the identity string and resolve the model.
    pub async fn connect(transport: Arc<dyn ScpiTransport>) -> Result<Self> {
        let identity = transport
            .query("*IDN?")
            .await
            .context("Failed to query source meter identity")?;
        let model = SmuModel::from_identity(&identity);
        debug!(%identity, %model, "Source meter identified");

        Ok(Self {
            transport,
            model,
            identity,
        })
    }

    /// Resolved model tag.
    pub fn model(&self) -> SmuModel {
        self.model
    }
}

#[async_trait]
impl SourceMeter for ScpiSourceMeter {
    fn capabilities(&self) -> CapabilitySet {
        self.model.capabilities()
    }

    async fn name(&self) -> Result<String> {
        Ok(self.identity.clone())
    }

    async fn get_voltage(&self) -> Result<f64> {
        let response = self.transport.query(self.model.voltage_query()).await?;
        self.model.parse_voltage(&response)
    }

    async fn set_voltage(&self, volts: f64) -> Result<()> {
        self.transport.command(&format!(":SOUR:VOLT {}", volts)).await
    }

    async fn get_current(&self) -> Result<f64> {
        let response = self.transport.query(self.model.current_query()).await?;
        self.model.parse_current(&response)
    }

    async fn source_voltage_mode(&self) -> Result<()> {
        self.transport.command(":SOUR:FUNC VOLT").await
    }

    async fn set_current_limit(&self, amps: f64) -> Result<()> {
        self.transport
            .command(&format!(":SENS:CURR:PROT {}", amps))
            .await
    }

    async fn set_voltage_range(&self, volts: f64) -> Result<()> {
        self.transport
            .command(&format!(":SOUR:VOLT:RANG {}", volts))
            .await
    }

    async fn on(&self) -> Result<()> {
        self.transport.command(":OUTP ON").await
    }

    async fn off(&self) -> Result<()> {
        self.transport.command(":OUTP OFF").await
    }

    async fn is_on(&self) -> Result<bool> {
        let response = self.transport.query(":OUTP?").await?;
        match response.trim() {
            "1" | "ON" => Ok(true),
            "0" | "OFF" => Ok(false),
            other => Err(anyhow!("Unexpected output state '{}'", other)),
        }
    }

    async fn clear_input(&self) -> Result<()> {
        self.transport.clear_input().await
    }

    async fn release(&self) -> Result<()> {
        self.transport.close().await
    }
}

/// HP 4284A style LCR meter driven over SCPI.
pub struct ScpiLcrMeter {
    transport: Arc<dyn ScpiTransport>,
    trigger: Mutex<TriggerMode>,
}

impl ScpiLcrMeter {
    /// Wrap a transport. No I/O happens until the first command.
    pub fn new(transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            transport,
            trigger: Mutex::new(TriggerMode::Internal),
        }
    }
}

#[async_trait]
impl LcrMeter for ScpiLcrMeter {
    async fn name(&self) -> Result<String> {
        self.transport.query("*IDN?").await
    }

    async fn set_ac_voltage(&self, level: AcLevel) -> Result<()> {
        let command = match level {
            AcLevel::Volts(v) => format!(":VOLT {}", v),
            AcLevel::Min => ":VOLT MIN".to_string(),
        };
        self.transport.command(&command).await
    }

    async fn set_ac_frequency(&self, hertz: f64) -> Result<()> {
        self.transport.command(&format!(":FREQ {}", hertz)).await
    }

    async fn select_function(&self, function: ImpedanceFunction) -> Result<()> {
        self.transport
            .command(&format!(":FUNC:IMP {}", function.mnemonic()))
            .await
    }

    async fn set_trigger_mode(&self, mode: TriggerMode) -> Result<()> {
        self.transport
            .command(&format!(":TRIG:SOUR {}", mode.mnemonic()))
            .await?;
        *self.trigger.lock().await = mode;
        Ok(())
    }

    async fn measure(&self) -> Result<(f64, f64)> {
        if *self.trigger.lock().await != TriggerMode::Internal {
            self.transport.command(":TRIG:IMM").await?;
        }
        let response = self.transport.query(":FETC?").await?;
        let primary = parse_f64_response(field(&response, 0)?)?;
        let secondary = parse_f64_response(field(&response, 1)?)?;
        Ok((primary, secondary))
    }

    async fn release(&self) -> Result<()> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockScpiTransport;

    #[test]
    fn resolves_models_from_identity() {
        assert_eq!(
            SmuModel::from_identity("KEITHLEY INSTRUMENTS INC.,MODEL 2410,1234567,C30"),
            SmuModel::Keithley2410
        );
        assert_eq!(
            SmuModel::from_identity("Keithley Instruments,Model 6517A,0815,A13"),
            SmuModel::Keithley6517A
        );
        assert_eq!(
            SmuModel::from_identity("Rohde&Schwarz,HMP4040,1,1"),
            SmuModel::Generic
        );
        assert_eq!(SmuModel::from_identity("no commas here"), SmuModel::Generic);
    }

    #[test]
    fn reading_adapters() {
        let k2410 = SmuModel::Keithley2410;
        let reading = "-1.000E+01,-2.5E-07,+9.91E+37,+1.2E+04,+1.9E+04";
        assert_eq!(k2410.parse_current(reading).unwrap(), -2.5e-7);
        assert_eq!(k2410.parse_voltage(reading).unwrap(), -10.0);

        let k6517 = SmuModel::Keithley6517A;
        assert_eq!(
            k6517
                .parse_current("+1.0453E-12NADC,+0000183.13secs,+00004RDNG#")
                .unwrap(),
            1.0453e-12
        );
        assert!(k6517.parse_current("NADC").is_err());

        assert_eq!(SmuModel::Generic.parse_current("3e-9").unwrap(), 3e-9);
        assert!(SmuModel::Generic.parse_voltage("garbage").is_err());
    }

    #[test]
    fn electrometer_lacks_compliance() {
        let caps = SmuModel::Keithley6517A.capabilities();
        assert!(!caps.contains(Capability::CurrentLimit));
        assert!(caps.contains(Capability::PowerState));
    }

    #[tokio::test]
    async fn source_meter_speaks_model_dialect() {
        let transport = Arc::new(
            MockScpiTransport::new()
                .with_response("*IDN?", "KEITHLEY INSTRUMENTS INC.,MODEL 2410,1,C30")
                .with_response(":MEAS:CURR?", "-5.0E+00,1.5E-08,+9.9E+37")
                .with_response(":OUTP?", "1"),
        );
        let smu = ScpiSourceMeter::connect(transport.clone()).await.unwrap();
        assert_eq!(smu.model(), SmuModel::Keithley2410);

        smu.set_voltage(-5.0).await.unwrap();
        assert_eq!(smu.get_current().await.unwrap(), 1.5e-8);
        assert!(smu.is_on().await.unwrap());

        let log = transport.get_call_log();
        assert_eq!(log, vec!["*IDN?", ":SOUR:VOLT -5", ":MEAS:CURR?", ":OUTP?"]);
    }

    #[tokio::test]
    async fn lcr_meter_triggers_when_not_internal() {
        let transport = Arc::new(
            MockScpiTransport::new().with_response(":FETC?", "+1.2E-11,+4.5E+06,+0"),
        );
        let lcr = ScpiLcrMeter::new(transport.clone());

        lcr.set_ac_voltage(AcLevel::Min).await.unwrap();
        lcr.select_function(ImpedanceFunction::CpRp).await.unwrap();
        assert_eq!(lcr.measure().await.unwrap(), (1.2e-11, 4.5e6));

        lcr.set_trigger_mode(TriggerMode::Bus).await.unwrap();
        lcr.measure().await.unwrap();

        let log = transport.get_call_log();
        assert_eq!(
            log,
            vec![
                ":VOLT MIN",
                ":FUNC:IMP CPRP",
                ":FETC?",
                ":TRIG:SOUR BUS",
                ":TRIG:IMM",
                ":FETC?"
            ]
        );
    }
}
