//! Mock Hardware Implementations
//!
//! Simulated instruments for running scans without physical hardware.
//! Every mock records its calls so tests can assert on the exact command order.
//!
//! # Available Mocks
//!
//! - `MockSourceMeter` - voltage source with a configurable leakage current
//! - `MockLcrMeter` - impedance meter returning a fixed `(cp, rp)` pair
//! - `MockScpiTransport` - scripted SCPI responses for driver tests
//!
//! # Fault Injection
//!
//! - `with_current_at` overrides the current read at one bias voltage (interlock trips)
//! - `with_stuck_voltage` keeps reporting one voltage regardless of `set_voltage` (ramp failures)
//! - `with_stuck_voltage_after` does the same once a number of readings were answered
//! - `fail_on` makes one operation return an error

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::hardware::capabilities::{
    AcLevel, Capability, CapabilitySet, ImpedanceFunction, LcrMeter, SourceMeter, TriggerMode,
};
use crate::hardware::scpi::ScpiTransport;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type CurrentModel = Box<dyn Fn(f64) -> f64 + Send + Sync>;

// =============================================================================
// MockSourceMeter - Simulated Voltage Source
// =============================================================================

#[derive(Debug, Default)]
struct SourceState {
    voltage: f64,
    output_on: bool,
    current_limit: Option<f64>,
    voltage_range: Option<f64>,
    voltage_mode: bool,
    released: bool,
}

/// Mock source meter
///
/// Simulates a voltage source with:
/// - Instant voltage changes (settling is the caller's job)
/// - Ohmic leakage current (1 nA per volt unless replaced)
/// - Per-voltage current overrides for interlock tests
///
/// # Example
///
/// ```rust,ignore
/// let smu = MockSourceMeter::new().with_current_at(3.0, 2e-6);
/// smu.set_voltage(3.0).await?;
/// assert_eq!(smu.get_current().await?, 2e-6);
/// ```
pub struct MockSourceMeter {
    name: String,
    capabilities: CapabilitySet,
    state: Mutex<SourceState>,
    current_model: CurrentModel,
    current_overrides: Vec<(f64, f64)>,
    stuck_voltage: Option<(usize, f64)>,
    voltage_reads: AtomicUsize,
    failing: HashSet<&'static str>,
    call_log: Mutex<Vec<String>>,
}

impl MockSourceMeter {
    /// Mock at 0 V with the output off and every capability declared.
    pub fn new() -> Self {
        Self {
            name: "MOCK INSTRUMENTS,MODEL SMU,0,1.0".to_string(),
            capabilities: CapabilitySet::all(),
            state: Mutex::new(SourceState::default()),
            current_model: Box::new(|v| v * 1e-9),
            current_overrides: Vec::new(),
            stuck_voltage: None,
            voltage_reads: AtomicUsize::new(0),
            failing: HashSet::new(),
            call_log: Mutex::new(Vec::new()),
        }
    }

    /// Set the identity string
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Declare a different capability set
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Start at the given output voltage
    pub fn with_voltage(self, volts: f64) -> Self {
        lock(&self.state).voltage = volts;
        self
    }

    /// Start with the output enabled or disabled
    pub fn with_output_on(self, on: bool) -> Self {
        lock(&self.state).output_on = on;
        self
    }

    /// Replace the leakage model `current = f(voltage)`
    pub fn with_current_model(mut self, model: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        self.current_model = Box::new(model);
        self
    }

    /// Report `amps` whenever the output sits at `volts`
    pub fn with_current_at(mut self, volts: f64, amps: f64) -> Self {
        self.current_overrides.push((volts, amps));
        self
    }

    /// Report `volts` from `get_voltage` no matter what was set
    pub fn with_stuck_voltage(mut self, volts: f64) -> Self {
        self.stuck_voltage = Some((0, volts));
        self
    }

    /// Report `volts` from `get_voltage` once `reads` readings were answered truthfully
    pub fn with_stuck_voltage_after(mut self, reads: usize, volts: f64) -> Self {
        self.stuck_voltage = Some((reads, volts));
        self
    }

    /// Make the named operation (e.g. `"off"`, `"set_voltage"`) fail
    pub fn fail_on(mut self, operation: &'static str) -> Self {
        self.failing.insert(operation);
        self
    }

    /// Get a copy of the call log for verification
    pub fn get_call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    /// Clear the call log
    pub fn clear_call_log(&self) {
        lock(&self.call_log).clear();
    }

    /// Every voltage passed to `set_voltage`, in order
    pub fn voltage_history(&self) -> Vec<f64> {
        self.get_call_log()
            .iter()
            .filter_map(|c| c.strip_prefix("set_voltage "))
            .filter_map(|v| v.parse().ok())
            .collect()
    }

    /// Last programmed output voltage
    pub fn output_voltage(&self) -> f64 {
        lock(&self.state).voltage
    }

    /// Whether the output is enabled
    pub fn output_on(&self) -> bool {
        lock(&self.state).output_on
    }

    /// Compliance limit set through `set_current_limit`
    pub fn current_limit(&self) -> Option<f64> {
        lock(&self.state).current_limit
    }

    /// Range set through `set_voltage_range`
    pub fn voltage_range(&self) -> Option<f64> {
        lock(&self.state).voltage_range
    }

    /// Whether `source_voltage_mode` was called
    pub fn in_voltage_mode(&self) -> bool {
        lock(&self.state).voltage_mode
    }

    /// Whether `release` was called
    pub fn released(&self) -> bool {
        lock(&self.state).released
    }

    fn log_call(&self, call: String) -> Result<()> {
        let operation = call.split(' ').next().unwrap_or_default().to_string();
        lock(&self.call_log).push(call);
        if self.failing.contains(operation.as_str()) {
            bail!("MockSourceMeter: injected failure in {}", operation);
        }
        Ok(())
    }

    fn require(&self, capability: Capability) -> Result<()> {
        if self.capabilities.contains(capability) {
            Ok(())
        } else {
            Err(anyhow!("{} not supported by this device", capability))
        }
    }
}

impl Default for MockSourceMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceMeter for MockSourceMeter {
    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    async fn name(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    async fn get_voltage(&self) -> Result<f64> {
        self.require(Capability::ReadVoltage)?;
        self.log_call("get_voltage".to_string())?;
        let read = self.voltage_reads.fetch_add(1, Ordering::SeqCst);
        match self.stuck_voltage {
            Some((after, volts)) if read >= after => Ok(volts),
            _ => Ok(lock(&self.state).voltage),
        }
    }

    async fn set_voltage(&self, volts: f64) -> Result<()> {
        self.require(Capability::SetVoltage)?;
        self.log_call(format!("set_voltage {}", volts))?;
        lock(&self.state).voltage = volts;
        Ok(())
    }

    async fn get_current(&self) -> Result<f64> {
        self.require(Capability::ReadCurrent)?;
        self.log_call("get_current".to_string())?;
        let voltage = lock(&self.state).voltage;
        let amps = self
            .current_overrides
            .iter()
            .find(|(v, _)| (v - voltage).abs() < 1e-9)
            .map(|(_, a)| *a)
            .unwrap_or_else(|| (self.current_model)(voltage));
        Ok(amps)
    }

    async fn source_voltage_mode(&self) -> Result<()> {
        self.require(Capability::VoltageSourceMode)?;
        self.log_call("source_voltage_mode".to_string())?;
        lock(&self.state).voltage_mode = true;
        Ok(())
    }

    async fn set_current_limit(&self, amps: f64) -> Result<()> {
        self.require(Capability::CurrentLimit)?;
        self.log_call(format!("set_current_limit {}", amps))?;
        lock(&self.state).current_limit = Some(amps);
        Ok(())
    }

    async fn set_voltage_range(&self, volts: f64) -> Result<()> {
        self.require(Capability::VoltageRange)?;
        self.log_call(format!("set_voltage_range {}", volts))?;
        lock(&self.state).voltage_range = Some(volts);
        Ok(())
    }

    async fn on(&self) -> Result<()> {
        self.require(Capability::PowerSwitch)?;
        self.log_call("on".to_string())?;
        lock(&self.state).output_on = true;
        Ok(())
    }

    async fn off(&self) -> Result<()> {
        self.require(Capability::PowerSwitch)?;
        self.log_call("off".to_string())?;
        lock(&self.state).output_on = false;
        Ok(())
    }

    async fn is_on(&self) -> Result<bool> {
        self.require(Capability::PowerState)?;
        self.log_call("is_on".to_string())?;
        Ok(lock(&self.state).output_on)
    }

    async fn clear_input(&self) -> Result<()> {
        self.require(Capability::ClearInput)?;
        self.log_call("clear_input".to_string())
    }

    async fn release(&self) -> Result<()> {
        self.log_call("release".to_string())?;
        lock(&self.state).released = true;
        Ok(())
    }
}

// =============================================================================
// MockLcrMeter - Simulated Impedance Meter
// =============================================================================

/// Mock LCR meter returning a fixed `(primary, secondary)` reading.
pub struct MockLcrMeter {
    reading: (f64, f64),
    ac_level: Mutex<Option<AcLevel>>,
    released: Mutex<bool>,
    call_log: Mutex<Vec<String>>,
}

impl MockLcrMeter {
    /// Mock reading 50 pF parallel to 1 GOhm
    pub fn new() -> Self {
        Self {
            reading: (50e-12, 1e9),
            ac_level: Mutex::new(None),
            released: Mutex::new(false),
            call_log: Mutex::new(Vec::new()),
        }
    }

    /// Set the reading returned by `measure`
    pub fn with_reading(mut self, primary: f64, secondary: f64) -> Self {
        self.reading = (primary, secondary);
        self
    }

    /// Last AC level set
    pub fn ac_level(&self) -> Option<AcLevel> {
        *lock(&self.ac_level)
    }

    /// Whether `release` was called
    pub fn released(&self) -> bool {
        *lock(&self.released)
    }

    /// Get a copy of the call log for verification
    pub fn get_call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    fn log_call(&self, call: String) {
        lock(&self.call_log).push(call);
    }
}

impl Default for MockLcrMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LcrMeter for MockLcrMeter {
    async fn name(&self) -> Result<String> {
        Ok("MOCK,MODEL 4284A,0,1.0".to_string())
    }

    async fn set_ac_voltage(&self, level: AcLevel) -> Result<()> {
        self.log_call(format!("set_ac_voltage {:?}", level));
        *lock(&self.ac_level) = Some(level);
        Ok(())
    }

    async fn set_ac_frequency(&self, hertz: f64) -> Result<()> {
        self.log_call(format!("set_ac_frequency {}", hertz));
        Ok(())
    }

    async fn select_function(&self, function: ImpedanceFunction) -> Result<()> {
        self.log_call(format!("select_function {}", function.mnemonic()));
        Ok(())
    }

    async fn set_trigger_mode(&self, mode: TriggerMode) -> Result<()> {
        self.log_call(format!("set_trigger_mode {}", mode.mnemonic()));
        Ok(())
    }

    async fn measure(&self) -> Result<(f64, f64)> {
        self.log_call("measure".to_string());
        Ok(self.reading)
    }

    async fn release(&self) -> Result<()> {
        self.log_call("release".to_string());
        *lock(&self.released) = true;
        Ok(())
    }
}

// =============================================================================
// MockScpiTransport - Scripted SCPI Responses
// =============================================================================

/// SCPI transport answering queries from a fixed table.
///
/// Unknown queries fail, so a test notices when a driver sends something unexpected.
#[derive(Default)]
pub struct MockScpiTransport {
    responses: HashMap<String, String>,
    call_log: Mutex<Vec<String>>,
    cleared: AtomicUsize,
}

impl MockScpiTransport {
    /// Transport with no scripted responses
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `query` with `response`
    pub fn with_response(mut self, query: &str, response: &str) -> Self {
        self.responses.insert(query.to_string(), response.to_string());
        self
    }

    /// Get a copy of the call log for verification
    pub fn get_call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    /// Number of `clear_input` calls
    pub fn clear_count(&self) -> usize {
        self.cleared.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScpiTransport for MockScpiTransport {
    async fn query(&self, command: &str) -> Result<String> {
        lock(&self.call_log).push(command.to_string());
        self.responses
            .get(command)
            .cloned()
            .ok_or_else(|| anyhow!("MockScpiTransport: no response scripted for '{}'", command))
    }

    async fn command(&self, command: &str) -> Result<()> {
        lock(&self.call_log).push(command.to_string());
        Ok(())
    }

    async fn clear_input(&self) -> Result<()> {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_source_meter_leakage() {
        let smu = MockSourceMeter::new();
        smu.set_voltage(10.0).await.unwrap();
        assert_eq!(smu.get_voltage().await.unwrap(), 10.0);
        assert!((smu.get_current().await.unwrap() - 1e-8).abs() < 1e-20);
    }

    #[tokio::test]
    async fn test_mock_source_meter_current_override() {
        let smu = MockSourceMeter::new().with_current_at(3.0, 2e-6);
        smu.set_voltage(2.0).await.unwrap();
        assert!(smu.get_current().await.unwrap() < 1e-6);
        smu.set_voltage(3.0).await.unwrap();
        assert_eq!(smu.get_current().await.unwrap(), 2e-6);
    }

    #[tokio::test]
    async fn test_mock_source_meter_fault_injection() {
        let smu = MockSourceMeter::new()
            .with_stuck_voltage(12.0)
            .fail_on("off");
        smu.set_voltage(0.0).await.unwrap();
        assert_eq!(smu.get_voltage().await.unwrap(), 12.0);
        assert!(smu.off().await.is_err());
        assert_eq!(
            smu.get_call_log(),
            vec!["set_voltage 0", "get_voltage", "off"]
        );
    }

    #[tokio::test]
    async fn test_mock_source_meter_sticks_after_reads() {
        let smu = MockSourceMeter::new().with_stuck_voltage_after(1, 40.0);
        smu.set_voltage(2.0).await.unwrap();
        assert_eq!(smu.get_voltage().await.unwrap(), 2.0);
        assert_eq!(smu.get_voltage().await.unwrap(), 40.0);
        assert_eq!(smu.get_voltage().await.unwrap(), 40.0);
    }

    #[tokio::test]
    async fn test_mock_source_meter_respects_capabilities() {
        let smu = MockSourceMeter::new().with_capabilities(CapabilitySet::basic());
        assert!(smu.on().await.is_err());
        assert!(smu.get_call_log().is_empty());
    }

    #[tokio::test]
    async fn test_mock_lcr_meter() {
        let lcr = MockLcrMeter::new().with_reading(1e-11, 2e6);
        lcr.set_ac_voltage(AcLevel::Volts(0.05)).await.unwrap();
        assert_eq!(lcr.measure().await.unwrap(), (1e-11, 2e6));
        assert_eq!(lcr.ac_level(), Some(AcLevel::Volts(0.05)));
    }

    #[tokio::test]
    async fn test_mock_transport_rejects_unknown_query() {
        let transport = MockScpiTransport::new().with_response("*IDN?", "MOCK,1");
        assert_eq!(transport.query("*IDN?").await.unwrap(), "MOCK,1");
        assert!(transport.query(":MEAS:CURR?").await.is_err());
        transport.clear_input().await.unwrap();
        assert_eq!(transport.clear_count(), 1);
    }
}
