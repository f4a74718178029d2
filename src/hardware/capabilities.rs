//! Instrument Capabilities
//!
//! Instruments are consumed through two traits:
//!
//! - [`SourceMeter`]: a programmable voltage source that can also read current
//! - [`LcrMeter`]: an impedance meter used for capacitance-voltage scans
//!
//! Not every source meter supports every operation. Instead of probing at runtime,
//! each device declares a fixed [`CapabilitySet`] and callers branch on it:
//!
//! ```rust,ignore
//! if smu.supports(Capability::CurrentLimit) {
//!     smu.set_current_limit(1e-6).await?;
//! }
//! ```
//!
//! Calling an operation the device did not declare returns an error from the default
//! trait implementation. Absence of a capability is never an error by itself; the scan
//! code simply skips that setup step.
//!
//! # Design Philosophy
//!
//! Each trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Takes `&self`; drivers keep their state behind interior mutability

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::fmt;

/// Optional source-meter operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// `get_voltage`
    ReadVoltage,
    /// `set_voltage`
    SetVoltage,
    /// `get_current`
    ReadCurrent,
    /// `source_voltage_mode`
    VoltageSourceMode,
    /// `set_current_limit`
    CurrentLimit,
    /// `set_voltage_range`
    VoltageRange,
    /// `on` / `off`
    PowerSwitch,
    /// `is_on`
    PowerState,
    /// `clear_input`
    ClearInput,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 9] = [
        Capability::ReadVoltage,
        Capability::SetVoltage,
        Capability::ReadCurrent,
        Capability::VoltageSourceMode,
        Capability::CurrentLimit,
        Capability::VoltageRange,
        Capability::PowerSwitch,
        Capability::PowerState,
        Capability::ClearInput,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Operation name as used in log messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::ReadVoltage => "get_voltage",
            Capability::SetVoltage => "set_voltage",
            Capability::ReadCurrent => "get_current",
            Capability::VoltageSourceMode => "source_voltage_mode",
            Capability::CurrentLimit => "set_current_limit",
            Capability::VoltageRange => "set_voltage_range",
            Capability::PowerSwitch => "on/off",
            Capability::PowerState => "get_on",
            Capability::ClearInput => "clear_input",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of operations a device declares at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    /// No optional operations.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every operation.
    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }

    /// The minimum a device needs to be swept: read/set voltage and read current.
    pub fn basic() -> Self {
        [
            Capability::ReadVoltage,
            Capability::SetVoltage,
            Capability::ReadCurrent,
        ]
        .into_iter()
        .collect()
    }

    /// Add a capability.
    #[must_use]
    pub fn with(mut self, capability: Capability) -> Self {
        self.0 |= capability.bit();
        self
    }

    /// Remove a capability.
    #[must_use]
    pub fn without(mut self, capability: Capability) -> Self {
        self.0 &= !capability.bit();
        self
    }

    /// Whether the capability is declared.
    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// Iterate over declared capabilities.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), |set, c| set.with(c))
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Capability::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Capability: Voltage Source / Current Measure
///
/// # Contract
/// - Voltages in volts, currents in amperes
/// - `set_voltage` returns once the command is accepted; settling is the caller's job
/// - Operations not declared in [`SourceMeter::capabilities`] fail with an error
#[async_trait]
pub trait SourceMeter: Send + Sync {
    /// Operations this device supports.
    fn capabilities(&self) -> CapabilitySet;

    /// Convenience check against [`SourceMeter::capabilities`].
    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(capability)
    }

    /// Identity string of the device.
    async fn name(&self) -> Result<String> {
        Ok("unknown source meter".to_string())
    }

    /// Read the output voltage
    async fn get_voltage(&self) -> Result<f64> {
        bail!("{} not supported by this device", Capability::ReadVoltage)
    }

    /// Program the output voltage
    async fn set_voltage(&self, _volts: f64) -> Result<()> {
        bail!("{} not supported by this device", Capability::SetVoltage)
    }

    /// Measure the output current
    async fn get_current(&self) -> Result<f64> {
        bail!("{} not supported by this device", Capability::ReadCurrent)
    }

    /// Switch the device into voltage-sourcing mode
    async fn source_voltage_mode(&self) -> Result<()> {
        bail!("{} not supported by this device", Capability::VoltageSourceMode)
    }

    /// Set the compliance current
    async fn set_current_limit(&self, _amps: f64) -> Result<()> {
        bail!("{} not supported by this device", Capability::CurrentLimit)
    }

    /// Select the output range able to reach `volts`
    async fn set_voltage_range(&self, _volts: f64) -> Result<()> {
        bail!("{} not supported by this device", Capability::VoltageRange)
    }

    /// Enable the output
    async fn on(&self) -> Result<()> {
        bail!("{} not supported by this device", Capability::PowerSwitch)
    }

    /// Disable the output
    async fn off(&self) -> Result<()> {
        bail!("{} not supported by this device", Capability::PowerSwitch)
    }

    /// Whether the output is enabled
    async fn is_on(&self) -> Result<bool> {
        bail!("{} not supported by this device", Capability::PowerState)
    }

    /// Discard unread bytes waiting in the transport
    async fn clear_input(&self) -> Result<()> {
        bail!("{} not supported by this device", Capability::ClearInput)
    }

    /// Release the underlying session. Called once during teardown.
    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// AC test signal level of an LCR meter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcLevel {
    /// Explicit level in volts
    Volts(f64),
    /// Lowest level the meter supports (quiescent)
    Min,
}

/// Impedance measurement function of an LCR meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpedanceFunction {
    /// Parallel capacitance and parallel resistance
    CpRp,
    /// Parallel capacitance and dissipation factor
    CpD,
    /// Series capacitance and series resistance
    CsRs,
}

impl ImpedanceFunction {
    /// Function mnemonic as used by SCPI LCR meters.
    pub fn mnemonic(self) -> &'static str {
        match self {
            ImpedanceFunction::CpRp => "CPRP",
            ImpedanceFunction::CpD => "CPD",
            ImpedanceFunction::CsRs => "CSRS",
        }
    }
}

/// Trigger source of an LCR meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Free-running internal trigger
    Internal,
    /// Trigger on bus command
    Bus,
    /// Hold until triggered
    Hold,
}

impl TriggerMode {
    /// Trigger mnemonic as used by SCPI LCR meters.
    pub fn mnemonic(self) -> &'static str {
        match self {
            TriggerMode::Internal => "INT",
            TriggerMode::Bus => "BUS",
            TriggerMode::Hold => "HOLD",
        }
    }
}

/// Capability: Impedance Measurement
///
/// # Contract
/// - `measure` returns the `(primary, secondary)` pair of the selected function,
///   e.g. `(cp, rp)` in farads and ohms for [`ImpedanceFunction::CpRp`]
#[async_trait]
pub trait LcrMeter: Send + Sync {
    /// Identity string of the device.
    async fn name(&self) -> Result<String> {
        Ok("unknown LCR meter".to_string())
    }

    /// Set the AC test signal level
    async fn set_ac_voltage(&self, level: AcLevel) -> Result<()>;

    /// Set the AC test signal frequency in hertz
    async fn set_ac_frequency(&self, hertz: f64) -> Result<()>;

    /// Select the measurement function
    async fn select_function(&self, function: ImpedanceFunction) -> Result<()>;

    /// Select the trigger source
    async fn set_trigger_mode(&self, mode: TriggerMode) -> Result<()>;

    /// Read one `(primary, secondary)` pair
    async fn measure(&self) -> Result<(f64, f64)>;

    /// Release the underlying session.
    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReadOnlyMeter;

    #[async_trait]
    impl SourceMeter for ReadOnlyMeter {
        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::empty().with(Capability::ReadCurrent)
        }

        async fn get_current(&self) -> Result<f64> {
            Ok(1e-9)
        }
    }

    #[test]
    fn capability_set_membership() {
        let set = CapabilitySet::basic().with(Capability::PowerSwitch);
        assert!(set.contains(Capability::SetVoltage));
        assert!(set.contains(Capability::PowerSwitch));
        assert!(!set.contains(Capability::CurrentLimit));

        let set = set.without(Capability::PowerSwitch);
        assert!(!set.contains(Capability::PowerSwitch));
        assert_eq!(CapabilitySet::all().iter().count(), Capability::ALL.len());
    }

    #[test]
    fn capability_set_display() {
        let set = CapabilitySet::empty()
            .with(Capability::ReadVoltage)
            .with(Capability::PowerState);
        assert_eq!(set.to_string(), "[get_voltage, get_on]");
    }

    #[tokio::test]
    async fn undeclared_operations_fail() {
        let meter = ReadOnlyMeter;
        assert!(meter.supports(Capability::ReadCurrent));
        assert!(!meter.supports(Capability::SetVoltage));
        assert_eq!(meter.get_current().await.unwrap(), 1e-9);

        let err = meter.set_voltage(10.0).await.unwrap_err();
        assert!(err.to_string().contains("set_voltage"));
    }
}
