//! Instrument layer: capability traits, SCPI drivers, mocks and the registry.

pub mod capabilities;
pub mod mock;
pub mod registry;
pub mod scpi;
#[cfg(feature = "instrument_serial")]
pub mod serial;

pub use capabilities::{
    AcLevel, Capability, CapabilitySet, ImpedanceFunction, LcrMeter, SourceMeter, TriggerMode,
};
pub use registry::{InstrumentRegistry, InstrumentRole};
