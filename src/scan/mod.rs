//! Bias scans: sequence generation, ramping, teardown and the scan controller.

pub mod bias;
pub mod controller;
pub mod ramp;
pub mod safety;

pub use bias::{generate, BiasInput, BiasSequence, Polarity};
pub use controller::{
    CvSettings, Linger, OutputSpec, ScanConfig, ScanController, ScanMode, ScanOutcome,
    ScanReport, ScanState,
};
pub use ramp::{prepare_voltage_source, ramp_voltage, VoltageRamp};
