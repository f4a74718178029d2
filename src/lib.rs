//! # Bias Scan Library
//!
//! Current-voltage and capacitance-voltage scans of semiconductor detectors. A programmable
//! source meter is walked through a bias sequence while a current-limit interlock guards the
//! device under test, and the bias is always ramped back to 0 V before the instruments are
//! released. Every measured row is persisted immediately as CSV text or an Arrow IPC stream.
//!
//! ## Crate Structure
//!
//! - **`config`**: `ScanSettings` loaded from TOML with environment overrides (Figment).
//! - **`error`**: the `ScanError` enum and its `ErrorKind` classification.
//! - **`hardware`**: `SourceMeter` / `LcrMeter` capability traits, SCPI drivers, mock
//!   instruments and the instrument registry.
//! - **`logging`**: tracing-subscriber initialisation.
//! - **`scan`**: bias sequence generator, voltage ramp engine, teardown scope and the
//!   scan controller state machine.
//! - **`storage`**: the schema-checked data writer with its text and binary sinks.

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod scan;
pub mod storage;
