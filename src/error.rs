//! Custom error types for bias scans.
//!
//! This module defines `ScanError`, the single error type returned by the scan controller,
//! the bias generator, the ramp engine and the data writer. It uses `thiserror` so that
//! every variant carries a readable message and lower-level errors convert with `?`.
//!
//! ## Error Hierarchy
//!
//! Variants group into the categories reported by [`ScanError::kind`]:
//!
//! - **Configuration**: bad bias input, ambiguous instrument selection, bad schema, empty
//!   identifier. Raised before any device I/O and never retried.
//! - **Convergence**: a ramp ended outside the tolerance band around its target.
//! - **ResourceConflict**: the output file exists and overwriting was not allowed.
//! - **Validation** / **Key**: a single row was rejected by the writer; nothing was written.
//! - **Io**: file system, csv or Arrow failures while persisting.
//! - **Device**: an instrument command failed. Instrument traits use `anyhow`, so the
//!   underlying error is kept opaque.
//!
//! A tripped current-limit interlock is *not* an error; it is reported through
//! [`crate::scan::ScanOutcome`].

use crate::scan::ScanReport;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Coarse classification of a [`ScanError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid input detected before touching hardware.
    Configuration,
    /// A voltage ramp did not reach its target.
    Convergence,
    /// The output path is already taken.
    ResourceConflict,
    /// Row value count or value type does not fit the schema.
    Validation,
    /// Row column names do not fit the schema.
    Key,
    /// Failure while writing to disk.
    Io,
    /// Failure reported by an instrument.
    Device,
}

/// Error returned by every fallible scan, ramp and writer operation.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Generic invalid setting
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// An explicit bias list entry is not a number
    #[error("Bias voltage '{value}' cannot be converted to a float")]
    BiasConversion { value: String },

    /// Explicit bias list changes direction
    #[error("Bias voltages are not monotonic. Disable the monotonic check to allow this sequence")]
    NotMonotonic,

    /// No or several instruments match the requested role
    #[error("Cannot identify {role}: {reason}")]
    AmbiguousDevice { role: String, reason: String },

    /// Data set identifier is blank
    #[error("Identifier must be a non-empty string")]
    EmptyIdentifier,

    /// Schema entries do not fit the output kind
    #[error("Schema does not match output kind {kind}: {reason}")]
    SchemaKindMismatch { kind: String, reason: String },

    /// Output path taken and overwrite disabled
    #[error("File {} already exists. Enable overwrite to replace it", path.display())]
    FileExists { path: PathBuf },

    /// Row has the wrong number of values
    #[error("Row requires data for each column: expected {expected} values, got {got}")]
    RowLength { expected: usize, got: usize },

    /// Named row lacks a schema column
    #[error("Column field is missing: '{column}'")]
    MissingColumn { column: String },

    /// Value does not fit the column type
    #[error("Value {value} cannot be stored in column '{column}' of type {dtype}")]
    ColumnValue {
        column: String,
        dtype: String,
        value: f64,
    },

    /// Ramp finished outside the tolerance band
    #[error("Ramping voltage to target of {target} V failed ({actual} V after ramping)")]
    Convergence { target: f64, actual: f64 },

    /// Operation missing from the device capability set
    #[error("Device does not support {capability}")]
    Unsupported { capability: String },

    /// Instrument command failed
    #[error("Instrument error: {0:#}")]
    Device(#[from] anyhow::Error),

    /// Teardown failed after an otherwise clean scan
    #[error("Returning the bias to a safe state failed: {source}")]
    Teardown {
        #[source]
        source: Box<ScanError>,
        /// Outcome of the scan whose teardown failed, when the scan itself succeeded
        report: Option<Box<ScanReport>>,
    },

    /// Scan body or teardown panicked
    #[error("Scan body panicked: {0}")]
    Panicked(String),

    /// File system failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage_csv")]
    /// csv writer failure
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[cfg(feature = "storage_arrow")]
    /// Arrow IPC writer failure
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Settings file could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    /// Output kind compiled out
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl ScanError {
    /// Classify the error into one of the scan error categories.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::Configuration(_)
            | ScanError::BiasConversion { .. }
            | ScanError::NotMonotonic
            | ScanError::AmbiguousDevice { .. }
            | ScanError::EmptyIdentifier
            | ScanError::SchemaKindMismatch { .. }
            | ScanError::Settings(_)
            | ScanError::FeatureNotEnabled(_) => ErrorKind::Configuration,
            ScanError::FileExists { .. } => ErrorKind::ResourceConflict,
            ScanError::RowLength { .. } | ScanError::ColumnValue { .. } => ErrorKind::Validation,
            ScanError::MissingColumn { .. } => ErrorKind::Key,
            ScanError::Convergence { .. } => ErrorKind::Convergence,
            ScanError::Teardown { source, .. } => source.kind(),
            ScanError::Io(_) => ErrorKind::Io,
            #[cfg(feature = "storage_csv")]
            ScanError::Csv(_) => ErrorKind::Io,
            #[cfg(feature = "storage_arrow")]
            ScanError::Arrow(_) => ErrorKind::Io,
            ScanError::Device(_) | ScanError::Unsupported { .. } | ScanError::Panicked(_) => {
                ErrorKind::Device
            }
        }
    }

    /// Report of a completed scan carried by a teardown failure.
    ///
    /// The sweep outcome and row counts stay available when only the return to a safe
    /// state failed.
    pub fn report(&self) -> Option<&ScanReport> {
        match self {
            ScanError::Teardown { report, .. } => report.as_deref(),
            _ => None,
        }
    }

    /// Shorthand for a configuration error with a formatted message.
    pub fn config(msg: impl Into<String>) -> Self {
        ScanError::Configuration(msg.into())
    }

    pub(crate) fn unsupported(capability: impl std::fmt::Display) -> Self {
        ScanError::Unsupported {
            capability: capability.to_string(),
        }
    }
}

impl From<figment::Error> for ScanError {
    fn from(value: figment::Error) -> Self {
        ScanError::Settings(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_writer_errors() {
        let err = ScanError::RowLength {
            expected: 3,
            got: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = ScanError::MissingColumn {
            column: "bias".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Key);
        assert!(err.to_string().contains("bias"));

        let err = ScanError::FileExists {
            path: PathBuf::from("run.csv"),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceConflict);
    }

    #[test]
    fn teardown_keeps_inner_kind() {
        let err = ScanError::Teardown {
            source: Box::new(ScanError::Convergence {
                target: 0.0,
                actual: 12.0,
            }),
            report: None,
        };
        assert_eq!(err.kind(), ErrorKind::Convergence);
        assert!(err.report().is_none());
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn device_errors_wrap_anyhow() {
        let err: ScanError = anyhow::anyhow!("serial timeout").into();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert!(err.to_string().contains("serial timeout"));
    }
}
