//! Comma-separated text sink.
//!
//! ```text
//! # Identifier: IV_curve
//! # Comments: SMU: KEITHLEY 2410; Current limit: 1.00E-6 A
//! # Columns: timestamp, bias, current
//! "1.0","0.0","1e-6"
//! ```
//!
//! Values use Rust's shortest round-trip float formatting, so reading a field back with
//! `str::parse::<f64>` reproduces the written value exactly.

use super::RowSink;
use crate::error::ScanResult;
use csv::{QuoteStyle, Terminator, WriterBuilder};
use std::fs::File;
use std::io::Write;
use std::path::Path;

pub(super) struct TextSink {
    writer: csv::Writer<File>,
}

impl TextSink {
    pub(super) fn create(
        path: &Path,
        identifier: &str,
        comments: &[String],
        columns: &[&str],
    ) -> ScanResult<Self> {
        let mut file = File::create(path)?;

        let comments = format!("# Comments: {}", comments.join("; "));
        writeln!(file, "# Identifier: {identifier}")?;
        writeln!(file, "{}", comments.trim_end())?;
        writeln!(file, "# Columns: {}", columns.join(", "))?;
        file.flush()?;

        let writer = WriterBuilder::new()
            .has_headers(false)
            .quote_style(QuoteStyle::Always)
            .quote(b'"')
            .terminator(Terminator::Any(b'\n'))
            .from_writer(file);

        Ok(Self { writer })
    }
}

impl RowSink for TextSink {
    fn append(&mut self, values: &[f64]) -> ScanResult<()> {
        self.writer
            .write_record(values.iter().map(|v| format!("{v:?}")))?;
        self.writer.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> ScanResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}
