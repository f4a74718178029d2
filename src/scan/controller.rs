//! Scan controller state machine.
//!
//! ```text
//! Init -> RampingToFirst -> Stepping -> (Lingering)? -> RampingToZero -> Closed
//! ```
//!
//! `Init` validates the configuration, builds the bias sequence and opens the output file
//! before any instrument is commanded. Everything from instrument setup to the end of
//! lingering runs inside [`run_guarded`], so `RampingToZero` is entered on every exit
//! path: normal completion, a tripped interlock, an operator interrupt, an error or a panic.
//!
//! The interlock is not an error. A reading above the current limit ends the sweep with
//! [`ScanOutcome::Aborted`], logs a warning and proceeds to teardown.

use crate::config::Timing;
use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::{
    AcLevel, Capability, ImpedanceFunction, LcrMeter, SourceMeter, TriggerMode,
};
use crate::scan::bias::{generate, BiasInput, BiasSequence, Polarity};
use crate::scan::ramp::{prepare_voltage_source, ramp_voltage};
use crate::scan::safety::{run_guarded, Guarded, TeardownGuard, TeardownLog};
use crate::storage::{DataWriter, OutputKind, RowData, Schema, WriterConfig, WriterSession};
use std::fmt;
use std::future::{pending, Future};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Readings at or above this magnitude are the instrument's overflow marker, not a current.
pub const OVERFLOW_SENTINEL: f64 = 1e37;

/// Phase of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Validating input and opening the output file
    Init,
    /// Moving from the prepared 0 V to the first bias point
    RampingToFirst,
    /// Walking the bias sequence
    Stepping,
    /// Re-measuring at the final bias
    Lingering,
    /// Returning to 0 V and switching off
    RampingToZero,
    /// Instruments released
    Closed,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Init => "INIT",
            ScanState::RampingToFirst => "RAMPING_TO_FIRST",
            ScanState::Stepping => "STEPPING",
            ScanState::Lingering => "LINGERING",
            ScanState::RampingToZero => "RAMPING_TO_ZERO",
            ScanState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// AC excitation of the LCR meter in CV mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CvSettings {
    /// AC level in volts
    pub ac_voltage: f64,
    /// AC frequency in hertz
    pub ac_frequency: f64,
}

/// Kind of sweep
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScanMode {
    /// Current-voltage
    Iv,
    /// Capacitance-voltage
    Cv(CvSettings),
}

impl ScanMode {
    /// Output columns for `n_meas` sub-measurements per bias point.
    pub fn columns(&self, n_meas: usize) -> Vec<&'static str> {
        match (self, n_meas > 1) {
            (ScanMode::Iv, false) => vec!["timestamp", "bias", "current"],
            (ScanMode::Iv, true) => vec!["timestamp", "bias", "mean_current", "std_current"],
            (ScanMode::Cv(_), false) => vec!["timestamp", "bias", "current", "cp", "rp"],
            (ScanMode::Cv(_), true) => vec![
                "timestamp",
                "bias",
                "mean_current",
                "std_current",
                "mean_cp",
                "std_cp",
                "mean_rp",
                "std_rp",
            ],
        }
    }

    /// Output schema for `kind`; binary columns are `Float64`.
    pub fn schema(&self, n_meas: usize, kind: OutputKind) -> Schema {
        Schema::float_columns(self.columns(n_meas), kind)
    }
}

/// Continued measurement at the final bias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Linger {
    /// Go straight to teardown
    #[default]
    Off,
    /// Until the operator interrupts
    Indefinite,
    /// For a fixed time, or until interrupted
    For(Duration),
}

/// Where and how measurements are stored
#[derive(Debug, Clone)]
pub struct OutputSpec {
    /// File path; the extension is normalised to `kind`
    pub path: PathBuf,
    /// Physical encoding
    pub kind: OutputKind,
    /// Data set label
    pub identifier: String,
    /// Free-text comments; `None` writes a description of the scan
    pub comments: Option<Vec<String>>,
    /// Whether an existing file may be replaced
    pub overwrite: bool,
}

impl OutputSpec {
    /// Output with generated comments and overwrite disabled
    pub fn new(path: impl Into<PathBuf>, kind: OutputKind, identifier: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            identifier: identifier.into(),
            comments: None,
            overwrite: false,
        }
    }
}

/// Parameters of one scan
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Scalar endpoint or explicit voltages
    pub bias: BiasInput,
    /// Points of a scalar sweep, also the point count of the ramps
    pub steps: Option<usize>,
    /// Sign applied to the bias
    pub polarity: Polarity,
    /// Reject non-monotonic explicit lists
    pub check_monotonic: bool,
    /// Interlock threshold in amperes
    pub current_limit: f64,
    /// Sub-measurements per bias point; above 1 rows hold mean and standard deviation
    pub n_meas: usize,
    /// Behaviour after a completed sweep
    pub linger: Linger,
    /// Log every step at info level
    pub log_progress: bool,
    /// Delays between instrument operations
    pub timing: Timing,
    /// Output file
    pub output: OutputSpec,
}

impl ScanConfig {
    /// Config with one measurement per point and default timing
    pub fn new(bias: BiasInput, current_limit: f64, output: OutputSpec) -> Self {
        Self {
            bias,
            steps: None,
            polarity: Polarity::Positive,
            check_monotonic: true,
            current_limit,
            n_meas: 1,
            linger: Linger::Off,
            log_progress: false,
            timing: Timing::default(),
            output,
        }
    }

    /// Run every check that needs no instrument and return the bias sequence.
    ///
    /// Covers the limits below, bias generation and the output file checks of
    /// [`DataWriter::new`]. Nothing is written and no device is contacted, so callers can
    /// run this before opening instruments.
    pub fn preflight(&self, mode: ScanMode) -> ScanResult<BiasSequence> {
        self.validate()?;
        let bias = generate(&self.bias, self.steps, self.polarity, self.check_monotonic)?;
        DataWriter::new(self.writer_config(mode, self.output.comments.clone().unwrap_or_default()))?;
        Ok(bias)
    }

    fn writer_config(&self, mode: ScanMode, comments: Vec<String>) -> WriterConfig {
        let output = &self.output;
        WriterConfig::new(&output.path, mode.schema(self.n_meas, output.kind), output.kind)
            .identifier(output.identifier.clone())
            .comments(comments)
            .overwrite(output.overwrite)
    }

    /// Reject limits and counts the controller cannot run with.
    pub fn validate(&self) -> ScanResult<()> {
        if !self.current_limit.is_finite() || self.current_limit <= 0.0 {
            return Err(ScanError::config(format!(
                "Current limit must be a positive number of amperes, got {}",
                self.current_limit
            )));
        }
        if self.n_meas == 0 {
            return Err(ScanError::config(
                "At least one measurement per voltage step is required",
            ));
        }
        Ok(())
    }
}

/// How the sweep ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScanOutcome {
    /// Every bias point was measured
    Completed,
    /// The interlock tripped at `bias` with `current`
    Aborted {
        /// Bias voltage of the trip
        bias: f64,
        /// Offending current reading
        current: f64,
    },
    /// The operator interrupted the sweep before it completed
    Interrupted,
}

/// Result of a scan that reached `Closed`
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// How the sweep ended
    pub outcome: ScanOutcome,
    /// Rows in the output file, linger rows included
    pub rows_written: usize,
    /// Rows written while lingering
    pub linger_rows: usize,
    /// Lingering was ended by the operator
    pub linger_interrupted: bool,
    /// Visited states in order
    pub states: Vec<ScanState>,
    /// Normalised output path
    pub path: PathBuf,
}

struct SweepSummary {
    outcome: ScanOutcome,
    rows_written: usize,
    linger_rows: usize,
    linger_interrupted: bool,
}

#[derive(Default)]
struct StateTrace(Mutex<Vec<ScanState>>);

impl StateTrace {
    fn enter(&self, state: ScanState) {
        debug!(state = %state, "Scan state");
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state);
    }

    fn into_inner(self) -> Vec<ScanState> {
        self.0.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One bias point worth of readings
#[derive(Debug, Clone, PartialEq)]
struct Reading {
    current: Vec<f64>,
    cp: Vec<f64>,
    rp: Vec<f64>,
}

/// Arithmetic mean and population standard deviation.
fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

enum StepResult {
    Measured,
    Tripped { current: f64 },
}

/// Drives one IV or CV scan.
///
/// # Example
///
/// ```rust,ignore
/// let output = OutputSpec::new("iv_run", OutputKind::Text, "IV_curve");
/// let config = ScanConfig::new(BiasInput::Scalar(-100.0), 1e-6, output);
/// let report = ScanController::iv(smu, config).run().await?;
/// println!("{:?} after {} rows", report.outcome, report.rows_written);
/// ```
pub struct ScanController {
    smu: Arc<dyn SourceMeter>,
    lcr: Option<Arc<dyn LcrMeter>>,
    mode: ScanMode,
    config: ScanConfig,
    trace: StateTrace,
}

impl ScanController {
    /// Current-voltage scan with a source meter
    pub fn iv(smu: Arc<dyn SourceMeter>, config: ScanConfig) -> Self {
        Self {
            smu,
            lcr: None,
            mode: ScanMode::Iv,
            config,
            trace: StateTrace::default(),
        }
    }

    /// Capacitance-voltage scan with a source meter and an LCR meter
    pub fn cv(
        smu: Arc<dyn SourceMeter>,
        lcr: Arc<dyn LcrMeter>,
        settings: CvSettings,
        config: ScanConfig,
    ) -> Self {
        Self {
            smu,
            lcr: Some(lcr),
            mode: ScanMode::Cv(settings),
            config,
            trace: StateTrace::default(),
        }
    }

    /// Kind of sweep
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Run without an operator interrupt.
    pub async fn run(self) -> ScanResult<ScanReport> {
        self.run_until(pending::<()>()).await
    }

    /// Run, treating completion of `interrupt` as the operator's request to stop.
    ///
    /// While lingering an interrupt ends the scan normally. During the sweep it ends
    /// stepping with [`ScanOutcome::Interrupted`]. Teardown always runs to completion.
    ///
    /// If the sweep succeeded but teardown failed, the returned [`ScanError::Teardown`]
    /// carries the [`ScanReport`].
    pub async fn run_until<F>(self, interrupt: F) -> ScanResult<ScanReport>
    where
        F: Future<Output = ()>,
    {
        self.trace.enter(ScanState::Init);
        let bias = self.config.preflight(self.mode)?;
        let (path, session) = match self.open_output(&bias).await {
            Ok(opened) => opened,
            Err(e) => {
                self.release_instruments().await;
                return Err(e);
            }
        };

        tokio::pin!(interrupt);
        let guard = TeardownGuard::arm(self.config.output.identifier.clone());
        let guarded = run_guarded(self.sweep(&bias, session, interrupt.as_mut()), || {
            self.teardown()
        })
        .await;
        guard.complete();

        let trace = self.trace;
        let guarded = guarded.map(|summary| {
            match summary.outcome {
                ScanOutcome::Completed => info!(rows = summary.rows_written, "Scan completed"),
                ScanOutcome::Aborted { bias, current } => {
                    info!(rows = summary.rows_written, bias, current, "Scan aborted by interlock")
                }
                ScanOutcome::Interrupted => {
                    info!(rows = summary.rows_written, "Scan interrupted by operator")
                }
            }
            ScanReport {
                outcome: summary.outcome,
                rows_written: summary.rows_written,
                linger_rows: summary.linger_rows,
                linger_interrupted: summary.linger_interrupted,
                states: trace.into_inner(),
                path,
            }
        });

        match guarded {
            Guarded {
                body: Ok(report),
                teardown: Err(e),
            } => {
                error!(outcome = ?report.outcome, "Return to a safe state failed: {e}");
                Err(ScanError::Teardown {
                    source: Box::new(e),
                    report: Some(Box::new(report)),
                })
            }
            other => other.merge(),
        }
    }

    async fn open_output(&self, bias: &BiasSequence) -> ScanResult<(PathBuf, WriterSession)> {
        let writer = self.data_writer(bias).await?;
        let path = writer.path().to_path_buf();
        Ok((path, writer.open()?))
    }

    async fn data_writer(&self, bias: &BiasSequence) -> ScanResult<DataWriter> {
        let output = &self.config.output;
        let comments = match &output.comments {
            Some(comments) => comments.clone(),
            None => self.default_comments(bias).await?,
        };
        DataWriter::new(self.config.writer_config(self.mode, comments))
    }

    /// Release the instruments when the scan fails before the source was touched.
    async fn release_instruments(&self) {
        if let Err(e) = self.smu.release().await {
            warn!("Failed to release source meter: {e:#}");
        }
        if let Some(lcr) = &self.lcr {
            if let Err(e) = lcr.release().await {
                warn!("Failed to release LCR meter: {e:#}");
            }
        }
    }

    async fn default_comments(&self, bias: &BiasSequence) -> ScanResult<Vec<String>> {
        let mut comments = vec![format!("SMU: {}", self.smu.name().await?)];
        if let (Some(lcr), ScanMode::Cv(cv)) = (&self.lcr, self.mode) {
            comments.push(format!("LCR meter: {}", lcr.name().await?));
            comments.push(format!(
                "AC voltage: {} V @ {} Hz",
                cv.ac_voltage, cv.ac_frequency
            ));
        }
        comments.push(format!("Current limit: {:.2E} A", self.config.current_limit));
        comments.push(format!(
            "Measurements per voltage step: {}",
            self.config.n_meas
        ));
        comments.push(bias.describe());
        Ok(comments)
    }

    async fn sweep<F>(
        &self,
        bias: &BiasSequence,
        mut session: WriterSession,
        mut interrupt: Pin<&mut F>,
    ) -> ScanResult<SweepSummary>
    where
        F: Future<Output = ()>,
    {
        if let (Some(lcr), ScanMode::Cv(cv)) = (&self.lcr, self.mode) {
            lcr.set_ac_voltage(AcLevel::Volts(cv.ac_voltage)).await?;
            lcr.set_ac_frequency(cv.ac_frequency).await?;
            lcr.select_function(ImpedanceFunction::CpRp).await?;
            lcr.set_trigger_mode(TriggerMode::Internal).await?;
        }
        prepare_voltage_source(self.smu.as_ref(), bias, self.config.current_limit).await?;

        self.trace.enter(ScanState::RampingToFirst);
        ramp_voltage(
            self.smu.as_ref(),
            bias.first(),
            self.config.timing.ramp_step,
            self.config.steps,
        )
        .await?;

        self.trace.enter(ScanState::Stepping);
        let mut outcome = ScanOutcome::Completed;
        for (index, volts) in bias.iter().enumerate() {
            let step = tokio::select! {
                _ = interrupt.as_mut() => None,
                result = self.step(volts, &mut session) => Some(result?),
            };
            match step {
                None => {
                    warn!(bias = volts, "Scan interrupted by operator");
                    self.drain_input().await;
                    outcome = ScanOutcome::Interrupted;
                    break;
                }
                Some(StepResult::Tripped { current }) => {
                    outcome = ScanOutcome::Aborted {
                        bias: volts,
                        current,
                    };
                    break;
                }
                Some(StepResult::Measured) => {
                    let progress = index + 1;
                    if self.config.log_progress {
                        info!(step = progress, total = bias.len(), bias = volts, "Bias step done");
                    } else {
                        debug!(step = progress, total = bias.len(), bias = volts, "Bias step done");
                    }
                }
            }
        }

        let sweep_rows = session.rows_written();
        let mut linger_interrupted = false;
        if outcome == ScanOutcome::Completed && self.config.linger != Linger::Off {
            self.trace.enter(ScanState::Lingering);
            let (tripped, interrupted) = self.linger(bias.last(), &mut session, interrupt).await?;
            if let Some(current) = tripped {
                outcome = ScanOutcome::Aborted {
                    bias: bias.last(),
                    current,
                };
            }
            linger_interrupted = interrupted;
        }

        let rows_written = session.rows_written();
        session.close()?;
        Ok(SweepSummary {
            outcome,
            rows_written,
            linger_rows: rows_written - sweep_rows,
            linger_interrupted,
        })
    }

    /// Set `volts`, check the interlock, settle, measure and write one row.
    async fn step(&self, volts: f64, session: &mut WriterSession) -> ScanResult<StepResult> {
        self.smu.set_voltage(volts).await?;
        let current = self.smu.get_current().await?;
        if self.tripped(current) {
            return Ok(StepResult::Tripped { current });
        }

        sleep(self.config.timing.settle).await;
        let reading = self.measure().await?;
        self.write_reading(volts, &reading, session)?;
        Ok(StepResult::Measured)
    }

    fn tripped(&self, current: f64) -> bool {
        let magnitude = current.abs();
        let over = magnitude > self.config.current_limit && magnitude < OVERFLOW_SENTINEL;
        if over {
            warn!(
                current,
                limit = self.config.current_limit,
                "Current limit exceeded with {:.2E} A. Abort.",
                current
            );
        }
        over
    }

    async fn measure(&self) -> ScanResult<Reading> {
        let n = self.config.n_meas;
        let mut reading = Reading {
            current: Vec::with_capacity(n),
            cp: Vec::with_capacity(n),
            rp: Vec::with_capacity(n),
        };
        for _ in 0..n {
            reading.current.push(self.smu.get_current().await?);
            if let Some(lcr) = &self.lcr {
                let (cp, rp) = lcr.measure().await?;
                reading.cp.push(cp);
                reading.rp.push(rp);
            }
            if n > 1 {
                sleep(self.config.timing.measurement).await;
            }
        }
        Ok(reading)
    }

    fn write_reading(
        &self,
        volts: f64,
        reading: &Reading,
        session: &mut WriterSession,
    ) -> ScanResult<()> {
        let mut row: Vec<(&str, f64)> = vec![("timestamp", unix_timestamp()), ("bias", volts)];
        let cv = matches!(self.mode, ScanMode::Cv(_));

        if self.config.n_meas == 1 {
            row.push(("current", reading.current[0]));
            if cv {
                row.push(("cp", reading.cp[0]));
                row.push(("rp", reading.rp[0]));
            }
        } else {
            let (mean, std) = mean_std(&reading.current);
            row.push(("mean_current", mean));
            row.push(("std_current", std));
            if cv {
                let (mean, std) = mean_std(&reading.cp);
                row.push(("mean_cp", mean));
                row.push(("std_cp", std));
                let (mean, std) = mean_std(&reading.rp);
                row.push(("mean_rp", mean));
                row.push(("std_rp", std));
            }
        }

        session.write_row(RowData::named(row))
    }

    /// Re-measure at `volts` until the deadline, the interlock or the interrupt.
    ///
    /// Returns the tripping current, if any, and whether the operator interrupted.
    async fn linger<F>(
        &self,
        volts: f64,
        session: &mut WriterSession,
        mut interrupt: Pin<&mut F>,
    ) -> ScanResult<(Option<f64>, bool)>
    where
        F: Future<Output = ()>,
    {
        let deadline = match self.config.linger {
            Linger::For(duration) => Some(Instant::now() + duration),
            Linger::Indefinite | Linger::Off => None,
        };
        info!(bias = volts, ?deadline, "Lingering at final bias");

        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!(rows = session.rows_written(), "Lingering finished");
                return Ok((None, false));
            }

            let tick = tokio::select! {
                _ = interrupt.as_mut() => None,
                result = self.linger_tick(volts, session) => Some(result?),
            };
            match tick {
                None => {
                    info!("Lingering interrupted by operator");
                    self.drain_input().await;
                    return Ok((None, true));
                }
                Some(StepResult::Tripped { current }) => return Ok((Some(current), false)),
                Some(StepResult::Measured) => {}
            }
        }
    }

    async fn linger_tick(&self, volts: f64, session: &mut WriterSession) -> ScanResult<StepResult> {
        sleep(self.config.timing.linger_interval).await;
        let current = self.smu.get_current().await?;
        if self.tripped(current) {
            return Ok(StepResult::Tripped { current });
        }
        let reading = self.measure().await?;
        self.write_reading(volts, &reading, session)?;
        Ok(StepResult::Measured)
    }

    /// Discard unread instrument output left by a cancelled exchange.
    async fn drain_input(&self) {
        if self.smu.supports(Capability::ClearInput) {
            if let Err(e) = self.smu.clear_input().await {
                warn!("Failed to clear instrument input: {e:#}");
            }
        }
    }

    async fn teardown(&self) -> ScanResult<()> {
        self.trace.enter(ScanState::RampingToZero);
        let mut log = TeardownLog::new();
        let smu = self.smu.as_ref();

        if let Some(lcr) = &self.lcr {
            log.record(
                "ac level",
                lcr.set_ac_voltage(AcLevel::Min).await.map_err(ScanError::from),
            );
        }

        if smu.supports(Capability::ReadVoltage) && smu.supports(Capability::SetVoltage) {
            log.record(
                "ramp to zero",
                ramp_voltage(smu, 0.0, self.config.timing.ramp_step, self.config.steps).await,
            );
        } else if smu.supports(Capability::SetVoltage) {
            log.record(
                "zero voltage",
                smu.set_voltage(0.0).await.map_err(ScanError::from),
            );
        }

        if smu.supports(Capability::PowerSwitch) {
            log.record("output off", smu.off().await.map_err(ScanError::from));
        }

        log.record("release source meter", smu.release().await.map_err(ScanError::from));
        if let Some(lcr) = &self.lcr {
            log.record("release lcr meter", lcr.release().await.map_err(ScanError::from));
        }

        self.trace.enter(ScanState::Closed);
        log.finish()
    }
}
