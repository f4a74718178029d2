//! CLI entry point for bias-scan
//!
//! Runs IV and CV scans against the instruments defined in a settings file.
//!
//! # Usage
//!
//! IV scan to -200 V in 5 V steps:
//! ```bash
//! bias-scan --config config/bias_scan.toml iv --output data/diode_iv \
//!     --bias 200 --polarity -1 --steps 41 --current-limit 1e-6
//! ```
//!
//! CV scan over explicit points, lingering at the last one until Ctrl-C:
//! ```bash
//! bias-scan cv --output data/diode_cv --bias 0,5,10,20,40 --current-limit 20e-6 \
//!     --ac-voltage 0.5 --ac-frequency 10000 --linger
//! ```

use anyhow::{Context, Result};
use bias_scan::config::ScanSettings;
use bias_scan::error::ScanResult;
use bias_scan::hardware::{InstrumentRegistry, SourceMeter};
use bias_scan::logging;
use bias_scan::scan::{
    BiasInput, CvSettings, Linger, OutputSpec, Polarity, ScanConfig, ScanController, ScanMode,
    ScanOutcome, ScanReport,
};
use bias_scan::storage::OutputKind;
use clap::{Args, Parser, Subcommand};
use std::future::pending;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bias-scan")]
#[command(about = "IV/CV bias scans with a current-limit interlock", long_about = None)]
struct Cli {
    /// Settings file (TOML); BIAS_SCAN_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Current-voltage scan
    Iv {
        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Capacitance-voltage scan with an LCR meter
    Cv {
        #[command(flatten)]
        scan: ScanArgs,

        /// LCR meter name from the settings file
        #[arg(long)]
        lcr: Option<String>,

        /// AC level in volts
        #[arg(long)]
        ac_voltage: f64,

        /// AC frequency in hertz
        #[arg(long)]
        ac_frequency: f64,
    },

    /// List compiled-in output formats
    Formats,
}

#[derive(Args)]
struct ScanArgs {
    /// Output file; the extension follows the format
    #[arg(long)]
    output: PathBuf,

    /// Output format (csv, arrow); defaults to the settings file
    #[arg(long)]
    format: Option<String>,

    /// Bias endpoint in volts, or a comma separated list of voltages
    #[arg(long, allow_hyphen_values = true)]
    bias: String,

    /// Number of bias points of a scalar sweep and of the ramps
    #[arg(long)]
    steps: Option<usize>,

    /// Sign of the bias (1 or -1)
    #[arg(long, default_value_t = 1.0, allow_negative_numbers = true)]
    polarity: f64,

    /// Interlock threshold in amperes
    #[arg(long)]
    current_limit: f64,

    /// Measurements per bias point; above 1 rows hold mean and standard deviation
    #[arg(long, default_value_t = 1)]
    n_meas: usize,

    /// Source meter name from the settings file
    #[arg(long)]
    smu: Option<String>,

    /// Keep measuring at the final bias, for SECONDS or until Ctrl-C
    #[arg(long, value_name = "SECONDS", num_args = 0..=1, require_equals = true)]
    linger: Option<Option<f64>>,

    /// Log every bias step at info level
    #[arg(long)]
    log_progress: bool,

    /// Replace an existing output file
    #[arg(long)]
    overwrite: bool,

    /// Accept explicit bias lists that are not monotonic
    #[arg(long)]
    no_monotonic_check: bool,

    /// Data set label written to the file
    #[arg(long)]
    identifier: Option<String>,

    /// Comment line for the file header (repeatable); replaces the generated description
    #[arg(long = "comment")]
    comments: Vec<String>,
}

impl ScanArgs {
    fn linger(&self) -> Result<Linger> {
        match self.linger {
            None => Ok(Linger::Off),
            Some(None) => Ok(Linger::Indefinite),
            Some(Some(seconds)) => Duration::try_from_secs_f64(seconds)
                .map(Linger::For)
                .with_context(|| format!("Invalid linger duration: {seconds}")),
        }
    }

    fn scan_config(&self, settings: &ScanSettings, default_identifier: &str) -> Result<ScanConfig> {
        let kind = match &self.format {
            Some(format) => format.parse::<OutputKind>()?,
            None => settings.output.kind()?,
        };
        let path = if self.output.is_relative() {
            settings.output.directory.join(&self.output)
        } else {
            self.output.clone()
        };

        let mut output = OutputSpec::new(
            path,
            kind,
            self.identifier.as_deref().unwrap_or(default_identifier),
        );
        output.overwrite = self.overwrite || settings.output.overwrite;
        if !self.comments.is_empty() {
            output.comments = Some(self.comments.clone());
        }

        let mut config = ScanConfig::new(self.bias.parse::<BiasInput>()?, self.current_limit, output);
        config.steps = self.steps;
        config.polarity = Polarity::from_sign(self.polarity);
        config.check_monotonic = !self.no_monotonic_check;
        config.n_meas = self.n_meas;
        config.linger = self.linger()?;
        config.log_progress = self.log_progress;
        config.timing = settings.timing;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => ScanSettings::load_from(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => ScanSettings::load_env_only()?,
    };
    settings.validate()?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Iv { scan } => run_iv(&settings, scan).await,
        Commands::Cv {
            scan,
            lcr,
            ac_voltage,
            ac_frequency,
        } => {
            let cv = CvSettings {
                ac_voltage,
                ac_frequency,
            };
            run_cv(&settings, scan, lcr, cv).await
        }
        Commands::Formats => {
            list_formats();
            Ok(())
        }
    }
}

async fn run_iv(settings: &ScanSettings, args: ScanArgs) -> Result<()> {
    let config = args.scan_config(settings, "IV_curve")?;
    config.preflight(ScanMode::Iv)?;
    let registry = InstrumentRegistry::from_settings(settings)?;
    let smu = registry.open_source_meter(args.smu.as_deref()).await?;

    let result = ScanController::iv(smu, config)
        .run_until(operator_interrupt())
        .await;
    finish(result)
}

async fn run_cv(
    settings: &ScanSettings,
    args: ScanArgs,
    lcr_name: Option<String>,
    cv: CvSettings,
) -> Result<()> {
    let config = args.scan_config(settings, "CV_curve")?;
    config.preflight(ScanMode::Cv(cv))?;
    let registry = InstrumentRegistry::from_settings(settings)?;
    let smu = registry.open_source_meter(args.smu.as_deref()).await?;
    let lcr = match registry.open_lcr_meter(lcr_name.as_deref()).await {
        Ok(lcr) => lcr,
        Err(e) => {
            if let Err(release) = smu.release().await {
                warn!("Failed to release source meter: {release:#}");
            }
            return Err(e.into());
        }
    };

    let result = ScanController::cv(smu, lcr, cv, config)
        .run_until(operator_interrupt())
        .await;
    finish(result)
}

/// Summarize the scan, including one whose return to 0 V failed, and pass on any error.
fn finish(result: ScanResult<ScanReport>) -> Result<()> {
    match result {
        Ok(report) => {
            summarize(&report);
            Ok(())
        }
        Err(e) => {
            if let Some(report) = e.report() {
                summarize(report);
            }
            Err(e.into())
        }
    }
}

/// Completes on Ctrl-C. Never completes if the signal handler cannot be installed.
async fn operator_interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl-C handler unavailable: {e}");
        pending::<()>().await;
    }
}

fn summarize(report: &ScanReport) {
    match report.outcome {
        ScanOutcome::Completed => info!("Scan completed"),
        ScanOutcome::Aborted { bias, current } => {
            warn!("Scan aborted at {bias} V: current {current:.2E} A above limit")
        }
        ScanOutcome::Interrupted => warn!("Scan interrupted before the last bias point"),
    }
    if report.linger_rows > 0 {
        info!(
            "Lingered for {} rows{}",
            report.linger_rows,
            if report.linger_interrupted {
                " (stopped by operator)"
            } else {
                ""
            }
        );
    }
    println!(
        "{} rows written to {}",
        report.rows_written,
        report.path.display()
    );
}

fn list_formats() {
    println!("Output formats:");
    for kind in OutputKind::all() {
        let status = if kind.is_enabled() {
            "enabled".to_string()
        } else {
            format!("disabled (build with --features {})", kind.feature())
        };
        println!("  {:<6} .{:<6} {}", kind.to_string(), kind.extension(), status);
    }
}
