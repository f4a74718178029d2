//! End-to-end scan scenarios against mock instruments
//!
//! Delays run on tokio's paused clock, so a scan with realistic settle and ramp
//! timing completes instantly while still exercising every sleep.

use bias_scan::config::{ScanSettings, Timing};
use bias_scan::error::{ErrorKind, ScanError};
use bias_scan::hardware::mock::MockSourceMeter;
use bias_scan::hardware::InstrumentRegistry;
use bias_scan::scan::{
    generate, BiasInput, Linger, OutputSpec, Polarity, ScanConfig, ScanController, ScanOutcome,
    ScanState,
};
use bias_scan::storage::OutputKind;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

fn iv_config(dir: &Path, bias: BiasInput, steps: Option<usize>) -> ScanConfig {
    let output = OutputSpec::new(dir.join("iv"), OutputKind::Text, "IV_curve");
    let mut config = ScanConfig::new(bias, 1e-6, output);
    config.steps = steps;
    config
}

fn data_rows(path: &Path) -> Vec<Vec<f64>> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(|line| {
            line.split(',')
                .map(|field| field.trim_matches('"').parse::<f64>().unwrap())
                .collect()
        })
        .collect()
}

// =============================================================================
// Interlock
// =============================================================================

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_interlock_aborts_after_three_rows() {
    let bias = generate(&BiasInput::Scalar(5.0), Some(6), Polarity::Positive, true).unwrap();
    assert_eq!(bias.as_slice(), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);

    let dir = tempfile::tempdir().unwrap();
    let smu = Arc::new(MockSourceMeter::new().with_current_at(3.0, 2e-6));
    let config = iv_config(dir.path(), BiasInput::Scalar(5.0), Some(6));

    let report = ScanController::iv(smu.clone(), config).run().await.unwrap();

    assert_eq!(
        report.outcome,
        ScanOutcome::Aborted {
            bias: 3.0,
            current: 2e-6
        }
    );
    assert_eq!(report.rows_written, 3);
    let biases: Vec<f64> = data_rows(&report.path).iter().map(|r| r[1]).collect();
    assert_eq!(biases, vec![0.0, 1.0, 2.0]);

    // Nothing above the trip point was ever applied, and the source ended at 0 V
    let history = smu.voltage_history();
    assert!(history.iter().all(|v| *v <= 3.0));
    assert_eq!(history.last(), Some(&0.0));
    assert!(!smu.output_on());
    assert!(smu.released());

    assert_eq!(
        report.states,
        vec![
            ScanState::Init,
            ScanState::RampingToFirst,
            ScanState::Stepping,
            ScanState::RampingToZero,
            ScanState::Closed,
        ]
    );
    assert!(logs_contain("Current limit exceeded with 2.00E-6 A. Abort."));
}

#[tokio::test(start_paused = true)]
async fn test_teardown_ramp_uses_sweep_step_budget() {
    let dir = tempfile::tempdir().unwrap();
    let smu = Arc::new(MockSourceMeter::new());
    let mut config = iv_config(dir.path(), BiasInput::Scalar(10.0), Some(3));
    config.timing = Timing::immediate();

    let report = ScanController::iv(smu.clone(), config).run().await.unwrap();
    assert_eq!(report.outcome, ScanOutcome::Completed);

    // prepare: 0, sweep: 0, 5, 10, teardown: 3 points from 10 V back to 0 V
    assert_eq!(smu.voltage_history(), vec![0.0, 0.0, 5.0, 10.0, 5.0, 0.0]);
}

#[tokio::test(start_paused = true)]
async fn test_scan_timing_follows_settings() {
    let dir = tempfile::tempdir().unwrap();
    let smu = Arc::new(MockSourceMeter::new());
    let mut config = iv_config(dir.path(), BiasInput::values([0.0, 1.0, 2.0]), None);
    config.timing = Timing {
        settle: Duration::from_secs(2),
        measurement: Duration::from_millis(100),
        ramp_step: Duration::from_secs(1),
        linger_interval: Duration::from_secs(1),
    };

    let started = tokio::time::Instant::now();
    ScanController::iv(smu, config).run().await.unwrap();

    // three settles of 2 s, then a 2 V ramp down in 3 steps of 1 s
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(9) && elapsed < Duration::from_millis(9050),
        "Expected ~9s, got {elapsed:?}"
    );
}

// =============================================================================
// Teardown guarantees
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_output_switched_off_even_if_ramp_fails() {
    let dir = tempfile::tempdir().unwrap();
    let smu = Arc::new(MockSourceMeter::new().with_stuck_voltage(50.0));
    let mut config = iv_config(dir.path(), BiasInput::Scalar(5.0), None);
    config.timing = Timing::immediate();

    let err = ScanController::iv(smu.clone(), config).run().await.unwrap_err();

    // The sweep's own failure is reported, not the failed return to zero
    assert!(matches!(err, ScanError::Convergence { .. }));
    assert!(smu.get_call_log().contains(&"off".to_string()));
    assert!(!smu.output_on());
    assert!(smu.released());
}

#[tokio::test(start_paused = true)]
async fn test_teardown_error_after_clean_sweep_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let smu = Arc::new(MockSourceMeter::new().fail_on("off"));
    let mut config = iv_config(dir.path(), BiasInput::Scalar(2.0), None);
    config.timing = Timing::immediate();

    let err = ScanController::iv(smu.clone(), config).run().await.unwrap_err();

    assert!(matches!(err, ScanError::Teardown { .. }));
    assert_eq!(err.kind(), ErrorKind::Device);
    assert_eq!(smu.output_voltage(), 0.0);
    assert!(smu.released());
    // rows were persisted before teardown
    assert_eq!(data_rows(&dir.path().join("iv.csv")).len(), 3);
    let report = err.report().expect("sweep report kept");
    assert_eq!(report.outcome, ScanOutcome::Completed);
    assert_eq!(report.rows_written, 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_return_to_zero_keeps_interlock_outcome() {
    let dir = tempfile::tempdir().unwrap();
    // the first reading (ramp to the first point) is honest, then the source sticks at 40 V
    let smu = Arc::new(
        MockSourceMeter::new()
            .with_current_at(3.0, 2e-6)
            .with_stuck_voltage_after(1, 40.0),
    );
    let mut config = iv_config(dir.path(), BiasInput::Scalar(5.0), Some(6));
    config.timing = Timing::immediate();

    let err = ScanController::iv(smu.clone(), config).run().await.unwrap_err();

    match &err {
        ScanError::Teardown { source, .. } => assert!(matches!(
            **source,
            ScanError::Convergence {
                target: 0.0,
                actual: 40.0
            }
        )),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Convergence);

    let report = err.report().expect("sweep report kept");
    assert_eq!(
        report.outcome,
        ScanOutcome::Aborted {
            bias: 3.0,
            current: 2e-6
        }
    );
    assert_eq!(report.rows_written, 3);
    assert_eq!(report.states.last(), Some(&ScanState::Closed));
    assert_eq!(data_rows(&report.path).len(), 3);

    // power-off and release still ran
    assert!(!smu.output_on());
    assert!(smu.released());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_error_wins_over_teardown_error() {
    let dir = tempfile::tempdir().unwrap();
    let smu = Arc::new(
        MockSourceMeter::new()
            .fail_on("get_current")
            .fail_on("off"),
    );
    let mut config = iv_config(dir.path(), BiasInput::Scalar(2.0), None);
    config.timing = Timing::immediate();

    let err = ScanController::iv(smu.clone(), config).run().await.unwrap_err();

    assert!(matches!(err, ScanError::Device(_)));
    assert!(err.report().is_none());
    assert_eq!(smu.output_voltage(), 0.0);
    assert!(smu.released());
}

// =============================================================================
// Lingering and interrupts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_interrupt_during_sweep_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let smu = Arc::new(MockSourceMeter::new());
    let mut config = iv_config(dir.path(), BiasInput::Scalar(10.0), Some(11));
    config.timing = Timing::immediate();
    config.timing.settle = Duration::from_secs(1);

    let report = ScanController::iv(smu.clone(), config)
        .run_until(tokio::time::sleep(Duration::from_millis(3500)))
        .await
        .unwrap();

    assert_eq!(report.outcome, ScanOutcome::Interrupted);
    assert_eq!(report.rows_written, 3);
    assert!(smu.get_call_log().contains(&"clear_input".to_string()));
    assert_eq!(smu.output_voltage(), 0.0);
    assert!(!smu.output_on());
}

#[tokio::test(start_paused = true)]
async fn test_interlock_during_linger_ends_scan() {
    let dir = tempfile::tempdir().unwrap();
    // leakage grows with time spent at the final bias
    let reads = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = reads.clone();
    let smu = Arc::new(MockSourceMeter::new().with_current_model(move |v| {
        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n >= 8 {
            5e-6
        } else {
            v * 1e-9
        }
    }));
    let mut config = iv_config(dir.path(), BiasInput::Scalar(2.0), None);
    config.timing = Timing::immediate();
    config.timing.linger_interval = Duration::from_secs(1);
    config.linger = Linger::Indefinite;

    let report = ScanController::iv(smu.clone(), config).run().await.unwrap();

    // 3 bias points use 6 reads, one linger row uses 2 more, the next check trips
    assert_eq!(
        report.outcome,
        ScanOutcome::Aborted {
            bias: 2.0,
            current: 5e-6
        }
    );
    assert_eq!(report.linger_rows, 1);
    assert!(!report.linger_interrupted);
    assert_eq!(smu.output_voltage(), 0.0);
}

// =============================================================================
// Instruments from settings
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_scan_with_instrument_from_settings() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(
        br#"
        [timing]
        settle = "0s"
        ramp_step = "0s"

        [[instruments]]
        name = "Sourcemeter"
        type = "mock_smu"
        options = { leakage = 1e-9, trip_voltage = -3.0, trip_current = -4e-6 }

        [[instruments]]
        name = "Spare"
        type = "mock_smu"
        enabled = false
        "#,
    )
    .unwrap();

    let settings = ScanSettings::load_from(file.path()).unwrap();
    settings.validate().unwrap();
    let registry = InstrumentRegistry::from_settings(&settings).unwrap();
    let smu = registry.open_source_meter(None).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut config = iv_config(dir.path(), BiasInput::Scalar(5.0), Some(6));
    config.polarity = Polarity::Negative;
    config.timing = settings.timing;

    let report = ScanController::iv(smu, config).run().await.unwrap();
    assert_eq!(report.rows_written, 3);
    assert!(matches!(report.outcome, ScanOutcome::Aborted { .. }));
}
