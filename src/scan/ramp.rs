//! Voltage ramping and voltage-source preparation.
//!
//! A ramp walks the source from its present reading to a target in evenly spaced steps,
//! pausing after each step, and verifies the final reading. It is used to reach the first
//! bias point and to return to 0 V during teardown, so it must be safe to call repeatedly
//! and after an earlier ramp failed.

use crate::error::{ScanError, ScanResult};
use anyhow::anyhow;
use crate::hardware::capabilities::{Capability, SourceMeter};
use crate::scan::bias::{bounded_points, linspace, BiasSequence};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

/// Largest accepted deviation from the target after ramping, in volts
pub const DEFAULT_TOLERANCE: f64 = 1.0;

/// Step delay used when an already enabled source is brought to 0 V before a scan
pub const PREPARE_RAMP_DELAY: Duration = Duration::from_millis(200);

/// Number of points on the path from `from` to `to`.
///
/// With `steps`, at least 2. Otherwise one point per volt of difference plus both endpoints.
/// Fails for paths longer than [`MAX_POINTS`](crate::scan::bias::MAX_POINTS) or a non-finite difference.
pub fn ramp_points(from: f64, to: f64, steps: Option<usize>) -> ScanResult<usize> {
    match steps {
        Some(n) => bounded_points(n.max(2) as f64),
        None => bounded_points((to - from).abs().floor() + 2.0),
    }
}

/// Builder for a single ramp
///
/// # Example
///
/// ```rust,ignore
/// VoltageRamp::to(0.0)
///     .delay(Duration::from_millis(500))
///     .steps(Some(21))
///     .run(smu.as_ref())
///     .await?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageRamp {
    target: f64,
    delay: Duration,
    steps: Option<usize>,
    tolerance: f64,
}

impl VoltageRamp {
    /// Ramp to `target` with a 1 s step delay and one step per volt
    pub fn to(target: f64) -> Self {
        Self {
            target,
            delay: Duration::from_secs(1),
            steps: None,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Wait after each step
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fixed number of path points, endpoints included
    pub fn steps(mut self, steps: Option<usize>) -> Self {
        self.steps = steps;
        self
    }

    /// Accepted deviation from the target after the ramp
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Drive `device` to the target.
    ///
    /// Returns without any write if the device already reads the target.
    pub async fn run(&self, device: &dyn SourceMeter) -> ScanResult<()> {
        for capability in [Capability::ReadVoltage, Capability::SetVoltage] {
            if !device.supports(capability) {
                return Err(ScanError::unsupported(capability));
            }
        }

        if device.supports(Capability::PowerState)
            && device.supports(Capability::PowerSwitch)
            && !device.is_on().await?
        {
            debug!("Source output is off, switching on before ramping");
            device.on().await?;
        }

        let start = device.get_voltage().await?;
        if !start.is_finite() {
            return Err(ScanError::Device(anyhow!(
                "Source meter reported a non-finite voltage: {start}"
            )));
        }
        if start == self.target {
            debug!(voltage = start, "Already at target voltage");
            return Ok(());
        }

        let path = linspace(start, self.target, ramp_points(start, self.target, self.steps)?);
        info!(
            from = start,
            to = self.target,
            steps = path.len() - 1,
            "Ramping voltage to {} V",
            self.target
        );

        for volts in path.iter().skip(1) {
            device.set_voltage(*volts).await?;
            debug!(voltage = *volts, "Ramp step");
            sleep(self.delay).await;
        }

        let reached = device.get_voltage().await?;
        if (reached - self.target).abs() > self.tolerance {
            return Err(ScanError::Convergence {
                target: self.target,
                actual: reached,
            });
        }
        Ok(())
    }
}

/// Ramp `device` to `target` with the default tolerance.
pub async fn ramp_voltage(
    device: &dyn SourceMeter,
    target: f64,
    delay: Duration,
    steps: Option<usize>,
) -> ScanResult<()> {
    VoltageRamp::to(target)
        .delay(delay)
        .steps(steps)
        .run(device)
        .await
}

/// Put the source into a known state before a sweep.
///
/// Selects voltage sourcing, sets the compliance limit and the range covering the largest
/// bias. An output that is already on is ramped to 0 V; otherwise 0 V is programmed and
/// the output switched on. Each step runs only if the device declares it.
pub async fn prepare_voltage_source(
    device: &dyn SourceMeter,
    bias: &BiasSequence,
    current_limit: f64,
) -> ScanResult<()> {
    if device.supports(Capability::VoltageSourceMode) {
        device.source_voltage_mode().await?;
    }
    if device.supports(Capability::CurrentLimit) {
        device.set_current_limit(current_limit).await?;
    }
    if device.supports(Capability::VoltageRange) {
        device.set_voltage_range(bias.max_abs()).await?;
    }

    let already_on = if device.supports(Capability::PowerState) {
        device.is_on().await?
    } else {
        false
    };

    if already_on {
        info!("Source output already on, ramping to 0 V");
        ramp_voltage(device, 0.0, PREPARE_RAMP_DELAY, None).await
    } else {
        if device.supports(Capability::SetVoltage) {
            device.set_voltage(0.0).await?;
        }
        if device.supports(Capability::PowerSwitch) {
            device.on().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hardware::capabilities::CapabilitySet;
    use crate::hardware::mock::MockSourceMeter;
    use crate::scan::bias::{generate, BiasInput, Polarity};

    fn assert_elapsed(started: tokio::time::Instant, expected: Duration) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(20),
            "expected ~{expected:?}, got {elapsed:?}"
        );
    }

    #[test]
    fn point_counts() {
        assert_eq!(ramp_points(0.0, 10.0, None).unwrap(), 12);
        assert_eq!(ramp_points(3.0, 2.5, None).unwrap(), 2);
        assert_eq!(ramp_points(0.0, 10.0, Some(1)).unwrap(), 2);
        assert_eq!(ramp_points(0.0, 10.0, Some(6)).unwrap(), 6);
    }

    #[test]
    fn point_counts_are_bounded() {
        assert!(ramp_points(0.0, f64::INFINITY, None).is_err());
        assert!(ramp_points(f64::NEG_INFINITY, 0.0, None).is_err());
        assert!(ramp_points(0.0, 1e12, None).is_err());
        assert!(ramp_points(0.0, 1.0, Some(usize::MAX)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_at_target_makes_no_writes() {
        let smu = MockSourceMeter::new().with_voltage(-50.0).with_output_on(true);
        ramp_voltage(&smu, -50.0, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert!(smu.voltage_history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_walks_evenly_to_target() {
        let smu = MockSourceMeter::new().with_output_on(true);
        let started = tokio::time::Instant::now();
        ramp_voltage(&smu, 10.0, Duration::from_secs(1), Some(6))
            .await
            .unwrap();

        assert_eq!(smu.voltage_history(), vec![2.0, 4.0, 6.0, 8.0, 10.0]);
        assert_elapsed(started, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_switches_output_on_first() {
        let smu = MockSourceMeter::new();
        ramp_voltage(&smu, 2.0, Duration::ZERO, None).await.unwrap();
        let log = smu.get_call_log();
        assert_eq!(log[0], "is_on");
        assert_eq!(log[1], "on");
        assert!(smu.output_on());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_source_fails_convergence() {
        let smu = MockSourceMeter::new()
            .with_output_on(true)
            .with_stuck_voltage(5.0);
        let err = ramp_voltage(&smu, 0.0, Duration::ZERO, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Convergence);

        // Within tolerance is accepted
        let smu = MockSourceMeter::new()
            .with_output_on(true)
            .with_stuck_voltage(0.8);
        assert!(ramp_voltage(&smu, 0.0, Duration::ZERO, None).await.is_ok());
    }

    #[tokio::test]
    async fn overflowed_reading_is_rejected_without_writes() {
        let smu = MockSourceMeter::new()
            .with_output_on(true)
            .with_stuck_voltage(f64::INFINITY);
        let err = ramp_voltage(&smu, 0.0, Duration::ZERO, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert!(smu.voltage_history().is_empty());
    }

    #[tokio::test]
    async fn ramp_requires_voltage_access() {
        let smu = MockSourceMeter::new()
            .with_capabilities(CapabilitySet::empty().with(Capability::ReadCurrent));
        let err = ramp_voltage(&smu, 1.0, Duration::ZERO, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Unsupported { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_configures_and_switches_on() {
        let smu = MockSourceMeter::new().with_voltage(3.0);
        let bias = generate(&BiasInput::Scalar(100.0), Some(11), Polarity::Negative, true).unwrap();
        prepare_voltage_source(&smu, &bias, 1e-6).await.unwrap();

        assert!(smu.in_voltage_mode());
        assert_eq!(smu.current_limit(), Some(1e-6));
        assert_eq!(smu.voltage_range(), Some(100.0));
        assert_eq!(smu.output_voltage(), 0.0);
        assert!(smu.output_on());
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_ramps_down_live_output() {
        let smu = MockSourceMeter::new().with_voltage(3.0).with_output_on(true);
        let bias = generate(&BiasInput::Scalar(5.0), None, Polarity::Positive, true).unwrap();
        let started = tokio::time::Instant::now();
        prepare_voltage_source(&smu, &bias, 1e-6).await.unwrap();

        assert_eq!(smu.voltage_history(), vec![2.25, 1.5, 0.75, 0.0]);
        assert_elapsed(started, PREPARE_RAMP_DELAY * 4);
    }

    #[tokio::test]
    async fn prepare_skips_missing_capabilities() {
        let smu = MockSourceMeter::new().with_capabilities(CapabilitySet::basic());
        let bias = generate(&BiasInput::Scalar(5.0), None, Polarity::Positive, true).unwrap();
        prepare_voltage_source(&smu, &bias, 1e-6).await.unwrap();
        assert_eq!(smu.get_call_log(), vec!["set_voltage 0"]);
    }
}
