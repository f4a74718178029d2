//! Guaranteed teardown around a scan body.
//!
//! Hardware must be returned to 0 V whether the sweep finished, failed or panicked:
//!
//! - [`run_guarded`] runs the sweep, then always runs the teardown, and keeps both results
//! - [`with_teardown`] does the same and merges the results into one
//! - [`TeardownGuard`] logs loudly if the scan future is dropped before teardown completed
//! - [`TeardownLog`] runs best-effort teardown steps and keeps the first failure
//!
//! # Example
//!
//! ```rust,ignore
//! let result = with_teardown(
//!     async { sweep(&smu).await },
//!     || async { ramp_voltage(smu.as_ref(), 0.0, delay, None).await },
//! )
//! .await;
//! ```

use crate::error::{ScanError, ScanResult};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{error, warn};

/// Readable text from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn catch_panic<T, F>(future: F) -> ScanResult<T>
where
    F: Future<Output = ScanResult<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(ScanError::Panicked(panic_message(payload.as_ref()))),
    }
}

/// Results of a body and of the teardown that followed it
#[derive(Debug)]
pub struct Guarded<T> {
    /// Outcome of the body, panics converted
    pub body: ScanResult<T>,
    /// Outcome of the teardown, panics converted
    pub teardown: ScanResult<()>,
}

impl<T> Guarded<T> {
    /// Transform a successful body value, keeping the teardown result.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Guarded<U> {
        Guarded {
            body: self.body.map(f),
            teardown: self.teardown,
        }
    }

    /// Merge both results into one.
    ///
    /// | body  | teardown | returned                          |
    /// |-------|----------|-----------------------------------|
    /// | Ok    | Ok       | body value                        |
    /// | Ok    | Err      | [`ScanError::Teardown`]           |
    /// | Err   | Ok       | body error                        |
    /// | Err   | Err      | body error, teardown error logged |
    pub fn merge(self) -> ScanResult<T> {
        match (self.body, self.teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(ScanError::Teardown {
                source: Box::new(e),
                report: None,
            }),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup_err)) => {
                error!("Teardown failed after scan error: {cleanup_err}");
                Err(e)
            }
        }
    }
}

/// Run `body`, then `teardown`, regardless of how `body` ended, and keep both results.
pub async fn run_guarded<T, B, F, Fut>(body: B, teardown: F) -> Guarded<T>
where
    B: Future<Output = ScanResult<T>>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = ScanResult<()>>,
{
    let body = catch_panic(body).await;
    if let Err(e) = &body {
        warn!("Scan failed, returning bias to a safe state: {e}");
    }

    let teardown = catch_panic(teardown()).await;
    Guarded { body, teardown }
}

/// Run `body`, then `teardown`, and merge the results with [`Guarded::merge`].
///
/// Panics in either future are converted into [`ScanError::Panicked`].
pub async fn with_teardown<T, B, F, Fut>(body: B, teardown: F) -> ScanResult<T>
where
    B: Future<Output = ScanResult<T>>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = ScanResult<()>>,
{
    run_guarded(body, teardown).await.merge()
}

/// Armed until [`TeardownGuard::complete`] is called.
///
/// Dropping an armed guard means the scan future was cancelled or unwound past teardown,
/// so the source may still be biased. The guard cannot run async cleanup from `Drop`; it
/// only reports the condition.
pub struct TeardownGuard {
    name: String,
    armed: bool,
}

impl TeardownGuard {
    /// Arm a guard for the named scan
    pub fn arm(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            armed: true,
        }
    }

    /// Teardown finished; disarm.
    pub fn complete(mut self) {
        self.armed = false;
    }

    /// Whether teardown is still outstanding
    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if self.armed {
            error!(
                scan = %self.name,
                panicking = std::thread::panicking(),
                "Scan '{}' ended before teardown completed; the source may still be biased",
                self.name
            );
        }
    }
}

/// Collects the results of best-effort teardown steps.
///
/// Every step runs even if an earlier one failed. The first failure is returned by
/// [`TeardownLog::finish`]; later ones are only logged.
#[derive(Debug, Default)]
pub struct TeardownLog {
    first_error: Option<ScanError>,
    failed_steps: Vec<&'static str>,
}

impl TeardownLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one step.
    pub fn record(&mut self, step: &'static str, result: ScanResult<()>) {
        if let Err(e) = result {
            warn!(step, "Teardown step failed: {e}");
            self.failed_steps.push(step);
            if self.first_error.is_none() {
                self.first_error = Some(e);
            }
        }
    }

    /// Names of the steps that failed, in order
    pub fn failed_steps(&self) -> &[&'static str] {
        &self.failed_steps
    }

    /// First recorded failure, if any.
    pub fn finish(self) -> ScanResult<()> {
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
