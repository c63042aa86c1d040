use std::{
    path::Path,
    time::{Duration, Instant},
};

use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use crate::ext::BestEffortPathExt;
use crate::tree::{FingerprintDiff, FingerprintError, TreeFingerprint, fingerprint};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// Waits for two trees to reach identical fingerprints.
///
/// This is a liveness check: the trees are only observed at poll instants, so
/// a system that is briefly equal and then diverges again can still pass.
#[derive(Debug, Clone)]
pub struct ConvergencePoller {
    config: PollConfig,
}

impl ConvergencePoller {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    /// Returns the converged fingerprint, or the last differing pair once
    /// `timeout` has elapsed. Always compares at least once.
    pub async fn await_convergence(
        &self,
        left: &Path,
        right: &Path,
    ) -> Result<TreeFingerprint, ConvergenceError> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let left_fingerprint = fingerprint(left).await.context(FingerprintSnafu)?;
            let right_fingerprint = fingerprint(right).await.context(FingerprintSnafu)?;

            if left_fingerprint == right_fingerprint {
                info!(
                    "Trees converged after {} attempt(s) in {:?}",
                    attempt,
                    started.elapsed()
                );
                return Ok(left_fingerprint);
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.timeout {
                let diff = left_fingerprint.diff(&right_fingerprint);
                return Err(ConvergenceError::TimeoutError {
                    left_root: left.best_effort_path_display(),
                    right_root: right.best_effort_path_display(),
                    elapsed,
                    diff,
                    left: left_fingerprint,
                    right: right_fingerprint,
                });
            }

            debug!(
                "Trees still differ on attempt {} ({:?} elapsed), retrying in {:?}",
                attempt, elapsed, self.config.interval
            );
            compio::time::sleep(self.config.interval).await;
        }
    }
}

#[derive(Debug, Snafu)]
pub enum ConvergenceError {
    #[snafu(display("Failed to fingerprint a tree while polling"))]
    FingerprintError { source: FingerprintError },
    #[snafu(display(
        "Trees {} and {} did not converge within {:?}:\n{}",
        left_root,
        right_root,
        elapsed,
        diff
    ))]
    TimeoutError {
        left_root: String,
        right_root: String,
        elapsed: Duration,
        diff: FingerprintDiff,
        left: TreeFingerprint,
        right: TreeFingerprint,
    },
}
