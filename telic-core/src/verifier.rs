//! VerificationRunner: executes arbitrary verification scripts under a
//! per-script timeout and a total wall-clock cap, bounded to CPU count.
//!
//! Scripts are named by `Verification::script_path` and run concurrently, a
//! bounded worker pool rather than a fixed sequential gate.

use crate::config::Config;
use crate::error::{LoopError, LoopResult};
use crate::state::{Verification, VerificationStatus};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Outcome of running a single verification script.
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub id: String,
    pub exit_success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

pub struct VerificationRunner {
    project_dir: std::path::PathBuf,
    script_timeout: Duration,
    total_wall_clock: Duration,
    concurrency: usize,
}

impl VerificationRunner {
    pub fn new(config: &Config) -> Self {
        let concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            project_dir: config.project_dir.clone(),
            script_timeout: Duration::from_secs(config.verification_script_timeout_sec),
            total_wall_clock: Duration::from_secs(config.verification_total_wall_clock_sec),
            concurrency,
        }
    }

    /// Run every verification that `needs_run`, in parallel bounded by CPU
    /// count, under the total wall-clock cap. Verifications still pending
    /// when the cap is hit are left untouched (picked up next RUN_QC pass).
    pub async fn run_pending(
        &self,
        verifications: &[Verification],
    ) -> LoopResult<Vec<VerificationOutcome>> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let deadline = Instant::now() + self.total_wall_clock;

        let mut handles = Vec::new();
        for v in verifications.iter().filter(|v| v.needs_run()) {
            let permit = semaphore.clone();
            let script = v.script_path.clone();
            let id = v.id.clone();
            let project_dir = self.project_dir.clone();
            let script_timeout = self.script_timeout;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(verification = %id, "total wall clock cap reached, skipping remaining scripts");
                break;
            }
            let per_call_timeout = script_timeout.min(remaining);

            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore closed");
                Self::run_one(&id, &project_dir, &script, per_call_timeout).await
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => return Err(e),
                Err(join_err) => {
                    return Err(LoopError::VerificationRunner {
                        script: self.project_dir.clone(),
                        message: join_err.to_string(),
                    })
                }
            }
        }
        Ok(outcomes)
    }

    async fn run_one(
        id: &str,
        project_dir: &Path,
        script: &Path,
        timeout: Duration,
    ) -> LoopResult<VerificationOutcome> {
        let mut cmd = tokio::process::Command::new(script);
        cmd.current_dir(project_dir).kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(LoopError::VerificationRunner {
                    script: script.to_path_buf(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(LoopError::VerificationRunner {
                    script: script.to_path_buf(),
                    message: format!("timed out after {}s", timeout.as_secs()),
                })
            }
        };

        Ok(VerificationOutcome {
            id: id.to_string(),
            exit_success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }
}

/// Apply a batch of outcomes to the verifications they cover, returning the
/// ids that newly failed (for the decision engine's next FIX pass).
pub fn apply_outcomes(
    verifications: &mut std::collections::HashMap<String, Verification>,
    outcomes: &[VerificationOutcome],
) -> Vec<String> {
    let mut newly_failed = Vec::new();
    for outcome in outcomes {
        if let Some(v) = verifications.get_mut(&outcome.id) {
            if outcome.exit_success {
                v.status = VerificationStatus::Passed;
                v.last_error = None;
            } else {
                v.status = VerificationStatus::Failed;
                v.attempts += 1;
                v.last_error = Some(outcome.stderr.clone());
                newly_failed.push(outcome.id.clone());
            }
        }
    }
    newly_failed
}
