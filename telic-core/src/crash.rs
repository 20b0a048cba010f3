//! CrashSupervisor: the outermost of the three crash-resilience layers
//!
//! Layer 1 (per-call timeout) lives in `gateway` and `verifier`. Layer 2
//! (handler-exception containment) lives in the scheduler loop itself, which
//! resets the in-progress task and persists state after every handler call
//! regardless of outcome. This module is layer 3: process-level auto-restart
//! with linear backoff, reusing persisted state on restart via an automatic
//! supervisor loop.

use std::time::Duration;

const BACKOFF_SCHEDULE_SEC: [u64; 3] = [10, 20, 30];

pub struct CrashSupervisor {
    max_restarts: u32,
    restarts_so_far: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// The body returned normally; the supervisor's job is done.
    Completed,
    /// The body panicked or the process would have crashed; restart if
    /// budget remains.
    Restart { after: Duration },
    /// Restart budget exhausted; caller must emit a partial report and stop.
    BudgetExhausted,
}

impl CrashSupervisor {
    pub fn new(max_restarts: u32) -> Self {
        Self {
            max_restarts,
            restarts_so_far: 0,
        }
    }

    pub fn restarts_so_far(&self) -> u32 {
        self.restarts_so_far
    }

    /// Run `body` to completion, catching panics. On panic, returns a
    /// `Restart` outcome with the next backoff delay, or `BudgetExhausted`
    /// once `max_restarts` is spent. Intended to wrap the top-level
    /// scheduler loop, not individual handler calls.
    pub async fn run<F, Fut>(&mut self, body: F) -> SupervisorOutcome
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let result = std::panic::AssertUnwindSafe(body())
            .catch_unwind()
            .await;

        match result {
            Ok(()) => SupervisorOutcome::Completed,
            Err(payload) => {
                let message = panic_message(&payload);
                tracing::error!(%message, restarts_so_far = self.restarts_so_far, "scheduler loop crashed");

                if self.restarts_so_far >= self.max_restarts {
                    return SupervisorOutcome::BudgetExhausted;
                }

                let delay_sec = BACKOFF_SCHEDULE_SEC
                    .get(self.restarts_so_far as usize)
                    .copied()
                    .unwrap_or(*BACKOFF_SCHEDULE_SEC.last().unwrap());
                self.restarts_so_far += 1;

                SupervisorOutcome::Restart {
                    after: Duration::from_secs(delay_sec),
                }
            }
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

use futures::FutureExt;
