//! RUN_QC: execute every verification that needs a run, in parallel under
//! `VerificationRunner`'s bound, and integrate the outcomes.

use crate::actions::LoopServices;
use crate::error::LoopResult;
use crate::state::LoopState;
use crate::verifier::apply_outcomes;

pub async fn run(state: &mut LoopState, services: &LoopServices) -> LoopResult<bool> {
    let pending: Vec<_> = state.verifications.values().filter(|v| v.needs_run()).cloned().collect();
    if pending.is_empty() {
        tracing::info!("run_qc invoked with nothing pending");
        return Ok(false);
    }

    let outcomes = services.verifier.run_pending(&pending).await?;
    let newly_failed = apply_outcomes(&mut state.verifications, &outcomes);

    if !newly_failed.is_empty() {
        tracing::warn!(?newly_failed, "verifications failed this pass");
    }

    if state.all_verifications_passed() {
        services.git.commit("run-qc", "all verifications passing")?;
        tracing::info!("all verifications passed and committed");
    }

    Ok(!outcomes.is_empty())
}
