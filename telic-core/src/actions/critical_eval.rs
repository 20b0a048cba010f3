//! CRITICAL_EVAL: the EVALUATOR's two-stage review, invoked only from inside
//! `ExitGate` step 4 when the deliverable has a user-visible surface
//!
//! Stage A (structural: build succeeds, routes resolve, no console errors)
//! is cheap; stage B (visual/interactive) only runs if A passes, under the
//! EVALUATOR's longer timeout. Ensuring the external dev server is healthy
//! before invocation and cleaning up transient artifacts afterward are the
//! evaluator implementation's own responsibility, out of scope here.

use crate::actions::LoopServices;
use crate::error::LoopResult;
use crate::gateway::contracts::parse_report_critical_eval;
use crate::gateway::{extract_json, Role};
use crate::state::{LoopState, Task, TaskSource};

/// Returns `true` when the deliverable cleared both stages with no new gap
/// tasks; `false` when it inserted `critical_eval`-sourced tasks that must
/// be worked before the exit gate can pass.
pub async fn run(state: &mut LoopState, services: &LoopServices) -> LoopResult<bool> {
    let prompt = "Perform a two-stage critical evaluation of the deliverable. Stage A: \
         a cheap structural pass (build succeeds, routes resolve, no console errors). If \
         stage A fails, do not attempt stage B. Stage B (only if A passed): a slower \
         visual/interactive review. Respond as JSON matching report_critical_eval: \
         {\"structural_pass\": bool, \"structural_findings\": [...], \"visual_pass\": bool?, \
         \"findings\": [...], \"gap_tasks\": [...]}.";

    let response = services.gateway.run(Role::Evaluator, prompt).await?;
    state.add_tokens(response.input_tokens, response.output_tokens);

    let Some(call) = extract_json(&response.raw_text).and_then(|v| parse_report_critical_eval(&v)) else {
        tracing::warn!("evaluator did not emit a parseable critical eval report, treating as failed");
        insert_gap_task(state, "critical eval response was unparseable");
        return Ok(false);
    };

    if !call.structural_pass {
        tracing::warn!(findings = ?call.structural_findings, "critical eval failed at the structural stage");
        for mutation in call.gap_tasks {
            let mut task = mutation.into_task();
            task.source = TaskSource::CriticalEval;
            state.insert_task(task);
        }
        if state.tasks.values().all(|t| t.source != TaskSource::CriticalEval) {
            insert_gap_task(state, "structural pass failed with no evaluator-proposed tasks");
        }
        return Ok(false);
    }

    let visual_passed = call.visual_pass.unwrap_or(false);
    if !visual_passed || !call.gap_tasks.is_empty() {
        tracing::warn!(findings = ?call.findings, "critical eval failed at the visual stage");
        for mutation in call.gap_tasks {
            let mut task = mutation.into_task();
            task.source = TaskSource::CriticalEval;
            state.insert_task(task);
        }
        return Ok(false);
    }

    tracing::info!("critical eval passed both stages");
    Ok(true)
}

fn insert_gap_task(state: &mut LoopState, reason: &str) {
    let id = format!("critical-eval-gap-{}", state.iteration);
    let task = Task::new(
        id,
        TaskSource::CriticalEval,
        format!("Address critical evaluation failure: {reason}"),
        "deliverable must clear critical evaluation before shipping",
        "critical evaluation passes both stages",
    );
    state.insert_task(task);
}
