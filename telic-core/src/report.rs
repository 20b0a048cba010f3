//! DELIVERY_REPORT.md: the honest closing statement a sprint leaves behind
//!
//! Whether the loop shipped or the safety valve tripped, this is the only
//! artifact a human is guaranteed to read. It is built entirely from
//! `LoopState` — no new agent call, no new I/O beyond the one write — so
//! that emitting it can never itself become a reason the loop fails to
//! terminate. The per-phase token/time breakdown groups `progress_log`
//! entries by `action`.

use crate::scheduler::LoopOutcome;
use crate::state::{LoopState, TaskStatus};
use std::collections::BTreeMap;

/// One row of the per-phase token/time breakdown.
#[derive(Debug, Clone, Default)]
struct PhaseTotals {
    iterations: u32,
    input_tokens: u64,
    output_tokens: u64,
    duration_sec: f64,
}

/// Render the delivery report for a terminated sprint as markdown.
pub fn render(state: &LoopState, outcome: LoopOutcome, crash_restarts: u32) -> String {
    let mut out = String::new();

    out.push_str(&format!("# Delivery Report — {}\n\n", state.sprint));
    out.push_str(&format!(
        "**Outcome:** {}\n\n",
        match outcome {
            LoopOutcome::Shipped => "Shipped — value delivered and verified",
            LoopOutcome::Partial => "Partial — exit gate safety valve tripped, reporting honestly",
        }
    ));

    let value_score = state.latest_vrc().map(|v| v.value_score).unwrap_or(0.0);
    out.push_str(&format!("**Value score:** {value_score:.2}\n\n"));

    out.push_str("## Tasks\n\n");
    let (done, descoped, blocked, pending) = task_counts(state);
    out.push_str(&format!("- Delivered (done): {done}\n"));
    out.push_str(&format!("- Descoped: {descoped}\n"));
    out.push_str(&format!("- Blocked: {blocked}\n"));
    if pending > 0 {
        out.push_str(&format!("- Still pending at termination: {pending}\n"));
    }
    out.push('\n');

    out.push_str("## Loop statistics\n\n");
    out.push_str(&format!("- Iterations: {}\n", state.iteration));
    out.push_str(&format!("- Exit-gate attempts: {}\n", state.exit_gate_attempts));
    out.push_str(&format!("- Total tokens used: {}\n", state.total_tokens_used));
    out.push_str(&format!("- Rollbacks: {}\n", state.git.rollbacks_so_far));
    if crash_restarts > 0 {
        out.push_str(&format!("- Crash-supervisor restarts: {crash_restarts}\n"));
    }
    out.push('\n');

    out.push_str("## Per-phase breakdown\n\n");
    out.push_str("| Action | Iterations | Input tokens | Output tokens | Duration (s) |\n");
    out.push_str("|---|---:|---:|---:|---:|\n");
    for (action, totals) in phase_breakdown(state) {
        out.push_str(&format!(
            "| {action} | {} | {} | {} | {:.1} |\n",
            totals.iterations, totals.input_tokens, totals.output_tokens, totals.duration_sec
        ));
    }
    out.push('\n');

    let blockers: Vec<_> = state
        .tasks
        .values()
        .filter(|t| t.status == TaskStatus::Blocked)
        .collect();
    if !blockers.is_empty() {
        out.push_str("## Blockers\n\n");
        for task in blockers {
            out.push_str(&format!(
                "- `{}`: {}\n",
                task.id,
                task.blocked_reason.as_deref().unwrap_or("no reason recorded")
            ));
        }
        out.push('\n');
    }

    if !state.errors.is_empty() {
        out.push_str("## Error provenance\n\n");
        out.push_str("| Iteration | Action | Code | Message |\n");
        out.push_str("|---:|---|---|---|\n");
        for err in &state.errors {
            out.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                err.iteration, err.action, err.code, err.message
            ));
        }
        out.push('\n');
    }

    if let Some(vrc) = state.latest_vrc() {
        if !vrc.gaps.is_empty() {
            out.push_str("## Remaining gaps at termination\n\n");
            for gap in &vrc.gaps {
                out.push_str(&format!("- `{}` ({:?})\n", gap.id, gap.severity));
            }
            out.push('\n');
        }
        out.push_str("## Final VRC summary\n\n");
        out.push_str(&vrc.summary);
        out.push('\n');
    }

    out
}

fn task_counts(state: &LoopState) -> (usize, usize, usize, usize) {
    let mut done = 0;
    let mut descoped = 0;
    let mut blocked = 0;
    let mut pending = 0;
    for task in state.tasks.values() {
        match task.status {
            TaskStatus::Done => done += 1,
            TaskStatus::Descoped => descoped += 1,
            TaskStatus::Blocked => blocked += 1,
            TaskStatus::Pending | TaskStatus::InProgress => pending += 1,
        }
    }
    (done, descoped, blocked, pending)
}

fn phase_breakdown(state: &LoopState) -> BTreeMap<String, PhaseTotals> {
    let mut phases: BTreeMap<String, PhaseTotals> = BTreeMap::new();
    for entry in &state.progress_log {
        let totals = phases.entry(entry.action.clone()).or_default();
        totals.iterations += 1;
        totals.input_tokens += entry.input_tokens;
        totals.output_tokens += entry.output_tokens;
        totals.duration_sec += entry.duration_sec;
    }
    phases
}

/// Exit code for the process: 0 full success, 2 partial success.
pub fn exit_code(outcome: LoopOutcome) -> i32 {
    match outcome {
        LoopOutcome::Shipped => 0,
        LoopOutcome::Partial => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ProgressEntry, ProgressResult, Task, TaskSource};

    #[test]
    fn counts_tasks_by_terminal_status() {
        let mut state = LoopState::new("s", "/tmp");
        let mut t1 = Task::new("t1", TaskSource::Plan, "d", "v", "a");
        t1.status = TaskStatus::Done;
        state.insert_task(t1);
        let mut t2 = Task::new("t2", TaskSource::Plan, "d", "v", "a");
        t2.status = TaskStatus::Blocked;
        t2.blocked_reason = Some("waiting on credentials".to_string());
        state.insert_task(t2);

        let report = render(&state, LoopOutcome::Partial, 0);
        assert!(report.contains("Delivered (done): 1"));
        assert!(report.contains("Blocked: 1"));
        assert!(report.contains("waiting on credentials"));
    }

    #[test]
    fn partial_outcome_maps_to_exit_code_two() {
        assert_eq!(exit_code(LoopOutcome::Partial), 2);
        assert_eq!(exit_code(LoopOutcome::Shipped), 0);
    }

    #[test]
    fn phase_breakdown_aggregates_by_action() {
        let mut state = LoopState::new("s", "/tmp");
        state.progress_log.push(ProgressEntry {
            iteration: 1,
            action: "EXECUTE".to_string(),
            result: ProgressResult::Progress,
            input_tokens: 10,
            output_tokens: 20,
            duration_sec: 1.5,
        });
        state.progress_log.push(ProgressEntry {
            iteration: 2,
            action: "EXECUTE".to_string(),
            result: ProgressResult::Progress,
            input_tokens: 5,
            output_tokens: 5,
            duration_sec: 0.5,
        });
        let breakdown = phase_breakdown(&state);
        let execute = &breakdown["EXECUTE"];
        assert_eq!(execute.iterations, 2);
        assert_eq!(execute.input_tokens, 15);
        assert_eq!(execute.duration_sec, 2.0);
    }
}
