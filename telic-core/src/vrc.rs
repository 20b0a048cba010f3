//! VRCHeartbeat: the periodic "are we actually delivering value" check
//!
//! A deterministic heuristic function consulted between expensive agent
//! calls: cheap signals computed from state first, an agent-authored report
//! layered on top, never the other way around.

use crate::config::Config;
use crate::state::{Gap, GapSeverity, LoopState, TaskStatus, VrcRecommendation, VrcSnapshot};
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrcMode {
    Full,
    Quick,
}

pub struct VRCHeartbeat;

impl VRCHeartbeat {
    /// Whether a VRC should run at all this iteration, applying the three
    /// skip-optimizations before mode selection is even considered.
    pub fn should_run(
        state: &LoopState,
        config: &Config,
        last_action_made_progress: bool,
        last_vrc_elapsed_sec: Option<u64>,
        last_task_status_hash: Option<u64>,
    ) -> bool {
        if !last_action_made_progress {
            return false;
        }
        if let Some(hash) = last_task_status_hash {
            if hash == state.task_status_hash() {
                return false;
            }
        }
        if let Some(elapsed) = last_vrc_elapsed_sec {
            if elapsed < config.vrc_min_interval_sec {
                return false;
            }
        }
        true
    }

    /// Mode selection: full on the first three iterations, every
    /// fifth iteration, right after CRITICAL_EVAL/COURSE_CORRECT, and inside
    /// EXIT_GATE; forced quick once the budget crosses the degraded
    /// fraction; quick otherwise.
    pub fn select_mode(
        state: &LoopState,
        config: &Config,
        just_ran_critical_eval_or_course_correct: bool,
        inside_exit_gate: bool,
    ) -> VrcMode {
        let budget_fraction = state.budget_fraction(config.token_budget);
        if budget_fraction >= config.budget_degraded_fraction {
            return VrcMode::Quick;
        }
        if state.iteration <= 3
            || state.iteration % 5 == 0
            || just_ran_critical_eval_or_course_correct
            || inside_exit_gate
        {
            return VrcMode::Full;
        }
        VrcMode::Quick
    }

    /// Build a snapshot purely from state, used both as the quick-mode
    /// heuristic and as the fallback when a full-mode agent fails to emit a
    /// structured `report_vrc` tool-call.
    pub fn synthesize(state: &LoopState) -> VrcSnapshot {
        let total = state.tasks.len() as u32;
        let verified = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Done)
            .count() as u32;
        let blocked = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Blocked)
            .count() as u32;

        let value_score = if total == 0 {
            0.0
        } else {
            verified as f64 / total as f64
        };

        let gaps = if blocked > 0 {
            vec![Gap {
                id: "synthesized-blocked-tasks".to_string(),
                severity: GapSeverity::Blocking,
                suggested_task: None,
            }]
        } else {
            Vec::new()
        };

        VrcSnapshot {
            iteration: state.iteration,
            timestamp: Utc::now(),
            deliverables_total: total,
            deliverables_verified: verified,
            deliverables_blocked: blocked,
            value_score,
            gaps,
            recommendation: VrcRecommendation::Continue,
            summary: format!("{verified}/{total} tasks done, {blocked} blocked (synthesized)"),
        }
    }

    /// Apply the SHIP_READY guard: a recommendation of SHIP_READY
    /// is only valid when no gap is rated critical, blocking, or degraded.
    /// Downgrades an invalid SHIP_READY to COURSE_CORRECT and returns the
    /// gap-derived tasks that must be synthesized alongside it.
    pub fn apply_ship_ready_guard(mut snapshot: VrcSnapshot) -> (VrcSnapshot, Vec<Gap>) {
        let blockers: Vec<Gap> = snapshot
            .gaps
            .iter()
            .filter(|g| {
                matches!(
                    g.severity,
                    GapSeverity::Critical | GapSeverity::Blocking | GapSeverity::Degraded
                )
            })
            .cloned()
            .collect();

        if snapshot.recommendation == VrcRecommendation::ShipReady && !blockers.is_empty() {
            snapshot.recommendation = VrcRecommendation::CourseCorrect;
        }

        let auto_tasks: Vec<Gap> = blockers
            .into_iter()
            .filter(|g| matches!(g.severity, GapSeverity::Critical | GapSeverity::Blocking))
            .collect();

        (snapshot, auto_tasks)
    }
}
