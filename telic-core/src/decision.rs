//! The DecisionEngine: a pure function from `LoopState` to the next `Action`
//!
//! A single ordered rule-list evaluated top to bottom, with no I/O beyond
//! reading already-materialized state. `decide` here is total: every state
//! maps to exactly one `Action`, and the same state always yields the same
//! `Action`.

use crate::config::Config;
use crate::state::{LoopState, TaskStatus, VerificationStatus, VrcRecommendation};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use std::collections::HashMap;

/// The next unit of work the scheduler should hand to an action handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    InteractivePause,
    CourseCorrect { reason: String },
    Fix { verification_id: String },
    ServiceFix { service: String },
    Research { task_id: String },
    Execute { task_id: String },
    GenerateQc,
    RunQc,
    ExitGate,
}

pub struct DecisionEngine;

impl DecisionEngine {
    /// Evaluate the precedence rules against `state` and `config`. Pure:
    /// the same `(state, config)` pair always yields the same `Action`.
    pub fn decide(state: &LoopState, config: &Config) -> Action {
        // Rule 1: an open pause always wins.
        if state.pause.is_some() {
            return Action::InteractivePause;
        }

        // Rule 2: budget discipline.
        let budget_fraction = state.budget_fraction(config.token_budget);
        if budget_fraction >= config.budget_critical_fraction {
            if let Some(a) = Self::fix_action(state, config) {
                return a;
            }
            if let Some(a) = Self::run_qc_action(state) {
                return a;
            }
            return Action::ExitGate;
        }

        // Rule 3: pending structural health failure.
        if state.coherence_critical_pending {
            return Action::CourseCorrect {
                reason: "coherence critical".to_string(),
            };
        }

        // Rule 4: fixable failing verifications.
        if let Some(a) = Self::fix_action(state, config) {
            return a;
        }

        // Rule 5: unhealthy service.
        if let Some(service) = state
            .context
            .services
            .iter()
            .find(|(_, healthy)| !**healthy)
            .map(|(name, _)| name.clone())
        {
            return Action::ServiceFix { service };
        }

        // Rule 6: pending task blocked on unmet research dependency.
        //
        // A task's dependency is a "research dependency" when the
        // dependency task itself has source `Regression` from an earlier
        // RESEARCH note request — modeled here as a task whose description
        // begins with the `research:` marker the RESEARCH handler writes.
        if let Some(task_id) = Self::research_blocked_task(state) {
            return Action::Research { task_id };
        }

        // Rule 7: executable tasks, ordered by source then insertion order.
        // Detect unresolvable cycles among still-pending tasks first.
        if let Some(cycle_ids) = Self::detect_cycle(state) {
            return Action::CourseCorrect {
                reason: format!("dependency cycle: {}", cycle_ids.join(", ")),
            };
        }
        if let Some(task) = state.executable_tasks().into_iter().next() {
            return Action::Execute {
                task_id: task.id.clone(),
            };
        }

        // Rule 8: completed-but-unverified tasks past the threshold.
        let scoped_task_count = state.tasks.len();
        let completed_count = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Done)
            .count();
        let threshold = config.qc_generation_threshold.min(scoped_task_count.max(1));
        let covered: std::collections::HashSet<&str> = state
            .verifications
            .values()
            .flat_map(|v| v.covers.iter().map(|s| s.as_str()))
            .collect();
        let has_unverified_done = state
            .tasks
            .values()
            .any(|t| t.status == TaskStatus::Done && !covered.contains(t.id.as_str()));
        if completed_count >= threshold && has_unverified_done {
            return Action::GenerateQc;
        }

        // Rule 9: verifications that need a run.
        if let Some(a) = Self::run_qc_action(state) {
            return a;
        }

        // Rule 10: clean ship.
        let all_terminal = state.all_tasks_terminal();
        let all_passed = state.all_verifications_passed();
        let ship_ready = state
            .vrc_history
            .last()
            .map(|v| v.recommendation == VrcRecommendation::ShipReady)
            .unwrap_or(false);
        if all_terminal && all_passed && ship_ready {
            return Action::ExitGate;
        }

        // Rule 11: stuck.
        if state.iterations_without_progress >= config.stuck_threshold {
            return Action::CourseCorrect {
                reason: "no progress for stuck_threshold iterations".to_string(),
            };
        }

        // Rule 12: default.
        Action::ExitGate
    }

    fn fix_action(state: &LoopState, config: &Config) -> Option<Action> {
        state
            .verifications
            .values()
            .find(|v| v.status == VerificationStatus::Failed && v.attempts < config.max_fix_attempts)
            .map(|v| Action::Fix {
                verification_id: v.id.clone(),
            })
    }

    fn run_qc_action(state: &LoopState) -> Option<Action> {
        if state.verifications.values().any(|v| v.needs_run()) {
            Some(Action::RunQc)
        } else {
            None
        }
    }

    fn research_blocked_task(state: &LoopState) -> Option<String> {
        state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .find(|t| {
                t.status == TaskStatus::Pending
                    && t.dependencies.iter().any(|dep| {
                        state
                            .tasks
                            .get(dep)
                            .map(|d| {
                                d.status != TaskStatus::Done
                                    && d.description.starts_with("research:")
                            })
                            .unwrap_or(false)
                    })
            })
            .map(|t| t.id.clone())
    }

    /// Build a dependency graph over non-terminal tasks and check for a
    /// cycle. Returns the offending task ids (unordered) if one exists.
    fn detect_cycle(state: &LoopState) -> Option<Vec<String>> {
        let pending: Vec<&String> = state
            .tasks
            .iter()
            .filter(|(_, t)| !t.status.is_terminal())
            .map(|(id, _)| id)
            .collect();
        if pending.is_empty() {
            return None;
        }

        let mut graph = DiGraph::<(), ()>::new();
        let mut index = HashMap::new();
        for id in &pending {
            index.insert((*id).clone(), graph.add_node(()));
        }
        for id in &pending {
            let task = &state.tasks[*id];
            for dep in &task.dependencies {
                if let (Some(&from), Some(&to)) = (index.get(*id), index.get(dep)) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        if is_cyclic_directed(&graph) {
            Some(pending.into_iter().cloned().collect())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PauseState, Task, TaskSource, Verification, VerificationCategory};

    fn cfg() -> Config {
        Config::from_env("sprint-1", "/tmp/proj")
    }

    #[test]
    fn pause_always_wins() {
        let mut state = LoopState::new("s", "/tmp").with_retry_ceiling(3);
        state.pause = Some(PauseState::new("need human input", "check logs"));
        assert_eq!(DecisionEngine::decide(&state, &cfg()), Action::InteractivePause);
    }

    #[test]
    fn budget_critical_forces_exit_gate_absent_fix_or_qc() {
        let mut state = LoopState::new("s", "/tmp").with_retry_ceiling(3);
        state.total_tokens_used = (cfg().token_budget as f64 * 0.96) as u64;
        assert_eq!(DecisionEngine::decide(&state, &cfg()), Action::ExitGate);
    }

    #[test]
    fn coherence_critical_triggers_course_correct() {
        let mut state = LoopState::new("s", "/tmp").with_retry_ceiling(3);
        state.coherence_critical_pending = true;
        match DecisionEngine::decide(&state, &cfg()) {
            Action::CourseCorrect { reason } => assert!(reason.contains("coherence")),
            other => panic!("expected CourseCorrect, got {other:?}"),
        }
    }

    #[test]
    fn failing_verification_under_attempt_cap_triggers_fix() {
        let mut state = LoopState::new("s", "/tmp").with_retry_ceiling(3);
        let mut v = Verification::new("v1", "scripts/v1.sh", VerificationCategory::Unit, vec![]);
        v.status = VerificationStatus::Failed;
        v.attempts = 1;
        state.insert_verification(v);
        assert_eq!(
            DecisionEngine::decide(&state, &cfg()),
            Action::Fix {
                verification_id: "v1".to_string()
            }
        );
    }

    #[test]
    fn pending_task_with_met_deps_triggers_execute_in_source_order() {
        let mut state = LoopState::new("s", "/tmp").with_retry_ceiling(3);
        state.insert_task(Task::new("exit1", TaskSource::ExitGate, "d", "v", "a"));
        state.insert_task(Task::new("plan1", TaskSource::Plan, "d", "v", "a"));
        assert_eq!(
            DecisionEngine::decide(&state, &cfg()),
            Action::Execute {
                task_id: "plan1".to_string()
            }
        );
    }

    #[test]
    fn dependency_cycle_synthesizes_course_correct() {
        let mut state = LoopState::new("s", "/tmp").with_retry_ceiling(3);
        let mut a = Task::new("a", TaskSource::Plan, "d", "v", "a");
        a.dependencies = vec!["b".to_string()];
        let mut b = Task::new("b", TaskSource::Plan, "d", "v", "a");
        b.dependencies = vec!["a".to_string()];
        state.insert_task(a);
        state.insert_task(b);
        match DecisionEngine::decide(&state, &cfg()) {
            Action::CourseCorrect { reason } => assert!(reason.contains("dependency cycle")),
            other => panic!("expected CourseCorrect, got {other:?}"),
        }
    }

    #[test]
    fn empty_plan_eventually_exits() {
        let state = LoopState::new("s", "/tmp").with_retry_ceiling(3);
        assert_eq!(DecisionEngine::decide(&state, &cfg()), Action::ExitGate);
    }

    #[test]
    fn stuck_threshold_triggers_course_correct() {
        let mut state = LoopState::new("s", "/tmp").with_retry_ceiling(3);
        state.iterations_without_progress = cfg().stuck_threshold;
        match DecisionEngine::decide(&state, &cfg()) {
            Action::CourseCorrect { reason } => assert!(reason.contains("no progress")),
            other => panic!("expected CourseCorrect, got {other:?}"),
        }
    }

    #[test]
    fn decide_is_pure() {
        let mut state = LoopState::new("s", "/tmp").with_retry_ceiling(3);
        state.insert_task(Task::new("t1", TaskSource::Plan, "d", "v", "a"));
        let config = cfg();
        assert_eq!(DecisionEngine::decide(&state, &config), DecisionEngine::decide(&state, &config));
    }
}
