//! CourseCorrector: the six-verb recovery action taken when the loop is
//! stuck, regressing, or structurally unhealthy
//!
//! Six verbs: restructure, descope, new_tasks, rollback, regenerate_tests,
//! escalate. Every verb is a pure `LoopState` mutation plus, where the verb
//! touches the working tree, a `GitSafetyNet` call — no agent I/O lives
//! here, the REASONER call that picks the verb happens in the handler.

use crate::error::{LoopError, LoopResult};
use crate::git::GitSafetyNet;
use crate::state::{PauseState, Task, TaskStatus, VerificationStatus};
use serde::{Deserialize, Serialize};

use crate::state::LoopState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CourseCorrection {
    Restructure {
        tasks_to_restructure: Vec<String>,
        reason: String,
    },
    Descope {
        task_ids: Vec<String>,
        reason: String,
    },
    NewTasks {
        tasks: Vec<Task>,
        reason: String,
    },
    Rollback {
        rollback_to_checkpoint: String,
        reason: String,
    },
    RegenerateTests {
        verification_ids: Vec<String>,
        reason: String,
    },
    Escalate {
        reason: String,
        instructions: String,
    },
}

impl CourseCorrection {
    pub fn reason(&self) -> &str {
        match self {
            Self::Restructure { reason, .. }
            | Self::Descope { reason, .. }
            | Self::NewTasks { reason, .. }
            | Self::Rollback { reason, .. }
            | Self::RegenerateTests { reason, .. }
            | Self::Escalate { reason, .. } => reason,
        }
    }
}

pub struct CourseCorrector;

impl CourseCorrector {
    /// Apply `correction` to `state`, optionally touching the working tree
    /// through `git`. Returns whether the loop should count this as progress
    /// (it never does — a correction resets the stuck counter instead of
    /// incrementing progress).
    pub fn apply(
        state: &mut LoopState,
        git: &GitSafetyNet,
        max_rollbacks_per_sprint: u32,
        correction: CourseCorrection,
    ) -> LoopResult<()> {
        match correction {
            CourseCorrection::Restructure {
                tasks_to_restructure,
                reason,
            } => {
                state.iterations_without_progress = 0;
                for task_id in &tasks_to_restructure {
                    state.invalidate_verifications_covering(task_id);
                }
                git.commit("course-correct", &format!("restructure: {reason}"))?;
            }
            CourseCorrection::Descope { task_ids, reason } => {
                for id in &task_ids {
                    state.descope_task(id);
                }
                tracing::info!(%reason, tasks = ?task_ids, "descoped tasks");
                git.commit("course-correct", &format!("descope: {reason}"))?;
            }
            CourseCorrection::NewTasks { tasks, reason } => {
                for task in tasks {
                    state.insert_task(task);
                }
                tracing::info!(%reason, "inserted new tasks");
                git.commit("course-correct", &format!("new_tasks: {reason}"))?;
            }
            CourseCorrection::Rollback {
                rollback_to_checkpoint,
                reason,
            } => {
                Self::rollback(state, git, max_rollbacks_per_sprint, &rollback_to_checkpoint, &reason)?;
            }
            CourseCorrection::RegenerateTests {
                verification_ids,
                reason,
            } => {
                // Removed, not merely invalidated: an invalidated verification
                // still `covers` its task, so rule 9 (RUN_QC) would fire ahead
                // of rule 8 (GENERATE_QC) on the next iteration.
                state.remove_verifications(&verification_ids);
                tracing::info!(%reason, "removed verifications for regeneration");
            }
            CourseCorrection::Escalate {
                reason,
                instructions,
            } => {
                state.pause = Some(PauseState::new(reason, instructions));
            }
        }
        Ok(())
    }

    fn rollback(
        state: &mut LoopState,
        git: &GitSafetyNet,
        max_rollbacks_per_sprint: u32,
        checkpoint_label: &str,
        reason: &str,
    ) -> LoopResult<()> {
        if state.git.rollbacks_so_far >= max_rollbacks_per_sprint {
            return Err(LoopError::invariant(format!(
                "rollback refused: {} rollbacks already used this sprint",
                state.git.rollbacks_so_far
            )));
        }

        let checkpoint = state
            .find_checkpoint(checkpoint_label)
            .cloned()
            .ok_or_else(|| LoopError::git("rollback", format!("no checkpoint labeled '{checkpoint_label}'")))?;

        git.rollback_to(&checkpoint.commit_hash)?;

        let mut reverted_ids = Vec::new();
        for (id, task) in state.tasks.iter_mut() {
            if task.status == TaskStatus::Done && task.updated_at > checkpoint.timestamp {
                task.status = TaskStatus::Pending;
                task.retry_count += 1;
                reverted_ids.push(id.clone());
            }
        }
        for v in state.verifications.values_mut() {
            if v.covers.iter().any(|c| reverted_ids.contains(c)) && v.status == VerificationStatus::Passed {
                v.status = VerificationStatus::Invalidated;
            }
        }

        // A reverted startup task may have been what last marked a service
        // healthy; force every service back through rule 5's probe.
        state.reset_all_services_unhealthy();

        state.git.rollbacks_so_far += 1;
        tracing::warn!(%checkpoint_label, %reason, "rolled back to checkpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{GitCheckpoint, Task, TaskSource, Verification, VerificationCategory};
    use chrono::Utc;

    fn git_in(dir: &std::path::Path) -> GitSafetyNet {
        std::process::Command::new("git").arg("init").current_dir(dir).output().unwrap();
        std::process::Command::new("git")
            .args(["config", "user.email", "t@t.com"])
            .current_dir(dir)
            .output()
            .unwrap();
        std::process::Command::new("git")
            .args(["config", "user.name", "t"])
            .current_dir(dir)
            .output()
            .unwrap();
        std::fs::write(dir.join("a.txt"), "x").unwrap();
        std::process::Command::new("git").args(["add", "."]).current_dir(dir).output().unwrap();
        std::process::Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(dir)
            .output()
            .unwrap();
        GitSafetyNet::new(dir, "sprint-1")
    }

    #[test]
    fn descope_flips_status() {
        let dir = tempfile::tempdir().unwrap();
        let git = git_in(dir.path());
        let mut state = LoopState::new("sprint-1", dir.path());
        state.insert_task(Task::new("t1", TaskSource::Plan, "d", "v", "a"));

        CourseCorrector::apply(
            &mut state,
            &git,
            3,
            CourseCorrection::Descope {
                task_ids: vec!["t1".to_string()],
                reason: "out of scope".to_string(),
            },
        )
        .unwrap();

        assert_eq!(state.tasks["t1"].status, TaskStatus::Descoped);
    }

    #[test]
    fn rollback_refuses_past_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let git = git_in(dir.path());
        let mut state = LoopState::new("sprint-1", dir.path());
        state.git.rollbacks_so_far = 3;
        state.add_checkpoint(GitCheckpoint {
            label: "cp1".to_string(),
            commit_hash: git.current_commit().unwrap(),
            timestamp: Utc::now(),
            tasks_completed: 0,
            verifications_passing: 0,
            value_score: 0.0,
        });

        let result = CourseCorrector::apply(
            &mut state,
            &git,
            3,
            CourseCorrection::Rollback {
                rollback_to_checkpoint: "cp1".to_string(),
                reason: "bad diff".to_string(),
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn rollback_scopes_invalidation_to_reverted_tasks_and_rechecks_services() {
        let dir = tempfile::tempdir().unwrap();
        let git = git_in(dir.path());
        let mut state = LoopState::new("sprint-1", dir.path());

        let checkpoint_time = Utc::now();
        state.add_checkpoint(GitCheckpoint {
            label: "cp1".to_string(),
            commit_hash: git.current_commit().unwrap(),
            timestamp: checkpoint_time,
            tasks_completed: 0,
            verifications_passing: 0,
            value_score: 0.0,
        });

        // Already pending before the checkpoint; rollback must leave it alone.
        state.insert_task(Task::new("t1", TaskSource::Plan, "d", "v", "a"));
        let mut v1 = Verification::new("v1", "scripts/v1.sh", VerificationCategory::Unit, vec!["t1".to_string()]);
        v1.status = VerificationStatus::Passed;
        state.insert_verification(v1);

        // Completed after the checkpoint; rollback reverts it to pending.
        let mut t2 = Task::new("t2", TaskSource::Plan, "d", "v", "a");
        t2.status = TaskStatus::Done;
        t2.updated_at = checkpoint_time + chrono::Duration::seconds(10);
        state.insert_task(t2);
        let mut v2 = Verification::new("v2", "scripts/v2.sh", VerificationCategory::Unit, vec!["t2".to_string()]);
        v2.status = VerificationStatus::Passed;
        state.insert_verification(v2);

        state.context.services.insert("db".to_string(), true);

        CourseCorrector::apply(
            &mut state,
            &git,
            3,
            CourseCorrection::Rollback {
                rollback_to_checkpoint: "cp1".to_string(),
                reason: "regression".to_string(),
            },
        )
        .unwrap();

        assert_eq!(state.tasks["t2"].status, TaskStatus::Pending);
        assert_eq!(state.verifications["v1"].status, VerificationStatus::Passed);
        assert_eq!(state.verifications["v2"].status, VerificationStatus::Invalidated);
        assert_eq!(state.context.services["db"], false);
    }

    #[test]
    fn regenerate_tests_removes_verifications_so_generate_qc_fires_next() {
        let dir = tempfile::tempdir().unwrap();
        let git = git_in(dir.path());
        let mut state = LoopState::new("sprint-1", dir.path());
        let v = Verification::new("v1", "scripts/v1.sh", VerificationCategory::Unit, vec!["t1".to_string()]);
        state.insert_verification(v);

        CourseCorrector::apply(
            &mut state,
            &git,
            3,
            CourseCorrection::RegenerateTests {
                verification_ids: vec!["v1".to_string()],
                reason: "flaky script".to_string(),
            },
        )
        .unwrap();

        assert!(!state.verifications.contains_key("v1"));
    }

    #[test]
    fn escalate_sets_pause_state() {
        let dir = tempfile::tempdir().unwrap();
        let git = git_in(dir.path());
        let mut state = LoopState::new("sprint-1", dir.path());

        CourseCorrector::apply(
            &mut state,
            &git,
            3,
            CourseCorrection::Escalate {
                reason: "ambiguous requirement".to_string(),
                instructions: "clarify acceptance criteria for t1".to_string(),
            },
        )
        .unwrap();

        assert!(state.pause.is_some());
    }
}
