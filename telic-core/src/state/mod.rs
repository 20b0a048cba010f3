//! The single authoritative state object and its mutation discipline
//!
//! `LoopState` is owned exclusively by the scheduler thread. Handlers
//! receive it by reference and mutate only through the methods below, each
//! of which preserves the documented invariants (at most one in-progress
//! task, retry ceilings, verification/task regression coupling). Persistence
//! is driven by `StateStore`, not by `LoopState` itself.

pub mod store;
pub mod types;

pub use store::StateStore;
pub use types::*;

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;

/// The root, single-instance, fully serializable loop state.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LoopState {
    pub sprint: String,
    pub project_dir: PathBuf,

    pub iteration: u32,
    pub iterations_without_progress: u32,
    pub total_tokens_used: u64,
    pub exit_gate_attempts: u32,
    pub mid_loop_tasks_since_health_check: u32,
    pub tasks_since_last_coherence: u32,
    pub coherence_critical_pending: bool,

    pub tasks: HashMap<String, Task>,
    /// Insertion order of task ids, needed for the intra-category tie-break
    /// in DecisionEngine rule 7.
    pub task_order: Vec<String>,

    pub verifications: HashMap<String, Verification>,

    pub vrc_history: Vec<VrcSnapshot>,
    pub coherence_history: Vec<CoherenceReport>,
    pub checkpoints: Vec<GitCheckpoint>,
    pub progress_log: Vec<ProgressEntry>,
    /// Every error encountered, for the delivery report's provenance list.
    #[serde(default)]
    pub errors: Vec<crate::error::ErrorProvenance>,

    pub pause: Option<PauseState>,
    pub git: GitState,

    #[serde(default)]
    pub context: LoopContext,

    #[serde(skip, default)]
    pub inbox: AgentResultInbox,

    /// Re-applied from `Config::max_task_retries` on every load; not
    /// persisted so a config change takes effect immediately on resume.
    #[serde(skip, default = "default_retry_ceiling")]
    pub max_task_retries_hint: u32,
}

fn default_retry_ceiling() -> u32 {
    3
}

/// Externally-observed context the DecisionEngine reads but does not probe
/// for itself.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LoopContext {
    /// Per-service health, populated by SERVICE_FIX / upstream probes.
    #[serde(default)]
    pub services: HashMap<String, bool>,
    /// Whether the deliverable has a user-visible surface (gates CRITICAL_EVAL).
    #[serde(default)]
    pub has_visible_surface: bool,
}

impl LoopState {
    pub fn new(sprint: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            sprint: sprint.into(),
            project_dir: project_dir.into(),
            iteration: 0,
            iterations_without_progress: 0,
            total_tokens_used: 0,
            exit_gate_attempts: 0,
            mid_loop_tasks_since_health_check: 0,
            tasks_since_last_coherence: 0,
            coherence_critical_pending: false,
            tasks: HashMap::new(),
            task_order: Vec::new(),
            verifications: HashMap::new(),
            vrc_history: Vec::new(),
            coherence_history: Vec::new(),
            checkpoints: Vec::new(),
            progress_log: Vec::new(),
            errors: Vec::new(),
            pause: None,
            git: GitState::default(),
            context: LoopContext::default(),
            inbox: AgentResultInbox::default(),
            max_task_retries_hint: default_retry_ceiling(),
        }
    }

    // -- iteration bookkeeping ----------------------------------------------

    /// Advance to the next iteration. Strictly increasing per invariant 4.
    pub fn begin_iteration(&mut self) {
        self.iteration += 1;
        self.inbox.clear();
    }

    pub fn add_tokens(&mut self, input: u64, output: u64) {
        self.total_tokens_used += input + output;
    }

    pub fn budget_fraction(&self, token_budget: u64) -> f64 {
        if token_budget == 0 {
            return 1.0;
        }
        self.total_tokens_used as f64 / token_budget as f64
    }

    /// Record an error with provenance for the delivery report's blocker list.
    pub fn record_error(&mut self, action: impl Into<String>, err: &crate::error::LoopError) {
        self.errors
            .push(crate::error::ErrorProvenance::new(self.iteration, action, err));
    }

    pub fn record_progress(&mut self, entry: ProgressEntry) {
        if entry.result == ProgressResult::NoProgress {
            self.iterations_without_progress += 1;
        } else {
            self.iterations_without_progress = 0;
        }
        self.progress_log.push(entry);
    }

    // -- task mutation (invariant 1, 2) -------------------------------------

    /// Number of tasks currently `in_progress`. Must never exceed 1.
    pub fn in_progress_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count()
    }

    pub fn insert_task(&mut self, task: Task) {
        if !self.tasks.contains_key(&task.id) {
            self.task_order.push(task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task);
    }

    /// Begin work on a task, enforcing invariant 1 (at most one in_progress).
    pub fn start_task(&mut self, task_id: &str) -> crate::error::LoopResult<()> {
        if self.in_progress_count() > 0 {
            return Err(crate::error::LoopError::invariant(
                "another task is already in_progress",
            ));
        }
        if let Some(t) = self.tasks.get_mut(task_id) {
            t.status = TaskStatus::InProgress;
            t.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Reset an in-progress task back to pending (handler exception, timeout,
    /// or crash recovery), matching every action handler's pre/post discipline.
    pub fn reset_task_to_pending(&mut self, task_id: &str) {
        if let Some(t) = self.tasks.get_mut(task_id) {
            t.status = TaskStatus::Pending;
            t.updated_at = Utc::now();
        }
    }

    /// Mark a task done, invalidating any `passed` verification covering a
    /// task that was previously done and regresses (invariant 3) is the
    /// mirror operation, `reopen_task`.
    pub fn complete_task(&mut self, task_id: &str) {
        if let Some(t) = self.tasks.get_mut(task_id) {
            t.status = TaskStatus::Done;
            t.updated_at = Utc::now();
        }
    }

    pub fn block_task(&mut self, task_id: &str, reason: impl Into<String>) {
        if let Some(t) = self.tasks.get_mut(task_id) {
            t.status = TaskStatus::Blocked;
            t.blocked_reason = Some(reason.into());
            t.updated_at = Utc::now();
        }
    }

    /// `done → pending` on regression or rollback. Bumps `retry_count` and
    /// invalidates any verification that covers this task (invariant 3).
    pub fn reopen_task(&mut self, task_id: &str) {
        let was_done = self
            .tasks
            .get(task_id)
            .map(|t| t.status == TaskStatus::Done)
            .unwrap_or(false);
        if let Some(t) = self.tasks.get_mut(task_id) {
            t.status = TaskStatus::Pending;
            t.retry_count += 1;
            t.updated_at = Utc::now();
        }
        if was_done {
            self.invalidate_verifications_covering(task_id);
        }
        self.enforce_retry_ceiling(task_id);
    }

    /// Invariant 2: once `retry_count >= max_task_retries`, the task must be
    /// `descoped` or carry a builder-supplied `resolution_note` override.
    pub fn enforce_retry_ceiling(&mut self, task_id: &str) {
        let (retry_count, has_override, status) = match self.tasks.get(task_id) {
            Some(t) => (
                t.retry_count,
                t.resolution_note.is_some(),
                t.status,
            ),
            None => return,
        };
        if status.is_terminal() || has_override {
            return;
        }
        let max = self.max_task_retries_hint;
        if retry_count >= max {
            if let Some(t) = self.tasks.get_mut(task_id) {
                t.status = TaskStatus::Descoped;
                t.updated_at = Utc::now();
            }
        }
    }

    pub fn descope_task(&mut self, task_id: &str) {
        if let Some(t) = self.tasks.get_mut(task_id) {
            t.status = TaskStatus::Descoped;
            t.updated_at = Utc::now();
        }
    }

    /// Tasks ordered by source precedence then insertion order, per rule 7.
    pub fn executable_tasks(&self) -> Vec<&Task> {
        let mut candidates: Vec<&Task> = self
            .task_order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.status == TaskStatus::Pending && t.dependencies_met(&self.tasks))
            .collect();
        candidates.sort_by_key(|t| t.source);
        candidates
    }

    // -- verification mutation (invariant 3) --------------------------------

    pub fn insert_verification(&mut self, v: Verification) {
        self.verifications.insert(v.id.clone(), v);
    }

    pub fn invalidate_verifications_covering(&mut self, task_id: &str) {
        for v in self.verifications.values_mut() {
            if v.covers.iter().any(|c| c == task_id) && v.status == VerificationStatus::Passed {
                v.status = VerificationStatus::Invalidated;
            }
        }
    }

    pub fn invalidate_all(&mut self, ids: &[String]) {
        for id in ids {
            if let Some(v) = self.verifications.get_mut(id) {
                v.status = VerificationStatus::Invalidated;
            }
        }
    }

    /// Drop verifications outright (course-correct `regenerate_tests`):
    /// unlike invalidation, this leaves their covered tasks with no
    /// verification on record at all, so rule 8 selects GENERATE_QC next
    /// instead of rule 9 re-selecting the same scripts via RUN_QC.
    pub fn remove_verifications(&mut self, ids: &[String]) {
        for id in ids {
            self.verifications.remove(id);
        }
    }

    /// Mark every tracked service unhealthy, forcing rule 5 to re-probe them
    /// on the next iteration. Used after a rollback, which may have reverted
    /// the startup task that last marked a service healthy.
    pub fn reset_all_services_unhealthy(&mut self) {
        for healthy in self.context.services.values_mut() {
            *healthy = false;
        }
    }

    // -- checkpoints / rollback ----------------------------------------------

    pub fn add_checkpoint(&mut self, checkpoint: GitCheckpoint) {
        self.checkpoints.push(checkpoint);
    }

    pub fn find_checkpoint(&self, label: &str) -> Option<&GitCheckpoint> {
        self.checkpoints.iter().find(|c| c.label == label)
    }

    // -- coherence / vrc history ----------------------------------------------

    pub fn push_vrc(&mut self, snap: VrcSnapshot) {
        self.vrc_history.push(snap);
    }

    pub fn latest_vrc(&self) -> Option<&VrcSnapshot> {
        self.vrc_history.last()
    }

    pub fn push_coherence(&mut self, report: CoherenceReport) {
        self.coherence_critical_pending = report.is_critical();
        self.coherence_history.push(report);
        self.tasks_since_last_coherence = 0;
    }

    pub fn latest_coherence(&self) -> Option<&CoherenceReport> {
        self.coherence_history.last()
    }

    /// Hash over `{task_id: status}`, used by VRCHeartbeat's skip-optimization
    /// to detect "no task changed status since the last VRC".
    pub fn task_status_hash(&self) -> u64 {
        let mut ids: Vec<&String> = self.tasks.keys().collect();
        ids.sort();
        let mut hasher = blake3::Hasher::new();
        for id in ids {
            let status = self.tasks[id].status;
            hasher.update(id.as_bytes());
            hasher.update(&[status as u8]);
        }
        let hash = hasher.finalize();
        u64::from_le_bytes(hash.as_bytes()[..8].try_into().unwrap())
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    pub fn all_verifications_passed(&self) -> bool {
        self.verifications
            .values()
            .all(|v| v.status == VerificationStatus::Passed)
    }

    // `max_task_retries_hint` is set once at scheduler startup from Config,
    // so `LoopState` methods that enforce invariant 2 don't need to thread a
    // `&Config` through every call site.
    pub fn with_retry_ceiling(mut self, max_task_retries: u32) -> Self {
        self.max_task_retries_hint = max_task_retries;
        self
    }
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new(String::new(), PathBuf::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> LoopState {
        LoopState::new("sprint-1", "/tmp/proj").with_retry_ceiling(3)
    }

    #[test]
    fn start_task_enforces_single_in_progress() {
        let mut s = state();
        s.insert_task(Task::new("t1", TaskSource::Plan, "d", "v", "a"));
        s.insert_task(Task::new("t2", TaskSource::Plan, "d", "v", "a"));
        s.start_task("t1").unwrap();
        assert!(s.start_task("t2").is_err());
    }

    #[test]
    fn reopen_invalidates_passed_verification_and_bumps_retry() {
        let mut s = state();
        let mut t = Task::new("t1", TaskSource::Plan, "d", "v", "a");
        t.status = TaskStatus::Done;
        s.insert_task(t);
        let mut v = Verification::new(
            "v1",
            "scripts/v1.sh",
            VerificationCategory::Unit,
            vec!["t1".to_string()],
        );
        v.status = VerificationStatus::Passed;
        s.insert_verification(v);

        s.reopen_task("t1");

        assert_eq!(s.tasks["t1"].status, TaskStatus::Pending);
        assert_eq!(s.tasks["t1"].retry_count, 1);
        assert_eq!(s.verifications["v1"].status, VerificationStatus::Invalidated);
    }

    #[test]
    fn retry_ceiling_descopes_without_override() {
        let mut s = state();
        let mut t = Task::new("t1", TaskSource::Plan, "d", "v", "a");
        t.status = TaskStatus::Done;
        s.insert_task(t);
        for _ in 0..3 {
            s.reopen_task("t1");
        }
        assert_eq!(s.tasks["t1"].status, TaskStatus::Descoped);
    }

    #[test]
    fn retry_ceiling_respects_resolution_note_override() {
        let mut s = state();
        let mut t = Task::new("t1", TaskSource::Plan, "d", "v", "a");
        t.status = TaskStatus::Done;
        s.insert_task(t);
        for _ in 0..2 {
            s.reopen_task("t1");
        }
        s.tasks.get_mut("t1").unwrap().resolution_note = Some("builder override".into());
        s.reopen_task("t1");
        assert_eq!(s.tasks["t1"].status, TaskStatus::Pending);
    }

    #[test]
    fn executable_tasks_orders_by_source_then_insertion() {
        let mut s = state();
        s.insert_task(Task::new("exit1", TaskSource::ExitGate, "d", "v", "a"));
        s.insert_task(Task::new("plan1", TaskSource::Plan, "d", "v", "a"));
        s.insert_task(Task::new("mid1", TaskSource::MidLoop, "d", "v", "a"));
        let order: Vec<&str> = s
            .executable_tasks()
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(order, vec!["plan1", "mid1", "exit1"]);
    }

    #[test]
    fn task_status_hash_changes_when_status_changes() {
        let mut s = state();
        s.insert_task(Task::new("t1", TaskSource::Plan, "d", "v", "a"));
        let h1 = s.task_status_hash();
        s.complete_task("t1");
        let h2 = s.task_status_hash();
        assert_ne!(h1, h2);
    }
}
