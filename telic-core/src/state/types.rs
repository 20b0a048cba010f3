//! Core entities of the value loop's single authoritative state object
//!
//! Every type here is plain data — serializable, cloneable, and free of
//! interior mutability — so that `LoopState` as a whole round-trips through
//! JSON with structural equality. Mutation discipline (which methods may
//! touch which fields) lives on `LoopState` itself in `state/mod.rs`, not
//! here.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ===========================================================================
// Task
// ===========================================================================

/// Where a task originated, used as the primary EXECUTE ordering key: `plan < mid_loop < regression < critical_eval < exit_gate < refactor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Plan,
    MidLoop,
    Regression,
    CriticalEval,
    ExitGate,
    Refactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Blocked,
    Descoped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Blocked | Self::Descoped)
    }
}

/// Maximum length of `Task::description`, enforced at the gateway as an
/// agent-tool granularity cap.
pub const MAX_DESCRIPTION_LEN: usize = 600;
/// Maximum number of `files_expected` entries.
pub const MAX_FILES_EXPECTED: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub source: TaskSource,
    pub description: String,
    pub value: String,
    pub acceptance: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files_expected: Vec<PathBuf>,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub health_checked: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resolution_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub blocked_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        source: TaskSource,
        description: impl Into<String>,
        value: impl Into<String>,
        acceptance: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            source,
            description: description.into(),
            value: value.into(),
            acceptance: acceptance.into(),
            dependencies: Vec::new(),
            files_expected: Vec::new(),
            status: TaskStatus::Pending,
            retry_count: 0,
            health_checked: false,
            resolution_note: None,
            blocked_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn dependencies_met(&self, tasks: &HashMap<String, Task>) -> bool {
        self.dependencies.iter().all(|dep| {
            tasks
                .get(dep)
                .map(|t| t.status == TaskStatus::Done)
                .unwrap_or(false)
        })
    }
}

// ===========================================================================
// Verification
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationCategory {
    Unit,
    Integration,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Passed,
    Failed,
    Invalidated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub id: String,
    pub script_path: PathBuf,
    pub category: VerificationCategory,
    pub status: VerificationStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<String>,
    pub covers: Vec<String>,
}

impl Verification {
    pub fn new(
        id: impl Into<String>,
        script_path: impl Into<PathBuf>,
        category: VerificationCategory,
        covers: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            script_path: script_path.into(),
            category,
            status: VerificationStatus::Pending,
            attempts: 0,
            last_error: None,
            covers,
        }
    }

    pub fn needs_run(&self) -> bool {
        matches!(
            self.status,
            VerificationStatus::Pending | VerificationStatus::Invalidated
        )
    }
}

// ===========================================================================
// VRC (Vision Reality Check)
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GapSeverity {
    Critical,
    Blocking,
    Degraded,
    Polish,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gap {
    pub id: String,
    pub severity: GapSeverity,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub suggested_task: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VrcRecommendation {
    Continue,
    CourseCorrect,
    Descope,
    ShipReady,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VrcSnapshot {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub deliverables_total: u32,
    pub deliverables_verified: u32,
    pub deliverables_blocked: u32,
    pub value_score: f64,
    pub gaps: Vec<Gap>,
    pub recommendation: VrcRecommendation,
    pub summary: String,
}

impl VrcSnapshot {
    /// Gaps rated severe enough to forbid `ShipReady`.
    pub fn has_shipping_blockers(&self) -> bool {
        self.gaps.iter().any(|g| {
            matches!(
                g.severity,
                GapSeverity::Critical | GapSeverity::Blocking | GapSeverity::Degraded
            )
        })
    }
}

// ===========================================================================
// Coherence
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CoherenceMode {
    Quick,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionReport {
    pub dimension: String,
    pub status: HealthStatus,
    pub findings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoherenceReport {
    pub iteration: u32,
    pub mode: CoherenceMode,
    pub dimensions: Vec<DimensionReport>,
    pub overall: HealthStatus,
}

impl CoherenceReport {
    pub fn is_critical(&self) -> bool {
        self.overall == HealthStatus::Critical
    }
}

// ===========================================================================
// Git checkpoint
// ===========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCheckpoint {
    pub label: String,
    pub commit_hash: String,
    pub timestamp: DateTime<Utc>,
    pub tasks_completed: u32,
    pub verifications_passing: u32,
    pub value_score: f64,
}

/// Git-related scalars tracked on `LoopState`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GitState {
    #[serde(default)]
    pub current_branch: Option<String>,
    #[serde(default)]
    pub rollbacks_so_far: u32,
}

// ===========================================================================
// Pause state
// ===========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseState {
    pub reason: String,
    pub instructions: String,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PauseState {
    pub fn new(reason: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            instructions: instructions.into(),
            requested_at: Utc::now(),
            resolved_at: None,
        }
    }
}

// ===========================================================================
// Progress entry
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressResult {
    Progress,
    NoProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub iteration: u32,
    pub action: String,
    pub result: ProgressResult,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_sec: f64,
}

// ===========================================================================
// Agent tool-call inbox
// ===========================================================================

/// Transient per-iteration inbox of structured tool-call outputs, keyed by
/// tool name. Cleared at the start of each handler invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResultInbox {
    #[serde(default)]
    pub results: HashMap<String, serde_json::Value>,
}

impl AgentResultInbox {
    pub fn clear(&mut self) {
        self.results.clear();
    }

    pub fn insert(&mut self, tool: impl Into<String>, value: serde_json::Value) {
        self.results.insert(tool.into(), value);
    }

    pub fn get(&self, tool: &str) -> Option<&serde_json::Value> {
        self.results.get(tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_source_orders_per_precedence_rule() {
        assert!(TaskSource::Plan < TaskSource::MidLoop);
        assert!(TaskSource::MidLoop < TaskSource::Regression);
        assert!(TaskSource::Regression < TaskSource::CriticalEval);
        assert!(TaskSource::CriticalEval < TaskSource::ExitGate);
        assert!(TaskSource::ExitGate < TaskSource::Refactor);
    }

    #[test]
    fn dependencies_met_requires_all_done() {
        let mut tasks = HashMap::new();
        let mut dep = Task::new("t1", TaskSource::Plan, "d", "v", "a");
        dep.status = TaskStatus::Done;
        tasks.insert("t1".to_string(), dep);

        let mut t2 = Task::new("t2", TaskSource::Plan, "d", "v", "a");
        t2.dependencies = vec!["t1".to_string()];
        assert!(t2.dependencies_met(&tasks));

        t2.dependencies.push("t3".to_string());
        assert!(!t2.dependencies_met(&tasks));
    }

    #[test]
    fn vrc_shipping_blockers_exclude_polish() {
        let snap = VrcSnapshot {
            iteration: 1,
            timestamp: Utc::now(),
            deliverables_total: 2,
            deliverables_verified: 2,
            deliverables_blocked: 0,
            value_score: 0.9,
            gaps: vec![Gap {
                id: "g1".into(),
                severity: GapSeverity::Polish,
                suggested_task: None,
            }],
            recommendation: VrcRecommendation::ShipReady,
            summary: "ok".into(),
        };
        assert!(!snap.has_shipping_blockers());
    }
}
