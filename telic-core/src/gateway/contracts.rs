//! Structured tool-call contracts the gateway must route
//!
//! Parsing is fail-closed: an unparseable or out-of-bounds payload never
//! panics and never silently proceeds — it downgrades to a conservative,
//! clearly-marked failure value the caller must handle.

use crate::state::{CoherenceMode, Gap, GapSeverity, HealthStatus, TaskSource, VrcRecommendation};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_DESCRIPTION_LEN: usize = crate::state::MAX_DESCRIPTION_LEN;
pub const MAX_FILES_EXPECTED: usize = crate::state::MAX_FILES_EXPECTED;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReportVrcCall {
    pub value_score: f64,
    pub deliverables_verified: u32,
    pub deliverables_total: u32,
    #[serde(default)]
    pub deliverables_blocked: u32,
    #[serde(default)]
    pub gaps: Vec<GapPayload>,
    pub recommendation: VrcRecommendation,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GapPayload {
    pub id: String,
    pub severity: GapSeverity,
    #[serde(default)]
    pub suggested_task: Option<String>,
}

impl From<GapPayload> for Gap {
    fn from(g: GapPayload) -> Self {
        Gap {
            id: g.id,
            severity: g.severity,
            suggested_task: g.suggested_task,
        }
    }
}

/// Parse a `report_vrc` tool-call payload. Fail-closed: an unparseable
/// payload becomes a zero-confidence report recommending `CONTINUE`, never
/// `SHIP_READY`.
pub fn parse_report_vrc(raw: &Value) -> ReportVrcCall {
    match serde_json::from_value::<ReportVrcCall>(raw.clone()) {
        Ok(call) => call,
        Err(e) => {
            tracing::warn!(error = %e, "report_vrc payload failed schema validation, failing closed");
            ReportVrcCall {
                value_score: 0.0,
                deliverables_verified: 0,
                deliverables_total: 0,
                deliverables_blocked: 0,
                gaps: vec![GapPayload {
                    id: "unparseable-vrc-response".to_string(),
                    severity: GapSeverity::Blocking,
                    suggested_task: None,
                }],
                recommendation: VrcRecommendation::Continue,
                summary: "agent did not emit a valid report_vrc call".to_string(),
            }
        }
    }
}

impl ReportVrcCall {
    /// Materialize a parsed `report_vrc` call into the `VrcSnapshot` shape
    /// `LoopState::push_vrc` stores, stamping the iteration and wall-clock
    /// time the caller observed rather than anything agent-supplied.
    pub fn into_snapshot(self, iteration: u32) -> crate::state::VrcSnapshot {
        crate::state::VrcSnapshot {
            iteration,
            timestamp: chrono::Utc::now(),
            deliverables_total: self.deliverables_total,
            deliverables_verified: self.deliverables_verified,
            deliverables_blocked: self.deliverables_blocked,
            value_score: self.value_score,
            gaps: self.gaps.into_iter().map(Gap::from).collect(),
            recommendation: self.recommendation,
            summary: self.summary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CourseCorrectionVerb {
    Restructure,
    Descope,
    NewTasks,
    Rollback,
    RegenerateTests,
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReportCourseCorrectionCall {
    pub action: CourseCorrectionVerb,
    pub reason: String,
    #[serde(default)]
    pub rollback_to_checkpoint: Option<String>,
    #[serde(default)]
    pub tasks_to_restructure: Vec<String>,
    /// Only read when `action == new_tasks`; the task definitions to insert.
    #[serde(default)]
    pub new_tasks: Vec<TaskMutationCall>,
}

pub fn parse_report_course_correction(raw: &Value) -> Option<ReportCourseCorrectionCall> {
    match serde_json::from_value(raw.clone()) {
        Ok(call) => Some(call),
        Err(e) => {
            tracing::warn!(error = %e, "report_course_correction payload failed schema validation");
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReportCoherenceCall {
    pub mode: CoherenceMode,
    pub dimensions: Vec<CoherenceDimensionPayload>,
    pub overall: HealthStatus,
    #[serde(default)]
    pub top_findings: Vec<String>,
    #[serde(default)]
    pub comparison_to_previous: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CoherenceDimensionPayload {
    pub dimension: String,
    pub status: HealthStatus,
    #[serde(default)]
    pub findings: Vec<String>,
}

pub fn parse_report_coherence(raw: &Value) -> Option<ReportCoherenceCall> {
    serde_json::from_value(raw.clone()).ok()
}

/// Task-mutation tool-call, validated at the gateway against the
/// granularity caps before it ever reaches `StateStore`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskMutationCall {
    pub id: String,
    pub source: TaskSource,
    pub description: String,
    pub value: String,
    pub acceptance: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files_expected: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GranularityViolation {
    DescriptionTooLong { actual: usize, max: usize },
    TooManyFiles { actual: usize, max: usize },
}

/// Enforce the description-length and files-count caps on a task mutation.
pub fn validate_task_mutation(call: &TaskMutationCall) -> Result<(), GranularityViolation> {
    if call.description.len() > MAX_DESCRIPTION_LEN {
        return Err(GranularityViolation::DescriptionTooLong {
            actual: call.description.len(),
            max: MAX_DESCRIPTION_LEN,
        });
    }
    if call.files_expected.len() > MAX_FILES_EXPECTED {
        return Err(GranularityViolation::TooManyFiles {
            actual: call.files_expected.len(),
            max: MAX_FILES_EXPECTED,
        });
    }
    Ok(())
}

// ===========================================================================
// EXECUTE / FIX — builder and fixer diff reports
// ===========================================================================

/// What a BUILDER or FIXER turn reports about the diff it produced. The
/// scope fence checks `files_changed` against `Task::files_expected`
/// before the caller integrates anything into state.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReportDiffCall {
    #[serde(default)]
    pub files_changed: Vec<String>,
    pub summary: String,
}

pub fn parse_report_diff(raw: &Value) -> Option<ReportDiffCall> {
    serde_json::from_value(raw.clone()).ok()
}

/// Fail-closed scope-fence check: every changed file must be declared in
/// `files_expected`, unless the task left it empty (unscoped by the plan).
pub fn scope_fence_violation(files_changed: &[String], files_expected: &[std::path::PathBuf]) -> Option<Vec<String>> {
    if files_expected.is_empty() {
        return None;
    }
    let allowed: Vec<String> = files_expected.iter().map(|p| p.to_string_lossy().to_string()).collect();
    let violations: Vec<String> = files_changed
        .iter()
        .filter(|f| !allowed.contains(f))
        .cloned()
        .collect();
    if violations.is_empty() {
        None
    } else {
        Some(violations)
    }
}

// ===========================================================================
// GENERATE_QC
// ===========================================================================

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QcVerificationPayload {
    pub id: String,
    pub script_path: String,
    pub script_body: String,
    pub category: crate::state::VerificationCategory,
    #[serde(default)]
    pub covers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReportQcPlanCall {
    #[serde(default)]
    pub verifications: Vec<QcVerificationPayload>,
}

pub fn parse_report_qc_plan(raw: &Value) -> Option<ReportQcPlanCall> {
    serde_json::from_value(raw.clone()).ok()
}

// ===========================================================================
// SERVICE_FIX
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServiceClassification {
    ArchitectureGap,
    ExternalBlocker,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReportServiceClassificationCall {
    pub classification: ServiceClassification,
    pub reasoning: String,
    #[serde(default)]
    pub startup_task: Option<TaskMutationCall>,
    #[serde(default)]
    pub blocked_task_ids: Vec<String>,
}

pub fn parse_report_service_classification(raw: &Value) -> Option<ReportServiceClassificationCall> {
    serde_json::from_value(raw.clone()).ok()
}

// ===========================================================================
// RESEARCH
// ===========================================================================

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReportResearchCall {
    pub note: String,
    #[serde(default)]
    pub mid_loop_tasks: Vec<TaskMutationCall>,
}

pub fn parse_report_research(raw: &Value) -> Option<ReportResearchCall> {
    serde_json::from_value(raw.clone()).ok()
}

// ===========================================================================
// CRITICAL_EVAL
// ===========================================================================

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReportCriticalEvalCall {
    pub structural_pass: bool,
    #[serde(default)]
    pub structural_findings: Vec<String>,
    /// Absent when stage A (structural) already failed — stage B never runs.
    #[serde(default)]
    pub visual_pass: Option<bool>,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub gap_tasks: Vec<TaskMutationCall>,
}

pub fn parse_report_critical_eval(raw: &Value) -> Option<ReportCriticalEvalCall> {
    serde_json::from_value(raw.clone()).ok()
}

impl TaskMutationCall {
    /// Materialize into a full `Task`, used by every handler that turns an
    /// agent-authored tool-call into state (RESEARCH's mid-loop tasks,
    /// SERVICE_FIX's startup task, CRITICAL_EVAL's gap tasks).
    pub fn into_task(self) -> crate::state::Task {
        let mut task = crate::state::Task::new(self.id, self.source, self.description, self.value, self.acceptance);
        task.dependencies = self.dependencies;
        task.files_expected = self.files_expected.into_iter().map(std::path::PathBuf::from).collect();
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_vrc_payload_fails_closed() {
        let raw = json!({"not": "a vrc report"});
        let call = parse_report_vrc(&raw);
        assert_eq!(call.recommendation, VrcRecommendation::Continue);
        assert!(!call.gaps.is_empty());
    }

    #[test]
    fn well_formed_vrc_payload_parses() {
        let raw = json!({
            "value_score": 0.8,
            "deliverables_verified": 4,
            "deliverables_total": 5,
            "recommendation": "continue",
            "summary": "on track"
        });
        let call = parse_report_vrc(&raw);
        assert_eq!(call.deliverables_total, 5);
    }

    #[test]
    fn oversized_description_is_rejected() {
        let call = TaskMutationCall {
            id: "t1".to_string(),
            source: TaskSource::Plan,
            description: "x".repeat(MAX_DESCRIPTION_LEN + 1),
            value: "v".to_string(),
            acceptance: "a".to_string(),
            dependencies: vec![],
            files_expected: vec![],
        };
        assert_eq!(
            validate_task_mutation(&call),
            Err(GranularityViolation::DescriptionTooLong {
                actual: MAX_DESCRIPTION_LEN + 1,
                max: MAX_DESCRIPTION_LEN
            })
        );
    }

    #[test]
    fn too_many_files_expected_is_rejected() {
        let call = TaskMutationCall {
            id: "t1".to_string(),
            source: TaskSource::Plan,
            description: "d".to_string(),
            value: "v".to_string(),
            acceptance: "a".to_string(),
            dependencies: vec![],
            files_expected: (0..MAX_FILES_EXPECTED + 1).map(|i| format!("f{i}.rs")).collect(),
        };
        assert!(validate_task_mutation(&call).is_err());
    }

    #[test]
    fn scope_fence_allows_declared_files() {
        let expected = vec![std::path::PathBuf::from("src/a.rs")];
        assert!(scope_fence_violation(&["src/a.rs".to_string()], &expected).is_none());
    }

    #[test]
    fn scope_fence_flags_undeclared_files() {
        let expected = vec![std::path::PathBuf::from("src/a.rs")];
        let violation = scope_fence_violation(&["src/a.rs".to_string(), "src/b.rs".to_string()], &expected);
        assert_eq!(violation, Some(vec!["src/b.rs".to_string()]));
    }

    #[test]
    fn scope_fence_is_a_noop_when_task_left_files_unscoped() {
        assert!(scope_fence_violation(&["anything.rs".to_string()], &[]).is_none());
    }
}
