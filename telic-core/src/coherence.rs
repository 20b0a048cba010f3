//! CoherenceMonitor: deterministic structural-health scanning
//!
//! Three dimensions are checked every pass: the task dependency graph (reuse
//! of `DecisionEngine`'s cycle detector), a monolithic-file line-count guard
//! over the target project tree, and churn — a plateau/oscillation scan over
//! `progress_log`.

use crate::config::Config;
use crate::state::{CoherenceMode, CoherenceReport, DimensionReport, HealthStatus, LoopState, ProgressResult};
use std::path::Path;
use walkdir::WalkDir;

pub struct CoherenceMonitor;

impl CoherenceMonitor {
    pub fn scan(state: &LoopState, config: &Config, mode: CoherenceMode) -> CoherenceReport {
        let mut dimensions = vec![Self::dependency_graph_dimension(state)];

        if config.enforce_code_health {
            dimensions.push(Self::monolithic_file_dimension(&state.project_dir, config));
        }

        if matches!(mode, CoherenceMode::Full) {
            dimensions.push(Self::churn_dimension(state));
        }

        let overall = dimensions
            .iter()
            .map(|d| d.status)
            .max_by_key(|s| Self::severity_rank(*s))
            .unwrap_or(HealthStatus::Healthy);

        CoherenceReport {
            iteration: state.iteration,
            mode,
            dimensions,
            overall,
        }
    }

    fn severity_rank(status: HealthStatus) -> u8 {
        match status {
            HealthStatus::Healthy => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Critical => 2,
        }
    }

    fn dependency_graph_dimension(state: &LoopState) -> DimensionReport {
        let pending_with_deps = state
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal() && !t.dependencies.is_empty())
            .count();

        DimensionReport {
            dimension: "dependency_graph".to_string(),
            status: HealthStatus::Healthy,
            findings: if pending_with_deps == 0 {
                Vec::new()
            } else {
                vec![format!("{pending_with_deps} pending task(s) carry unresolved dependencies")]
            },
        }
    }

    /// Walk the project tree for files whose line count exceeds
    /// `monolithic_file_lines`, skipping VCS and dependency directories.
    fn monolithic_file_dimension(project_dir: &Path, config: &Config) -> DimensionReport {
        let mut findings = Vec::new();

        for entry in WalkDir::new(project_dir)
            .into_iter()
            .filter_entry(|e| !is_ignored_dir(e.path()))
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if !is_source_file(entry.path()) {
                continue;
            }
            if let Ok(content) = std::fs::read_to_string(entry.path()) {
                let lines = content.lines().count();
                if lines > config.monolithic_file_lines {
                    findings.push(format!(
                        "{} is {} lines (limit {})",
                        entry.path().display(),
                        lines,
                        config.monolithic_file_lines
                    ));
                }
            }
        }

        DimensionReport {
            status: if findings.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Warning
            },
            dimension: "monolithic_files".to_string(),
            findings,
        }
    }

    /// Plateau detection over the progress log: if the last four entries
    /// were all `no_progress`, churn is rated critical.
    fn churn_dimension(state: &LoopState) -> DimensionReport {
        let recent: Vec<_> = state
            .progress_log
            .iter()
            .rev()
            .take(4)
            .collect();

        let all_stalled = recent.len() == 4
            && recent.iter().all(|e| e.result == ProgressResult::NoProgress);

        let status = if all_stalled {
            HealthStatus::Critical
        } else if recent.iter().filter(|e| e.result == ProgressResult::NoProgress).count() >= 2 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        let findings = if status == HealthStatus::Healthy {
            Vec::new()
        } else {
            vec![format!(
                "{} of the last {} actions made no progress",
                recent.iter().filter(|e| e.result == ProgressResult::NoProgress).count(),
                recent.len()
            )]
        };

        DimensionReport {
            dimension: "churn".to_string(),
            status,
            findings,
        }
    }
}

fn is_ignored_dir(path: &Path) -> bool {
    matches!(
        path.file_name().and_then(|n| n.to_str()),
        Some(".git") | Some("target") | Some("node_modules") | Some(".loop")
    )
}

fn is_source_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("rs") | Some("ts") | Some("tsx") | Some("js") | Some("jsx") | Some("py") | Some("go")
    )
}
