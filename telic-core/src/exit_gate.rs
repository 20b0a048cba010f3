//! ExitGate: the terminal action handler, a fresh-context verification
//! sequence that is the only valid ship condition
//!
//! Reuses the deterministic scans `CoherenceMonitor` already performs for
//! the coherence step and code-health enforcement rather than reimplementing
//! them. Each step is fail-fast: the first failing step inserts gap tasks
//! (where relevant) and returns `false` so the loop keeps iterating instead
//! of stalling inside a single long-running gate call.

use crate::actions::{critical_eval, LoopServices};
use crate::coherence::CoherenceMonitor;
use crate::config::Config;
use crate::error::LoopResult;
use crate::gateway::contracts::parse_report_vrc;
use crate::gateway::{extract_json, Role};
use crate::state::{CoherenceMode, LoopState, Task, TaskSource, VrcRecommendation};
use crate::verifier::apply_outcomes;
use crate::vrc::VRCHeartbeat;

pub async fn run(config: &Config, state: &mut LoopState, services: &LoopServices) -> LoopResult<bool> {
    state.exit_gate_attempts += 1;

    // Safety valve: too many attempts means we report honestly instead of
    // looping forever on a gate that can't pass.
    if state.exit_gate_attempts > config.max_exit_gate_attempts {
        tracing::warn!(
            attempts = state.exit_gate_attempts,
            "exit gate safety valve tripped, terminating with a partial report"
        );
        return Ok(true);
    }

    // Step 1: coherence, full scan.
    let coherence = CoherenceMonitor::scan(state, config, CoherenceMode::Full);
    state.push_coherence(coherence);
    if state.coherence_critical_pending {
        tracing::warn!("exit gate failed at the coherence scan");
        return Ok(false);
    }

    // Step 2: full regression sweep of every verification, not just the ones
    // that need_run — a verification already `passed` still gets re-run here
    // because the exit gate's whole point is a fresh-context check.
    // `run_pending` only ever executes a `needs_run()` verification, so every
    // verification is force-invalidated first; otherwise an already-passed
    // one would never actually re-execute.
    let mut all_verifications: Vec<_> = state.verifications.values().cloned().collect();
    if !all_verifications.is_empty() {
        for v in &mut all_verifications {
            v.status = crate::state::VerificationStatus::Invalidated;
        }
        let outcomes = services.verifier.run_pending(&all_verifications).await?;
        apply_outcomes(&mut state.verifications, &outcomes);
        if !state.all_verifications_passed() {
            tracing::warn!("exit gate failed the regression sweep");
            return Ok(false);
        }
    }

    // Step 3: fresh-context VRC, forced full.
    let prompt = "Fresh-context vision reality check ahead of shipping. Assess the \
         deliverable as if seeing it for the first time. Respond as JSON matching \
         report_vrc: {\"value_score\": ..., \"deliverables_verified\": ..., \
         \"deliverables_total\": ..., \"gaps\": [...], \"recommendation\": \
         \"continue|course_correct|descope|ship_ready\", \"summary\": \"...\"}.";
    let response = services.gateway.run(Role::Reasoner, prompt).await?;
    state.add_tokens(response.input_tokens, response.output_tokens);

    let raw_value = extract_json(&response.raw_text).unwrap_or(serde_json::Value::Null);
    let snapshot = parse_report_vrc(&raw_value).into_snapshot(state.iteration);
    let (snapshot, auto_tasks) = VRCHeartbeat::apply_ship_ready_guard(snapshot);
    let ship_ready = snapshot.recommendation == VrcRecommendation::ShipReady;
    state.push_vrc(snapshot);

    if !ship_ready {
        tracing::warn!("exit gate's fresh-context VRC did not recommend shipping");
        for gap in auto_tasks {
            let id = gap.suggested_task.clone().unwrap_or_else(|| format!("exit-gate-gap-{}", gap.id));
            let task = Task::new(
                id,
                TaskSource::ExitGate,
                format!("Close gap '{}' surfaced by the exit gate VRC", gap.id),
                "deliverable is shippable without this gap",
                "gap no longer present in the next VRC",
            );
            state.insert_task(task);
        }
        return Ok(false);
    }

    // Step 4: critical evaluation, only when there's something to look at.
    if state.context.has_visible_surface {
        let passed = critical_eval::run(state, services).await?;
        if !passed {
            tracing::warn!("exit gate failed critical evaluation");
            return Ok(false);
        }
    }

    // Step 5: code-health enforcement (monolithic-file guard).
    if config.enforce_code_health {
        let health = CoherenceMonitor::scan(state, config, CoherenceMode::Quick);
        let monolithic = health.dimensions.iter().find(|d| d.dimension == "monolithic_files");
        if let Some(dim) = monolithic {
            if !dim.findings.is_empty() {
                tracing::warn!(findings = ?dim.findings, "exit gate failed code-health enforcement");
                for (i, finding) in dim.findings.iter().enumerate() {
                    let task = Task::new(
                        format!("refactor-{}-{i}", state.iteration),
                        TaskSource::Refactor,
                        format!("REFACTOR: split up monolithic file — {finding}"),
                        "codebase stays maintainable",
                        "file no longer exceeds the monolithic-file line threshold",
                    );
                    state.insert_task(task);
                }
                return Ok(false);
            }
        }
    }

    // Step 6: full pass — checkpoint and commit.
    let tasks_completed = state.tasks.values().filter(|t| t.status == crate::state::TaskStatus::Done).count() as u32;
    let verifications_passing = state.verifications.len() as u32;
    let checkpoint = services.git.checkpoint(
        format!("exit-gate-{}", state.exit_gate_attempts),
        tasks_completed,
        verifications_passing,
        state.latest_vrc().map(|v| v.value_score).unwrap_or(0.0),
    )?;
    state.add_checkpoint(checkpoint);
    services.git.commit("exit-gate", "exit gate passed, shipping")?;
    tracing::info!(attempts = state.exit_gate_attempts, "exit gate passed");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{AgentGateway, GatewayResponse};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubGateway {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentGateway for StubGateway {
        async fn run(&self, _role: Role, _prompt: &str) -> LoopResult<GatewayResponse> {
            let mut responses = self.responses.lock().unwrap();
            let raw_text = if responses.len() > 1 { responses.remove(0) } else { responses[0].clone() };
            Ok(GatewayResponse { raw_text, input_tokens: 1, output_tokens: 1 })
        }
    }

    fn git_in(dir: &std::path::Path) -> crate::git::GitSafetyNet {
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
        crate::git::GitSafetyNet::new(dir, "s")
    }

    #[tokio::test]
    async fn clean_state_passes_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_env("s", dir.path());
        let mut state = LoopState::new("s", dir.path());

        let services = LoopServices {
            gateway: std::sync::Arc::new(StubGateway {
                responses: Mutex::new(vec![
                    r#"{"value_score": 1.0, "deliverables_verified": 0, "deliverables_total": 0, "gaps": [], "recommendation": "ship_ready", "summary": "done"}"#.to_string(),
                ]),
            }),
            verifier: crate::verifier::VerificationRunner::new(&config),
            git: git_in(dir.path()),
        };

        let passed = run(&config, &mut state, &services).await.unwrap();
        assert!(passed);
        assert_eq!(state.checkpoints.len(), 1);
        assert!(state.checkpoints[0].label.starts_with("exit-gate-"));
    }

    #[tokio::test]
    async fn safety_valve_trips_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env("s", dir.path());
        config.max_exit_gate_attempts = 1;
        let mut state = LoopState::new("s", dir.path());
        state.exit_gate_attempts = 1;

        let services = LoopServices {
            gateway: std::sync::Arc::new(StubGateway { responses: Mutex::new(vec!["{}".to_string()]) }),
            verifier: crate::verifier::VerificationRunner::new(&config),
            git: git_in(dir.path()),
        };

        let passed = run(&config, &mut state, &services).await.unwrap();
        assert!(passed);
        assert!(state.checkpoints.is_empty());
    }

    #[tokio::test]
    async fn non_ship_ready_vrc_inserts_gap_tasks_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_env("s", dir.path());
        let mut state = LoopState::new("s", dir.path());

        let services = LoopServices {
            gateway: std::sync::Arc::new(StubGateway {
                responses: Mutex::new(vec![
                    r#"{"value_score": 0.5, "deliverables_verified": 0, "deliverables_total": 1,
                        "gaps": [{"id": "missing-feature", "severity": "blocking"}],
                        "recommendation": "ship_ready", "summary": "not actually done"}"#.to_string(),
                ]),
            }),
            verifier: crate::verifier::VerificationRunner::new(&config),
            git: git_in(dir.path()),
        };

        let passed = run(&config, &mut state, &services).await.unwrap();
        assert!(!passed);
        assert!(state.tasks.values().any(|t| t.source == TaskSource::ExitGate));
    }
}
