//! SERVICE_FIX: classify an unhealthy service as an actionable architecture
//! gap or a human-only external blocker
//!
//! Either branch marks the service handled in `state.context.services` so
//! rule 5 doesn't re-select the same service forever — the real remedy
//! (a startup task, or a blocked task awaiting a human) flows through the
//! ordinary task pipeline from here on, so an unhealthy service never
//! causes an infinite loop.

use crate::actions::LoopServices;
use crate::error::LoopResult;
use crate::gateway::contracts::{parse_report_service_classification, ServiceClassification};
use crate::gateway::{extract_json, Role};
use crate::state::LoopState;

pub async fn run(state: &mut LoopState, services: &LoopServices, service: &str) -> LoopResult<bool> {
    let prompt = format!(
        "Service '{service}' is reporting unhealthy. Decide whether this is an \
         ARCHITECTURE_GAP (something we can build our way out of — propose a startup \
         task) or an EXTERNAL_BLOCKER (needs a human, e.g. missing credentials or an \
         unreachable third party). Respond as JSON matching report_service_classification: \
         {{\"classification\": \"architecture_gap|external_blocker\", \"reasoning\": \"...\", \
         \"startup_task\": {{...}}?, \"blocked_task_ids\": [...]?}}.",
    );

    let response = services.gateway.run(Role::Classifier, &prompt).await?;
    state.add_tokens(response.input_tokens, response.output_tokens);

    let Some(call) = extract_json(&response.raw_text).and_then(|v| parse_report_service_classification(&v)) else {
        tracing::warn!(service, "service classification unparseable, leaving service unhealthy");
        return Ok(false);
    };

    match call.classification {
        ServiceClassification::ArchitectureGap => {
            if let Some(startup_task) = call.startup_task {
                let task = startup_task.into_task();
                tracing::info!(service, task_id = %task.id, reason = %call.reasoning, "service gap classified as architecture gap");
                state.insert_task(task);
            } else {
                tracing::warn!(service, "architecture_gap classification carried no startup task");
            }
        }
        ServiceClassification::ExternalBlocker => {
            for task_id in &call.blocked_task_ids {
                state.block_task(task_id, format!("external blocker on service '{service}': {}", call.reasoning));
            }
            tracing::warn!(service, reason = %call.reasoning, blocked = ?call.blocked_task_ids, "service gap classified as external blocker");
        }
    }

    state.context.services.insert(service.to_string(), true);
    services.git.commit("service-fix", &format!("classify {service}"))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{AgentGateway, GatewayResponse};
    use crate::state::{Task, TaskSource, TaskStatus};
    use async_trait::async_trait;

    struct StubGateway {
        raw_text: String,
    }

    #[async_trait]
    impl AgentGateway for StubGateway {
        async fn run(&self, _role: Role, _prompt: &str) -> LoopResult<GatewayResponse> {
            Ok(GatewayResponse {
                raw_text: self.raw_text.clone(),
                input_tokens: 1,
                output_tokens: 1,
            })
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

    fn services_with(dir: &std::path::Path, raw_text: &str) -> LoopServices {
        let config = crate::config::Config::from_env("s", dir);
        LoopServices {
            gateway: std::sync::Arc::new(StubGateway { raw_text: raw_text.to_string() }),
            verifier: crate::verifier::VerificationRunner::new(&config),
            git: git_in(dir),
        }
    }

    #[tokio::test]
    async fn architecture_gap_inserts_startup_task_and_clears_service() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = LoopState::new("s", dir.path());
        state.context.services.insert("db".to_string(), false);
        let services = services_with(
            dir.path(),
            r#"{"classification": "architecture_gap", "reasoning": "migrations never ran",
                "startup_task": {"id": "start-db", "source": "plan", "description": "run migrations",
                "value": "db available", "acceptance": "service reports healthy"}}"#,
        );

        let progress = run(&mut state, &services, "db").await.unwrap();
        assert!(progress);
        assert!(state.tasks.contains_key("start-db"));
        assert_eq!(state.context.services["db"], true);
    }

    #[tokio::test]
    async fn external_blocker_blocks_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = LoopState::new("s", dir.path());
        state.context.services.insert("payments".to_string(), false);
        state.insert_task(Task::new("t1", TaskSource::Plan, "d", "v", "a"));
        let services = services_with(
            dir.path(),
            r#"{"classification": "external_blocker", "reasoning": "missing api key",
                "blocked_task_ids": ["t1"]}"#,
        );

        let progress = run(&mut state, &services, "payments").await.unwrap();
        assert!(progress);
        assert_eq!(state.tasks["t1"].status, TaskStatus::Blocked);
        assert_eq!(state.context.services["payments"], true);
    }
}
