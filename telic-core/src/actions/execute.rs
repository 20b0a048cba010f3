//! EXECUTE: run a BUILDER session against exactly one pending task and
//! integrate its diff, enforcing the scope fence before anything is marked
//! done.

use crate::actions::LoopServices;
use crate::error::LoopResult;
use crate::gateway::contracts::{parse_report_diff, scope_fence_violation};
use crate::gateway::{extract_json, Role};
use crate::state::LoopState;

pub async fn run(state: &mut LoopState, services: &LoopServices, task_id: &str) -> LoopResult<bool> {
    state.start_task(task_id)?;
    let task = state
        .tasks
        .get(task_id)
        .expect("task_id selected by DecisionEngine::executable_tasks")
        .clone();

    let prompt = format!(
        "# Task {}\n\nDescription: {}\nValue: {}\nAcceptance: {}\nFiles expected: {:?}\n\n\
         Implement this task against the project tree. Touch only the files listed above \
         unless you widen scope through the task-mutation tool. Respond as JSON matching \
         report_diff: {{\"files_changed\": [...], \"summary\": \"...\"}}.",
        task.id, task.description, task.value, task.acceptance, task.files_expected,
    );

    let response = match services.gateway.run(Role::Builder, &prompt).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(task_id, error = %e, "builder turn failed, resetting task to pending");
            state.reset_task_to_pending(task_id);
            return Ok(false);
        }
    };
    state.add_tokens(response.input_tokens, response.output_tokens);

    let Some(call) = extract_json(&response.raw_text).and_then(|v| parse_report_diff(&v)) else {
        tracing::warn!(task_id, "builder did not emit a parseable diff report");
        state.reset_task_to_pending(task_id);
        return Ok(false);
    };

    if let Some(violations) = scope_fence_violation(&call.files_changed, &task.files_expected) {
        tracing::warn!(task_id, ?violations, "scope fence rejected builder diff");
        state.reopen_task(task_id);
        return Ok(false);
    }

    state.complete_task(task_id);
    let commit_summary: String = call.summary.chars().take(72).collect();
    services.git.commit(task_id, &commit_summary)?;
    tracing::info!(task_id, summary = %call.summary, "task executed and committed");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoopError;
    use crate::gateway::{AgentGateway, GatewayResponse};
    use crate::state::{Task, TaskSource, TaskStatus};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct StubGateway {
        response: Mutex<Option<LoopResult<GatewayResponse>>>,
    }

    #[async_trait]
    impl AgentGateway for StubGateway {
        async fn run(&self, _role: Role, _prompt: &str) -> LoopResult<GatewayResponse> {
            match self.response.lock().unwrap().take() {
                Some(r) => r,
                None => Err(LoopError::invariant("stub called more than once")),
            }
        }
    }

    fn services_with(dir: &std::path::Path, response: LoopResult<GatewayResponse>) -> LoopServices {
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

        let config = crate::config::Config::from_env("s", dir);
        LoopServices {
            gateway: std::sync::Arc::new(StubGateway {
                response: Mutex::new(Some(response)),
            }),
            verifier: crate::verifier::VerificationRunner::new(&config),
            git: crate::git::GitSafetyNet::new(dir, "s"),
        }
    }

    #[tokio::test]
    async fn in_scope_diff_completes_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src_a.rs"), "fn a() {}").unwrap();
        let mut state = LoopState::new("s", dir.path());
        let mut task = Task::new("t1", TaskSource::Plan, "d", "v", "a");
        task.files_expected = vec![PathBuf::from("src_a.rs")];
        state.insert_task(task);

        let response = Ok(GatewayResponse {
            raw_text: r#"{"files_changed": ["src_a.rs"], "summary": "implemented a"}"#.to_string(),
            input_tokens: 10,
            output_tokens: 10,
        });
        let services = services_with(dir.path(), response);

        let progress = run(&mut state, &services, "t1").await.unwrap();
        assert!(progress);
        assert_eq!(state.tasks["t1"].status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn out_of_scope_diff_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = LoopState::new("s", dir.path());
        let mut task = Task::new("t1", TaskSource::Plan, "d", "v", "a");
        task.files_expected = vec![PathBuf::from("src_a.rs")];
        state.insert_task(task);

        let response = Ok(GatewayResponse {
            raw_text: r#"{"files_changed": ["src_a.rs", "src_b.rs"], "summary": "scope creep"}"#.to_string(),
            input_tokens: 10,
            output_tokens: 10,
        });
        let services = services_with(dir.path(), response);

        let progress = run(&mut state, &services, "t1").await.unwrap();
        assert!(!progress);
        assert_eq!(state.tasks["t1"].status, TaskStatus::Pending);
        assert_eq!(state.tasks["t1"].retry_count, 1);
    }
}
