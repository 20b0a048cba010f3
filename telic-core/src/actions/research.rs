//! RESEARCH: resolve a pending task's unmet research dependency
//!
//! `task_id` is the *blocked* task DecisionEngine rule 6 selected — the one
//! whose dependency carries the `research:` marker. This handler runs the
//! RESEARCHER role against that dependency, records its findings on the
//! dependency task, and marks it done so the blocked task's dependency is
//! satisfied next decision cycle.

use crate::actions::LoopServices;
use crate::error::{LoopError, LoopResult};
use crate::gateway::contracts::parse_report_research;
use crate::gateway::{extract_json, Role};
use crate::state::{LoopState, TaskSource, TaskStatus};

pub async fn run(state: &mut LoopState, services: &LoopServices, task_id: &str) -> LoopResult<bool> {
    let task = state
        .tasks
        .get(task_id)
        .ok_or_else(|| LoopError::invariant(format!("unknown task {task_id}")))?;
    let research_task_id = task
        .dependencies
        .iter()
        .find(|dep| {
            state
                .tasks
                .get(*dep)
                .map(|d| d.status != TaskStatus::Done && d.description.starts_with("research:"))
                .unwrap_or(false)
        })
        .cloned()
        .ok_or_else(|| LoopError::invariant(format!("task {task_id} has no outstanding research dependency")))?;

    let research_task = state.tasks[&research_task_id].clone();

    let prompt = format!(
        "{}\n\nGather the facts needed before the dependent task can proceed. Do not modify \
         source files. Respond as JSON matching report_research: {{\"note\": \"...\", \
         \"mid_loop_tasks\": [...]?}}.",
        research_task.description,
    );

    let response = services.gateway.run(Role::Researcher, &prompt).await?;
    state.add_tokens(response.input_tokens, response.output_tokens);

    let Some(call) = extract_json(&response.raw_text).and_then(|v| parse_report_research(&v)) else {
        tracing::warn!(task_id = %research_task_id, "researcher did not emit a parseable report");
        return Ok(false);
    };

    if let Some(t) = state.tasks.get_mut(&research_task_id) {
        t.resolution_note = Some(call.note.clone());
    }
    state.complete_task(&research_task_id);

    for mutation in call.mid_loop_tasks {
        let mut new_task = mutation.into_task();
        new_task.source = TaskSource::MidLoop;
        state.insert_task(new_task);
    }

    services.git.commit(&research_task_id, "research note recorded")?;
    tracing::info!(task_id = %research_task_id, "research complete, dependency cleared");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{AgentGateway, GatewayResponse};
    use crate::state::Task;
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

    #[tokio::test]
    async fn research_completes_dependency_and_unblocks() {
        use crate::state::TaskSource;

        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::Config::from_env("s", dir.path());
        let mut state = LoopState::new("s", dir.path());

        let research_task = Task::new("research-1", TaskSource::MidLoop, "research: which auth provider to use", "v", "a");
        state.insert_task(research_task);

        let mut blocked = Task::new("t1", TaskSource::Plan, "d", "v", "a");
        blocked.dependencies = vec!["research-1".to_string()];
        state.insert_task(blocked);

        let services = LoopServices {
            gateway: std::sync::Arc::new(StubGateway {
                raw_text: r#"{"note": "use provider X", "mid_loop_tasks": []}"#.to_string(),
            }),
            verifier: crate::verifier::VerificationRunner::new(&config),
            git: git_in(dir.path()),
        };

        let progress = run(&mut state, &services, "t1").await.unwrap();
        assert!(progress);
        assert_eq!(state.tasks["research-1"].status, TaskStatus::Done);
        assert_eq!(state.tasks["research-1"].resolution_note.as_deref(), Some("use provider X"));
        assert!(state.tasks["t1"].dependencies_met(&state.tasks));
    }
}
