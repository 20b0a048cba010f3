//! FIX: run a FIXER session against exactly one failing verification, then
//! re-run just that verification to confirm the fix before committing.

use crate::actions::LoopServices;
use crate::error::{LoopError, LoopResult};
use crate::gateway::contracts::parse_report_diff;
use crate::gateway::{extract_json, Role};
use crate::state::{LoopState, VerificationStatus};
use crate::verifier::apply_outcomes;

pub async fn run(state: &mut LoopState, services: &LoopServices, verification_id: &str) -> LoopResult<bool> {
    let verification = state
        .verifications
        .get(verification_id)
        .cloned()
        .ok_or_else(|| LoopError::invariant(format!("unknown verification {verification_id}")))?;

    let covering_task_description = verification
        .covers
        .first()
        .and_then(|id| state.tasks.get(id))
        .map(|t| t.description.as_str())
        .unwrap_or("(no covering task on record)");

    let prompt = format!(
        "Verification {} is failing.\nLast error:\n{}\n\nOriginal task context: {}\n\n\
         Produce the minimal diff that makes it pass. Respond as JSON matching report_diff: \
         {{\"files_changed\": [...], \"summary\": \"...\"}}.",
        verification.id,
        verification.last_error.as_deref().unwrap_or("(no error captured)"),
        covering_task_description,
    );

    let response = services.gateway.run(Role::Fixer, &prompt).await?;
    state.add_tokens(response.input_tokens, response.output_tokens);

    let Some(call) = extract_json(&response.raw_text).and_then(|v| parse_report_diff(&v)) else {
        tracing::warn!(verification_id, "fixer did not emit a parseable diff report");
        if let Some(v) = state.verifications.get_mut(verification_id) {
            v.attempts += 1;
        }
        return Ok(false);
    };

    // Re-run just this verification to confirm the fix landed, regardless
    // of its current `failed` status (needs_run() alone wouldn't re-select it).
    if let Some(v) = state.verifications.get_mut(verification_id) {
        v.status = VerificationStatus::Invalidated;
    }
    let verification = state.verifications[verification_id].clone();
    let outcomes = services.verifier.run_pending(std::slice::from_ref(&verification)).await?;
    let newly_failed = apply_outcomes(&mut state.verifications, &outcomes);
    let fixed = newly_failed.is_empty();

    if fixed {
        // apply_outcomes only bumps `attempts` on the failure branch; a
        // successful fix still counts as one attempt against the ceiling.
        if let Some(v) = state.verifications.get_mut(verification_id) {
            v.attempts += 1;
        }
        let summary: String = call.summary.chars().take(72).collect();
        services.git.commit(verification_id, &format!("fix: {summary}"))?;
        tracing::info!(verification_id, "verification fixed and committed");
    } else {
        tracing::warn!(verification_id, "fix attempt did not clear the verification");
    }
    Ok(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{AgentGateway, GatewayResponse};
    use crate::state::{Verification, VerificationCategory};
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;

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

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn fix_that_clears_verification_commits() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "v.sh", "#!/bin/sh\nexit 0\n");
        let config = crate::config::Config::from_env("s", dir.path());
        let mut state = LoopState::new("s", dir.path());
        let mut v = Verification::new("v1", script, VerificationCategory::Unit, vec![]);
        v.status = VerificationStatus::Failed;
        v.attempts = 1;
        v.last_error = Some("boom".to_string());
        state.insert_verification(v);

        let services = LoopServices {
            gateway: std::sync::Arc::new(StubGateway {
                raw_text: r#"{"files_changed": [], "summary": "patched"}"#.to_string(),
            }),
            verifier: crate::verifier::VerificationRunner::new(&config),
            git: git_in(dir.path()),
        };

        let fixed = run(&mut state, &services, "v1").await.unwrap();
        assert!(fixed);
        assert_eq!(state.verifications["v1"].status, VerificationStatus::Passed);
        assert_eq!(state.verifications["v1"].attempts, 2);
    }
}
