//! GENERATE_QC: ask the QC role to synthesize verification scripts for every
//! completed-but-unverified task, then materialize them onto disk and into
//! state.

use crate::actions::LoopServices;
use crate::config::Config;
use crate::error::LoopResult;
use crate::gateway::contracts::parse_report_qc_plan;
use crate::gateway::{extract_json, Role};
use crate::state::{LoopState, TaskStatus, Verification};
use std::os::unix::fs::PermissionsExt;

pub async fn run(config: &Config, state: &mut LoopState, services: &LoopServices) -> LoopResult<bool> {
    let covered: std::collections::HashSet<&str> = state
        .verifications
        .values()
        .flat_map(|v| v.covers.iter().map(|s| s.as_str()))
        .collect();
    let unverified: Vec<&str> = state
        .tasks
        .values()
        .filter(|t| t.status == TaskStatus::Done && !covered.contains(t.id.as_str()))
        .map(|t| t.id.as_str())
        .collect();

    if unverified.is_empty() {
        tracing::info!("generate_qc invoked with nothing to cover");
        return Ok(false);
    }

    let prompt = format!(
        "The following tasks are done but have no covering verification: {:?}\n\n\
         Write one verification script per task (or one covering several where that's \
         natural). Every script must be directly executable and exit non-zero on failure. \
         Respond as JSON matching report_qc_plan: {{\"verifications\": [{{\"id\": ..., \
         \"script_path\": ..., \"script_body\": ..., \"category\": \"unit|integration|value\", \
         \"covers\": [...]}}]}}.",
        unverified,
    );

    let response = services.gateway.run(Role::Qc, &prompt).await?;
    state.add_tokens(response.input_tokens, response.output_tokens);

    let Some(call) = extract_json(&response.raw_text).and_then(|v| parse_report_qc_plan(&v)) else {
        tracing::warn!("qc did not emit a parseable qc plan, nothing generated");
        return Ok(false);
    };

    if call.verifications.is_empty() {
        tracing::warn!("qc plan was well-formed but empty");
        return Ok(false);
    }

    let verifications_dir = config.verifications_dir();
    std::fs::create_dir_all(&verifications_dir)?;

    for plan in call.verifications {
        let script_path = verifications_dir.join(&plan.script_path);
        if let Some(parent) = script_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&script_path, &plan.script_body)?;
        let mut perms = std::fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms)?;

        let verification = Verification::new(plan.id, script_path, plan.category, plan.covers);
        state.insert_verification(verification);
    }

    services.git.commit("generate-qc", "generated verification scripts")?;
    tracing::info!("qc plan materialized and committed");
    Ok(true)
}
