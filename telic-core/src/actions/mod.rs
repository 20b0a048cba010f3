//! Action handlers: the one-per-`Action` functions the scheduler dispatches
//! to after `DecisionEngine::decide`
//!
//! Every handler shares the same shape — read what it needs from `LoopState`,
//! make at most one agent call through `LoopServices::gateway`, integrate the
//! result back into state — one function per action rather than a single
//! monolithic dispatch function.

pub mod critical_eval;
pub mod execute;
pub mod fix;
pub mod generate_qc;
pub mod interactive_pause;
pub mod research;
pub mod run_qc;
pub mod service_fix;

use crate::config::Config;
use crate::course_correct::{CourseCorrection, CourseCorrector};
use crate::error::LoopResult;
use crate::gateway::contracts::{parse_report_course_correction, CourseCorrectionVerb, ReportCourseCorrectionCall};
use crate::gateway::{extract_json, AgentGateway, Role};
use crate::git::GitSafetyNet;
use crate::state::{LoopState, TaskSource};
use crate::verifier::VerificationRunner;
use std::sync::Arc;

/// The external collaborators every action handler needs, bundled together
/// rather than threading three separate parameters through every call site.
pub struct LoopServices {
    pub gateway: Arc<dyn AgentGateway>,
    pub verifier: VerificationRunner,
    pub git: GitSafetyNet,
}

/// COURSE_CORRECT: ask the REASONER for exactly one recovery verb given the
/// trigger reason, then apply it. Never counted as progress — see
/// `CourseCorrector::apply`'s own doc comment.
pub async fn run_course_correct(
    config: &Config,
    state: &mut LoopState,
    services: &LoopServices,
    trigger_reason: &str,
) -> LoopResult<bool> {
    let prompt = format!(
        "The loop needs a course correction: {trigger_reason}\n\n\
         Recent VRC history (most recent last): {:?}\n\
         Checkpoints available for rollback: {:?}\n\
         Recent progress (most recent last): {:?}\n\n\
         Choose exactly one recovery verb and respond as JSON matching report_course_correction.",
        state.vrc_history.iter().rev().take(5).collect::<Vec<_>>(),
        state.checkpoints.iter().map(|c| &c.label).collect::<Vec<_>>(),
        state.progress_log.iter().rev().take(10).collect::<Vec<_>>(),
    );

    let response = services.gateway.run(Role::Reasoner, &prompt).await?;
    state.add_tokens(response.input_tokens, response.output_tokens);

    let correction = match extract_json(&response.raw_text).and_then(|v| parse_report_course_correction(&v)) {
        Some(call) => build_correction(call, state),
        None => {
            tracing::warn!(trigger_reason, "course correction unparseable, escalating to a human");
            CourseCorrection::Escalate {
                reason: format!("unparseable course-correction response while stuck: {trigger_reason}"),
                instructions: "Review .loop/state.json and the sprint context, then create .loop/RESUME to continue."
                    .to_string(),
            }
        }
    };

    CourseCorrector::apply(state, &services.git, config.max_rollbacks_per_sprint, correction)?;
    Ok(false)
}

fn build_correction(call: ReportCourseCorrectionCall, state: &LoopState) -> CourseCorrection {
    match call.action {
        CourseCorrectionVerb::Restructure => CourseCorrection::Restructure {
            tasks_to_restructure: call.tasks_to_restructure,
            reason: call.reason,
        },
        CourseCorrectionVerb::Descope => CourseCorrection::Descope {
            task_ids: call.tasks_to_restructure,
            reason: call.reason,
        },
        CourseCorrectionVerb::NewTasks => CourseCorrection::NewTasks {
            tasks: call
                .new_tasks
                .into_iter()
                .map(|t| {
                    let mut task = t.into_task();
                    task.source = TaskSource::MidLoop;
                    task
                })
                .collect(),
            reason: call.reason,
        },
        CourseCorrectionVerb::Rollback => CourseCorrection::Rollback {
            rollback_to_checkpoint: call.rollback_to_checkpoint.unwrap_or_default(),
            reason: call.reason,
        },
        CourseCorrectionVerb::RegenerateTests => {
            let verification_ids: Vec<String> = if call.tasks_to_restructure.is_empty() {
                state.verifications.keys().cloned().collect()
            } else {
                state
                    .verifications
                    .values()
                    .filter(|v| v.covers.iter().any(|c| call.tasks_to_restructure.contains(c)))
                    .map(|v| v.id.clone())
                    .collect()
            };
            CourseCorrection::RegenerateTests {
                verification_ids,
                reason: call.reason,
            }
        }
        CourseCorrectionVerb::Escalate => CourseCorrection::Escalate {
            reason: call.reason,
            instructions: "Review .loop/state.json and the sprint context, then create .loop/RESUME to continue."
                .to_string(),
        },
    }
}
