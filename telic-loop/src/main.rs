//! `telic-loop`: the CLI entry point that wires `telic-core`'s collaborators
//! together and drives the value loop scheduler to a terminal outcome.
//!
//! Bootstrap order: verify the working directory, load git state, acquire
//! the sprint's advisory lock, then hand off to the loop body. The outermost
//! retry loop is `CrashSupervisor` — a scheduler panic is caught, the
//! in-progress task it left behind is reset on the next
//! `load_or_init_state`, and the loop resumes with linear backoff.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use telic_core::actions::LoopServices;
use telic_core::config::Config;
use telic_core::crash::{CrashSupervisor, SupervisorOutcome};
use telic_core::gateway::RigAgentGateway;
use telic_core::git::{GitSafetyNet, SprintLock};
use telic_core::report;
use telic_core::scheduler::{LoopOutcome, Scheduler};
use telic_core::verifier::VerificationRunner;
use telic_core::LoopResult;

#[derive(Parser, Debug)]
#[command(author, version, about = "Closed-loop autonomous delivery engine", long_about = None)]
struct Args {
    /// Sprint name; also the directory under `--project-dir` holding
    /// VISION.md, PRD.md, and this sprint's `.loop/` state.
    sprint: String,

    /// Root of the target project the loop operates on. Defaults to the
    /// current working directory.
    #[arg(long)]
    project_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let project_dir = args
        .project_dir
        .unwrap_or(std::env::current_dir().context("resolving current directory")?);

    match run(args.sprint, project_dir).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!(error = %err, "telic-loop exited with an error");
            std::process::exit(1);
        }
    }
}

/// Bootstrap the sprint, drive the scheduler under the crash supervisor, and
/// emit the delivery report. Returns the process exit code.
async fn run(sprint: String, project_dir: PathBuf) -> Result<i32> {
    let config = Config::from_env(sprint.clone(), project_dir.clone());
    let sprint_dir = project_dir.join(&sprint);
    check_sprint_inputs(&sprint_dir);

    std::fs::create_dir_all(config.checkpoints_dir()).context("creating checkpoints directory")?;
    std::fs::create_dir_all(config.verifications_dir()).context("creating verifications directory")?;

    let _lock = SprintLock::acquire(config.lock_path()).context("acquiring sprint advisory lock")?;

    let git = GitSafetyNet::new(&project_dir, &sprint);
    let branch = git.ensure_feature_branch().context("establishing feature branch")?;
    tracing::info!(%branch, "feature branch ready");

    let services = LoopServices {
        gateway: Arc::new(build_gateway(&config)?),
        verifier: VerificationRunner::new(&config),
        git,
    };

    let scheduler = Scheduler::new(config.clone(), services);
    let mut supervisor = CrashSupervisor::new(config.max_crash_restarts);

    let outcome = loop {
        let state = scheduler.load_or_init_state().context("loading sprint state")?;
        let slot: Arc<Mutex<Option<LoopResult<LoopOutcome>>>> = Arc::new(Mutex::new(None));
        let slot_inner = slot.clone();
        let scheduler_ref = &scheduler;

        let supervisor_outcome = supervisor
            .run(move || async move {
                let result = scheduler_ref.run(state).await;
                *slot_inner.lock().unwrap() = Some(result);
            })
            .await;

        match supervisor_outcome {
            SupervisorOutcome::Completed => {
                let result = slot
                    .lock()
                    .unwrap()
                    .take()
                    .context("scheduler body completed without recording a result")?;
                break result.context("scheduler loop failed")?;
            }
            SupervisorOutcome::Restart { after } => {
                tracing::warn!(delay_sec = after.as_secs(), "scheduler crashed, restarting after backoff");
                tokio::time::sleep(after).await;
                continue;
            }
            SupervisorOutcome::BudgetExhausted => {
                tracing::error!("crash-restart budget exhausted, terminating with a partial report");
                break LoopOutcome::Partial;
            }
        }
    };

    let final_state = scheduler.load_or_init_state().context("loading final sprint state")?;
    let rendered = report::render(&final_state, outcome, supervisor.restarts_so_far());
    std::fs::write(config.delivery_report_path(), rendered).context("writing DELIVERY_REPORT.md")?;

    Ok(report::exit_code(outcome))
}

/// Warn (but don't fail) when the documents a sprint consumes are missing —
/// discovery pre-computation over their contents happens upstream of this
/// crate's scope.
fn check_sprint_inputs(sprint_dir: &std::path::Path) {
    for required in ["VISION.md", "PRD.md"] {
        if !sprint_dir.join(required).exists() {
            tracing::warn!(file = required, dir = %sprint_dir.display(), "expected sprint input is missing");
        }
    }
}

fn build_gateway(config: &Config) -> Result<RigAgentGateway> {
    use rig::providers::openai;

    let api_key = std::env::var("TELIC_LLM_API_KEY").unwrap_or_else(|_| "not-needed".to_string());
    let mut builder = openai::CompletionsClient::builder().api_key(&api_key);
    if let Ok(base_url) = std::env::var("TELIC_LLM_BASE_URL") {
        builder = builder.base_url(&base_url);
    }
    let client = builder.build().context("building LLM client")?;

    Ok(RigAgentGateway::new(
        client,
        config.agent_roles.clone(),
        config.role_timeouts,
    ))
}
