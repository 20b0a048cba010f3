//! INTERACTIVE_PAUSE: emit pause instructions and poll for the human-supplied
//! resolution marker
//!
//! The marker is a `RESUME` file inside `.loop/`, the same path
//! `CourseCorrector::Escalate`'s instructions point a human at. Never counted
//! as progress — clearing the pause just lets the decision engine re-evaluate
//! from where it left off.

use crate::config::Config;
use crate::error::LoopResult;
use crate::state::LoopState;

pub async fn run(config: &Config, state: &mut LoopState) -> LoopResult<bool> {
    let pause = match &state.pause {
        Some(p) => p.clone(),
        None => return Ok(false),
    };

    let resume_marker = config.loop_dir().join("RESUME");
    if resume_marker.exists() {
        std::fs::remove_file(&resume_marker)?;
        tracing::info!(reason = %pause.reason, "RESUME marker found, clearing pause");
        state.pause = None;
    } else {
        tracing::info!(reason = %pause.reason, instructions = %pause.instructions, "loop paused, awaiting human action");
    }

    Ok(false)
}
