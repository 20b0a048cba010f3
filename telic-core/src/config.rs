//! Loop configuration
//!
//! Centralizes the thresholds and budgets the DecisionEngine, VRCHeartbeat,
//! CourseCorrector, and ExitGate consult. Populated from environment
//! variables layered on typed defaults.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level loop configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sprint name, used for branch naming and commit prefixes.
    pub sprint: String,
    /// Root of the target project the loop operates on.
    pub project_dir: PathBuf,

    /// Maximum retries for a single verification before the covering task blocks.
    pub max_fix_attempts: u32,
    /// Maximum retries for a single task before it is descoped / needs override.
    pub max_task_retries: u32,
    /// Iterations without progress before COURSE_CORRECT fires.
    pub stuck_threshold: u32,
    /// Number of completed tasks before GENERATE_QC is considered, bounded
    /// by the total scoped task count.
    pub qc_generation_threshold: usize,
    /// Maximum rollbacks allowed per sprint.
    pub max_rollbacks_per_sprint: u32,
    /// Maximum exit-gate attempts before the safety valve fires.
    pub max_exit_gate_attempts: u32,
    /// Maximum process crash restarts.
    pub max_crash_restarts: u32,

    /// Cumulative token budget for the sprint.
    pub token_budget: u64,
    /// Budget fraction at which the loop is forced toward EXIT_GATE (0.95).
    pub budget_critical_fraction: f64,
    /// Budget fraction at which VRC is forced to quick mode (0.80).
    pub budget_degraded_fraction: f64,

    /// Minimum wall-clock seconds between VRC heartbeats.
    pub vrc_min_interval_sec: u64,
    /// Total wall-clock cap for the exit gate sequence.
    pub exit_gate_wall_clock_sec: u64,
    /// Per-script verification timeout.
    pub verification_script_timeout_sec: u64,
    /// Total wall-clock cap across all verifications in one RUN_QC pass.
    pub verification_total_wall_clock_sec: u64,
    /// Poll interval while INTERACTIVE_PAUSE holds the loop.
    pub interactive_pause_poll_sec: u64,

    /// Per-role agent timeouts.
    pub role_timeouts: RoleTimeouts,
    /// Per-role model selection, so prompt/model tuning stays a config
    /// concern rather than something the gateway hardcodes.
    pub agent_roles: AgentRoleConfig,

    /// Whether code-health enforcement (monolithic-file guard) is enabled.
    pub enforce_code_health: bool,
    /// Line-count threshold past which a file is "monolithic".
    pub monolithic_file_lines: usize,
}

/// Model selection per agent role, keyed by `Role` name rather than a fixed
/// tier enum, since the loop's seven roles don't divide evenly into a small
/// fixed set of tiers.
#[derive(Debug, Clone)]
pub struct AgentRoleConfig {
    /// Model used for any role without an explicit override.
    pub default_model: String,
    /// Role name (`Role::name()`) -> model name overrides.
    pub overrides: HashMap<String, String>,
}

impl AgentRoleConfig {
    pub fn model_for(&self, role_name: &str) -> &str {
        self.overrides
            .get(role_name)
            .map(|s| s.as_str())
            .unwrap_or(&self.default_model)
    }

    fn from_env() -> Self {
        let default_model =
            std::env::var("TELIC_MODEL_DEFAULT").unwrap_or_else(|_| "gpt-4.1-mini".to_string());
        let mut overrides = HashMap::new();
        for role in ["classifier", "builder", "fixer", "qc", "reasoner", "researcher", "evaluator"] {
            let key = format!("TELIC_MODEL_{}", role.to_uppercase());
            if let Ok(model) = std::env::var(&key) {
                overrides.insert(role.to_string(), model);
            }
        }
        Self {
            default_model,
            overrides,
        }
    }
}

/// Per-role agent session timeouts.
#[derive(Debug, Clone, Copy)]
pub struct RoleTimeouts {
    pub classifier: Duration,
    pub builder: Duration,
    pub fixer: Duration,
    pub qc: Duration,
    pub reasoner: Duration,
    pub researcher: Duration,
    pub evaluator: Duration,
}

impl Default for RoleTimeouts {
    fn default() -> Self {
        Self {
            classifier: Duration::from_secs(60),
            builder: Duration::from_secs(300),
            fixer: Duration::from_secs(300),
            qc: Duration::from_secs(300),
            reasoner: Duration::from_secs(300),
            researcher: Duration::from_secs(300),
            evaluator: Duration::from_secs(900),
        }
    }
}

impl Config {
    /// Construct a config for `sprint` rooted at `project_dir`, applying
    /// environment-variable overrides on top of calibrated defaults.
    pub fn from_env(sprint: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        let mut cfg = Self::defaults(sprint.into(), project_dir.into());

        if let Some(v) = env_u32("TELIC_MAX_FIX_ATTEMPTS") {
            cfg.max_fix_attempts = v;
        }
        if let Some(v) = env_u32("TELIC_MAX_TASK_RETRIES") {
            cfg.max_task_retries = v;
        }
        if let Some(v) = env_u32("TELIC_STUCK_THRESHOLD") {
            cfg.stuck_threshold = v;
        }
        if let Some(v) = env_usize("TELIC_QC_GENERATION_THRESHOLD") {
            cfg.qc_generation_threshold = v;
        }
        if let Some(v) = env_u32("TELIC_MAX_ROLLBACKS_PER_SPRINT") {
            cfg.max_rollbacks_per_sprint = v;
        }
        if let Some(v) = env_u32("TELIC_MAX_EXIT_GATE_ATTEMPTS") {
            cfg.max_exit_gate_attempts = v;
        }
        if let Some(v) = env_u32("TELIC_MAX_CRASH_RESTARTS") {
            cfg.max_crash_restarts = v;
        }
        if let Some(v) = env_u64("TELIC_TOKEN_BUDGET") {
            cfg.token_budget = v;
        }
        if let Some(v) = env_u64("TELIC_VRC_MIN_INTERVAL_SEC") {
            cfg.vrc_min_interval_sec = v;
        }
        if let Some(v) = env_u64("TELIC_EXIT_GATE_WALL_CLOCK_SEC") {
            cfg.exit_gate_wall_clock_sec = v;
        }
        if let Some(v) = env_u64("TELIC_VERIFICATION_SCRIPT_TIMEOUT_SEC") {
            cfg.verification_script_timeout_sec = v;
        }
        if let Some(v) = env_u64("TELIC_VERIFICATION_TOTAL_WALL_CLOCK_SEC") {
            cfg.verification_total_wall_clock_sec = v;
        }
        if let Some(v) = env_u64("TELIC_INTERACTIVE_PAUSE_POLL_SEC") {
            cfg.interactive_pause_poll_sec = v;
        }
        if let Ok(v) = std::env::var("TELIC_ENFORCE_CODE_HEALTH") {
            cfg.enforce_code_health = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = env_usize("TELIC_MONOLITHIC_FILE_LINES") {
            cfg.monolithic_file_lines = v;
        }
        cfg.agent_roles = AgentRoleConfig::from_env();

        cfg
    }

    fn defaults(sprint: String, project_dir: PathBuf) -> Self {
        Self {
            sprint,
            project_dir,
            max_fix_attempts: 3,
            max_task_retries: 3,
            stuck_threshold: 3,
            qc_generation_threshold: 3,
            max_rollbacks_per_sprint: 3,
            max_exit_gate_attempts: 5,
            max_crash_restarts: 3,
            token_budget: 2_000_000,
            budget_critical_fraction: 0.95,
            budget_degraded_fraction: 0.80,
            vrc_min_interval_sec: 30,
            exit_gate_wall_clock_sec: 30 * 60,
            verification_script_timeout_sec: 300,
            verification_total_wall_clock_sec: 20 * 60,
            interactive_pause_poll_sec: 5,
            role_timeouts: RoleTimeouts::default(),
            agent_roles: AgentRoleConfig {
                default_model: "gpt-4.1-mini".to_string(),
                overrides: HashMap::new(),
            },
            enforce_code_health: true,
            monolithic_file_lines: 1000,
        }
    }

    /// Root directory for this sprint's loop state (`<sprint>/.loop/`).
    pub fn loop_dir(&self) -> PathBuf {
        self.project_dir.join(&self.sprint).join(".loop")
    }

    pub fn state_path(&self) -> PathBuf {
        self.loop_dir().join("state.json")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.loop_dir().join("checkpoints")
    }

    pub fn verifications_dir(&self) -> PathBuf {
        self.loop_dir().join("verifications")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.loop_dir().join(".loop.lock")
    }

    pub fn delivery_report_path(&self) -> PathBuf {
        self.project_dir
            .join(&self.sprint)
            .join("DELIVERY_REPORT.md")
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
