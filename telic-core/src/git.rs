//! Git safety net: feature-branch lifecycle, checkpoints, rollback, and the
//! per-sprint advisory lock.
//!
//! `GitSafetyNet` wraps a retrying git command runner with the protections
//! this loop needs: protected-branch refusal, a sensitive-file guard, and a
//! sprint-scoped advisory lock.

use crate::error::{LoopError, LoopResult};
use crate::state::GitCheckpoint;
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;

const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;

const PROTECTED_BRANCHES: &[&str] = &["main", "master", "develop"];

fn sensitive_patterns() -> &'static [&'static str] {
    &[".env", ".key", "secret", "credential", "id_rsa", ".pem"]
}

pub struct GitSafetyNet {
    working_dir: PathBuf,
    sprint: String,
    max_retries: u32,
}

impl GitSafetyNet {
    pub fn new(working_dir: impl AsRef<Path>, sprint: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            sprint: sprint.into(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    fn run_git(&self, args: &[&str]) -> LoopResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|e| LoopError::git("execute", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LoopError::git(args.join(" "), stderr.to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_git_with_retry(&self, args: &[&str]) -> LoopResult<String> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.run_git(args) {
                Ok(out) => return Ok(out),
                Err(e) => {
                    if e.is_retryable() && attempt < self.max_retries {
                        let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                        std::thread::sleep(std::time::Duration::from_millis(delay));
                        last_error = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| LoopError::git("retry", "max retries exceeded")))
    }

    pub fn current_branch(&self) -> LoopResult<String> {
        self.run_git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn current_commit(&self) -> LoopResult<String> {
        self.run_git(&["rev-parse", "HEAD"])
    }

    fn is_protected(branch: &str) -> bool {
        PROTECTED_BRANCHES.contains(&branch)
    }

    /// Create and check out `telic-loop/<sprint>-<timestamp>`, refusing if
    /// HEAD is already a protected branch and the feature branch can't be
    /// cleanly forked from it.
    pub fn ensure_feature_branch(&self) -> LoopResult<String> {
        let current = self.current_branch()?;
        if let Ok(existing) = self.run_git(&["branch", "--list", &self.branch_name_prefix_glob()]) {
            if !existing.is_empty() {
                let name = existing.lines().next().unwrap().trim_start_matches("* ").trim();
                self.run_git_with_retry(&["checkout", name])?;
                return Ok(name.to_string());
            }
        }

        let branch = format!("telic-loop/{}-{}", self.sprint, Utc::now().format("%Y%m%d%H%M%S"));
        if Self::is_protected(&current) {
            tracing::info!(%current, %branch, "forking feature branch off protected branch");
        }
        self.run_git_with_retry(&["checkout", "-b", &branch])?;
        Ok(branch)
    }

    fn branch_name_prefix_glob(&self) -> String {
        format!("telic-loop/{}-*", self.sprint)
    }

    /// Refuses to commit anything matching a sensitive-file pattern; unstages
    /// it instead of failing the whole operation so the rest of the diff can
    /// still land.
    fn guard_sensitive_files(&self) -> LoopResult<()> {
        let staged = self.run_git(&["diff", "--cached", "--name-only"])?;
        for path in staged.lines() {
            let lower = path.to_lowercase();
            if sensitive_patterns().iter().any(|p| lower.contains(p)) {
                tracing::warn!(%path, "unstaging sensitive file before commit");
                self.run_git(&["restore", "--staged", path])?;
                return Err(LoopError::SensitiveFile {
                    path: PathBuf::from(path),
                });
            }
        }
        Ok(())
    }

    fn guard_protected_branch(&self) -> LoopResult<()> {
        let branch = self.current_branch()?;
        if Self::is_protected(&branch) {
            return Err(LoopError::git(
                "commit",
                format!("refusing to commit directly to protected branch '{branch}'"),
            ));
        }
        Ok(())
    }

    /// Stage everything, guard against protected branches and sensitive
    /// files, then commit with the sprint/action context and `Telic-Loop`
    /// coauthor trailer.
    pub fn commit(&self, task_id: &str, description_head: &str) -> LoopResult<String> {
        self.guard_protected_branch()?;
        self.run_git_with_retry(&["add", "-A"])?;
        self.guard_sensitive_files()?;

        let status = self.run_git(&["status", "--porcelain"])?;
        if status.is_empty() {
            return Err(LoopError::git("commit", "nothing to commit"));
        }

        let message = format!(
            "telic-loop({}): {} — {}\n\nCo-authored-by: Telic-Loop <noreply@telic-loop>",
            self.sprint, task_id, description_head
        );
        self.run_git_with_retry(&["commit", "-m", &message])?;
        self.current_commit()
    }

    /// Labeled checkpoint: a snapshot of the commit hash plus the scalars
    /// the delivery report and rollback path need.
    pub fn checkpoint(
        &self,
        label: impl Into<String>,
        tasks_completed: u32,
        verifications_passing: u32,
        value_score: f64,
    ) -> LoopResult<GitCheckpoint> {
        Ok(GitCheckpoint {
            label: label.into(),
            commit_hash: self.current_commit()?,
            timestamp: Utc::now(),
            tasks_completed,
            verifications_passing,
            value_score,
        })
    }

    /// `git reset --hard <hash>`. Caller is responsible for state
    /// reconciliation (resetting tasks completed after the checkpoint,
    /// invalidating dependent verifications) — this only moves the tree.
    pub fn rollback_to(&self, commit_hash: &str) -> LoopResult<()> {
        self.run_git(&["cat-file", "-t", commit_hash])?;
        self.run_git_with_retry(&["reset", "--hard", commit_hash])?;
        Ok(())
    }

    pub fn has_uncommitted_changes(&self) -> LoopResult<bool> {
        Ok(!self.run_git(&["status", "--porcelain"])?.is_empty())
    }
}

/// Matches a path against the sensitive-file patterns without needing a git
/// repository, used by the gateway's tool-call validation before a diff is
/// even staged.
pub fn looks_sensitive(path: &Path) -> bool {
    let text = path.to_string_lossy().to_lowercase();
    sensitive_patterns().iter().any(|p| text.contains(p))
        || Regex::new(r"\.key$|\.pem$").unwrap().is_match(&text)
}

// ===========================================================================
// Advisory lock
// ===========================================================================

/// PID-based `O_EXCL` advisory lock: one loop instance per sprint, held
/// until dropped, with stale-PID reclamation on acquire.
pub struct SprintLock {
    path: PathBuf,
}

impl SprintLock {
    /// Acquire the lock at `path`, reclaiming it if the owning PID is dead.
    pub fn acquire(path: impl Into<PathBuf>) -> LoopResult<Self> {
        let path = path.into();
        match Self::try_create(&path) {
            Ok(()) => return Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(LoopError::Io(e)),
        }

        let owner_pid = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());

        match owner_pid {
            Some(pid) if pid_is_alive(pid) => Err(LoopError::LockHeld {
                sprint: path
                    .parent()
                    .and_then(|p| p.parent())
                    .and_then(|p| p.file_name())
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default(),
                owner_pid: pid,
            }),
            _ => {
                tracing::warn!(path = %path.display(), "reclaiming lock from dead owner");
                std::fs::remove_file(&path)?;
                Self::try_create(&path).map_err(LoopError::Io)?;
                Ok(Self { path })
            }
        }
    }

    fn try_create(path: &Path) -> std::io::Result<()> {
        use std::fs::OpenOptions;
        use std::io::Write;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        write!(file, "{}", std::process::id())?;
        Ok(())
    }
}

impl Drop for SprintLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs no action beyond existence/permission checks.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}
