//! Durable persistence for `LoopState`
//!
//! Write-temp-then-rename so a crash or kill -9 mid-write never leaves
//! `state.json` half-written (invariant 5). `rename` within the same
//! directory is atomic on the filesystems this loop targets (ext4, APFS,
//! most overlay drivers).

use crate::error::{LoopError, LoopResult};
use crate::state::LoopState;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct StateStore {
    state_path: PathBuf,
}

impl StateStore {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
        }
    }

    /// Load existing state, or `None` if this is a fresh sprint.
    pub fn load(&self) -> LoopResult<Option<LoopState>> {
        if !self.state_path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.state_path)?;
        match serde_json::from_str(&json) {
            Ok(state) => Ok(Some(state)),
            Err(e) => Err(LoopError::StateCorrupted {
                path: self.state_path.clone(),
                message: e.to_string(),
            }),
        }
    }

    /// Persist `state`, replacing any previous `state.json` atomically.
    pub fn save(&self, state: &LoopState) -> LoopResult<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        atomic_write(&self.state_path, json.as_bytes())?;
        Ok(())
    }

    pub fn clear(&self) -> LoopResult<()> {
        if self.state_path.exists() {
            fs::remove_file(&self.state_path)?;
        }
        Ok(())
    }

    /// Attempt recovery from the most recent checkpoint-adjacent backup,
    /// used by `CrashSupervisor` when `load` reports `StateCorrupted`.
    pub fn load_or_recover(&self, backups_dir: &Path) -> LoopResult<Option<LoopState>> {
        match self.load() {
            Ok(state) => Ok(state),
            Err(LoopError::StateCorrupted { path, message }) => {
                tracing::warn!(%path, %message, "state store corrupted, attempting recovery");
                let mut candidates: Vec<PathBuf> = fs::read_dir(backups_dir)
                    .into_iter()
                    .flatten()
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
                    .collect();
                candidates.sort();
                for candidate in candidates.into_iter().rev() {
                    if let Ok(json) = fs::read_to_string(&candidate) {
                        if let Ok(state) = serde_json::from_str::<LoopState>(&json) {
                            tracing::info!(recovered_from = %candidate.display(), "state recovered from backup");
                            return Ok(Some(state));
                        }
                    }
                }
                Err(LoopError::StateCorrupted {
                    path: self.state_path.clone(),
                    message: "no recoverable backup found".to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Snapshot the current `state.json` into `backups_dir` labeled with
    /// `label`, called before risky operations (rollback, course-correct)
    /// so a bad mutation can be manually inspected.
    pub fn snapshot(&self, backups_dir: &Path, label: &str) -> LoopResult<()> {
        if !self.state_path.exists() {
            return Ok(());
        }
        fs::create_dir_all(backups_dir)?;
        let dest = backups_dir.join(format!("{label}.json"));
        fs::copy(&self.state_path, &dest)?;
        Ok(())
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
