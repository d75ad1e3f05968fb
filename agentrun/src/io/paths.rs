//! Canonical on-disk layout.
//!
//! ```text
//! <data>/repos/<repo_id>/lock
//! <data>/repos/<repo_id>/runs/<run_id>/{meta.json,events.jsonl,logs/}
//! <data>/repos/<repo_id>/worktrees/<run_id>/
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

/// Report file, relative to the run's worktree.
pub const REPORT_RELATIVE_PATH: &str = ".agentrun/report.md";
/// Worktree-local directory excluded from dirty checks.
pub const WORKTREE_STATE_DIR: &str = ".agentrun/";

pub fn report_path(worktree: &Path) -> PathBuf {
    worktree.join(REPORT_RELATIVE_PATH)
}

/// Pick the data directory from (in order) `AGENTRUN_DATA_DIR`,
/// `XDG_DATA_HOME/agentrun`, `HOME/.local/share/agentrun`.
pub fn resolve_data_dir(var: impl Fn(&str) -> Option<OsString>) -> Result<PathBuf> {
    let non_empty = |key: &str| var(key).filter(|value| !value.is_empty());
    if let Some(dir) = non_empty("AGENTRUN_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if let Some(dir) = non_empty("XDG_DATA_HOME") {
        return Ok(PathBuf::from(dir).join("agentrun"));
    }
    if let Some(home) = non_empty("HOME") {
        return Ok(PathBuf::from(home).join(".local/share/agentrun"));
    }
    Err(anyhow!(
        "cannot locate data directory: set AGENTRUN_DATA_DIR or HOME"
    ))
}

/// Root of all agentrun state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(resolve_data_dir(|key| std::env::var_os(key))?))
    }

    pub fn repo_dir(&self, repo_id: &str) -> PathBuf {
        self.root.join("repos").join(repo_id)
    }

    pub fn runs_dir(&self, repo_id: &str) -> PathBuf {
        self.repo_dir(repo_id).join("runs")
    }

    pub fn lock_path(&self, repo_id: &str) -> PathBuf {
        self.repo_dir(repo_id).join("lock")
    }

    pub fn worktree_path(&self, repo_id: &str, run_id: &str) -> PathBuf {
        self.repo_dir(repo_id).join("worktrees").join(run_id)
    }

    pub fn run(&self, repo_id: &str, run_id: &str) -> RunPaths {
        RunPaths::new(self.runs_dir(repo_id).join(run_id))
    }
}

/// Files belonging to one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub events_path: PathBuf,
    pub logs_dir: PathBuf,
    pub setup_log: PathBuf,
    pub verify_log: PathBuf,
    pub archive_log: PathBuf,
}

impl RunPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let logs_dir = dir.join("logs");
        Self {
            meta_path: dir.join("meta.json"),
            events_path: dir.join("events.jsonl"),
            setup_log: logs_dir.join("setup.log"),
            verify_log: logs_dir.join("verify.log"),
            archive_log: logs_dir.join("archive.log"),
            logs_dir,
            dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<OsString> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| OsString::from(v))
        }
    }

    #[test]
    fn explicit_data_dir_wins() {
        let dir = resolve_data_dir(env(&[
            ("AGENTRUN_DATA_DIR", "/data"),
            ("XDG_DATA_HOME", "/xdg"),
            ("HOME", "/home/u"),
        ]))
        .expect("resolve");
        assert_eq!(dir, PathBuf::from("/data"));
    }

    #[test]
    fn falls_back_to_xdg_then_home() {
        let xdg = resolve_data_dir(env(&[("XDG_DATA_HOME", "/xdg"), ("HOME", "/home/u")]))
            .expect("resolve");
        assert_eq!(xdg, PathBuf::from("/xdg/agentrun"));
        let home = resolve_data_dir(env(&[("XDG_DATA_HOME", ""), ("HOME", "/home/u")]))
            .expect("resolve");
        assert_eq!(home, PathBuf::from("/home/u/.local/share/agentrun"));
        assert!(resolve_data_dir(env(&[])).is_err());
    }

    #[test]
    fn layout() {
        let paths = DataPaths::new("/d");
        let run = paths.run("r1", "20260101000000-abcd");
        assert_eq!(run.meta_path, PathBuf::from("/d/repos/r1/runs/20260101000000-abcd/meta.json"));
        assert_eq!(run.archive_log, PathBuf::from("/d/repos/r1/runs/20260101000000-abcd/logs/archive.log"));
        assert_eq!(paths.lock_path("r1"), PathBuf::from("/d/repos/r1/lock"));
        assert_eq!(
            paths.worktree_path("r1", "x"),
            PathBuf::from("/d/repos/r1/worktrees/x")
        );
    }
}
