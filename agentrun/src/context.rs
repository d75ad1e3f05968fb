//! Per-repository command context.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::io::config::{RepoConfig, UserConfig, load_repo_config};
use crate::io::events::EventLog;
use crate::io::lock::{RepoLock, RepoLockGuard};
use crate::io::paths::{DataPaths, RunPaths};
use crate::io::repo::{RepoInfo, discover_repo};
use crate::io::run_store::{StoredRun, list_runs};
use crate::runtime::Runtime;

/// Everything a command needs to know about the repository it runs against.
#[derive(Debug, Clone)]
pub struct RepoContext {
    pub repo: RepoInfo,
    pub data: DataPaths,
    pub repo_config: RepoConfig,
    pub user_config: UserConfig,
}

impl RepoContext {
    /// Discover the repository around `cwd` and load its config.
    pub fn load(
        rt: &Runtime<'_>,
        cwd: &Path,
        data: DataPaths,
        user_config: UserConfig,
    ) -> Result<Self> {
        let repo = discover_repo(rt, cwd)?;
        let repo_config = load_repo_config(&repo.root)?;
        Ok(Self {
            repo,
            data,
            repo_config,
            user_config,
        })
    }

    pub fn repo_id(&self) -> &str {
        &self.repo.repo_id
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.data.runs_dir(self.repo_id())
    }

    pub fn run_paths(&self, run_id: &str) -> RunPaths {
        self.data.run(self.repo_id(), run_id)
    }

    pub fn worktree_path(&self, run_id: &str) -> PathBuf {
        self.data.worktree_path(self.repo_id(), run_id)
    }

    pub fn event_log(&self, run_id: &str) -> EventLog {
        EventLog::new(self.run_paths(run_id).events_path, self.repo_id(), run_id)
    }

    pub fn lock(&self, label: &str, now: DateTime<Utc>) -> Result<RepoLockGuard> {
        RepoLock::acquire(&self.data, self.repo_id(), label, now)
    }

    pub fn list_runs(&self) -> Result<Vec<StoredRun>> {
        list_runs(&self.runs_dir())
    }
}
