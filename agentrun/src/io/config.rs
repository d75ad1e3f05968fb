//! User and repository configuration (TOML).
//!
//! - User config: `$AGENTRUN_CONFIG`, else `$XDG_CONFIG_HOME/agentrun/config.toml`,
//!   else `~/.config/agentrun/config.toml`.
//! - Repo config: `<repo_root>/agentrun.toml`, checked in alongside the code.
//!
//! Both files are optional; missing fields default to sensible values.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::MergeStrategy;
use crate::io::run_store::write_atomic;

pub const REPO_CONFIG_FILE: &str = "agentrun.toml";

/// Per-user preferences.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UserConfig {
    /// Overall budget for one command invocation; unset means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,

    pub defaults: UserDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UserDefaults {
    /// Command started inside each run's tmux session.
    pub runner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,
    /// Parent branch for new runs; unset means the current branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_branch: Option<String>,
}

impl Default for UserDefaults {
    fn default() -> Self {
        Self {
            runner: "claude".to_string(),
            editor: None,
            parent_branch: None,
        }
    }
}

impl UserConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == Some(0) {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.defaults.runner.trim().is_empty() {
            return Err(anyhow!("defaults.runner must be non-empty"));
        }
        if let Some(parent) = &self.defaults.parent_branch
            && parent.trim().is_empty()
        {
            return Err(anyhow!("defaults.parent_branch must be non-empty when set"));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

/// Per-repository hooks and limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RepoConfig {
    pub scripts: ScriptsConfig,
    pub timeouts: TimeoutsConfig,
    /// Truncate captured script output beyond this many bytes.
    pub output_limit_bytes: usize,
    pub merge: MergeConfig,
}

/// Shell snippets run with `sh -c` inside the run's worktree.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub setup_secs: u64,
    pub verify_secs: u64,
    pub archive_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            setup_secs: 10 * 60,
            verify_secs: 30 * 60,
            archive_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MergeConfig {
    pub strategy: MergeStrategy,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            scripts: ScriptsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            output_limit_bytes: 1_000_000,
            merge: MergeConfig::default(),
        }
    }
}

impl RepoConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeouts.setup_secs == 0 {
            return Err(anyhow!("timeouts.setup_secs must be > 0"));
        }
        if self.timeouts.verify_secs == 0 {
            return Err(anyhow!("timeouts.verify_secs must be > 0"));
        }
        if self.timeouts.archive_secs == 0 {
            return Err(anyhow!("timeouts.archive_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        for (name, script) in [
            ("setup", &self.scripts.setup),
            ("verify", &self.scripts.verify),
            ("archive", &self.scripts.archive),
        ] {
            if script.as_deref().is_some_and(|s| s.trim().is_empty()) {
                return Err(anyhow!("scripts.{name} must be non-empty when set"));
            }
        }
        Ok(())
    }
}

/// Pick the user config path from `AGENTRUN_CONFIG`, `XDG_CONFIG_HOME`, `HOME`.
pub fn resolve_user_config_path(var: impl Fn(&str) -> Option<OsString>) -> Option<PathBuf> {
    let non_empty = |key: &str| var(key).filter(|value| !value.is_empty());
    if let Some(path) = non_empty("AGENTRUN_CONFIG") {
        return Some(PathBuf::from(path));
    }
    if let Some(dir) = non_empty("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(dir).join("agentrun/config.toml"));
    }
    non_empty("HOME").map(|home| PathBuf::from(home).join(".config/agentrun/config.toml"))
}

pub fn user_config_path() -> Option<PathBuf> {
    resolve_user_config_path(|key| std::env::var_os(key))
}

/// Load user config. A missing file yields defaults.
pub fn load_user_config(path: &Path) -> Result<UserConfig> {
    let cfg: UserConfig = load_or_default(path)?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Load `<repo_root>/agentrun.toml`. A missing file yields defaults.
pub fn load_repo_config(repo_root: &Path) -> Result<RepoConfig> {
    let path = repo_root.join(REPO_CONFIG_FILE);
    let cfg: RepoConfig = load_or_default(&path)?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write user config to disk (temp file + rename).
pub fn write_user_config(path: &Path, cfg: &UserConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        return Ok(T::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
