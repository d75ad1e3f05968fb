//! Run metadata storage (`runs/<run_id>/meta.json`).
//!
//! Writes are atomic (temp file + rename) so concurrent readers never see a
//! torn file. Fields this version does not know about are preserved on
//! rewrite.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::archive_outcome::ArchiveStage;
use crate::core::resolve::RunRef;

pub const RUN_SCHEMA_VERSION: u32 = 1;

/// Persisted state of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMeta {
    pub schema_version: u32,
    pub run_id: String,
    pub repo_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub runner: String,
    pub parent_branch: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub tmux_session: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub last_push_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_report_hash: Option<String>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub verify: Option<VerifyRecord>,
    #[serde(default)]
    pub archive: ArchiveState,
    #[serde(default)]
    pub flags: RunFlags,
    /// Unknown fields, carried through rewrites untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RunMeta {
    pub fn is_archived(&self) -> bool {
        self.archive.archived_at.is_some()
    }

    pub fn run_ref(&self) -> RunRef {
        RunRef {
            run_id: self.run_id.clone(),
            name: self.name.clone(),
            archived: self.is_archived(),
            broken: false,
        }
    }

    /// Name if set, else id; for human-facing messages.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.run_id)
    }
}

/// Last verify script result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyRecord {
    pub ok: bool,
    pub summary: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub finished_at: DateTime<Utc>,
    pub log_path: PathBuf,
}

/// Per-stage archive completion markers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveState {
    #[serde(default)]
    pub script_done_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_done_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub worktree_done_at: Option<DateTime<Utc>>,
    /// Set only once every stage has completed.
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl ArchiveState {
    pub fn stage_done(&self, stage: ArchiveStage) -> bool {
        self.marker(stage).is_some()
    }

    pub fn mark(&mut self, stage: ArchiveStage, at: DateTime<Utc>) {
        match stage {
            ArchiveStage::Script => self.script_done_at = Some(at),
            ArchiveStage::Session => self.session_done_at = Some(at),
            ArchiveStage::Worktree => self.worktree_done_at = Some(at),
        }
    }

    fn marker(&self, stage: ArchiveStage) -> Option<DateTime<Utc>> {
        match stage {
            ArchiveStage::Script => self.script_done_at,
            ArchiveStage::Session => self.session_done_at,
            ArchiveStage::Worktree => self.worktree_done_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunFlags {
    #[serde(default)]
    pub needs_attention: bool,
    #[serde(default)]
    pub setup_failed: bool,
}

/// A run directory as found on disk.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredRun {
    Valid(RunMeta),
    /// `meta.json` missing or unparseable.
    Broken { run_id: String, reason: String },
}

impl StoredRun {
    pub fn run_id(&self) -> &str {
        match self {
            StoredRun::Valid(meta) => &meta.run_id,
            StoredRun::Broken { run_id, .. } => run_id,
        }
    }

    pub fn run_ref(&self) -> RunRef {
        match self {
            StoredRun::Valid(meta) => meta.run_ref(),
            StoredRun::Broken { run_id, .. } => RunRef {
                run_id: run_id.clone(),
                name: None,
                archived: false,
                broken: true,
            },
        }
    }
}

/// Load run metadata from disk.
pub fn load_run_meta(path: &Path) -> Result<RunMeta> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run meta {}", path.display()))?;
    let meta: RunMeta = serde_json::from_str(&contents)
        .with_context(|| format!("parse run meta {}", path.display()))?;
    Ok(meta)
}

/// Atomically write run metadata to disk (temp file + rename).
pub fn write_run_meta(path: &Path, meta: &RunMeta) -> Result<()> {
    debug!(path = %path.display(), run_id = %meta.run_id, "writing run meta");
    let mut buf = serde_json::to_string_pretty(meta)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Read-modify-write; returns the stored result.
pub fn update_run_meta(path: &Path, mutate: impl FnOnce(&mut RunMeta)) -> Result<RunMeta> {
    let mut meta = load_run_meta(path)?;
    mutate(&mut meta);
    write_run_meta(path, &meta)?;
    Ok(meta)
}

/// Create a run directory; `false` if it already exists.
pub fn claim_run_dir(dir: &Path) -> Result<bool> {
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    match fs::create_dir(dir) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("create run dir {}", dir.display())),
    }
}

/// Every run directory under `runs_dir`, sorted by run id.
pub fn list_runs(runs_dir: &Path) -> Result<Vec<StoredRun>> {
    let entries = match fs::read_dir(runs_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("list runs {}", runs_dir.display()));
        }
    };

    let mut runs = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("list runs {}", runs_dir.display()))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let run_id = entry.file_name().to_string_lossy().into_owned();
        if run_id.starts_with('.') {
            continue;
        }
        let meta_path = entry.path().join("meta.json");
        match load_run_meta(&meta_path) {
            Ok(meta) => runs.push(StoredRun::Valid(meta)),
            Err(err) => {
                warn!(run_id = %run_id, err = %format!("{err:#}"), "broken run directory");
                runs.push(StoredRun::Broken {
                    run_id,
                    reason: format!("{err:#}"),
                });
            }
        }
    }
    runs.sort_by(|a, b| a.run_id().cmp(b.run_id()));
    Ok(runs)
}

/// Write `contents` to a sibling temp file, then rename over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(
        ".{}.{}.tmp",
        file_name.to_string_lossy(),
        std::process::id()
    ));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
