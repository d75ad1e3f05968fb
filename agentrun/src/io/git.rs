//! Git adapter for agentrun commands.
//!
//! A small, explicit wrapper around `git` subprocess calls. Calls that talk to
//! a remote (`push`, `fetch`) get the non-interactive environment overlay so
//! they fail instead of prompting for credentials.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::error::{CodedError, ErrorCode};
use crate::io::process::{ProcOutput, ProcSpec};
use crate::runtime::Runtime;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
pub struct Git<'a> {
    rt: &'a Runtime<'a>,
    workdir: PathBuf,
}

impl<'a> Git<'a> {
    pub fn new(rt: &'a Runtime<'a>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            rt,
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD in {}", self.workdir.display()));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Uncommitted changes, ignoring paths under any of the given prefixes.
    #[instrument(skip_all)]
    pub fn dirty_entries_except(&self, ignored_prefixes: &[&str]) -> Result<Vec<StatusEntry>> {
        let dirty: Vec<StatusEntry> = self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| {
                !ignored_prefixes
                    .iter()
                    .any(|prefix| entry.path.starts_with(prefix))
            })
            .collect();
        debug!(dirty = dirty.len(), "worktree status");
        Ok(dirty)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        self.ref_exists(&format!("refs/heads/{branch}"))
    }

    /// Check whether a fully-qualified ref exists.
    pub fn ref_exists(&self, refname: &str) -> Result<bool> {
        let out = self.run(&["show-ref", "--verify", "--quiet", refname])?;
        Ok(out.success())
    }

    /// Whether `rev` names a commit (branch, remote ref, or sha).
    pub fn commit_exists(&self, rev: &str) -> Result<bool> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        Ok(out.success())
    }

    /// URL of a remote, or `None` when it is not configured.
    pub fn remote_url(&self, remote: &str) -> Result<Option<String>> {
        let out = self.run(&["remote", "get-url", remote])?;
        if !out.success() {
            return Ok(None);
        }
        let url = out.stdout.trim().to_string();
        Ok((!url.is_empty()).then_some(url))
    }

    /// Number of commits in `range` (e.g. `origin/main..HEAD`).
    pub fn rev_list_count(&self, range: &str) -> Result<u64> {
        let out = self.run_capture(&["rev-list", "--count", range])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse rev-list count '{}'", out.trim()))
    }

    /// `git push -u origin <branch>`.
    #[instrument(skip_all, fields(branch))]
    pub fn push_branch(&self, branch: &str) -> Result<()> {
        let out = self.run_remote(&["push", "-u", "origin", branch])?;
        if !out.success() {
            return Err(CodedError::tool_failure(
                ErrorCode::GitPushFailed,
                &format!("git push origin {branch}"),
                out.exit_code,
                out.timed_out,
                &out.stderr,
            )
            .into());
        }
        debug!("pushed");
        Ok(())
    }

    /// Refresh `refs/remotes/origin/<branch>`.
    #[instrument(skip_all, fields(branch))]
    pub fn fetch_branch(&self, branch: &str) -> Result<()> {
        let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
        let out = self.run_remote(&["fetch", "origin", &refspec])?;
        if !out.success() {
            return Err(self.failure("fetch origin", &out).into());
        }
        Ok(())
    }

    /// SHA of `refs/remotes/origin/<branch>`, or `None` if the ref is missing.
    pub fn remote_ref_sha(&self, branch: &str) -> Result<Option<String>> {
        let refname = format!("refs/remotes/origin/{branch}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &refname])?;
        if !out.success() {
            return Ok(None);
        }
        Ok(Some(out.stdout.trim().to_string()))
    }

    /// Create `path` as a new worktree on a new branch starting at `base`.
    #[instrument(skip_all, fields(branch))]
    pub fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "-b", branch, &path_arg, base])?;
        Ok(())
    }

    #[instrument(skip_all)]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", &path_arg])?;
        Ok(())
    }

    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Force-delete a local branch.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Absolute path of the shared `.git` directory (same for all worktrees).
    pub fn common_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--path-format=absolute", "--git-common-dir"])?;
        Ok(PathBuf::from(out.trim()))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        Ok(self.run_checked(args)?.stdout)
    }

    fn run_checked(&self, args: &[&str]) -> Result<ProcOutput> {
        let out = self.run(args)?;
        if !out.success() {
            return Err(self.failure(&args.join(" "), &out).into());
        }
        Ok(out)
    }

    fn failure(&self, what: &str, out: &ProcOutput) -> CodedError {
        CodedError::tool_failure(
            ErrorCode::GitFailed,
            &format!("git {what}"),
            out.exit_code,
            out.timed_out,
            &out.stderr,
        )
    }

    fn run(&self, args: &[&str]) -> Result<ProcOutput> {
        self.rt
            .run(self.spec(args))
            .with_context(|| format!("git {}", args.join(" ")))
    }

    fn run_remote(&self, args: &[&str]) -> Result<ProcOutput> {
        self.rt
            .run(self.spec(args).non_interactive())
            .with_context(|| format!("git {}", args.join(" ")))
    }

    fn spec(&self, args: &[&str]) -> ProcSpec {
        ProcSpec::new("git").args(args.iter().copied()).cwd(&self.workdir)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
