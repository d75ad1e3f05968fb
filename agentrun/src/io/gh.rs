//! GitHub CLI (`gh`) adapter.
//!
//! Every call carries the non-interactive environment overlay. Lookups
//! distinguish "no such PR" and "unexpected JSON" (both answered by falling
//! back to a branch search) from transport failures (retried by callers).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::types::{MergeStrategy, PR_JSON_FIELDS, PrView};
use crate::error::{CodedError, ErrorCode};
use crate::io::process::{ProcOutput, ProcSpec};
use crate::runtime::Runtime;

/// Outcome of a PR query that reached the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrLookup {
    Found(PrView),
    NotFound,
    /// `gh` answered with JSON we could not interpret.
    Malformed(String),
}

/// Body source for `gh pr create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrBody {
    File(PathBuf),
    Text(String),
}

pub struct Gh<'a> {
    rt: &'a Runtime<'a>,
    workdir: PathBuf,
}

impl<'a> Gh<'a> {
    pub fn new(rt: &'a Runtime<'a>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            rt,
            workdir: workdir.into(),
        }
    }

    /// `gh` is installed and authenticated.
    #[instrument(skip_all)]
    pub fn ensure_ready(&self) -> Result<()> {
        if self.rt.look_path("gh").is_none() {
            return Err(CodedError::new(ErrorCode::GhMissing, "gh is not installed")
                .with_hint("install the GitHub CLI: https://cli.github.com")
                .into());
        }
        let out = self.run(&["auth", "status"])?;
        if !out.success() {
            return Err(CodedError::new(
                ErrorCode::GhNotAuthenticated,
                "gh is not authenticated",
            )
            .with_detail("stderr", crate::error::truncate_for_detail(out.stderr.trim()))
            .with_hint("gh auth login")
            .into());
        }
        Ok(())
    }

    /// `gh pr view <n>`.
    #[instrument(skip_all, fields(number))]
    pub fn view_by_number(&self, number: u64) -> Result<PrLookup> {
        let n = number.to_string();
        let out = self.run(&["pr", "view", &n, "--json", PR_JSON_FIELDS])?;
        if !out.success() {
            if is_not_found(&out.stderr) {
                debug!("pr not found by number");
                return Ok(PrLookup::NotFound);
            }
            return Err(self.failure(ErrorCode::GhFailed, &format!("gh pr view {n}"), &out).into());
        }
        Ok(match serde_json::from_str::<PrView>(&out.stdout) {
            Ok(view) => PrLookup::Found(view),
            Err(err) => PrLookup::Malformed(err.to_string()),
        })
    }

    /// Most recent PR (any state) whose head is `branch`.
    #[instrument(skip_all, fields(branch))]
    pub fn find_by_branch(&self, branch: &str) -> Result<PrLookup> {
        let out = self.run(&[
            "pr",
            "list",
            "--head",
            branch,
            "--state",
            "all",
            "--json",
            PR_JSON_FIELDS,
            "--limit",
            "1",
        ])?;
        if !out.success() {
            return Err(self
                .failure(ErrorCode::GhFailed, "gh pr list", &out)
                .into());
        }
        Ok(match serde_json::from_str::<Vec<PrView>>(&out.stdout) {
            Ok(mut views) if !views.is_empty() => PrLookup::Found(views.remove(0)),
            Ok(_) => PrLookup::NotFound,
            Err(err) => PrLookup::Malformed(err.to_string()),
        })
    }

    /// `gh pr create`. A PR that already exists for the branch counts as success.
    #[instrument(skip_all, fields(branch, base))]
    pub fn create(&self, branch: &str, base: &str, title: &str, body: &PrBody) -> Result<()> {
        let (body_flag, body_value) = match body {
            PrBody::File(path) => ("--body-file", path.to_string_lossy().into_owned()),
            PrBody::Text(text) => ("--body", text.clone()),
        };
        let args = [
            "pr", "create", "--head", branch, "--base", base, "--title", title, body_flag,
            body_value.as_str(),
        ];
        let out = self.run(&args)?;
        if !out.success() {
            if out.stderr.contains("already exists") {
                debug!("pr already exists for branch");
                return Ok(());
            }
            return Err(self
                .failure(ErrorCode::PrCreateFailed, "gh pr create", &out)
                .into());
        }
        Ok(())
    }

    /// Replace the PR body with the contents of `body_file`.
    #[instrument(skip_all, fields(number))]
    pub fn edit_body(&self, number: u64, body_file: &Path) -> Result<()> {
        let n = number.to_string();
        let path = body_file.to_string_lossy();
        let out = self.run(&["pr", "edit", &n, "--body-file", &path])?;
        if !out.success() {
            return Err(self
                .failure(ErrorCode::GhFailed, &format!("gh pr edit {n}"), &out)
                .into());
        }
        Ok(())
    }

    #[instrument(skip_all, fields(number))]
    pub fn merge(&self, number: u64, strategy: MergeStrategy) -> Result<()> {
        let n = number.to_string();
        let out = self.run(&["pr", "merge", &n, strategy.as_flag()])?;
        if !out.success() {
            return Err(self
                .failure(ErrorCode::PrMergeFailed, &format!("gh pr merge {n}"), &out)
                .into());
        }
        Ok(())
    }

    fn failure(&self, code: ErrorCode, what: &str, out: &ProcOutput) -> CodedError {
        CodedError::tool_failure(code, what, out.exit_code, out.timed_out, &out.stderr)
    }

    fn run(&self, args: &[&str]) -> Result<ProcOutput> {
        let spec = ProcSpec::new("gh")
            .args(args.iter().copied())
            .cwd(&self.workdir)
            .non_interactive();
        self.rt
            .run(spec)
            .with_context(|| format!("gh {}", args.first().copied().unwrap_or_default()))
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("could not resolve to a pullrequest")
        || lower.contains("no pull requests found")
}
