//! Precondition pipeline shared by `push` and `merge`.
//!
//! Each gate either passes silently, passes with a warning (stderr line plus
//! an allowed-class event), or fails: a failed gate emits
//! `<command>_failed {step, error_code, message}` and its error is returned
//! unchanged so the caller aborts before any further side effect.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::debug;

use crate::core::origin::{is_supported_host, parse_origin_host};
use crate::error::{CodedError, ErrorCode, code_of};
use crate::io::events::EventLog;
use crate::io::git::Git;
use crate::io::run_store::RunMeta;
use crate::runtime::Runtime;

pub struct Gates<'a> {
    command: &'static str,
    events: &'a EventLog,
    rt: &'a Runtime<'a>,
}

impl<'a> Gates<'a> {
    pub fn new(command: &'static str, events: &'a EventLog, rt: &'a Runtime<'a>) -> Self {
        Self {
            command,
            events,
            rt,
        }
    }

    /// Run a fatal gate.
    pub fn check<T>(&self, step: &str, gate: impl FnOnce() -> Result<T>) -> Result<T> {
        match gate() {
            Ok(value) => {
                debug!(command = self.command, step, "gate passed");
                Ok(value)
            }
            Err(err) => {
                self.record_failure(step, &err);
                Err(err)
            }
        }
    }

    /// Emit `<command>_failed` for an error raised outside [`Gates::check`].
    pub fn record_failure(&self, step: &str, err: &anyhow::Error) {
        let _ = self.events.emit(
            self.rt.now(),
            &format!("{}_failed", self.command),
            json!({
                "step": step,
                "error_code": code_of(err).as_str(),
                "message": format!("{err:#}"),
            }),
        );
    }

    /// Pass with a warning.
    pub fn warn(&self, step: &str, event: &str, message: &str, mut data: Value) {
        eprintln!("warning: {message}");
        if let Value::Object(map) = &mut data {
            map.insert("step".to_string(), json!(step));
            map.insert("message".to_string(), json!(message));
        }
        let _ = self.events.emit(self.rt.now(), event, data);
    }

    pub fn emit(&self, event: &str, data: Value) {
        let _ = self.events.emit(self.rt.now(), event, data);
    }
}

/// The run's worktree must exist on disk.
pub fn require_worktree(meta: &RunMeta) -> Result<()> {
    if meta.worktree_path.is_dir() {
        return Ok(());
    }
    Err(CodedError::new(
        ErrorCode::WorktreeMissing,
        format!("worktree {} does not exist", meta.worktree_path.display()),
    )
    .with_hint(format!("agentrun clean {}", meta.run_id))
    .into())
}

/// `origin` must be configured; returns its URL.
pub fn require_origin(git: &Git<'_>) -> Result<String> {
    git.remote_url("origin")?.ok_or_else(|| {
        CodedError::new(ErrorCode::NoOrigin, "remote 'origin' is not configured")
            .with_hint("git remote add origin <url>")
            .into()
    })
}

/// `origin` must point at a supported code host.
pub fn require_supported_host(origin_url: &str) -> Result<()> {
    let host = parse_origin_host(origin_url);
    if is_supported_host(&host) {
        return Ok(());
    }
    Err(CodedError::new(
        ErrorCode::UnsupportedOriginHost,
        format!("origin host '{host}' is not supported (only github.com)"),
    )
    .with_detail("origin", origin_url)
    .into())
}

/// Ref that commits-ahead is measured against: `origin/<parent>` when that
/// remote ref exists, else the local `<parent>`.
pub fn resolve_parent_ref(git: &Git<'_>, parent: &str) -> Result<String> {
    if git.ref_exists(&format!("refs/remotes/origin/{parent}"))? {
        return Ok(format!("origin/{parent}"));
    }
    if git.commit_exists(parent)? {
        return Ok(parent.to_string());
    }
    Err(CodedError::new(
        ErrorCode::ParentNotFound,
        format!("parent branch '{parent}' not found locally or on origin"),
    )
    .into())
}

/// At least one commit on HEAD that the parent ref lacks. Never waived.
pub fn require_commits_ahead(git: &Git<'_>, parent: &str) -> Result<u64> {
    let parent_ref = resolve_parent_ref(git, parent)?;
    let ahead = git.rev_list_count(&format!("{parent_ref}..HEAD"))?;
    if ahead == 0 {
        return Err(CodedError::new(
            ErrorCode::EmptyDiff,
            format!("no commits ahead of {parent_ref}"),
        )
        .with_hint("commit the agent's work before pushing")
        .into());
    }
    Ok(ahead)
}

/// Report contents, or `None` when the file does not exist.
pub fn read_report(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read report {}", path.display())),
    }
}
