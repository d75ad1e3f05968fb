//! Stable, machine-readable error codes.
//!
//! Command pipelines return `anyhow::Result` and attach context freely. Any
//! failure a caller is expected to react to is raised as a [`CodedError`]
//! somewhere in the chain; [`find_coded`] recovers it for reporting, event
//! tagging, and exit-code selection. Anything without a code is `E_INTERNAL`.

use std::fmt;

use serde::Serialize;

/// Upper bound for tool stderr copied into error details.
pub const STDERR_DETAIL_LIMIT: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    Usage,
    NotARepo,
    NameTaken,
    RunNotFound,
    RunAmbiguous,
    RunBroken,
    RunArchived,
    RepoLocked,
    WorktreeMissing,
    NoOrigin,
    UnsupportedOriginHost,
    ReportInvalid,
    EmptyDiff,
    ParentNotFound,
    NoPr,
    NotInteractive,
    Aborted,
    GhMissing,
    GhNotAuthenticated,
    TmuxMissing,
    GitFailed,
    GitPushFailed,
    GhFailed,
    PrCreateFailed,
    PrMergeFailed,
    TmuxFailed,
    PrClosed,
    PrDraft,
    PrMerged,
    PrMismatch,
    PrNotMergeable,
    PrMergeabilityUnknown,
    RemoteOutOfDate,
    MergeUnconfirmed,
    SessionNotFound,
    ScriptFailed,
    ScriptTimeout,
    ArchiveFailed,
    ArchiveIncomplete,
    DeadlineExceeded,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Usage => "E_USAGE",
            ErrorCode::NotARepo => "E_NOT_A_REPO",
            ErrorCode::NameTaken => "E_NAME_TAKEN",
            ErrorCode::RunNotFound => "E_RUN_NOT_FOUND",
            ErrorCode::RunAmbiguous => "E_RUN_AMBIGUOUS",
            ErrorCode::RunBroken => "E_RUN_BROKEN",
            ErrorCode::RunArchived => "E_RUN_ARCHIVED",
            ErrorCode::RepoLocked => "E_REPO_LOCKED",
            ErrorCode::WorktreeMissing => "E_WORKTREE_MISSING",
            ErrorCode::NoOrigin => "E_NO_ORIGIN",
            ErrorCode::UnsupportedOriginHost => "E_UNSUPPORTED_ORIGIN_HOST",
            ErrorCode::ReportInvalid => "E_REPORT_INVALID",
            ErrorCode::EmptyDiff => "E_EMPTY_DIFF",
            ErrorCode::ParentNotFound => "E_PARENT_NOT_FOUND",
            ErrorCode::NoPr => "E_NO_PR",
            ErrorCode::NotInteractive => "E_NOT_INTERACTIVE",
            ErrorCode::Aborted => "E_ABORTED",
            ErrorCode::GhMissing => "E_GH_MISSING",
            ErrorCode::GhNotAuthenticated => "E_GH_NOT_AUTHENTICATED",
            ErrorCode::TmuxMissing => "E_TMUX_MISSING",
            ErrorCode::GitFailed => "E_GIT_FAILED",
            ErrorCode::GitPushFailed => "E_GIT_PUSH_FAILED",
            ErrorCode::GhFailed => "E_GH_FAILED",
            ErrorCode::PrCreateFailed => "E_PR_CREATE_FAILED",
            ErrorCode::PrMergeFailed => "E_PR_MERGE_FAILED",
            ErrorCode::TmuxFailed => "E_TMUX_FAILED",
            ErrorCode::PrClosed => "E_PR_CLOSED",
            ErrorCode::PrDraft => "E_PR_DRAFT",
            ErrorCode::PrMerged => "E_PR_MERGED",
            ErrorCode::PrMismatch => "E_PR_MISMATCH",
            ErrorCode::PrNotMergeable => "E_PR_NOT_MERGEABLE",
            ErrorCode::PrMergeabilityUnknown => "E_PR_MERGEABILITY_UNKNOWN",
            ErrorCode::RemoteOutOfDate => "E_REMOTE_OUT_OF_DATE",
            ErrorCode::MergeUnconfirmed => "E_MERGE_UNCONFIRMED",
            ErrorCode::SessionNotFound => "E_SESSION_NOT_FOUND",
            ErrorCode::ScriptFailed => "E_SCRIPT_FAILED",
            ErrorCode::ScriptTimeout => "E_SCRIPT_TIMEOUT",
            ErrorCode::ArchiveFailed => "E_ARCHIVE_FAILED",
            ErrorCode::ArchiveIncomplete => "E_ARCHIVE_INCOMPLETE",
            ErrorCode::DeadlineExceeded => "E_DEADLINE_EXCEEDED",
            ErrorCode::Internal => "E_INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error with a stable code and free-form key/value details.
///
/// A `hint` detail, when present, is printed under the error line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CodedError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Vec<(String, String)>,
}

impl CodedError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.push((key.into(), value.to_string()));
        self
    }

    pub fn with_hint(self, hint: impl ToString) -> Self {
        self.with_detail("hint", hint)
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn hint(&self) -> Option<&str> {
        self.detail("hint")
    }

    /// Wrap a failed external tool call, keeping its exit code and a bounded stderr excerpt.
    pub fn tool_failure(
        code: ErrorCode,
        what: &str,
        exit_code: Option<i32>,
        timed_out: bool,
        stderr: &str,
    ) -> Self {
        let excerpt = truncate_for_detail(stderr.trim());
        let status = match (timed_out, exit_code) {
            (true, _) => "timed out".to_string(),
            (false, Some(code)) => format!("exit {code}"),
            (false, None) => "killed by signal".to_string(),
        };
        let message = if excerpt.is_empty() {
            format!("{what} failed ({status})")
        } else {
            format!("{what} failed ({status}): {excerpt}")
        };
        let mut err = Self::new(code, message)
            .with_detail("exit_code", exit_code.map_or("none".to_string(), |c| c.to_string()));
        if !excerpt.is_empty() {
            err = err.with_detail("stderr", excerpt);
        }
        err
    }
}

/// Find the first [`CodedError`] in an error chain.
pub fn find_coded(err: &anyhow::Error) -> Option<&CodedError> {
    err.chain().find_map(|cause| cause.downcast_ref::<CodedError>())
}

/// Stable code for any error; uncoded failures are internal.
pub fn code_of(err: &anyhow::Error) -> ErrorCode {
    find_coded(err).map_or(ErrorCode::Internal, |coded| coded.code)
}

/// Cut `text` to at most [`STDERR_DETAIL_LIMIT`] bytes on a char boundary.
pub fn truncate_for_detail(text: &str) -> String {
    if text.len() <= STDERR_DETAIL_LIMIT {
        return text.to_string();
    }
    let mut end = STDERR_DETAIL_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn code_survives_added_context() {
        let result: anyhow::Result<()> =
            Err(CodedError::new(ErrorCode::RepoLocked, "locked").into());
        let err = result.context("acquire lock").expect_err("error");
        assert_eq!(code_of(&err), ErrorCode::RepoLocked);
    }

    #[test]
    fn uncoded_errors_are_internal() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(code_of(&err), ErrorCode::Internal);
    }

    #[test]
    fn tool_failure_keeps_exit_code_and_bounded_stderr() {
        let stderr = "x".repeat(STDERR_DETAIL_LIMIT * 2);
        let err = CodedError::tool_failure(ErrorCode::GhFailed, "gh pr view", Some(4), false, &stderr);
        assert_eq!(err.detail("exit_code"), Some("4"));
        let excerpt = err.detail("stderr").expect("stderr detail");
        assert!(excerpt.len() <= STDERR_DETAIL_LIMIT + '…'.len_utf8());
        assert!(err.message.starts_with("gh pr view failed (exit 4)"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(STDERR_DETAIL_LIMIT);
        let cut = truncate_for_detail(&text);
        assert!(cut.ends_with('…'));
    }
}
