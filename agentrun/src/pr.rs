//! Pull request resolution protocol.
//!
//! Lookup prefers the PR number stored on the run and falls back to a search
//! by head branch. Creation only happens when nothing is found, and the new
//! PR is re-queried by branch until the host reports it. Every remote call is
//! retried on transient `gh` failures.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, info};

use crate::core::report::{PLACEHOLDER_BODY, report_hash};
use crate::core::retry::{
    Attempt, MERGE_CONFIRM_SCHEDULE, MERGEABILITY_SCHEDULE, PR_VIEW_SCHEDULE, retry_with_schedule,
};
use crate::core::types::{Mergeable, PrState, PrView};
use crate::error::{CodedError, ErrorCode, code_of};
use crate::io::gh::{Gh, PrBody, PrLookup};
use crate::io::run_store::RunMeta;
use crate::runtime::Runtime;

/// Which pipeline is validating the PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrPurpose {
    Push,
    Merge,
}

/// Retry transient `gh` failures; anything else is final.
fn classify(err: anyhow::Error) -> Attempt {
    match code_of(&err) {
        ErrorCode::GhFailed => Attempt::Retry(err),
        _ => Attempt::Fatal(err),
    }
}

/// Find the run's PR: stored number first, then by head branch.
pub fn lookup_pr(rt: &Runtime<'_>, gh: &Gh<'_>, meta: &RunMeta) -> Result<Option<PrView>> {
    let backoff = rt.backoff();
    if let Some(number) = meta.pr_number {
        let by_number = retry_with_schedule(PR_VIEW_SCHEDULE, &backoff, |_| {
            gh.view_by_number(number).map_err(classify)
        })?;
        match by_number {
            PrLookup::Found(view) => return Ok(Some(view)),
            PrLookup::NotFound => debug!(number, "stored PR number not found, searching by branch"),
            PrLookup::Malformed(reason) => {
                debug!(number, reason, "unexpected PR JSON, searching by branch");
            }
        }
    }

    let by_branch = retry_with_schedule(PR_VIEW_SCHEDULE, &backoff, |_| {
        gh.find_by_branch(&meta.branch).map_err(classify)
    })?;
    match by_branch {
        PrLookup::Found(view) => Ok(Some(view)),
        PrLookup::NotFound => Ok(None),
        PrLookup::Malformed(reason) => Err(CodedError::new(
            ErrorCode::GhFailed,
            format!("unexpected output from gh pr list: {reason}"),
        )
        .into()),
    }
}

/// Create the PR and wait until the host reports it for the run's branch.
pub fn create_pr(
    rt: &Runtime<'_>,
    gh: &Gh<'_>,
    meta: &RunMeta,
    title: &str,
    body: &PrBody,
) -> Result<PrView> {
    let backoff = rt.backoff();
    retry_with_schedule(PR_VIEW_SCHEDULE, &backoff, |_| {
        gh.create(&meta.branch, &meta.parent_branch, title, body)
            .map_err(classify)
    })?;
    info!(branch = %meta.branch, "pull request created");

    retry_with_schedule(PR_VIEW_SCHEDULE, &backoff, |_| {
        match gh.find_by_branch(&meta.branch).map_err(classify)? {
            PrLookup::Found(view) => Ok(view),
            PrLookup::NotFound => Err(Attempt::retry(CodedError::new(
                ErrorCode::PrCreateFailed,
                format!("created PR for {} is not visible yet", meta.branch),
            ))),
            PrLookup::Malformed(reason) => Err(Attempt::retry(CodedError::new(
                ErrorCode::GhFailed,
                format!("unexpected output from gh pr list: {reason}"),
            ))),
        }
    })
}

/// Reject PR states the pipeline cannot proceed from.
///
/// `MERGED` is fatal for push; merge handles it as already done.
pub fn validate_pr(view: &PrView, branch: &str, purpose: PrPurpose) -> Result<()> {
    let number = view.number;
    if view.head_ref != branch {
        return Err(CodedError::new(
            ErrorCode::PrMismatch,
            format!(
                "PR #{number} is for branch '{}', expected '{branch}'",
                view.head_ref
            ),
        )
        .with_detail("pr_number", number)
        .into());
    }
    match view.state {
        PrState::Closed => Err(CodedError::new(
            ErrorCode::PrClosed,
            format!("PR #{number} is closed"),
        )
        .with_detail("pr_url", &view.url)
        .with_hint("reopen the PR on GitHub, or clean the run")
        .into()),
        PrState::Merged if purpose == PrPurpose::Push => Err(CodedError::new(
            ErrorCode::PrMerged,
            format!("PR #{number} is already merged"),
        )
        .with_detail("pr_url", &view.url)
        .into()),
        PrState::Merged => Ok(()),
        PrState::Open if view.is_draft => Err(CodedError::new(
            ErrorCode::PrDraft,
            format!("PR #{number} is a draft"),
        )
        .with_detail("pr_url", &view.url)
        .with_hint(format!("gh pr ready {number}"))
        .into()),
        PrState::Open => Ok(()),
    }
}

/// Title for a new PR: the report's first line, else the run label.
pub fn pr_title(meta: &RunMeta, report: Option<&str>) -> String {
    report
        .and_then(|text| text.lines().map(str::trim).find(|line| !line.is_empty()))
        .map(|line| line.trim_start_matches('#').trim().to_string())
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| format!("agentrun: {}", meta.label()))
}

/// PR identity plus what push did to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPr {
    pub view: PrView,
    pub created: bool,
    /// A body was written by this push (on create, or by `gh pr edit`).
    pub body_written: bool,
    /// Report hash now reflected in the PR body, if any.
    pub body_hash: Option<String>,
}

/// Find-or-create for push, then keep the PR body in sync with the report.
///
/// `report` is `Some` only when the report is valid.
pub fn resolve_pr_for_push(
    rt: &Runtime<'_>,
    gh: &Gh<'_>,
    meta: &RunMeta,
    report_file: &Path,
    report: Option<&str>,
) -> Result<PushPr> {
    match lookup_pr(rt, gh, meta)? {
        Some(view) => {
            validate_pr(&view, &meta.branch, PrPurpose::Push)?;
            let mut body_hash = meta.last_report_hash.clone();
            let mut body_written = false;
            if let Some(contents) = report {
                let hash = report_hash(contents);
                if meta.last_report_hash.as_deref() == Some(hash.as_str()) {
                    debug!(number = view.number, "report unchanged, skipping body sync");
                } else {
                    let backoff = rt.backoff();
                    retry_with_schedule(PR_VIEW_SCHEDULE, &backoff, |_| {
                        gh.edit_body(view.number, report_file).map_err(classify)
                    })?;
                    body_hash = Some(hash);
                    body_written = true;
                }
            }
            Ok(PushPr {
                view,
                created: false,
                body_written,
                body_hash,
            })
        }
        None => {
            let body = match report {
                Some(_) => PrBody::File(report_file.to_path_buf()),
                None => PrBody::Text(PLACEHOLDER_BODY.to_string()),
            };
            let view = create_pr(rt, gh, meta, &pr_title(meta, report), &body)?;
            validate_pr(&view, &meta.branch, PrPurpose::Push)?;
            Ok(PushPr {
                view,
                created: true,
                body_written: true,
                body_hash: report.map(report_hash),
            })
        }
    }
}

/// Poll until the host has computed mergeability.
///
/// `CONFLICTING` stops immediately; `UNKNOWN` is retried per
/// [`MERGEABILITY_SCHEDULE`]. A PR that got merged meanwhile is returned as is.
pub fn poll_mergeability(rt: &Runtime<'_>, gh: &Gh<'_>, number: u64) -> Result<PrView> {
    retry_with_schedule(MERGEABILITY_SCHEDULE, &rt.backoff(), |_| {
        let view = match gh.view_by_number(number).map_err(classify)? {
            PrLookup::Found(view) => view,
            PrLookup::NotFound | PrLookup::Malformed(_) => {
                return Err(Attempt::fatal(CodedError::new(
                    ErrorCode::GhFailed,
                    format!("PR #{number} disappeared while checking mergeability"),
                )));
            }
        };
        if view.state == PrState::Merged {
            return Ok(view);
        }
        match view.mergeable {
            Mergeable::Mergeable => Ok(view),
            Mergeable::Conflicting => Err(Attempt::fatal(
                CodedError::new(
                    ErrorCode::PrNotMergeable,
                    format!("PR #{number} has conflicts with its base branch"),
                )
                .with_hint("rebase the run branch onto its parent and push again"),
            )),
            Mergeable::Unknown => Err(Attempt::retry(
                CodedError::new(
                    ErrorCode::PrMergeabilityUnknown,
                    format!("GitHub has not computed mergeability for PR #{number} yet"),
                )
                .with_hint("retry the merge in a few seconds"),
            )),
        }
    })
}

/// Poll until the PR reports `MERGED`.
pub fn confirm_merged(rt: &Runtime<'_>, gh: &Gh<'_>, number: u64) -> Result<PrView> {
    retry_with_schedule(MERGE_CONFIRM_SCHEDULE, &rt.backoff(), |_| {
        let unconfirmed = |detail: String| {
            Attempt::retry(
                CodedError::new(
                    ErrorCode::MergeUnconfirmed,
                    format!("PR #{number} is not reported as merged"),
                )
                .with_detail("last_seen", detail)
                .with_hint(format!("gh pr view {number}")),
            )
        };
        match gh.view_by_number(number) {
            Ok(PrLookup::Found(view)) if view.state == PrState::Merged => Ok(view),
            Ok(PrLookup::Found(view)) => Err(unconfirmed(view.state.as_str().to_string())),
            Ok(other) => Err(unconfirmed(format!("{other:?}"))),
            Err(err) if code_of(&err) == ErrorCode::DeadlineExceeded => Err(Attempt::Fatal(err)),
            Err(err) => Err(unconfirmed(format!("{err:#}"))),
        }
    })
}
