//! `agentrun push`: publish the run branch and open or refresh its PR.

use anyhow::Result;
use serde_json::json;
use tracing::{info, instrument};

use crate::context::RepoContext;
use crate::core::report::{ReportStatus, classify_report};
use crate::error::{CodedError, ErrorCode};
use crate::gates::{
    Gates, read_report, require_commits_ahead, require_origin, require_supported_host,
    require_worktree,
};
use crate::io::gh::Gh;
use crate::io::git::Git;
use crate::io::paths::{REPORT_RELATIVE_PATH, WORKTREE_STATE_DIR, report_path};
use crate::io::run_store::update_run_meta;
use crate::pr::resolve_pr_for_push;
use crate::runtime::Runtime;
use crate::select::select_active_run;

#[derive(Debug, Clone, Copy, Default)]
pub struct PushOptions {
    /// Push without a valid report (a placeholder PR body is used).
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub run_id: String,
    pub pr_number: u64,
    pub pr_url: String,
    pub created: bool,
    pub body_synced: bool,
}

#[instrument(skip_all, fields(run = input))]
pub fn run_push(
    rt: &Runtime<'_>,
    ctx: &RepoContext,
    input: &str,
    opts: PushOptions,
) -> Result<PushOutcome> {
    let meta = select_active_run(ctx, input)?;
    let events = ctx.event_log(&meta.run_id);
    let gates = Gates::new("push", &events, rt);

    gates.check("worktree", || require_worktree(&meta))?;
    let mut lock = gates.check("lock", || ctx.lock("push", rt.now()))?;
    gates.emit("push_started", json!({ "force": opts.force }));

    let git = Git::new(rt, &meta.worktree_path);
    let gh = Gh::new(rt, &meta.worktree_path);

    let origin = gates.check("origin", || require_origin(&git))?;
    gates.check("origin_host", || require_supported_host(&origin))?;

    let report_file = report_path(&meta.worktree_path);
    let report = gates.check("report", || read_report(&report_file))?;
    let status = classify_report(report.as_deref());
    let valid_report = if status.is_valid() {
        report
    } else if opts.force {
        gates.warn(
            "report",
            "push_report_bypassed",
            &format!("{}; using a placeholder PR body (--force)", describe(&status)),
            json!({}),
        );
        None
    } else {
        gates.check("report", || -> Result<()> {
            Err(CodedError::new(ErrorCode::ReportInvalid, describe(&status))
                .with_detail("path", report_file.display())
                .with_hint(format!(
                    "write a summary to {REPORT_RELATIVE_PATH} in the worktree, or pass --force"
                ))
                .into())
        })?;
        None
    };

    let dirty = gates.check("dirty", || git.dirty_entries_except(&[WORKTREE_STATE_DIR]))?;
    if !dirty.is_empty() {
        gates.warn(
            "dirty",
            "push_dirty_allowed",
            &format!(
                "worktree has {} uncommitted change(s); only committed work is pushed",
                dirty.len()
            ),
            json!({ "paths": dirty.iter().map(|e| e.path.as_str()).collect::<Vec<_>>() }),
        );
    }

    gates.check("gh", || gh.ensure_ready())?;
    let ahead = gates.check("commits_ahead", || {
        require_commits_ahead(&git, &meta.parent_branch)
    })?;
    gates.check("push", || git.push_branch(&meta.branch))?;
    let pr = gates.check("pr", || {
        resolve_pr_for_push(rt, &gh, &meta, &report_file, valid_report.as_deref())
    })?;

    let body_synced = pr.body_written;
    let now = rt.now();
    update_run_meta(&ctx.run_paths(&meta.run_id).meta_path, |m| {
        m.pr_number = Some(pr.view.number);
        m.pr_url = Some(pr.view.url.clone());
        m.last_push_at = Some(now);
        m.last_report_hash = pr.body_hash.clone();
    })?;

    gates.emit(
        "push_finished",
        json!({
            "pr_number": pr.view.number,
            "pr_url": pr.view.url,
            "created": pr.created,
            "body_synced": body_synced,
            "commits_ahead": ahead,
        }),
    );
    let _ = lock.release();
    info!(pr = pr.view.number, created = pr.created, "push finished");

    Ok(PushOutcome {
        run_id: meta.run_id,
        pr_number: pr.view.number,
        pr_url: pr.view.url,
        created: pr.created,
        body_synced,
    })
}

fn describe(status: &ReportStatus) -> String {
    match status {
        ReportStatus::Missing => format!("report {REPORT_RELATIVE_PATH} is missing"),
        ReportStatus::TooShort { chars } => {
            format!("report {REPORT_RELATIVE_PATH} is too short ({chars} characters)")
        }
        ReportStatus::Valid => "report is valid".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code_of;
    use crate::test_support::{Fakes, ScriptedProcess, TestRepo, ok, pr_json};

    const RUN: &str = "20260101000000-aaaa";
    const BRANCH: &str = "agentrun/20260101000000-aaaa";

    fn remote_ready(ahead: &str) -> ScriptedProcess {
        remote_with_status(ahead, "")
    }

    fn remote_with_status(ahead: &str, status: &str) -> ScriptedProcess {
        ScriptedProcess::new()
            .on("git remote get-url origin", ok("git@github.com:o/r.git\n"))
            .on("git status", ok(status))
            .on("gh auth status", ok(""))
            .on("git show-ref --verify --quiet refs/remotes/origin/main", ok(""))
            .on("git rev-list --count", ok(ahead))
            .on("git push", ok(""))
            .on("gh pr list", ok("[]"))
            .on("gh pr list", ok(&format!("[{}]", pr_json(12, "OPEN", BRANCH))))
            .on("gh pr create", ok("https://github.com/o/r/pull/12\n"))
    }

    #[test]
    fn first_push_creates_pr_and_records_it() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        repo.write_report(RUN, "# Add retries\n\nRetries flaky calls with backoff.\n");
        let process = remote_ready("2\n");
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);

        let outcome = run_push(&rt, &repo.ctx, RUN, PushOptions::default()).expect("push");
        assert_eq!(outcome.pr_number, 12);
        assert!(outcome.created);

        let meta = repo.load(RUN);
        assert_eq!(meta.pr_number, Some(12));
        assert!(meta.last_push_at.is_some());
        assert!(meta.last_report_hash.is_some());
        assert_eq!(repo.event_names(RUN), vec!["push_started", "push_finished"]);
        assert!(
            process
                .call_lines()
                .iter()
                .any(|line| line.starts_with("gh pr create") && line.contains("--title Add retries"))
        );
    }

    /// Nineteen trimmed characters fail; twenty pass.
    #[test]
    fn report_threshold_is_twenty_trimmed_chars() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        repo.write_report(RUN, "   0123456789abcdefghi   \n");
        let process = remote_ready("1\n");
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = run_push(&rt, &repo.ctx, RUN, PushOptions::default()).expect_err("short");
        assert_eq!(code_of(&err), ErrorCode::ReportInvalid);
        assert!(!process.call_lines().iter().any(|l| l.starts_with("git push")));

        repo.write_report(RUN, "   0123456789abcdefghij   \n");
        run_push(&rt, &repo.ctx, RUN, PushOptions::default()).expect("valid report");
    }

    #[test]
    fn force_bypasses_report_with_placeholder_body() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        let process = remote_ready("1\n");
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let outcome = run_push(&rt, &repo.ctx, RUN, PushOptions { force: true }).expect("forced");
        assert!(outcome.created);
        assert!(outcome.body_synced);
        assert!(
            process
                .call_lines()
                .iter()
                .any(|line| line.starts_with("gh pr create") && line.contains("--body"))
        );
        assert_eq!(
            repo.event_names(RUN),
            vec!["push_started", "push_report_bypassed", "push_finished"]
        );
        assert!(repo.load(RUN).last_report_hash.is_none());
    }

    /// `--force` never waives the commits-ahead gate.
    #[test]
    fn force_does_not_waive_zero_commits() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        let process = remote_ready("0\n");
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = run_push(&rt, &repo.ctx, RUN, PushOptions { force: true }).expect_err("empty");
        assert_eq!(code_of(&err), ErrorCode::EmptyDiff);
        let events = repo.events(RUN);
        let failed = events.last().expect("event");
        assert_eq!(failed.event, "push_failed");
        assert_eq!(failed.data["step"], "commits_ahead");
    }

    #[test]
    fn dirty_worktree_only_warns() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        repo.write_report(RUN, "A report that is long enough.\n");
        let process = remote_with_status("1\n", "?? scratch.txt\n M .agentrun/report.md\n");
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        run_push(&rt, &repo.ctx, RUN, PushOptions::default()).expect("push");
        let events = repo.events(RUN);
        let dirty = events
            .iter()
            .find(|e| e.event == "push_dirty_allowed")
            .expect("dirty warning");
        assert_eq!(dirty.data["paths"], json!(["scratch.txt"]));
    }

    /// An unchanged report does not rewrite the PR body.
    #[test]
    fn unchanged_report_skips_body_sync() {
        let repo = TestRepo::new();
        let mut meta = repo.seed_run(RUN, None);
        let report = "A report that is long enough.\n";
        repo.write_report(RUN, report);
        meta.pr_number = Some(12);
        meta.last_report_hash = Some(crate::core::report::report_hash(report));
        repo.save(&meta);
        let process = remote_ready("1\n").on("gh pr view 12", ok(&pr_json(12, "OPEN", BRANCH)));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let outcome = run_push(&rt, &repo.ctx, RUN, PushOptions::default()).expect("push");
        assert!(!outcome.created);
        assert!(!outcome.body_synced);
        assert!(!process.call_lines().iter().any(|l| l.starts_with("gh pr edit")));
    }

    #[test]
    fn changed_report_rewrites_body() {
        let repo = TestRepo::new();
        let mut meta = repo.seed_run(RUN, None);
        repo.write_report(RUN, "A report that is long enough, second draft.\n");
        meta.pr_number = Some(12);
        meta.last_report_hash = Some(crate::core::report::report_hash("older report text here\n"));
        repo.save(&meta);
        let process = remote_ready("1\n")
            .on("gh pr view 12", ok(&pr_json(12, "OPEN", BRANCH)))
            .on("gh pr edit 12", ok(""));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let outcome = run_push(&rt, &repo.ctx, RUN, PushOptions::default()).expect("push");
        assert!(!outcome.created);
        assert!(outcome.body_synced);
        assert!(process.call_lines().iter().any(|l| l.starts_with("gh pr edit 12")));
    }

    #[test]
    fn merged_pr_rejects_push() {
        let repo = TestRepo::new();
        let mut meta = repo.seed_run(RUN, None);
        repo.write_report(RUN, "A report that is long enough.\n");
        meta.pr_number = Some(12);
        repo.save(&meta);
        let process = remote_ready("1\n").on("gh pr view 12", ok(&pr_json(12, "MERGED", BRANCH)));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = run_push(&rt, &repo.ctx, RUN, PushOptions::default()).expect_err("merged");
        assert_eq!(code_of(&err), ErrorCode::PrMerged);
    }

    #[test]
    fn held_lock_blocks_push() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        let _held = repo.ctx.lock("merge", chrono::Utc::now()).expect("lock");
        let process = remote_ready("1\n");
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = run_push(&rt, &repo.ctx, RUN, PushOptions::default()).expect_err("locked");
        assert_eq!(code_of(&err), ErrorCode::RepoLocked);
        assert!(process.calls().is_empty());
    }
}
