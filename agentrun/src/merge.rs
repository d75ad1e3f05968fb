//! `agentrun merge`: land the run's PR, then archive the run.
//!
//! Once `gh pr merge` has been confirmed, `merged_at` is persisted before the
//! archive starts. A later `merge` of the same run therefore only retries the
//! archive, and an archived, merged run is a no-op. Every path that archives
//! asks for the typed confirmation first.

use anyhow::Result;
use serde_json::json;
use tracing::{info, instrument};

use crate::archive::{ArchiveResult, archive_run, delete_local_branch};
use crate::context::RepoContext;
use crate::core::types::{MergeStrategy, PrState};
use crate::error::{CodedError, ErrorCode};
use crate::gates::{Gates, require_origin, require_supported_host, require_worktree};
use crate::io::events::EventLog;
use crate::io::gh::Gh;
use crate::io::git::Git;
use crate::io::interact::confirm_typed;
use crate::io::lock::RepoLockGuard;
use crate::io::run_store::{RunMeta, update_run_meta};
use crate::pr::{PrPurpose, confirm_merged, lookup_pr, poll_mergeability, validate_pr};
use crate::runtime::Runtime;
use crate::select::{archived_error, select_run};
use crate::verify::verify_locked;

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    /// Overrides `[merge] strategy` from the repo config.
    pub strategy: Option<MergeStrategy>,
    pub skip_verify: bool,
    pub yes: bool,
    pub delete_branch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub run_id: String,
    pub pr_number: Option<u64>,
    /// The PR was merged before this invocation.
    pub already_merged: bool,
    pub archive: ArchiveResult,
    pub branch_deleted: bool,
}

#[instrument(skip_all, fields(run = input))]
pub fn run_merge(
    rt: &Runtime<'_>,
    ctx: &RepoContext,
    input: &str,
    opts: MergeOptions,
) -> Result<MergeOutcome> {
    let meta = select_run(ctx, input)?;
    if meta.is_archived() {
        if meta.merged_at.is_some() {
            info!("run already merged and archived");
            return Ok(MergeOutcome {
                run_id: meta.run_id,
                pr_number: meta.pr_number,
                already_merged: true,
                archive: ArchiveResult::AlreadyArchived,
                branch_deleted: false,
            });
        }
        return Err(archived_error(&meta).into());
    }

    let events = ctx.event_log(&meta.run_id);
    let gates = Gates::new("merge", &events, rt);

    if meta.merged_at.is_some() {
        let lock = gates.check("lock", || ctx.lock("merge", rt.now()))?;
        gates.emit("merge_started", json!({ "archive_only": true }));
        gates.check("confirm", || {
            confirm_typed(rt.prompter, "merge", &archive_action(&meta, meta.pr_number), opts.yes)
        })?;
        return finish(rt, ctx, &events, &meta, meta.pr_number, true, opts, lock);
    }

    gates.check("worktree", || require_worktree(&meta))?;
    let lock = gates.check("lock", || ctx.lock("merge", rt.now()))?;
    gates.emit("merge_started", json!({}));

    let git = Git::new(rt, &meta.worktree_path);
    let gh = Gh::new(rt, &meta.worktree_path);

    let origin = gates.check("origin", || require_origin(&git))?;
    gates.check("origin_host", || require_supported_host(&origin))?;
    gates.check("gh", || gh.ensure_ready())?;
    let view = gates.check("pr", || {
        lookup_pr(rt, &gh, &meta)?.ok_or_else(|| {
            CodedError::new(
                ErrorCode::NoPr,
                format!("run {} has no pull request", meta.label()),
            )
            .with_hint(format!("agentrun push {}", meta.run_id))
            .into()
        })
    })?;
    gates.check("state", || validate_pr(&view, &meta.branch, PrPurpose::Merge))?;
    let number = view.number;

    let mut already_merged = view.state == PrState::Merged;
    let strategy = opts.strategy.unwrap_or(ctx.repo_config.merge.strategy);
    if !already_merged {
        if ctx.repo_config.scripts.verify.is_some() && !opts.skip_verify {
            gates.check("verify", || verify_locked(rt, ctx, &meta, &events))?;
        }
        let polled = gates.check("mergeability", || poll_mergeability(rt, &gh, number))?;
        already_merged = polled.state == PrState::Merged;
    }
    if !already_merged {
        gates.check("remote_head", || {
            git.fetch_branch(&meta.branch)?;
            check_remote_head(&git, &meta.branch)
        })?;
    }
    // An already merged PR still needs confirmation before the archive.
    let action = if already_merged {
        archive_action(&meta, Some(number))
    } else {
        format!(
            "merge PR #{number} into {} ({})",
            meta.parent_branch,
            strategy.as_flag().trim_start_matches('-')
        )
    };
    gates.check("confirm", || confirm_typed(rt.prompter, "merge", &action, opts.yes))?;
    if !already_merged {
        gates.check("merge", || gh.merge(number, strategy))?;
    }
    let merged = gates.check("confirm_merged", || confirm_merged(rt, &gh, number))?;

    let now = rt.now();
    update_run_meta(&ctx.run_paths(&meta.run_id).meta_path, |m| {
        m.merged_at = Some(now);
        m.pr_number = Some(merged.number);
        m.pr_url = Some(merged.url.clone());
    })?;
    gates.emit(
        "merge_finished",
        json!({
            "pr_number": number,
            "already_merged": already_merged,
            "strategy": strategy,
        }),
    );
    info!(pr = number, already_merged, "merge confirmed");
    finish(rt, ctx, &events, &meta, Some(number), already_merged, opts, lock)
}

fn archive_action(meta: &RunMeta, pr_number: Option<u64>) -> String {
    let pr = pr_number.map_or_else(|| "the PR".to_string(), |n| format!("PR #{n}"));
    format!(
        "{pr} is already merged; archive run {} (kills its session, removes its worktree)",
        meta.label()
    )
}

/// Archive after a confirmed merge. An incomplete archive is an error even
/// though the merge itself succeeded.
#[allow(clippy::too_many_arguments)]
fn finish(
    rt: &Runtime<'_>,
    ctx: &RepoContext,
    events: &EventLog,
    meta: &RunMeta,
    pr_number: Option<u64>,
    already_merged: bool,
    opts: MergeOptions,
    mut lock: RepoLockGuard,
) -> Result<MergeOutcome> {
    let archive = archive_run(rt, ctx, &meta.run_id, events)?;
    if let ArchiveResult::Completed(outcome) = &archive
        && let Some(err) = outcome.to_error(
            ErrorCode::ArchiveIncomplete,
            &format!("merge of {} succeeded but archive is incomplete", meta.label()),
        )
    {
        let _ = lock.release();
        return Err(err
            .with_hint(format!("rerun: agentrun merge {}", meta.run_id))
            .into());
    }
    let branch_deleted = opts.delete_branch && delete_local_branch(rt, ctx, meta, events);
    let _ = lock.release();
    Ok(MergeOutcome {
        run_id: meta.run_id.clone(),
        pr_number,
        already_merged,
        archive,
        branch_deleted,
    })
}

/// Local `HEAD` must equal the freshly fetched `origin/<branch>`.
pub fn check_remote_head(git: &Git<'_>, branch: &str) -> Result<()> {
    let local = git.head_sha()?;
    let Some(remote) = git.remote_ref_sha(branch)? else {
        return Err(CodedError::new(
            ErrorCode::RemoteOutOfDate,
            format!("remote branch origin/{branch} is missing"),
        )
        .with_hint("push the run first")
        .into());
    };
    if remote != local {
        return Err(CodedError::new(
            ErrorCode::RemoteOutOfDate,
            format!("local HEAD {} differs from origin/{branch} {}", short(&local), short(&remote)),
        )
        .with_detail("local", &local)
        .with_detail("remote", &remote)
        .with_hint("push the run, then merge again")
        .into());
    }
    Ok(())
}

fn short(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code_of;
    use crate::test_support::{
        Fakes, ScriptedPrompter, ScriptedProcess, TestRepo, fail, ok, pr_json, pr_json_with,
    };

    const RUN: &str = "20260101000000-aaaa";
    const BRANCH: &str = "agentrun/20260101000000-aaaa";
    const SHA: &str = "1111111111111111111111111111111111111111";

    fn yes() -> MergeOptions {
        MergeOptions {
            yes: true,
            ..MergeOptions::default()
        }
    }

    /// Gates up to and including the PR lookup for PR #7.
    fn open_pr(mergeable: &str) -> ScriptedProcess {
        ScriptedProcess::new()
            .on("git remote get-url origin", ok("https://github.com/o/r.git\n"))
            .on("gh auth status", ok(""))
            .on("gh pr list", ok(&format!("[{}]", pr_json_with(7, "OPEN", BRANCH, false, mergeable))))
            .on("gh pr view 7", ok(&pr_json_with(7, "OPEN", BRANCH, false, mergeable)))
            .on("gh pr view 7", ok(&pr_json(7, "MERGED", BRANCH)))
            .on("git fetch origin", ok(""))
            .on("git rev-parse HEAD", ok(&format!("{SHA}\n")))
            .on("git rev-parse --verify --quiet refs/remotes/origin/", ok(&format!("{SHA}\n")))
            .on("gh pr merge 7", ok(""))
            .on("tmux has-session", fail(1, "can't find session"))
            .on("git worktree remove", ok(""))
    }

    #[test]
    fn merges_confirms_and_archives() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        let process = open_pr("MERGEABLE");
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);

        let outcome = run_merge(&rt, &repo.ctx, RUN, yes()).expect("merge");
        assert!(!outcome.already_merged);
        assert!(outcome.archive.fully_succeeded());
        let meta = repo.load(RUN);
        assert!(meta.merged_at.is_some());
        assert!(meta.is_archived());
        assert!(process.call_lines().contains(&"gh pr merge 7 --squash".to_string()));
        assert_eq!(
            repo.event_names(RUN),
            vec!["merge_started", "merge_finished", "archive_started", "archive_finished"]
        );
    }

    fn merged_pr() -> ScriptedProcess {
        ScriptedProcess::new()
            .on("git remote get-url origin", ok("https://github.com/o/r.git\n"))
            .on("gh auth status", ok(""))
            .on("gh pr list", ok(&format!("[{}]", pr_json(7, "MERGED", BRANCH))))
            .on("gh pr view 7", ok(&pr_json(7, "MERGED", BRANCH)))
            .on("tmux has-session", fail(1, ""))
            .on("git worktree remove", ok(""))
    }

    /// A PR that is already merged skips the merge call but still asks
    /// before archiving.
    #[test]
    fn already_merged_pr_confirms_then_archives() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        let process = merged_pr();
        let fakes = Fakes {
            prompter: ScriptedPrompter::answering(["merge"]),
            ..Fakes::default()
        };
        let rt = fakes.runtime(&process);

        let outcome = run_merge(&rt, &repo.ctx, RUN, MergeOptions::default()).expect("merge");
        assert!(outcome.already_merged);
        assert!(repo.load(RUN).is_archived());
        let prompts = fakes.prompter.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("PR #7 is already merged"), "prompt: {}", prompts[0]);
        assert!(!process.call_lines().iter().any(|l| l.starts_with("gh pr merge")));
    }

    #[test]
    fn already_merged_pr_without_terminal_is_not_archived() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        let process = merged_pr();
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);

        let err = run_merge(&rt, &repo.ctx, RUN, MergeOptions::default()).expect_err("tty");
        assert_eq!(code_of(&err), ErrorCode::NotInteractive);
        let meta = repo.load(RUN);
        assert!(!meta.is_archived());
        assert!(meta.merged_at.is_none());
        assert!(!process.call_lines().iter().any(|l| l.starts_with("git worktree remove")));
        assert_eq!(repo.events(RUN).last().expect("event").data["step"], "confirm");
    }

    #[test]
    fn archived_and_merged_is_a_no_op() {
        let repo = TestRepo::new();
        let mut meta = repo.seed_run(RUN, None);
        meta.merged_at = Some(meta.created_at);
        meta.archive.archived_at = Some(meta.created_at);
        repo.save(&meta);
        let process = ScriptedProcess::new();
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let outcome = run_merge(&rt, &repo.ctx, RUN, yes()).expect("no-op");
        assert_eq!(outcome.archive, ArchiveResult::AlreadyArchived);
        assert!(process.calls().is_empty());
        assert!(repo.event_names(RUN).is_empty());
    }

    #[test]
    fn archived_without_merge_is_rejected() {
        let repo = TestRepo::new();
        let mut meta = repo.seed_run(RUN, None);
        meta.archive.archived_at = Some(meta.created_at);
        repo.save(&meta);
        let process = ScriptedProcess::new();
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = run_merge(&rt, &repo.ctx, RUN, yes()).expect_err("archived");
        assert_eq!(code_of(&err), ErrorCode::RunArchived);
    }

    #[test]
    fn missing_pr_is_reported() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        let process = ScriptedProcess::new()
            .on("git remote get-url origin", ok("https://github.com/o/r.git\n"))
            .on("gh auth status", ok(""))
            .on("gh pr list", ok("[]"));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = run_merge(&rt, &repo.ctx, RUN, yes()).expect_err("no pr");
        assert_eq!(code_of(&err), ErrorCode::NoPr);
    }

    #[test]
    fn unknown_mergeability_stops_before_merge() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        let process = ScriptedProcess::new()
            .on("git remote get-url origin", ok("https://github.com/o/r.git\n"))
            .on("gh auth status", ok(""))
            .on("gh pr list", ok(&format!("[{}]", pr_json(7, "OPEN", BRANCH))))
            .on("gh pr view 7", ok(&pr_json_with(7, "OPEN", BRANCH, false, "UNKNOWN")));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = run_merge(&rt, &repo.ctx, RUN, yes()).expect_err("unknown");
        assert_eq!(code_of(&err), ErrorCode::PrMergeabilityUnknown);
        assert_eq!(fakes.sleeper.slept().len(), 3);
        let events = repo.events(RUN);
        assert_eq!(events.last().expect("event").data["step"], "mergeability");
    }

    #[test]
    fn remote_head_cases() {
        let fakes = Fakes::default();

        let matching = ScriptedProcess::new()
            .on("git rev-parse HEAD", ok(&format!("{SHA}\n")))
            .on("git rev-parse --verify", ok(&format!("{SHA}\n")));
        let rt = fakes.runtime(&matching);
        check_remote_head(&Git::new(&rt, "/wt"), BRANCH).expect("up to date");

        let behind = ScriptedProcess::new()
            .on("git rev-parse HEAD", ok(&format!("{SHA}\n")))
            .on("git rev-parse --verify", ok("2222222222222222222222222222222222222222\n"));
        let rt = fakes.runtime(&behind);
        let err = check_remote_head(&Git::new(&rt, "/wt"), BRANCH).expect_err("mismatch");
        assert_eq!(code_of(&err), ErrorCode::RemoteOutOfDate);
        assert!(err.to_string().contains("differs"));

        let missing = ScriptedProcess::new()
            .on("git rev-parse HEAD", ok(&format!("{SHA}\n")))
            .on("git rev-parse --verify", fail(1, ""));
        let rt = fakes.runtime(&missing);
        let err = check_remote_head(&Git::new(&rt, "/wt"), BRANCH).expect_err("missing");
        assert_eq!(code_of(&err), ErrorCode::RemoteOutOfDate);
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn non_interactive_without_yes_is_refused() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        let process = open_pr("MERGEABLE");
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = run_merge(&rt, &repo.ctx, RUN, MergeOptions::default()).expect_err("tty");
        assert_eq!(code_of(&err), ErrorCode::NotInteractive);
        assert!(!process.call_lines().iter().any(|l| l.starts_with("gh pr merge")));
    }

    /// The merge sticks even when the archive does not; a rerun only archives.
    #[test]
    fn incomplete_archive_then_archive_only_retry() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        let process = ScriptedProcess::new()
            .on("git remote get-url origin", ok("https://github.com/o/r.git\n"))
            .on("gh auth status", ok(""))
            .on("gh pr list", ok(&format!("[{}]", pr_json(7, "MERGED", BRANCH))))
            .on("gh pr view 7", ok(&pr_json(7, "MERGED", BRANCH)))
            .on("tmux has-session", ok(""))
            .on("tmux kill-session", fail(1, "lost server"))
            .on("git worktree remove", ok(""));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = run_merge(&rt, &repo.ctx, RUN, yes()).expect_err("partial");
        assert_eq!(code_of(&err), ErrorCode::ArchiveIncomplete);
        assert_eq!(crate::exit_codes::for_error(&err), crate::exit_codes::PARTIAL);
        assert!(repo.load(RUN).merged_at.is_some());

        let retry = ScriptedProcess::new()
            .on("tmux has-session", fail(1, ""));
        let rt = fakes.runtime(&retry);
        let err = run_merge(&rt, &repo.ctx, RUN, MergeOptions::default())
            .expect_err("archive-only retry still confirms");
        assert_eq!(code_of(&err), ErrorCode::NotInteractive);
        assert!(retry.calls().is_empty());

        let outcome = run_merge(&rt, &repo.ctx, RUN, yes()).expect("archive retry");
        assert!(outcome.archive.fully_succeeded());
        assert!(!retry.call_lines().iter().any(|l| l.starts_with("gh ")));
        assert!(repo.load(RUN).is_archived());
    }
}
