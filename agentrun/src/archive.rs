//! Three-stage archive pipeline shared by `merge` and `clean`.
//!
//! Stages run in a fixed order (script, session, worktree) and each one is
//! attempted even when an earlier one failed. A stage that succeeds is stamped
//! in `meta.archive` right away, so a retried archive skips it. The run counts
//! as archived only once every stage has a stamp.
//!
//! Callers hold the repository lock.

use std::fs;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::context::RepoContext;
use crate::core::archive_outcome::{ArchiveOutcome, ArchiveStage, StageOutcome};
use crate::io::events::EventLog;
use crate::io::git::Git;
use crate::io::run_store::{RunMeta, load_run_meta, update_run_meta};
use crate::io::scripts::{ScriptRequest, run_script, script_env};
use crate::io::tmux::Tmux;
use crate::runtime::Runtime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveResult {
    /// `archived_at` was already set; nothing ran.
    AlreadyArchived,
    Completed(ArchiveOutcome),
}

impl ArchiveResult {
    pub fn fully_succeeded(&self) -> bool {
        match self {
            ArchiveResult::AlreadyArchived => true,
            ArchiveResult::Completed(outcome) => outcome.fully_succeeded(),
        }
    }
}

/// Archive the run whose metadata lives under `ctx` for `run_id`.
#[instrument(skip_all, fields(run_id))]
pub fn archive_run(
    rt: &Runtime<'_>,
    ctx: &RepoContext,
    run_id: &str,
    events: &EventLog,
) -> Result<ArchiveResult> {
    let meta_path = ctx.run_paths(run_id).meta_path;
    let meta = load_run_meta(&meta_path)?;
    if meta.is_archived() {
        debug!("run already archived");
        return Ok(ArchiveResult::AlreadyArchived);
    }

    let _ = events.emit(rt.now(), "archive_started", json!({}));

    let mut outcomes = Vec::with_capacity(ArchiveStage::ALL.len());
    for stage in ArchiveStage::ALL {
        let outcome = if meta.archive.stage_done(stage) {
            debug!(stage = stage.as_str(), "stage already done");
            StageOutcome::previously_done()
        } else {
            let outcome = run_stage(rt, ctx, &meta, stage);
            if outcome.ok {
                update_run_meta(&meta_path, |m| m.archive.mark(stage, rt.now()))?;
            } else {
                warn!(
                    stage = stage.as_str(),
                    reason = outcome.reason.as_deref().unwrap_or_default(),
                    "archive stage failed"
                );
            }
            outcome
        };
        outcomes.push(outcome);
    }
    let mut stages = outcomes.into_iter();
    let outcome = ArchiveOutcome {
        script: stages.next().unwrap_or_else(StageOutcome::ok),
        session: stages.next().unwrap_or_else(StageOutcome::ok),
        worktree: stages.next().unwrap_or_else(StageOutcome::ok),
    };

    if outcome.fully_succeeded() {
        update_run_meta(&meta_path, |m| m.archive.archived_at = Some(rt.now()))?;
        info!("run archived");
    }

    let _ = events.emit(
        rt.now(),
        "archive_finished",
        json!({
            "ok": outcome.fully_succeeded(),
            "script": outcome.script,
            "session": outcome.session,
            "worktree": outcome.worktree,
        }),
    );
    Ok(ArchiveResult::Completed(outcome))
}

fn run_stage(
    rt: &Runtime<'_>,
    ctx: &RepoContext,
    meta: &RunMeta,
    stage: ArchiveStage,
) -> StageOutcome {
    let result = match stage {
        ArchiveStage::Script => archive_script(rt, ctx, meta),
        ArchiveStage::Session => kill_session(rt, meta),
        ArchiveStage::Worktree => remove_worktree(rt, ctx, meta),
    };
    result.unwrap_or_else(|err| StageOutcome::failed(format!("{err:#}")))
}

fn archive_script(rt: &Runtime<'_>, ctx: &RepoContext, meta: &RunMeta) -> Result<StageOutcome> {
    let Some(script) = ctx.repo_config.scripts.archive.clone() else {
        return Ok(StageOutcome::ok());
    };
    // Reached only while the stage is unstamped: the script has never
    // succeeded, and without a worktree it cannot run again.
    if !meta.worktree_path.is_dir() {
        return Ok(StageOutcome::failed(format!(
            "archive script never succeeded and worktree {} is already removed; \
             run the script by hand, then unset [scripts] archive to finish",
            meta.worktree_path.display()
        )));
    }
    let request = ScriptRequest {
        hook: "archive",
        script,
        workdir: meta.worktree_path.clone(),
        log_path: ctx.run_paths(&meta.run_id).archive_log,
        timeout: Duration::from_secs(ctx.repo_config.timeouts.archive_secs),
        output_limit_bytes: ctx.repo_config.output_limit_bytes,
        env: script_env(meta, &ctx.repo.root),
    };
    let outcome = run_script(rt, &request)?;
    Ok(match outcome.to_error() {
        None => StageOutcome::ok(),
        Some(err) => StageOutcome::failed(err.to_string()),
    })
}

fn kill_session(rt: &Runtime<'_>, meta: &RunMeta) -> Result<StageOutcome> {
    let tmux = Tmux::new(rt);
    if tmux.ensure_installed().is_err() {
        return Ok(StageOutcome {
            ok: true,
            reason: Some("tmux not installed".to_string()),
        });
    }
    if tmux.has_session(&meta.tmux_session)? {
        tmux.kill_session(&meta.tmux_session)?;
    }
    Ok(StageOutcome::ok())
}

fn remove_worktree(rt: &Runtime<'_>, ctx: &RepoContext, meta: &RunMeta) -> Result<StageOutcome> {
    let git = Git::new(rt, &ctx.repo.root);
    let path = &meta.worktree_path;
    if !path.exists() {
        if let Err(err) = git.worktree_prune() {
            debug!(err = %format!("{err:#}"), "worktree prune failed");
        }
        return Ok(StageOutcome::ok());
    }
    match git.worktree_remove(path) {
        Ok(()) => Ok(StageOutcome::ok()),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "git worktree remove failed, removing directory");
            fs::remove_dir_all(path).map_err(|io_err| {
                anyhow::anyhow!("{err:#}; remove {}: {io_err}", path.display())
            })?;
            git.worktree_prune()?;
            Ok(StageOutcome::ok())
        }
    }
}

/// `git branch -D <branch>` from the main checkout. Failure is a warning.
pub fn delete_local_branch(rt: &Runtime<'_>, ctx: &RepoContext, meta: &RunMeta, events: &EventLog) -> bool {
    let git = Git::new(rt, &ctx.repo.root);
    match git.delete_branch(&meta.branch) {
        Ok(()) => {
            let _ = events.emit(rt.now(), "branch_deleted", json!({ "branch": meta.branch }));
            true
        }
        Err(err) => {
            let message = format!("could not delete branch {}: {err:#}", meta.branch);
            eprintln!("warning: {message}");
            let _ = events.emit(
                rt.now(),
                "branch_delete_failed",
                json!({ "branch": meta.branch, "message": message }),
            );
            false
        }
    }
}
