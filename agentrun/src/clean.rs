//! `agentrun clean`: archive a run without merging it.

use anyhow::Result;
use serde_json::json;
use tracing::instrument;

use crate::archive::{ArchiveResult, archive_run, delete_local_branch};
use crate::context::RepoContext;
use crate::error::ErrorCode;
use crate::io::interact::confirm_typed;
use crate::io::run_store::load_run_meta;
use crate::runtime::Runtime;
use crate::select::select_run;

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanOptions {
    pub yes: bool,
    pub delete_branch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanOutcome {
    pub run_id: String,
    pub archive: ArchiveResult,
    pub branch_deleted: bool,
}

#[instrument(skip_all, fields(run = input))]
pub fn run_clean(
    rt: &Runtime<'_>,
    ctx: &RepoContext,
    input: &str,
    opts: CleanOptions,
) -> Result<CleanOutcome> {
    let selected = select_run(ctx, input)?;
    let mut lock = ctx.lock("clean", rt.now())?;

    // Reread under the lock: another command may have archived it meanwhile.
    let meta = load_run_meta(&ctx.run_paths(&selected.run_id).meta_path)?;
    if meta.is_archived() {
        let _ = lock.release();
        return Ok(CleanOutcome {
            run_id: meta.run_id,
            archive: ArchiveResult::AlreadyArchived,
            branch_deleted: false,
        });
    }

    confirm_typed(
        rt.prompter,
        "clean",
        &format!(
            "clean run {} (kills its session, removes its worktree)",
            meta.label()
        ),
        opts.yes,
    )?;

    let events = ctx.event_log(&meta.run_id);
    let _ = events.emit(rt.now(), "clean_started", json!({}));
    let archive = archive_run(rt, ctx, &meta.run_id, &events)?;
    if let ArchiveResult::Completed(outcome) = &archive
        && let Some(err) = outcome.to_error(ErrorCode::ArchiveFailed, "clean")
    {
        let _ = events.emit(
            rt.now(),
            "clean_failed",
            json!({ "error_code": err.code.as_str(), "message": err.message }),
        );
        let _ = lock.release();
        return Err(err
            .with_hint(format!("rerun: agentrun clean {}", meta.run_id))
            .into());
    }
    let branch_deleted = opts.delete_branch && delete_local_branch(rt, ctx, &meta, &events);
    let _ = events.emit(
        rt.now(),
        "clean_finished",
        json!({ "branch_deleted": branch_deleted }),
    );
    let _ = lock.release();
    Ok(CleanOutcome {
        run_id: meta.run_id,
        archive,
        branch_deleted,
    })
}
