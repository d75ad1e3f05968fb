//! Resolve a user-supplied run identifier to stored metadata.

use anyhow::Result;

use crate::context::RepoContext;
use crate::core::resolve::{RunRef, resolve_run};
use crate::error::{CodedError, ErrorCode};
use crate::io::run_store::{RunMeta, StoredRun};

/// Resolve `input` by name, id, or id prefix. Broken runs are an error.
pub fn select_run(ctx: &RepoContext, input: &str) -> Result<RunMeta> {
    let runs = ctx.list_runs()?;
    let refs: Vec<RunRef> = runs.iter().map(StoredRun::run_ref).collect();
    let chosen = resolve_run(input, &refs)?;
    let stored = runs
        .into_iter()
        .find(|run| run.run_id() == chosen.run_id)
        .ok_or_else(|| CodedError::new(ErrorCode::Internal, "resolved run vanished"))?;
    match stored {
        StoredRun::Valid(meta) => Ok(meta),
        StoredRun::Broken { run_id, reason } => Err(CodedError::new(
            ErrorCode::RunBroken,
            format!("run {run_id} has unreadable metadata"),
        )
        .with_detail("reason", reason)
        .with_hint(format!(
            "inspect or remove {}",
            ctx.run_paths(&run_id).dir.display()
        ))
        .into()),
    }
}

/// Like [`select_run`], but archived runs are an error.
pub fn select_active_run(ctx: &RepoContext, input: &str) -> Result<RunMeta> {
    let meta = select_run(ctx, input)?;
    if meta.is_archived() {
        return Err(archived_error(&meta).into());
    }
    Ok(meta)
}

pub fn archived_error(meta: &RunMeta) -> CodedError {
    CodedError::new(
        ErrorCode::RunArchived,
        format!("run {} is archived", meta.label()),
    )
    .with_detail("run_id", &meta.run_id)
}
