//! tmux session lifecycle for runs: `resume`, `restart`, `stop`, `kill`.
//!
//! Session creation is double-checked: probe without the lock, and only when
//! the session is missing take the lock and probe again before creating it.

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::context::RepoContext;
use crate::error::{CodedError, ErrorCode};
use crate::gates::require_worktree;
use crate::io::events::EventLog;
use crate::io::interact::confirm_typed;
use crate::io::run_store::{RunMeta, update_run_meta};
use crate::io::scripts::script_env;
use crate::io::tmux::{Tmux, inside_tmux};
use crate::runtime::Runtime;
use crate::select::select_active_run;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnsure {
    AlreadyRunning,
    Created,
    /// Missing at first probe, present once the lock was held.
    AppearedUnderLock,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AttachOptions {
    pub detached: bool,
    /// Overrides `$TMUX` detection; `None` means detect.
    pub inside_tmux: Option<bool>,
}

impl AttachOptions {
    fn inside_tmux(&self) -> bool {
        self.inside_tmux.unwrap_or_else(inside_tmux)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub run_id: String,
    pub session: String,
    pub ensure: SessionEnsure,
    pub attached: bool,
}

/// Make sure the run's session exists.
pub fn ensure_session(
    rt: &Runtime<'_>,
    ctx: &RepoContext,
    meta: &RunMeta,
    events: &EventLog,
) -> Result<SessionEnsure> {
    let tmux = Tmux::new(rt);
    if tmux.has_session(&meta.tmux_session)? {
        return Ok(SessionEnsure::AlreadyRunning);
    }
    let mut lock = ctx.lock("resume", rt.now())?;
    if tmux.has_session(&meta.tmux_session)? {
        debug!("session appeared while waiting for the lock");
        let _ = lock.release();
        return Ok(SessionEnsure::AppearedUnderLock);
    }
    require_worktree(meta)?;
    start_session(rt, ctx, meta, events)?;
    let _ = lock.release();
    Ok(SessionEnsure::Created)
}

/// Create the session running the run's runner. The caller holds the lock.
pub(crate) fn start_session(
    rt: &Runtime<'_>,
    ctx: &RepoContext,
    meta: &RunMeta,
    events: &EventLog,
) -> Result<()> {
    Tmux::new(rt).new_session(
        &meta.tmux_session,
        &meta.worktree_path,
        &meta.runner,
        &script_env(meta, &ctx.repo.root),
    )?;
    let _ = events.emit(
        rt.now(),
        "session_started",
        json!({ "session": meta.tmux_session, "runner": meta.runner }),
    );
    info!(session = %meta.tmux_session, "session started");
    Ok(())
}

#[instrument(skip_all, fields(run = input))]
pub fn run_resume(
    rt: &Runtime<'_>,
    ctx: &RepoContext,
    input: &str,
    opts: AttachOptions,
) -> Result<SessionOutcome> {
    let meta = select_active_run(ctx, input)?;
    let tmux = Tmux::new(rt);
    tmux.ensure_installed()?;
    let events = ctx.event_log(&meta.run_id);

    let ensure = ensure_session(rt, ctx, &meta, &events)?;
    if meta.flags.needs_attention {
        update_run_meta(&ctx.run_paths(&meta.run_id).meta_path, |m| {
            m.flags.needs_attention = false;
        })?;
    }
    let _ = events.emit(
        rt.now(),
        "session_resumed",
        json!({ "ensure": format!("{ensure:?}"), "detached": opts.detached }),
    );
    attach_unless_detached(&tmux, &meta, opts)?;
    Ok(SessionOutcome {
        run_id: meta.run_id,
        session: meta.tmux_session,
        ensure,
        attached: !opts.detached,
    })
}

#[instrument(skip_all, fields(run = input))]
pub fn run_restart(
    rt: &Runtime<'_>,
    ctx: &RepoContext,
    input: &str,
    yes: bool,
    opts: AttachOptions,
) -> Result<SessionOutcome> {
    let meta = select_active_run(ctx, input)?;
    let tmux = Tmux::new(rt);
    tmux.ensure_installed()?;
    confirm_typed(
        rt.prompter,
        "restart",
        &format!("restart session {} (the running agent is killed)", meta.tmux_session),
        yes,
    )?;
    require_worktree(&meta)?;

    let events = ctx.event_log(&meta.run_id);
    let mut lock = ctx.lock("restart", rt.now())?;
    if tmux.has_session(&meta.tmux_session)? {
        tmux.kill_session(&meta.tmux_session)?;
        let _ = events.emit(
            rt.now(),
            "session_killed",
            json!({ "session": meta.tmux_session, "reason": "restart" }),
        );
    }
    start_session(rt, ctx, &meta, &events)?;
    let _ = lock.release();

    attach_unless_detached(&tmux, &meta, opts)?;
    Ok(SessionOutcome {
        run_id: meta.run_id,
        session: meta.tmux_session,
        ensure: SessionEnsure::Created,
        attached: !opts.detached,
    })
}

/// Interrupt the agent (Ctrl-C) and flag the run for attention.
#[instrument(skip_all, fields(run = input))]
pub fn run_stop(rt: &Runtime<'_>, ctx: &RepoContext, input: &str) -> Result<RunMeta> {
    let meta = select_active_run(ctx, input)?;
    let tmux = Tmux::new(rt);
    tmux.ensure_installed()?;
    let mut lock = ctx.lock("stop", rt.now())?;
    if !tmux.has_session(&meta.tmux_session)? {
        return Err(session_not_found(&meta).into());
    }
    tmux.send_interrupt(&meta.tmux_session)?;
    let updated = update_run_meta(&ctx.run_paths(&meta.run_id).meta_path, |m| {
        m.flags.needs_attention = true;
    })?;
    let _ = ctx.event_log(&meta.run_id).emit(
        rt.now(),
        "session_stopped",
        json!({ "session": meta.tmux_session }),
    );
    let _ = lock.release();
    Ok(updated)
}

/// Kill the session. The run stays active; `resume` starts a fresh session.
#[instrument(skip_all, fields(run = input))]
pub fn run_kill(rt: &Runtime<'_>, ctx: &RepoContext, input: &str) -> Result<RunMeta> {
    let meta = select_active_run(ctx, input)?;
    let tmux = Tmux::new(rt);
    tmux.ensure_installed()?;
    let mut lock = ctx.lock("kill", rt.now())?;
    if !tmux.has_session(&meta.tmux_session)? {
        return Err(session_not_found(&meta).into());
    }
    tmux.kill_session(&meta.tmux_session)?;
    let _ = ctx.event_log(&meta.run_id).emit(
        rt.now(),
        "session_killed",
        json!({ "session": meta.tmux_session, "reason": "kill" }),
    );
    let _ = lock.release();
    Ok(meta)
}

fn attach_unless_detached(tmux: &Tmux<'_>, meta: &RunMeta, opts: AttachOptions) -> Result<()> {
    if opts.detached {
        return Ok(());
    }
    tmux.attach(&meta.tmux_session, opts.inside_tmux())
}

fn session_not_found(meta: &RunMeta) -> CodedError {
    CodedError::new(
        ErrorCode::SessionNotFound,
        format!("tmux session {} is not running", meta.tmux_session),
    )
    .with_hint(format!("agentrun resume {}", meta.run_id))
}
