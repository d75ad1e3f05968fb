//! `agentrun new`: create a run (worktree, branch, metadata, session).
//!
//! Everything up to the session start happens under the repository lock.
//! Attaching happens after the lock is released.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::context::RepoContext;
use crate::core::identity::{branch_name, format_run_id, session_name};
use crate::error::{CodedError, ErrorCode};
use crate::io::git::Git;
use crate::io::paths::{WORKTREE_STATE_DIR, report_path};
use crate::io::run_store::{
    ArchiveState, RUN_SCHEMA_VERSION, RunFlags, RunMeta, StoredRun, claim_run_dir, update_run_meta,
    write_run_meta,
};
use crate::io::scripts::{ScriptRequest, run_script, script_env};
use crate::io::tmux::{Tmux, inside_tmux};
use crate::runtime::Runtime;
use crate::session::start_session;

const RUN_ID_ATTEMPTS: usize = 5;

static NAME_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$"));

#[derive(Debug, Clone, Default)]
pub struct NewOptions {
    pub name: Option<String>,
    pub parent: Option<String>,
    pub runner: Option<String>,
    pub no_session: bool,
    pub detached: bool,
    /// Overrides `$TMUX` detection when attaching.
    pub inside_tmux: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOutcome {
    pub meta: RunMeta,
    pub session_started: bool,
    pub attached: bool,
}

/// Run names: 1-64 chars of `[A-Za-z0-9._-]`, starting alphanumeric.
pub fn validate_name(name: &str) -> Result<()> {
    let re = NAME_RE
        .as_ref()
        .map_err(|err| anyhow::anyhow!("compile run name pattern: {err}"))?;
    if re.is_match(name) {
        return Ok(());
    }
    Err(CodedError::new(
        ErrorCode::Usage,
        format!("invalid run name '{name}'"),
    )
    .with_hint("use 1-64 letters, digits, '.', '_' or '-', starting with a letter or digit")
    .into())
}

#[instrument(skip_all)]
pub fn run_new(rt: &Runtime<'_>, ctx: &RepoContext, opts: &NewOptions) -> Result<NewOutcome> {
    if let Some(name) = &opts.name {
        validate_name(name)?;
    }
    let root_git = Git::new(rt, &ctx.repo.root);
    let parent = match opts
        .parent
        .clone()
        .or_else(|| ctx.user_config.defaults.parent_branch.clone())
    {
        Some(parent) => parent,
        None => root_git
            .current_branch()
            .context("determine parent branch (pass --parent)")?,
    };
    let runner = opts
        .runner
        .clone()
        .unwrap_or_else(|| ctx.user_config.defaults.runner.clone());
    let tmux = Tmux::new(rt);
    if !opts.no_session {
        tmux.ensure_installed()?;
    }

    let mut lock = ctx.lock("new", rt.now())?;
    if let Some(name) = &opts.name {
        ensure_name_free(ctx, name)?;
    }
    let base = resolve_base(&root_git, &parent)?;

    let now = rt.now();
    let run_id = claim_run_id(ctx, now)?;
    let worktree = ctx.worktree_path(&run_id);
    let meta = RunMeta {
        schema_version: RUN_SCHEMA_VERSION,
        run_id: run_id.clone(),
        repo_id: ctx.repo_id().to_string(),
        name: opts.name.clone(),
        runner,
        parent_branch: parent,
        branch: branch_name(&run_id),
        worktree_path: worktree.clone(),
        tmux_session: session_name(&run_id),
        created_at: now,
        pr_number: None,
        pr_url: None,
        last_push_at: None,
        last_report_hash: None,
        merged_at: None,
        verify: None,
        archive: ArchiveState::default(),
        flags: RunFlags::default(),
        extra: Default::default(),
    };

    let paths = ctx.run_paths(&run_id);
    if let Err(err) = root_git.worktree_add(&worktree, &meta.branch, &base) {
        if let Err(cleanup) = fs::remove_dir_all(&paths.dir) {
            warn!(err = %cleanup, "could not remove claimed run directory");
        }
        return Err(err);
    }
    write_run_meta(&paths.meta_path, &meta)?;
    write_report_stub(&worktree)?;
    ensure_excluded(&ctx.repo.common_dir)?;

    let events = ctx.event_log(&run_id);
    let _ = events.emit(
        rt.now(),
        "run_created",
        json!({
            "name": meta.name,
            "parent_branch": meta.parent_branch,
            "base": base,
            "branch": meta.branch,
        }),
    );
    info!(run_id = %run_id, branch = %meta.branch, "run created");

    if let Some(script) = ctx.repo_config.scripts.setup.clone() {
        let outcome = run_script(
            rt,
            &ScriptRequest {
                hook: "setup",
                script,
                workdir: worktree.clone(),
                log_path: paths.setup_log.clone(),
                timeout: Duration::from_secs(ctx.repo_config.timeouts.setup_secs),
                output_limit_bytes: ctx.repo_config.output_limit_bytes,
                env: script_env(&meta, &ctx.repo.root),
            },
        )?;
        if let Some(err) = outcome.to_error() {
            update_run_meta(&paths.meta_path, |m| {
                m.flags.setup_failed = true;
                m.flags.needs_attention = true;
            })?;
            let _ = events.emit(
                rt.now(),
                "setup_failed",
                json!({ "exit_code": outcome.exit_code, "timed_out": outcome.timed_out, "summary": outcome.summary }),
            );
            let _ = lock.release();
            return Err(err
                .with_detail("run_id", &run_id)
                .with_hint(format!(
                    "inspect {}, then agentrun resume {run_id} or agentrun clean {run_id}",
                    outcome.log_path.display()
                ))
                .into());
        }
        let _ = events.emit(rt.now(), "setup_finished", json!({ "summary": outcome.summary }));
    }

    let session_started = !opts.no_session;
    if session_started {
        start_session(rt, ctx, &meta, &events)?;
    }
    let _ = lock.release();

    let attached = session_started && !opts.detached;
    if attached {
        tmux.attach(
            &meta.tmux_session,
            opts.inside_tmux.unwrap_or_else(inside_tmux),
        )?;
    }
    Ok(NewOutcome {
        meta,
        session_started,
        attached,
    })
}

fn ensure_name_free(ctx: &RepoContext, name: &str) -> Result<()> {
    let taken = ctx.list_runs()?.into_iter().find_map(|run| match run {
        StoredRun::Valid(meta) if !meta.is_archived() && meta.name.as_deref() == Some(name) => {
            Some(meta.run_id)
        }
        _ => None,
    });
    match taken {
        Some(run_id) => Err(CodedError::new(
            ErrorCode::NameTaken,
            format!("an active run is already named '{name}'"),
        )
        .with_detail("run_id", run_id)
        .into()),
        None => Ok(()),
    }
}

/// Start point for the run branch: the local parent, else `origin/<parent>`.
fn resolve_base(git: &Git<'_>, parent: &str) -> Result<String> {
    if git.commit_exists(parent)? {
        return Ok(parent.to_string());
    }
    let remote = format!("origin/{parent}");
    if git.ref_exists(&format!("refs/remotes/{remote}"))? {
        return Ok(remote);
    }
    Err(CodedError::new(
        ErrorCode::ParentNotFound,
        format!("parent branch '{parent}' not found locally or on origin"),
    )
    .into())
}

fn claim_run_id(ctx: &RepoContext, now: DateTime<Utc>) -> Result<String> {
    for _ in 0..RUN_ID_ATTEMPTS {
        let run_id = format_run_id(now, rand::random::<u16>());
        if claim_run_dir(&ctx.run_paths(&run_id).dir)? {
            return Ok(run_id);
        }
        debug!(run_id = %run_id, "run id collision");
    }
    Err(CodedError::new(
        ErrorCode::Internal,
        format!("could not allocate a run id after {RUN_ID_ATTEMPTS} attempts"),
    )
    .into())
}

fn write_report_stub(worktree: &Path) -> Result<()> {
    let path = report_path(worktree);
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(&path, "").with_context(|| format!("write {}", path.display()))
}

/// Keep the worktree state directory out of `git status` for every worktree.
fn ensure_excluded(common_dir: &Path) -> Result<()> {
    let path = common_dir.join("info").join("exclude");
    let existing = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    if existing.lines().any(|line| line.trim() == WORKTREE_STATE_DIR) {
        return Ok(());
    }
    let mut out = existing;
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(WORKTREE_STATE_DIR);
    out.push('\n');
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(&path, out).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::is_valid_run_id;
    use crate::error::code_of;
    use crate::test_support::{Fakes, ScriptedProcess, TestRepo, fail, ok};

    fn creatable() -> ScriptedProcess {
        ScriptedProcess::new()
            .on("git rev-parse --abbrev-ref HEAD", ok("main\n"))
            .on("git rev-parse --verify --quiet main^{commit}", ok("abc\n"))
            .on("git worktree add", ok(""))
            .on("tmux new-session", ok(""))
    }

    fn detached(name: Option<&str>) -> NewOptions {
        NewOptions {
            name: name.map(str::to_string),
            detached: true,
            ..NewOptions::default()
        }
    }

    #[test]
    fn name_rules() {
        assert!(validate_name("fix-login_2.1").is_ok());
        assert!(validate_name(&"a".repeat(64)).is_ok());
        let too_long = "a".repeat(65);
        for bad in ["", "-lead", "has space", "slash/y", too_long.as_str()] {
            let err = validate_name(bad).expect_err(bad);
            assert_eq!(code_of(&err), ErrorCode::Usage);
        }
    }

    #[test]
    fn creates_run_with_session() {
        let repo = TestRepo::new();
        let process = creatable();
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);

        let outcome = run_new(&rt, &repo.ctx, &detached(Some("alpha"))).expect("new");
        let meta = outcome.meta;
        assert!(is_valid_run_id(&meta.run_id));
        assert_eq!(meta.parent_branch, "main");
        assert_eq!(meta.branch, format!("agentrun/{}", meta.run_id));
        assert_eq!(repo.load(&meta.run_id), meta);
        assert!(outcome.session_started);
        assert!(!outcome.attached);
        assert!(report_path(&meta.worktree_path).exists());
        let exclude = fs::read_to_string(repo.ctx.repo.common_dir.join("info/exclude")).expect("exclude");
        assert_eq!(exclude.matches(WORKTREE_STATE_DIR).count(), 1);
        assert_eq!(repo.event_names(&meta.run_id), vec!["run_created", "session_started"]);
        assert!(
            process
                .call_lines()
                .iter()
                .any(|l| l.starts_with("git worktree add -b agentrun/") && l.ends_with(" main"))
        );
    }

    #[test]
    fn active_names_are_unique() {
        let repo = TestRepo::new();
        repo.seed_run("20260101000000-aaaa", Some("alpha"));
        let process = creatable();
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = run_new(&rt, &repo.ctx, &detached(Some("alpha"))).expect_err("taken");
        assert_eq!(code_of(&err), ErrorCode::NameTaken);
    }

    #[test]
    fn archived_runs_release_their_name() {
        let repo = TestRepo::new();
        let mut old = repo.seed_run("20260101000000-aaaa", Some("alpha"));
        old.archive.archived_at = Some(old.created_at);
        repo.save(&old);
        let process = creatable();
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        run_new(&rt, &repo.ctx, &detached(Some("alpha"))).expect("name reusable");
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let repo = TestRepo::new();
        let process = ScriptedProcess::new()
            .on("git rev-parse --verify", fail(1, ""))
            .on("git show-ref", fail(1, ""));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let opts = NewOptions {
            parent: Some("nope".to_string()),
            no_session: true,
            ..NewOptions::default()
        };
        let err = run_new(&rt, &repo.ctx, &opts).expect_err("parent");
        assert_eq!(code_of(&err), ErrorCode::ParentNotFound);
        assert!(repo.ctx.list_runs().expect("list").is_empty());
    }

    #[test]
    fn failed_worktree_add_releases_the_run_dir() {
        let repo = TestRepo::new();
        let process = ScriptedProcess::new()
            .on("git rev-parse --abbrev-ref HEAD", ok("main\n"))
            .on("git rev-parse --verify --quiet main^{commit}", ok("abc\n"))
            .on("git worktree add", fail(128, "fatal: already exists"));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = run_new(&rt, &repo.ctx, &detached(None)).expect_err("worktree");
        assert_eq!(code_of(&err), ErrorCode::GitFailed);
        assert!(repo.ctx.list_runs().expect("list").is_empty());
    }

    #[test]
    fn setup_failure_keeps_and_flags_the_run() {
        let mut repo = TestRepo::new();
        repo.ctx.repo_config.scripts.setup = Some("npm ci".to_string());
        let process = creatable().on("sh -c npm ci", fail(1, "npm ERR! missing lockfile"));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = run_new(&rt, &repo.ctx, &detached(None)).expect_err("setup");
        assert_eq!(code_of(&err), ErrorCode::ScriptFailed);

        let runs = repo.ctx.list_runs().expect("list");
        let [StoredRun::Valid(meta)] = runs.as_slice() else {
            panic!("expected one run, got {runs:?}");
        };
        assert!(meta.flags.setup_failed);
        assert!(meta.flags.needs_attention);
        assert_eq!(repo.event_names(&meta.run_id), vec!["run_created", "setup_failed"]);
        assert!(!process.call_lines().iter().any(|l| l.starts_with("tmux new-session")));
    }
}
