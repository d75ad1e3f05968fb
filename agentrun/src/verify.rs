//! `agentrun verify` and the merge-time verify gate.

use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{info, instrument};

use crate::context::RepoContext;
use crate::error::{CodedError, ErrorCode};
use crate::gates::{Gates, require_worktree};
use crate::io::events::EventLog;
use crate::io::run_store::{RunMeta, VerifyRecord, update_run_meta};
use crate::io::scripts::{ScriptRequest, run_script, script_env};
use crate::runtime::Runtime;
use crate::select::select_active_run;

#[instrument(skip_all, fields(run = input))]
pub fn run_verify(rt: &Runtime<'_>, ctx: &RepoContext, input: &str) -> Result<VerifyRecord> {
    let meta = select_active_run(ctx, input)?;
    let events = ctx.event_log(&meta.run_id);
    let gates = Gates::new("verify", &events, rt);
    gates.check("worktree", || require_worktree(&meta))?;
    let mut lock = gates.check("lock", || ctx.lock("verify", rt.now()))?;
    let record = gates.check("verify", || verify_locked(rt, ctx, &meta, &events))?;
    let _ = lock.release();
    Ok(record)
}

/// Run the repository verify script and record the result on the run.
///
/// The caller holds the lock. A failing script is recorded and then returned
/// as an error.
pub fn verify_locked(
    rt: &Runtime<'_>,
    ctx: &RepoContext,
    meta: &RunMeta,
    events: &EventLog,
) -> Result<VerifyRecord> {
    let Some(script) = ctx.repo_config.scripts.verify.clone() else {
        return Err(CodedError::new(
            ErrorCode::Usage,
            "no verify script configured ([scripts] verify in agentrun.toml)",
        )
        .into());
    };
    let _ = events.emit(rt.now(), "verify_started", json!({}));
    let request = ScriptRequest {
        hook: "verify",
        script,
        workdir: meta.worktree_path.clone(),
        log_path: ctx.run_paths(&meta.run_id).verify_log,
        timeout: Duration::from_secs(ctx.repo_config.timeouts.verify_secs),
        output_limit_bytes: ctx.repo_config.output_limit_bytes,
        env: script_env(meta, &ctx.repo.root),
    };
    let outcome = run_script(rt, &request)?;
    let record = VerifyRecord {
        ok: outcome.ok(),
        summary: outcome.summary.clone(),
        exit_code: outcome.exit_code,
        timed_out: outcome.timed_out,
        finished_at: rt.now(),
        log_path: outcome.log_path.clone(),
    };
    update_run_meta(&ctx.run_paths(&meta.run_id).meta_path, |m| {
        m.verify = Some(record.clone());
    })?;
    let _ = events.emit(
        rt.now(),
        "verify_finished",
        json!({
            "ok": record.ok,
            "exit_code": record.exit_code,
            "timed_out": record.timed_out,
            "summary": record.summary,
        }),
    );
    info!(ok = record.ok, "verify finished");
    match outcome.to_error() {
        Some(err) => Err(err.into()),
        None => Ok(record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code_of;
    use crate::test_support::{Fakes, ScriptedProcess, TestRepo, fail, ok};

    const RUN: &str = "20260101000000-aaaa";

    #[test]
    fn records_passing_verify() {
        let mut repo = TestRepo::new();
        repo.ctx.repo_config.scripts.verify = Some("make test".to_string());
        repo.seed_run(RUN, None);
        let process = ScriptedProcess::new().on("sh -c make test", ok("all green\n"));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);

        let record = run_verify(&rt, &repo.ctx, RUN).expect("verify");
        assert!(record.ok);
        assert_eq!(record.summary, "all green");
        assert_eq!(repo.load(RUN).verify, Some(record));
        assert_eq!(repo.event_names(RUN), vec!["verify_started", "verify_finished"]);
    }

    #[test]
    fn failing_verify_is_recorded_and_returned() {
        let mut repo = TestRepo::new();
        repo.ctx.repo_config.scripts.verify = Some("make test".to_string());
        repo.seed_run(RUN, None);
        let process = ScriptedProcess::new().on("sh -c", fail(2, "1 test failed"));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);

        let err = run_verify(&rt, &repo.ctx, RUN).expect_err("failed");
        assert_eq!(code_of(&err), ErrorCode::ScriptFailed);
        let stored = repo.load(RUN).verify.expect("recorded");
        assert!(!stored.ok);
        assert_eq!(stored.exit_code, Some(2));
        assert_eq!(
            repo.event_names(RUN),
            vec!["verify_started", "verify_finished", "verify_failed"]
        );
    }

    #[test]
    fn unconfigured_verify_is_a_usage_error() {
        let repo = TestRepo::new();
        repo.seed_run(RUN, None);
        let process = ScriptedProcess::new();
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = run_verify(&rt, &repo.ctx, RUN).expect_err("unconfigured");
        assert_eq!(code_of(&err), ErrorCode::Usage);
    }
}
