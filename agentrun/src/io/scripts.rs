//! Repository hook scripts (`setup`, `verify`, `archive`).
//!
//! Scripts run as `sh -c <script>` inside the run's worktree with `AGENTRUN_*`
//! variables describing the run. Output goes to a per-run log file; only a
//! one-line summary travels back to the caller.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::error::{CodedError, ErrorCode};
use crate::io::process::ProcSpec;
use crate::io::run_store::RunMeta;
use crate::runtime::Runtime;

const SUMMARY_MAX_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct ScriptRequest {
    /// Hook name for messages (`setup`, `verify`, `archive`).
    pub hook: &'static str,
    pub script: String,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub hook: &'static str,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub log_path: PathBuf,
    /// Last non-empty output line, for one-line reporting.
    pub summary: String,
}

impl ScriptOutcome {
    pub fn ok(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Coded error for a failed run; `None` when the script succeeded.
    pub fn to_error(&self) -> Option<CodedError> {
        if self.ok() {
            return None;
        }
        let log = self.log_path.display().to_string();
        let err = if self.timed_out {
            CodedError::new(
                ErrorCode::ScriptTimeout,
                format!("{} script timed out", self.hook),
            )
        } else {
            let status = self
                .exit_code
                .map_or("killed by signal".to_string(), |code| format!("exit {code}"));
            let mut message = format!("{} script failed ({status})", self.hook);
            if !self.summary.is_empty() {
                message.push_str(": ");
                message.push_str(&self.summary);
            }
            CodedError::new(ErrorCode::ScriptFailed, message)
        };
        Some(
            err.with_detail("log_path", &log)
                .with_hint(format!("see {log}")),
        )
    }
}

/// Environment describing a run to its hook scripts and tmux session.
pub fn script_env(meta: &RunMeta, repo_root: &Path) -> Vec<(String, String)> {
    let mut env = vec![
        ("AGENTRUN_RUN_ID".to_string(), meta.run_id.clone()),
        ("AGENTRUN_REPO_ID".to_string(), meta.repo_id.clone()),
        ("AGENTRUN_BRANCH".to_string(), meta.branch.clone()),
        ("AGENTRUN_PARENT_BRANCH".to_string(), meta.parent_branch.clone()),
        (
            "AGENTRUN_WORKTREE".to_string(),
            meta.worktree_path.display().to_string(),
        ),
        (
            "AGENTRUN_REPO_ROOT".to_string(),
            repo_root.display().to_string(),
        ),
        ("AGENTRUN_SESSION".to_string(), meta.tmux_session.clone()),
    ];
    if let Some(name) = &meta.name {
        env.push(("AGENTRUN_RUN_NAME".to_string(), name.clone()));
    }
    env
}

/// Run a hook script and write its log. A failing script is an `Ok` outcome.
#[instrument(skip_all, fields(hook = request.hook))]
pub fn run_script(rt: &Runtime<'_>, request: &ScriptRequest) -> Result<ScriptOutcome> {
    let mut spec = ProcSpec::new("sh")
        .args(["-c", request.script.as_str()])
        .cwd(&request.workdir)
        .timeout(request.timeout)
        .output_limit(request.output_limit_bytes);
    for (key, value) in &request.env {
        spec = spec.env(key.as_str(), value.as_str());
    }
    let out = rt.run(spec)?;
    write_script_log(
        &request.log_path,
        &out.stdout,
        &out.stderr,
        request.output_limit_bytes,
    )?;
    debug!(exit_code = ?out.exit_code, timed_out = out.timed_out, "script finished");
    Ok(ScriptOutcome {
        hook: request.hook,
        exit_code: out.exit_code,
        timed_out: out.timed_out,
        log_path: request.log_path.clone(),
        summary: summarize(&out.stderr, &out.stdout),
    })
}

fn summarize(stderr: &str, stdout: &str) -> String {
    let last = |text: &str| {
        text.lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    };
    let line = last(stderr).or_else(|| last(stdout)).unwrap_or_default();
    line.chars().take(SUMMARY_MAX_CHARS).collect()
}

fn write_script_log(path: &Path, stdout: &str, stderr: &str, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create script log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(stdout);
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(stderr);

    if buf.len() > output_limit {
        let mut end = output_limit;
        while !buf.is_char_boundary(end) {
            end -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &buf[..end], buf.len() - end);
        fs::write(path, truncated)
            .with_context(|| format!("write script log {}", path.display()))?;
        return Ok(());
    }

    fs::write(path, buf).with_context(|| format!("write script log {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Fakes, ScriptedProcess, fail, ok, timed_out};

    fn request(dir: &Path) -> ScriptRequest {
        ScriptRequest {
            hook: "verify",
            script: "cargo test".to_string(),
            workdir: dir.to_path_buf(),
            log_path: dir.join("logs/verify.log"),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 1000,
            env: vec![("AGENTRUN_RUN_ID".to_string(), "r".to_string())],
        }
    }

    #[test]
    fn success_writes_log_sections() {
        let temp = tempfile::tempdir().expect("tempdir");
        let process = ScriptedProcess::new().on("sh -c cargo test", ok("all passed\n"));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let outcome = run_script(&rt, &request(temp.path())).expect("run");
        assert!(outcome.ok());
        assert!(outcome.to_error().is_none());
        let log = fs::read_to_string(temp.path().join("logs/verify.log")).expect("log");
        assert!(log.starts_with("=== stdout ===\nall passed"));
        assert!(log.contains("=== stderr ==="));
        let call = &process.calls()[0];
        assert!(call.env.contains(&("AGENTRUN_RUN_ID".to_string(), "r".to_string())));
    }

    #[test]
    fn failure_summarizes_last_stderr_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let process =
            ScriptedProcess::new().on("sh -c", fail(101, "compiling\ntest foo ... FAILED\n"));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let outcome = run_script(&rt, &request(temp.path())).expect("run");
        let err = outcome.to_error().expect("error");
        assert_eq!(err.code, ErrorCode::ScriptFailed);
        assert_eq!(
            err.message,
            "verify script failed (exit 101): test foo ... FAILED"
        );
    }

    #[test]
    fn timeout_is_its_own_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let process = ScriptedProcess::new().on("sh -c", timed_out());
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let outcome = run_script(&rt, &request(temp.path())).expect("run");
        assert_eq!(
            outcome.to_error().expect("error").code,
            ErrorCode::ScriptTimeout
        );
    }

    #[test]
    fn log_truncates_on_char_boundary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("x.log");
        write_script_log(&path, &"é".repeat(100), "", 31).expect("write");
        let log = fs::read_to_string(&path).expect("read");
        assert!(log.contains("[truncated"));
    }
}
