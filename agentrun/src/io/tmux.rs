//! tmux adapter.
//!
//! Session targets use the `=name` form so tmux matches the session name
//! exactly instead of by prefix.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::error::{CodedError, ErrorCode};
use crate::io::process::{ProcOutput, ProcSpec};
use crate::runtime::Runtime;

pub struct Tmux<'a> {
    rt: &'a Runtime<'a>,
}

impl<'a> Tmux<'a> {
    pub fn new(rt: &'a Runtime<'a>) -> Self {
        Self { rt }
    }

    pub fn ensure_installed(&self) -> Result<()> {
        if self.rt.look_path("tmux").is_none() {
            return Err(CodedError::new(ErrorCode::TmuxMissing, "tmux is not installed")
                .with_hint("install tmux, or pass --no-session")
                .into());
        }
        Ok(())
    }

    /// Any non-zero exit (no server, no such session) reads as "absent".
    #[instrument(skip_all, fields(session = name))]
    pub fn has_session(&self, name: &str) -> Result<bool> {
        let target = exact(name);
        let out = self.run(&["has-session", "-t", &target])?;
        debug!(exists = out.success(), "probed session");
        Ok(out.success())
    }

    /// Start a detached session running `command` in `cwd`.
    #[instrument(skip_all, fields(session = name))]
    pub fn new_session(
        &self,
        name: &str,
        cwd: &Path,
        command: &str,
        env: &[(String, String)],
    ) -> Result<()> {
        let cwd_arg = cwd.to_string_lossy();
        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            name.into(),
            "-c".into(),
            cwd_arg.into_owned(),
        ];
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        if !command.trim().is_empty() {
            args.push(command.to_string());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&arg_refs, "tmux new-session")
    }

    #[instrument(skip_all, fields(session = name))]
    pub fn kill_session(&self, name: &str) -> Result<()> {
        let target = exact(name);
        self.run_checked(&["kill-session", "-t", &target], "tmux kill-session")
    }

    /// Send Ctrl-C to the session's active pane.
    #[instrument(skip_all, fields(session = name))]
    pub fn send_interrupt(&self, name: &str) -> Result<()> {
        let target = format!("{}:", exact(name));
        self.run_checked(&["send-keys", "-t", &target, "C-c"], "tmux send-keys")
    }

    /// Attach the terminal to the session; inside tmux, switch the client instead.
    pub fn attach(&self, name: &str, inside_tmux: bool) -> Result<()> {
        let target = exact(name);
        let verb = if inside_tmux {
            "switch-client"
        } else {
            "attach-session"
        };
        let spec = ProcSpec::new("tmux").args([verb, "-t", target.as_str()]);
        let code = self.rt.run_interactive(&spec)?;
        if code != 0 {
            return Err(CodedError::new(
                ErrorCode::TmuxFailed,
                format!("tmux {verb} exited with {code}"),
            )
            .with_detail("exit_code", code)
            .into());
        }
        Ok(())
    }

    fn run_checked(&self, args: &[&str], what: &str) -> Result<()> {
        let out = self.run(args)?;
        if !out.success() {
            return Err(CodedError::tool_failure(
                ErrorCode::TmuxFailed,
                what,
                out.exit_code,
                out.timed_out,
                &out.stderr,
            )
            .into());
        }
        Ok(())
    }

    fn run(&self, args: &[&str]) -> Result<ProcOutput> {
        let spec = ProcSpec::new("tmux").args(args.iter().copied());
        self.rt
            .run(spec)
            .with_context(|| format!("tmux {}", args.first().copied().unwrap_or_default()))
    }
}

/// Whether this process runs inside a tmux client.
pub fn inside_tmux() -> bool {
    std::env::var_os("TMUX").is_some_and(|value| !value.is_empty())
}

fn exact(name: &str) -> String {
    format!("={name}")
}
