//! Injected collaborators shared by every command.
//!
//! A [`Runtime`] bundles the process runner, clock, sleeper, jitter source,
//! prompter, and the caller deadline. Production wiring lives in `main.rs`;
//! tests build one from `test_support` fakes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::core::retry::{Backoff, Clock, Deadline, JitterSource, Sleeper};
use crate::error::{CodedError, ErrorCode};
use crate::io::interact::Prompter;
use crate::io::process::{ProcOutput, ProcSpec, ProcessRunner};

pub struct Runtime<'a> {
    pub process: &'a dyn ProcessRunner,
    pub clock: &'a dyn Clock,
    pub sleeper: &'a dyn Sleeper,
    pub jitter: &'a dyn JitterSource,
    pub prompter: &'a dyn Prompter,
    pub deadline: Deadline,
}

impl Runtime<'_> {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            clock: self.clock,
            sleeper: self.sleeper,
            jitter: self.jitter,
            deadline: self.deadline,
        }
    }

    /// Time left before the caller deadline, if one was set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.remaining(self.clock.instant())
    }

    /// Run a process with its timeout capped by the caller deadline.
    ///
    /// A call killed because the deadline ran out is `E_DEADLINE_EXCEEDED`;
    /// a call that hit its own limit returns normally with `timed_out` set.
    pub fn run(&self, mut spec: ProcSpec) -> Result<ProcOutput> {
        let now = self.clock.instant();
        if self.deadline.is_expired(now) {
            return Err(deadline_error(&spec).into());
        }
        let own_limit = spec.timeout;
        spec.timeout = self.deadline.clamp(own_limit, now);
        let bounded_by_deadline = spec.timeout < own_limit;

        let out = self.process.run(&spec)?;
        if out.timed_out && bounded_by_deadline {
            warn!(command = %spec.command_line(), "deadline interrupted command");
            return Err(deadline_error(&spec).into());
        }
        Ok(out)
    }

    pub fn run_interactive(&self, spec: &ProcSpec) -> Result<i32> {
        if self.deadline.is_expired(self.clock.instant()) {
            return Err(deadline_error(spec).into());
        }
        self.process.run_interactive(spec)
    }

    pub fn look_path(&self, name: &str) -> Option<PathBuf> {
        self.process.look_path(name)
    }
}

fn deadline_error(spec: &ProcSpec) -> CodedError {
    CodedError::new(
        ErrorCode::DeadlineExceeded,
        format!("deadline exceeded running `{}`", spec.command_line()),
    )
    .with_hint("raise --timeout or command_timeout_secs")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::code_of;
    use crate::test_support::{Fakes, ScriptedProcess, ok, timed_out};

    #[test]
    fn clamps_call_timeout_to_deadline() {
        let process = ScriptedProcess::new().on("git status", ok(""));
        let fakes = Fakes::default();
        let mut rt = fakes.runtime(&process);
        rt.deadline = Deadline::after(fakes.clock.instant(), Duration::from_secs(3));
        rt.run(ProcSpec::new("git").arg("status").timeout(Duration::from_secs(60)))
            .expect("run");
        let calls = process.calls();
        assert_eq!(calls[0].timeout, Duration::from_secs(3));
    }

    #[test]
    fn expired_deadline_fails_before_spawning() {
        let process = ScriptedProcess::new();
        let fakes = Fakes::default();
        let mut rt = fakes.runtime(&process);
        rt.deadline = Deadline::after(fakes.clock.instant(), Duration::ZERO);
        let err = rt.run(ProcSpec::new("git").arg("fetch")).expect_err("expired");
        assert_eq!(code_of(&err), ErrorCode::DeadlineExceeded);
        assert!(process.calls().is_empty());
    }

    #[test]
    fn own_timeout_is_not_a_deadline_error() {
        let process = ScriptedProcess::new().on("sh -c", timed_out());
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let out = rt
            .run(ProcSpec::new("sh").args(["-c", "sleep 9"]))
            .expect("returns output");
        assert!(out.timed_out);
    }

    #[test]
    fn deadline_kill_is_deadline_error() {
        let process = ScriptedProcess::new().on("sh -c", timed_out());
        let fakes = Fakes::default();
        let mut rt = fakes.runtime(&process);
        rt.deadline = Deadline::after(fakes.clock.instant(), Duration::from_secs(1));
        let err = rt
            .run(ProcSpec::new("sh").args(["-c", "sleep 9"]))
            .expect_err("deadline");
        assert_eq!(code_of(&err), ErrorCode::DeadlineExceeded);
    }
}
