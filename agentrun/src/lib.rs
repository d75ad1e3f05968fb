//! Run orchestration for AI coding agents.
//!
//! Each run gets a git worktree on its own branch and a tmux session running
//! the agent. Commands move a run through its lifecycle: `new`, `push` (branch
//! and pull request), `merge`, and `clean` (three-stage archive). All
//! mutations of a repository's runs are serialized by one lock file.
//!
//! - **[`core`]**: Pure logic (identifiers, resolution, retry schedules,
//!   archive aggregation). No I/O.
//! - **[`io`]**: Side effects (processes, git, gh, tmux, store, events, lock).
//!
//! Command modules ([`new_run`], [`push`], [`merge`], [`clean`], [`session`],
//! [`verify`], [`views`]) compose the two through a [`runtime::Runtime`].

pub mod archive;
pub mod clean;
pub mod context;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod gates;
pub mod io;
pub mod logging;
pub mod merge;
pub mod new_run;
pub mod pr;
pub mod push;
pub mod runtime;
pub mod select;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
pub mod views;
