//! Deterministic, pure logic shared by agentrun commands.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and injected clocks/sleepers, so every decision here is testable
//! without spawning `git`, `gh`, or `tmux`.

pub mod archive_outcome;
pub mod identity;
pub mod origin;
pub mod report;
pub mod resolve;
pub mod retry;
pub mod types;
