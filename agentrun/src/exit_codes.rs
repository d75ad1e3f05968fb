//! Stable exit codes for agentrun CLI commands.

use crate::error::{ErrorCode, code_of};

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed; stderr carries `<code>: <message>`.
pub const FAILED: i32 = 1;
/// Invalid invocation (also what clap uses for argument errors).
pub const USAGE: i32 = 2;
/// The primary operation succeeded but follow-up archival did not complete.
pub const PARTIAL: i32 = 3;

/// Map a command error to its exit code.
pub fn for_error(err: &anyhow::Error) -> i32 {
    match code_of(err) {
        ErrorCode::Usage => USAGE,
        ErrorCode::ArchiveIncomplete => PARTIAL,
        _ => FAILED,
    }
}
