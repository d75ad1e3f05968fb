//! Work-in-progress report rules.
//!
//! The report doubles as the PR body. A report is valid once it has at least
//! [`REPORT_MIN_CHARS`] characters after trimming surrounding whitespace.

use sha2::{Digest, Sha256};

pub const REPORT_MIN_CHARS: usize = 20;

/// Body used for PR creation when a forced push has no usable report.
pub const PLACEHOLDER_BODY: &str = "Work in progress. The agent report has not been written yet.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportStatus {
    Missing,
    TooShort { chars: usize },
    Valid,
}

impl ReportStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, ReportStatus::Valid)
    }
}

/// Classify report contents; `None` means the file does not exist.
pub fn classify_report(contents: Option<&str>) -> ReportStatus {
    let Some(contents) = contents else {
        return ReportStatus::Missing;
    };
    let chars = contents.trim().chars().count();
    if chars >= REPORT_MIN_CHARS {
        ReportStatus::Valid
    } else {
        ReportStatus::TooShort { chars }
    }
}

/// SHA-256 hex digest used to skip redundant PR body syncs.
pub fn report_hash(contents: &str) -> String {
    hex::encode(Sha256::digest(contents.as_bytes()))
}
