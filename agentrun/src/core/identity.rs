//! Naming rules for repositories, runs, branches, and sessions.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

pub const BRANCH_PREFIX: &str = "agentrun/";
pub const SESSION_PREFIX: &str = "agentrun-";
const REPO_ID_LEN: usize = 16;
const RUN_SUFFIX_LEN: usize = 4;

/// Stable repository identity: 16 hex chars of SHA-256(`root` + `\n` + `origin`).
pub fn repo_id(root: &str, origin_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(root.as_bytes());
    hasher.update(b"\n");
    hasher.update(origin_url.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..REPO_ID_LEN].to_string()
}

/// `YYYYMMDDHHMMSS-xxxx`, lexicographically sortable by creation time.
pub fn format_run_id(now: DateTime<Utc>, suffix: u16) -> String {
    format!("{}-{suffix:04x}", now.format("%Y%m%d%H%M%S"))
}

pub fn is_valid_run_id(id: &str) -> bool {
    let Some((stamp, suffix)) = id.split_once('-') else {
        return false;
    };
    stamp.len() == 14
        && stamp.bytes().all(|b| b.is_ascii_digit())
        && suffix.len() == RUN_SUFFIX_LEN
        && suffix
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub fn branch_name(run_id: &str) -> String {
    format!("{BRANCH_PREFIX}{run_id}")
}

pub fn session_name(run_id: &str) -> String {
    format!("{SESSION_PREFIX}{run_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn repo_id_is_stable_and_short() {
        let a = repo_id("/src/app", "git@github.com:o/app.git");
        let b = repo_id("/src/app", "git@github.com:o/app.git");
        let c = repo_id("/src/app", "");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn run_ids_sort_by_creation_time() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("time");
        let late = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 6).single().expect("time");
        let a = format_run_id(early, 0xffff);
        let b = format_run_id(late, 0x0000);
        assert_eq!(a, "20260102030405-ffff");
        assert!(a < b);
        assert!(is_valid_run_id(&a));
        assert!(is_valid_run_id(&b));
    }

    #[test]
    fn rejects_malformed_run_ids() {
        assert!(!is_valid_run_id("20260102030405"));
        assert!(!is_valid_run_id("2026010203040-abcd"));
        assert!(!is_valid_run_id("20260102030405-ABCD"));
        assert!(!is_valid_run_id("../etc-abcd"));
    }

    #[test]
    fn derived_names() {
        assert_eq!(branch_name("20260102030405-00aa"), "agentrun/20260102030405-00aa");
        assert_eq!(session_name("20260102030405-00aa"), "agentrun-20260102030405-00aa");
    }
}
