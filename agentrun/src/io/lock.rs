//! Repository lock: one mutating command per repository at a time.
//!
//! The lock is a marker file created with `create_new`, holding the holder's
//! pid, a label naming the command, and a random token. Acquisition never
//! blocks. A marker whose pid is gone, or which stays unreadable for longer
//! than [`UNREADABLE_STALE_AFTER`], is stale and gets broken by the next
//! acquirer. Release only removes a marker carrying our own token.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::types::Delivery;
use crate::error::{CodedError, ErrorCode};
use crate::io::paths::DataPaths;

/// Age after which an unparseable marker is considered abandoned.
pub const UNREADABLE_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Contents of the lock marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockHolder {
    pub pid: u32,
    pub label: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

pub struct RepoLock;

impl RepoLock {
    /// Acquire the lock for `repo_id`, labelled with the acquiring command.
    pub fn acquire(
        paths: &DataPaths,
        repo_id: &str,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<RepoLockGuard> {
        acquire_lock_at(&paths.lock_path(repo_id), label, now)
    }
}

/// Acquire the lock marker at `path`.
pub fn acquire_lock_at(path: &Path, label: &str, now: DateTime<Utc>) -> Result<RepoLockGuard> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let holder = LockHolder {
        pid: std::process::id(),
        label: label.to_string(),
        token: format!("{:016x}", rand::random::<u64>()),
        acquired_at: now,
    };

    // Second pass only after breaking a stale marker.
    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let body = serde_json::to_string(&holder).context("serialize lock holder")?;
                file.write_all(body.as_bytes())
                    .with_context(|| format!("write lock {}", path.display()))?;
                debug!(path = %path.display(), label, "lock acquired");
                return Ok(RepoLockGuard {
                    path: path.to_path_buf(),
                    token: holder.token,
                    released: false,
                });
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                match inspect_marker(path)? {
                    Marker::Held(existing) => return Err(locked_error(Some(&existing)).into()),
                    Marker::Busy => return Err(locked_error(None).into()),
                    Marker::Stale(reason) => {
                        info!(path = %path.display(), reason, "breaking stale lock");
                        match fs::remove_file(path) {
                            Ok(()) => {}
                            Err(err) if err.kind() == ErrorKind::NotFound => {}
                            Err(err) => {
                                return Err(err).with_context(|| {
                                    format!("remove stale lock {}", path.display())
                                });
                            }
                        }
                    }
                }
            }
            Err(err) => {
                return Err(err).with_context(|| format!("create lock {}", path.display()));
            }
        }
    }
    Err(locked_error(None).into())
}

enum Marker {
    Held(LockHolder),
    /// Unreadable but recent; probably mid-write.
    Busy,
    Stale(&'static str),
}

fn inspect_marker(path: &Path) -> Result<Marker> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Marker::Stale("vanished")),
        Err(err) => return Err(err).with_context(|| format!("read lock {}", path.display())),
    };
    match serde_json::from_str::<LockHolder>(&contents) {
        Ok(holder) if process_is_alive(holder.pid) => Ok(Marker::Held(holder)),
        Ok(_) => Ok(Marker::Stale("holder process exited")),
        Err(_) => {
            let age = fs::metadata(path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .unwrap_or_default();
            if age > UNREADABLE_STALE_AFTER {
                Ok(Marker::Stale("unreadable marker"))
            } else {
                Ok(Marker::Busy)
            }
        }
    }
}

fn locked_error(holder: Option<&LockHolder>) -> CodedError {
    match holder {
        Some(holder) => CodedError::new(
            ErrorCode::RepoLocked,
            format!(
                "repository is locked by '{}' (pid {})",
                holder.label, holder.pid
            ),
        )
        .with_detail("holder", &holder.label)
        .with_detail("pid", holder.pid)
        .with_detail("acquired_at", holder.acquired_at.to_rfc3339()),
        None => CodedError::new(ErrorCode::RepoLocked, "repository is locked"),
    }
    .with_hint("wait for the other agentrun command to finish, then retry")
}

/// Probe with `kill -0`; a permission error still means the process exists.
fn process_is_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    match Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
    {
        Ok(out) if out.status.success() => true,
        Ok(out) => String::from_utf8_lossy(&out.stderr)
            .to_ascii_lowercase()
            .contains("not permitted"),
        // Cannot probe: assume alive rather than break a live lock.
        Err(_) => true,
    }
}

/// Held lock; released on [`RepoLockGuard::release`] or drop.
#[derive(Debug)]
pub struct RepoLockGuard {
    path: PathBuf,
    token: String,
    released: bool,
}

impl RepoLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the marker if it is still ours. Safe to call more than once.
    pub fn release(&mut self) -> Delivery {
        if self.released {
            return Delivery::Written;
        }
        self.released = true;
        let delivery = release_marker(&self.path, &self.token);
        if let Delivery::Dropped { reason } = &delivery {
            warn!(path = %self.path.display(), reason, "lock release failed");
        }
        delivery
    }
}

impl Drop for RepoLockGuard {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn release_marker(path: &Path, token: &str) -> Delivery {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Delivery::Written,
        Err(err) => {
            return Delivery::Dropped {
                reason: format!("read lock: {err}"),
            };
        }
    };
    match serde_json::from_str::<LockHolder>(&contents) {
        Ok(holder) if holder.token == token => match fs::remove_file(path) {
            Ok(()) => Delivery::Written,
            Err(err) if err.kind() == ErrorKind::NotFound => Delivery::Written,
            Err(err) => Delivery::Dropped {
                reason: format!("remove lock: {err}"),
            },
        },
        Ok(holder) => Delivery::Dropped {
            reason: format!("lock now held by pid {}", holder.pid),
        },
        Err(err) => Delivery::Dropped {
            reason: format!("unreadable lock marker: {err}"),
        },
    }
}
