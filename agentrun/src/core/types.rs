//! Shared deterministic types for agentrun core logic.
//!
//! These types define stable contracts with the hosting CLI (`gh --json`) and
//! between pipeline stages. They must not depend on external state.

use serde::{Deserialize, Serialize};

/// Pull request lifecycle state as reported by `gh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

impl PrState {
    pub fn as_str(self) -> &'static str {
        match self {
            PrState::Open => "OPEN",
            PrState::Closed => "CLOSED",
            PrState::Merged => "MERGED",
        }
    }
}

/// Mergeability as computed by the host. `UNKNOWN` means "not computed yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mergeable {
    Mergeable,
    Conflicting,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Fields requested from `gh pr view/list --json`.
pub const PR_JSON_FIELDS: &str = "number,url,state,isDraft,mergeable,headRefName";

/// Snapshot of a pull request. Never cached beyond one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrView {
    pub number: u64,
    pub url: String,
    pub state: PrState,
    #[serde(rename = "isDraft", default)]
    pub is_draft: bool,
    #[serde(default)]
    pub mergeable: Mergeable,
    #[serde(rename = "headRefName")]
    pub head_ref: String,
}

/// How `gh pr merge` combines the branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl MergeStrategy {
    pub fn as_flag(self) -> &'static str {
        match self {
            MergeStrategy::Squash => "--squash",
            MergeStrategy::Merge => "--merge",
            MergeStrategy::Rebase => "--rebase",
        }
    }
}

/// Result of a best-effort side-channel write (event append, lock release).
///
/// Side channels never fail a command; callers may inspect or ignore this.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Delivery {
    Written,
    Dropped { reason: String },
}

impl Delivery {
    pub fn is_written(&self) -> bool {
        matches!(self, Delivery::Written)
    }
}
