//! Aggregated result of the three archive stages.

use serde::{Deserialize, Serialize};

use crate::error::{CodedError, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStage {
    Script,
    Session,
    Worktree,
}

impl ArchiveStage {
    /// Fixed execution order; also the error-projection priority.
    pub const ALL: [ArchiveStage; 3] = [
        ArchiveStage::Script,
        ArchiveStage::Session,
        ArchiveStage::Worktree,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveStage::Script => "script",
            ArchiveStage::Session => "session",
            ArchiveStage::Worktree => "worktree",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StageOutcome {
    pub fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    /// Succeeded in an earlier attempt; not re-run.
    pub fn previously_done() -> Self {
        Self {
            ok: true,
            reason: Some("completed earlier".to_string()),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveOutcome {
    pub script: StageOutcome,
    pub session: StageOutcome,
    pub worktree: StageOutcome,
}

impl ArchiveOutcome {
    pub fn stage(&self, stage: ArchiveStage) -> &StageOutcome {
        match stage {
            ArchiveStage::Script => &self.script,
            ArchiveStage::Session => &self.session,
            ArchiveStage::Worktree => &self.worktree,
        }
    }

    pub fn fully_succeeded(&self) -> bool {
        ArchiveStage::ALL.iter().all(|stage| self.stage(*stage).ok)
    }

    /// First failing stage in execution order.
    pub fn first_failure(&self) -> Option<(ArchiveStage, &StageOutcome)> {
        ArchiveStage::ALL
            .iter()
            .map(|stage| (*stage, self.stage(*stage)))
            .find(|(_, outcome)| !outcome.ok)
    }

    /// Project the first failing stage to a coded error; `None` when all succeeded.
    pub fn to_error(&self, code: ErrorCode, context: &str) -> Option<CodedError> {
        let (stage, outcome) = self.first_failure()?;
        let reason = outcome.reason.as_deref().unwrap_or("unknown failure");
        let failed: Vec<&str> = ArchiveStage::ALL
            .iter()
            .filter(|s| !self.stage(**s).ok)
            .map(|s| s.as_str())
            .collect();
        Some(
            CodedError::new(
                code,
                format!("{context}: archive {} stage failed: {reason}", stage.as_str()),
            )
            .with_detail("stage", stage.as_str())
            .with_detail("failed_stages", failed.join(",")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(script: bool, session: bool, worktree: bool) -> ArchiveOutcome {
        let pick = |ok: bool, name: &str| {
            if ok {
                StageOutcome::ok()
            } else {
                StageOutcome::failed(format!("{name} broke"))
            }
        };
        ArchiveOutcome {
            script: pick(script, "script"),
            session: pick(session, "session"),
            worktree: pick(worktree, "worktree"),
        }
    }

    #[test]
    fn all_ok_has_no_error() {
        let all = outcome(true, true, true);
        assert!(all.fully_succeeded());
        assert!(all.to_error(ErrorCode::ArchiveFailed, "clean").is_none());
    }

    /// The earliest stage in execution order decides the error.
    #[test]
    fn first_failing_stage_wins() {
        let partial = outcome(true, false, false);
        assert!(!partial.fully_succeeded());
        let err = partial
            .to_error(ErrorCode::ArchiveIncomplete, "merge succeeded")
            .expect("error");
        assert_eq!(err.code, ErrorCode::ArchiveIncomplete);
        assert_eq!(err.detail("stage"), Some("session"));
        assert_eq!(err.detail("failed_stages"), Some("session,worktree"));
        assert!(err.message.starts_with("merge succeeded: archive session stage failed"));
    }

    #[test]
    fn script_failure_precedes_worktree() {
        let partial = outcome(false, true, false);
        let (stage, _) = partial.first_failure().expect("failure");
        assert_eq!(stage, ArchiveStage::Script);
    }
}
