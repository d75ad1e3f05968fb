//! Repository discovery.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

use crate::core::identity::repo_id;
use crate::error::{CodedError, ErrorCode};
use crate::io::process::ProcSpec;
use crate::runtime::Runtime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    /// Main working tree root (never a linked worktree).
    pub root: PathBuf,
    /// Common `.git` directory shared by all worktrees.
    pub common_dir: PathBuf,
    pub origin_url: Option<String>,
    pub repo_id: String,
}

/// Locate the repository containing `cwd`.
///
/// Works from inside a run's worktree too: the common git dir always points
/// back at the main repository, so every worktree maps to the same repo id.
pub fn discover_repo(rt: &Runtime<'_>, cwd: &Path) -> Result<RepoInfo> {
    let out = rt.run(
        ProcSpec::new("git")
            .args(["rev-parse", "--path-format=absolute", "--git-common-dir"])
            .cwd(cwd),
    )?;
    if !out.success() {
        return Err(CodedError::new(
            ErrorCode::NotARepo,
            format!("{} is not inside a git repository", cwd.display()),
        )
        .with_hint("run agentrun from a git checkout")
        .into());
    }
    let common_dir = PathBuf::from(out.stdout.trim());
    let root = common_dir
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            CodedError::new(
                ErrorCode::NotARepo,
                format!("unexpected git dir {}", common_dir.display()),
            )
        })?;

    let origin = rt.run(
        ProcSpec::new("git")
            .args(["remote", "get-url", "origin"])
            .cwd(&root),
    )?;
    let origin_url = origin
        .success()
        .then(|| origin.stdout.trim().to_string())
        .filter(|url| !url.is_empty());

    let id = repo_id(
        &root.to_string_lossy(),
        origin_url.as_deref().unwrap_or_default(),
    );
    debug!(root = %root.display(), repo_id = %id, "repository discovered");
    Ok(RepoInfo {
        root,
        common_dir,
        origin_url,
        repo_id: id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code_of;
    use crate::test_support::{Fakes, ScriptedProcess, fail, ok};

    #[test]
    fn root_is_parent_of_common_dir() {
        let process = ScriptedProcess::new()
            .on("git rev-parse", ok("/src/app/.git\n"))
            .on("git remote get-url origin", ok("git@github.com:o/app.git\n"));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let info = discover_repo(&rt, Path::new("/src/app/sub")).expect("discover");
        assert_eq!(info.root, PathBuf::from("/src/app"));
        assert_eq!(info.origin_url.as_deref(), Some("git@github.com:o/app.git"));
        assert_eq!(info.repo_id, repo_id("/src/app", "git@github.com:o/app.git"));
    }

    #[test]
    fn outside_a_repo() {
        let process = ScriptedProcess::new().on("git rev-parse", fail(128, "fatal: not a git repository"));
        let fakes = Fakes::default();
        let rt = fakes.runtime(&process);
        let err = discover_repo(&rt, Path::new("/tmp")).expect_err("no repo");
        assert_eq!(code_of(&err), ErrorCode::NotARepo);
    }
}
