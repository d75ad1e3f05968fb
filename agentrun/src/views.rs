//! Read-only views: `ls`, `show`, `events`. None of them take the lock.

use anyhow::Result;
use serde::Serialize;

use crate::context::RepoContext;
use crate::io::events::{EventLogContents, read_events};
use crate::io::run_store::{RunMeta, StoredRun};
use crate::select::select_run;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRow {
    pub run_id: String,
    pub name: Option<String>,
    pub status: &'static str,
    pub pr_number: Option<u64>,
    pub branch: Option<String>,
}

fn status_of(meta: &RunMeta) -> &'static str {
    if meta.is_archived() {
        if meta.merged_at.is_some() {
            "merged"
        } else {
            "archived"
        }
    } else if meta.merged_at.is_some() {
        "archive-incomplete"
    } else if meta.flags.setup_failed {
        "setup-failed"
    } else if meta.flags.needs_attention {
        "needs-attention"
    } else {
        "active"
    }
}

/// Runs of the repository, oldest first. Archived runs only with `all`.
pub fn list_rows(ctx: &RepoContext, all: bool) -> Result<Vec<RunRow>> {
    let rows = ctx
        .list_runs()?
        .into_iter()
        .filter_map(|run| match run {
            StoredRun::Valid(meta) if all || !meta.is_archived() => Some(RunRow {
                status: status_of(&meta),
                run_id: meta.run_id,
                name: meta.name,
                pr_number: meta.pr_number,
                branch: Some(meta.branch),
            }),
            StoredRun::Valid(_) => None,
            StoredRun::Broken { run_id, .. } => Some(RunRow {
                run_id,
                name: None,
                status: "broken",
                pr_number: None,
                branch: None,
            }),
        })
        .collect();
    Ok(rows)
}

/// One line per run: `<id>  <name>  <status>  <pr>`.
pub fn format_rows(rows: &[RunRow]) -> String {
    let mut out = String::new();
    for row in rows {
        let name = row.name.as_deref().unwrap_or("-");
        let pr = row
            .pr_number
            .map_or_else(|| "-".to_string(), |n| format!("#{n}"));
        out.push_str(&format!("{}  {:<20}  {:<18}  {}\n", row.run_id, name, row.status, pr));
    }
    out
}

pub fn show_run(ctx: &RepoContext, input: &str) -> Result<RunMeta> {
    select_run(ctx, input)
}

pub fn run_events(ctx: &RepoContext, input: &str) -> Result<EventLogContents> {
    let meta = select_run(ctx, input)?;
    read_events(&ctx.run_paths(&meta.run_id).events_path)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn ls_hides_archived_unless_all() {
        let repo = TestRepo::new();
        repo.seed_run("20260101000000-aaaa", Some("alpha"));
        let mut done = repo.seed_run("20260101000000-bbbb", None);
        done.merged_at = Some(done.created_at);
        done.archive.archived_at = Some(done.created_at);
        repo.save(&done);
        fs::create_dir_all(repo.ctx.run_paths("20260101000000-cccc").dir).expect("mkdir");

        let active = list_rows(&repo.ctx, false).expect("ls");
        let ids: Vec<&str> = active.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["20260101000000-aaaa", "20260101000000-cccc"]);
        assert_eq!(active[1].status, "broken");

        let all = list_rows(&repo.ctx, true).expect("ls --all");
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].status, "merged");
        assert!(format_rows(&all).contains("alpha"));
    }

    #[test]
    fn events_view_reads_log() {
        let repo = TestRepo::new();
        repo.seed_run("20260101000000-aaaa", None);
        let _ = repo
            .ctx
            .event_log("20260101000000-aaaa")
            .emit(chrono::Utc::now(), "run_created", serde_json::json!({}));
        let log = run_events(&repo.ctx, "20260101000000-aaaa").expect("events");
        assert_eq!(log.events.len(), 1);
        assert_eq!(log.skipped_lines, 0);
    }
}
