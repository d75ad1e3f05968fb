//! Test-only fakes and fixtures: scripted processes, fixed time, recorded
//! sleeps, scripted prompts, and a temp-dir repository context.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use crate::context::RepoContext;
use crate::core::identity::{branch_name, session_name};
use crate::core::retry::{Clock, Deadline, JitterSource, Sleeper};
use crate::io::config::{RepoConfig, UserConfig};
use crate::io::events::{EventRecord, read_events};
use crate::io::interact::Prompter;
use crate::io::paths::{DataPaths, report_path};
use crate::io::process::{ProcOutput, ProcSpec, ProcessRunner};
use crate::io::repo::RepoInfo;
use crate::io::run_store::{
    ArchiveState, RUN_SCHEMA_VERSION, RunFlags, RunMeta, load_run_meta, write_run_meta,
};
use crate::runtime::Runtime;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 2026-01-01T00:00:00Z.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

struct Rule {
    prefix: String,
    responses: VecDeque<ProcOutput>,
}

/// Process runner answering from rules keyed by command-line prefix.
///
/// The longest matching prefix wins. Several `on` calls with the same prefix
/// queue answers in order; the last one repeats. Unmatched commands fail.
pub struct ScriptedProcess {
    rules: Mutex<Vec<Rule>>,
    missing_tools: Vec<String>,
    calls: Mutex<Vec<ProcSpec>>,
}

impl Default for ScriptedProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProcess {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            missing_tools: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, prefix: &str, output: ProcOutput) -> Self {
        {
            let mut rules = locked(&self.rules);
            match rules.iter_mut().find(|rule| rule.prefix == prefix) {
                Some(rule) => rule.responses.push_back(output),
                None => rules.push(Rule {
                    prefix: prefix.to_string(),
                    responses: VecDeque::from([output]),
                }),
            }
        }
        self
    }

    /// Make `look_path(name)` report the tool as not installed.
    pub fn without_tool(mut self, name: &str) -> Self {
        self.missing_tools.push(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ProcSpec> {
        locked(&self.calls).clone()
    }

    pub fn call_lines(&self) -> Vec<String> {
        self.calls().iter().map(ProcSpec::command_line).collect()
    }
}

impl ProcessRunner for ScriptedProcess {
    fn run(&self, spec: &ProcSpec) -> Result<ProcOutput> {
        locked(&self.calls).push(spec.clone());
        let line = spec.command_line();
        let mut rules = locked(&self.rules);
        let rule = rules
            .iter_mut()
            .filter(|rule| line.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
            .ok_or_else(|| anyhow!("unscripted command: {line}"))?;
        let output = if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        };
        output.ok_or_else(|| anyhow!("no scripted output for: {line}"))
    }

    fn run_interactive(&self, spec: &ProcSpec) -> Result<i32> {
        locked(&self.calls).push(spec.clone());
        Ok(0)
    }

    fn look_path(&self, name: &str) -> Option<PathBuf> {
        if self.missing_tools.iter().any(|tool| tool == name) {
            return None;
        }
        Some(PathBuf::from("/usr/bin").join(name))
    }
}

pub fn ok(stdout: &str) -> ProcOutput {
    ProcOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(0),
        timed_out: false,
    }
}

pub fn fail(code: i32, stderr: &str) -> ProcOutput {
    ProcOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: Some(code),
        timed_out: false,
    }
}

pub fn timed_out() -> ProcOutput {
    ProcOutput {
        timed_out: true,
        ..ProcOutput::default()
    }
}

/// `gh --json` output for one PR (not a draft, mergeable).
pub fn pr_json(number: u64, state: &str, head: &str) -> String {
    pr_json_with(number, state, head, false, "MERGEABLE")
}

pub fn pr_json_with(number: u64, state: &str, head: &str, draft: bool, mergeable: &str) -> String {
    serde_json::json!({
        "number": number,
        "url": format!("https://github.com/o/r/pull/{number}"),
        "state": state,
        "isDraft": draft,
        "mergeable": mergeable,
        "headRefName": head,
    })
    .to_string()
}

/// Clock frozen at [`fixed_now`] and the instant of construction.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    pub now: DateTime<Utc>,
    pub instant: Instant,
}

impl Default for FixedClock {
    fn default() -> Self {
        Self {
            now: fixed_now(),
            instant: Instant::now(),
        }
    }
}

impl FixedClock {
    pub fn instant(&self) -> Instant {
        self.instant
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn instant(&self) -> Instant {
        self.instant
    }
}

/// Records requested sleeps without sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        locked(&self.slept).clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        locked(&self.slept).push(duration);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

/// Prompter with canned answers. The default is non-interactive.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    interactive: bool,
    answers: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn non_interactive() -> Self {
        Self::default()
    }

    pub fn answering<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            interactive: true,
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        locked(&self.prompts).clone()
    }
}

impl Prompter for ScriptedPrompter {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn ask(&self, prompt: &str) -> Result<String> {
        locked(&self.prompts).push(prompt.to_string());
        locked(&self.answers)
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted answer for prompt: {prompt}"))
    }
}

/// Everything a [`Runtime`] needs besides the process runner.
#[derive(Debug, Default)]
pub struct Fakes {
    pub clock: FixedClock,
    pub sleeper: RecordingSleeper,
    pub jitter: FixedJitter,
    pub prompter: ScriptedPrompter,
}

impl Fakes {
    /// Runtime without a deadline.
    pub fn runtime<'a>(&'a self, process: &'a ScriptedProcess) -> Runtime<'a> {
        Runtime {
            process,
            clock: &self.clock,
            sleeper: &self.sleeper,
            jitter: &self.jitter,
            prompter: &self.prompter,
            deadline: Deadline::none(),
        }
    }
}

/// Run metadata with deterministic fields and no PR, verify, or archive state.
pub fn sample_meta(run_id: &str, name: Option<&str>) -> RunMeta {
    RunMeta {
        schema_version: RUN_SCHEMA_VERSION,
        run_id: run_id.to_string(),
        repo_id: "r1".to_string(),
        name: name.map(str::to_string),
        runner: "claude".to_string(),
        parent_branch: "main".to_string(),
        branch: branch_name(run_id),
        worktree_path: PathBuf::from("/tmp/agentrun-test/worktrees").join(run_id),
        tmux_session: session_name(run_id),
        created_at: fixed_now(),
        pr_number: None,
        pr_url: None,
        last_push_at: None,
        last_report_hash: None,
        merged_at: None,
        verify: None,
        archive: ArchiveState::default(),
        flags: RunFlags::default(),
        extra: Default::default(),
    }
}

/// A repository context rooted in a temp dir.
///
/// Nothing here is a real git repository; git, gh, and tmux are always
/// scripted. The repo id is `r1` and `origin` points at GitHub.
pub struct TestRepo {
    pub temp: TempDir,
    pub ctx: RepoContext,
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("repo");
        let common_dir = root.join(".git");
        fs::create_dir_all(&common_dir).expect("create repo");
        let ctx = RepoContext {
            repo: RepoInfo {
                root,
                common_dir,
                origin_url: Some("git@github.com:o/r.git".to_string()),
                repo_id: "r1".to_string(),
            },
            data: DataPaths::new(temp.path().join("data")),
            repo_config: RepoConfig::default(),
            user_config: UserConfig::default(),
        };
        Self { temp, ctx }
    }

    /// Store a run and create its worktree directory.
    pub fn seed_run(&self, run_id: &str, name: Option<&str>) -> RunMeta {
        let mut meta = sample_meta(run_id, name);
        meta.repo_id = self.ctx.repo_id().to_string();
        meta.worktree_path = self.ctx.worktree_path(run_id);
        fs::create_dir_all(&meta.worktree_path).expect("create worktree");
        self.save(&meta);
        meta
    }

    pub fn save(&self, meta: &RunMeta) {
        write_run_meta(&self.ctx.run_paths(&meta.run_id).meta_path, meta).expect("write meta");
    }

    pub fn load(&self, run_id: &str) -> RunMeta {
        load_run_meta(&self.ctx.run_paths(run_id).meta_path).expect("load meta")
    }

    pub fn write_report(&self, run_id: &str, contents: &str) {
        let path = report_path(&self.ctx.worktree_path(run_id));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create report dir");
        }
        fs::write(&path, contents).expect("write report");
    }

    pub fn events(&self, run_id: &str) -> Vec<EventRecord> {
        read_events(&self.ctx.run_paths(run_id).events_path)
            .expect("read events")
            .events
    }

    pub fn event_names(&self, run_id: &str) -> Vec<String> {
        self.events(run_id).into_iter().map(|e| e.event).collect()
    }
}
