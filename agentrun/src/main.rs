//! `agentrun` command-line entry point.
//!
//! Each subcommand prints one success line on stdout. Failures print
//! `<code>: <message>` (plus an optional `hint:` line) on stderr and exit with
//! a code from [`agentrun::exit_codes`].

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use agentrun::archive::ArchiveResult;
use agentrun::clean::{CleanOptions, run_clean};
use agentrun::context::RepoContext;
use agentrun::core::retry::{Clock, Deadline};
use agentrun::core::types::MergeStrategy;
use agentrun::error::{CodedError, ErrorCode, find_coded};
use agentrun::exit_codes;
use agentrun::io::clock::{RandJitter, SystemClock, ThreadSleeper};
use agentrun::io::config::{UserConfig, load_user_config, user_config_path};
use agentrun::io::interact::TtyPrompter;
use agentrun::io::paths::DataPaths;
use agentrun::io::process::SystemProcessRunner;
use agentrun::logging;
use agentrun::merge::{MergeOptions, run_merge};
use agentrun::new_run::{NewOptions, run_new};
use agentrun::push::{PushOptions, run_push};
use agentrun::runtime::Runtime;
use agentrun::session::{
    AttachOptions, SessionEnsure, SessionOutcome, run_kill, run_restart, run_resume, run_stop,
};
use agentrun::verify::run_verify;
use agentrun::views::{format_rows, list_rows, run_events, show_run};

#[derive(Parser)]
#[command(
    name = "agentrun",
    version,
    about = "Run AI coding agents in isolated git worktrees and tmux sessions"
)]
struct Cli {
    /// Overall time budget for this command, in seconds.
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a run: branch, worktree, and agent session.
    New {
        #[arg(long)]
        name: Option<String>,
        /// Branch to fork from (default: user config, then the current branch).
        #[arg(long)]
        parent: Option<String>,
        /// Command started in the session.
        #[arg(long)]
        runner: Option<String>,
        #[arg(long)]
        no_session: bool,
        /// Do not attach to the new session.
        #[arg(long)]
        detached: bool,
    },
    /// List runs.
    Ls {
        /// Include archived runs.
        #[arg(long)]
        all: bool,
    },
    /// Print a run's metadata as JSON.
    Show { run: String },
    /// Print a run's event log.
    Events { run: String },
    /// Run the repository's verify script in the run's worktree.
    Verify { run: String },
    /// Push the run's branch and create or update its pull request.
    Push {
        run: String,
        /// Push without a valid report.
        #[arg(long)]
        force: bool,
    },
    /// Merge the run's pull request, then archive the run.
    Merge {
        run: String,
        #[arg(long, value_enum)]
        strategy: Option<MergeStrategy>,
        #[arg(long)]
        skip_verify: bool,
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        delete_branch: bool,
    },
    /// Archive a run without merging.
    Clean {
        run: String,
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        delete_branch: bool,
    },
    /// Ensure the run's session exists and attach to it.
    Resume {
        run: String,
        #[arg(long)]
        detached: bool,
    },
    /// Kill and recreate the run's session.
    Restart {
        run: String,
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        detached: bool,
    },
    /// Interrupt the agent (Ctrl-C) and flag the run for attention.
    Stop { run: String },
    /// Kill the run's session.
    Kill { run: String },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        report_error(&err);
        std::process::exit(exit_codes::for_error(&err));
    }
}

fn report_error(err: &anyhow::Error) {
    match find_coded(err) {
        Some(coded) => {
            eprintln!("{}: {err:#}", coded.code);
            if let Some(hint) = coded.hint() {
                eprintln!("hint: {hint}");
            }
        }
        None => eprintln!("{}: {err:#}", ErrorCode::Internal),
    }
}

fn load_config() -> Result<UserConfig> {
    let Some(path) = user_config_path() else {
        return Ok(UserConfig::default());
    };
    load_user_config(&path)
        .map_err(|err| CodedError::new(ErrorCode::Usage, format!("{err:#}")).into())
}

fn run(cli: Cli) -> Result<()> {
    let user_config = load_config()?;
    let data = DataPaths::from_env()?;
    let cwd = std::env::current_dir().context("read current directory")?;

    let process = SystemProcessRunner;
    let clock = SystemClock;
    let budget = cli
        .timeout
        .map(Duration::from_secs)
        .or_else(|| user_config.command_timeout());
    let rt = Runtime {
        process: &process,
        clock: &clock,
        sleeper: &ThreadSleeper,
        jitter: &RandJitter,
        prompter: &TtyPrompter,
        deadline: budget.map_or_else(Deadline::none, |b| Deadline::after(clock.instant(), b)),
    };

    let ctx = RepoContext::load(&rt, &cwd, data, user_config)?;
    dispatch(&rt, &ctx, cli.command)
}

fn dispatch(rt: &Runtime<'_>, ctx: &RepoContext, command: Command) -> Result<()> {
    match command {
        Command::New {
            name,
            parent,
            runner,
            no_session,
            detached,
        } => {
            let opts = NewOptions {
                name,
                parent,
                runner,
                no_session,
                detached,
                inside_tmux: None,
            };
            let outcome = run_new(rt, ctx, &opts)?;
            let session = if outcome.session_started {
                outcome.meta.tmux_session.as_str()
            } else {
                "no session"
            };
            println!(
                "created {} on {} ({}) at {}",
                outcome.meta.label(),
                outcome.meta.branch,
                session,
                outcome.meta.worktree_path.display()
            );
        }
        Command::Ls { all } => {
            let rows = list_rows(ctx, all)?;
            if rows.is_empty() {
                println!("no runs");
            } else {
                print!("{}", format_rows(&rows));
            }
        }
        Command::Show { run } => {
            let meta = show_run(ctx, &run)?;
            println!("{}", serde_json::to_string(&meta).context("serialize run")?);
        }
        Command::Events { run } => {
            let log = run_events(ctx, &run)?;
            for record in &log.events {
                println!("{}", serde_json::to_string(record).context("serialize event")?);
            }
            if log.skipped_lines > 0 {
                eprintln!("warning: skipped {} unreadable event lines", log.skipped_lines);
            }
        }
        Command::Verify { run } => {
            let record = run_verify(rt, ctx, &run)?;
            println!("verify passed: {}", record.summary);
        }
        Command::Push { run, force } => {
            let outcome = run_push(rt, ctx, &run, PushOptions { force })?;
            let action = if outcome.created { "created" } else { "updated" };
            println!(
                "pushed {}; {action} PR #{} {}",
                outcome.run_id, outcome.pr_number, outcome.pr_url
            );
        }
        Command::Merge {
            run,
            strategy,
            skip_verify,
            yes,
            delete_branch,
        } => {
            let opts = MergeOptions {
                strategy,
                skip_verify,
                yes,
                delete_branch,
            };
            let outcome = run_merge(rt, ctx, &run, opts)?;
            let pr = outcome
                .pr_number
                .map_or_else(|| "PR".to_string(), |n| format!("PR #{n}"));
            match (&outcome.archive, outcome.already_merged) {
                (ArchiveResult::AlreadyArchived, _) => {
                    println!("{} already merged and archived", outcome.run_id);
                }
                (_, true) => println!("{pr} was already merged; archived {}", outcome.run_id),
                (_, false) => println!("merged {pr}; archived {}", outcome.run_id),
            }
        }
        Command::Clean {
            run,
            yes,
            delete_branch,
        } => {
            let outcome = run_clean(rt, ctx, &run, CleanOptions { yes, delete_branch })?;
            match outcome.archive {
                ArchiveResult::AlreadyArchived => println!("{} already archived", outcome.run_id),
                ArchiveResult::Completed(_) => println!("archived {}", outcome.run_id),
            }
        }
        Command::Resume { run, detached } => {
            let outcome = run_resume(rt, ctx, &run, attach(detached))?;
            print_session(&outcome);
        }
        Command::Restart { run, yes, detached } => {
            let outcome = run_restart(rt, ctx, &run, yes, attach(detached))?;
            print_session(&outcome);
        }
        Command::Stop { run } => {
            let meta = run_stop(rt, ctx, &run)?;
            println!("interrupted {}; run needs attention", meta.tmux_session);
        }
        Command::Kill { run } => {
            let meta = run_kill(rt, ctx, &run)?;
            println!("killed {}", meta.tmux_session);
        }
    }
    Ok(())
}

fn attach(detached: bool) -> AttachOptions {
    AttachOptions {
        detached,
        inside_tmux: None,
    }
}

fn print_session(outcome: &SessionOutcome) {
    let state = match outcome.ensure {
        SessionEnsure::AlreadyRunning | SessionEnsure::AppearedUnderLock => "running",
        SessionEnsure::Created => "started",
    };
    println!("session {} {state} for {}", outcome.session, outcome.run_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_merge_flags() {
        let cli = Cli::parse_from([
            "agentrun",
            "merge",
            "alpha",
            "--strategy",
            "rebase",
            "--yes",
            "--timeout",
            "30",
        ]);
        assert_eq!(cli.timeout, Some(30));
        match cli.command {
            Command::Merge {
                run,
                strategy,
                yes,
                skip_verify,
                delete_branch,
            } => {
                assert_eq!(run, "alpha");
                assert_eq!(strategy, Some(MergeStrategy::Rebase));
                assert!(yes);
                assert!(!skip_verify && !delete_branch);
            }
            _ => panic!("expected merge"),
        }
    }

    #[test]
    fn parse_new_defaults() {
        let cli = Cli::parse_from(["agentrun", "new", "--name", "fix-login"]);
        assert!(matches!(
            cli.command,
            Command::New {
                name: Some(_),
                parent: None,
                runner: None,
                no_session: false,
                detached: false,
            }
        ));
    }

    #[test]
    fn push_requires_a_run() {
        assert!(Cli::try_parse_from(["agentrun", "push"]).is_err());
    }
}
