//! Typed confirmations for destructive commands.

use std::io::{BufRead, IsTerminal, Write};

use anyhow::{Context, Result};

use crate::error::{CodedError, ErrorCode};

pub trait Prompter {
    /// Whether a human can answer prompts (stdin and stderr are terminals).
    fn is_interactive(&self) -> bool;

    /// Show `prompt` and read one line of input, without the trailing newline.
    fn ask(&self, prompt: &str) -> Result<String>;
}

/// Prompts on stderr and reads from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct TtyPrompter;

impl Prompter for TtyPrompter {
    fn is_interactive(&self) -> bool {
        std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
    }

    fn ask(&self, prompt: &str) -> Result<String> {
        let mut stderr = std::io::stderr();
        write!(stderr, "{prompt}").context("write prompt")?;
        stderr.flush().context("flush prompt")?;
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("read confirmation")?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Require the user to type `word` before `action` proceeds.
///
/// `skip` (from `--yes`) bypasses the prompt entirely.
pub fn confirm_typed(prompter: &dyn Prompter, word: &str, action: &str, skip: bool) -> Result<()> {
    if skip {
        return Ok(());
    }
    if !prompter.is_interactive() {
        return Err(CodedError::new(
            ErrorCode::NotInteractive,
            format!("{action} needs confirmation but no terminal is attached"),
        )
        .with_hint("pass --yes to confirm non-interactively")
        .into());
    }
    let answer = prompter.ask(&format!("{action}: type '{word}' to proceed: "))?;
    if answer.trim() == word {
        Ok(())
    } else {
        Err(CodedError::new(ErrorCode::Aborted, format!("{action} aborted")).into())
    }
}
