//! Run identifier resolution.
//!
//! Users refer to runs by name, full id, or id prefix. Resolution is tiered:
//!
//! 1. exact name among active runs (not archived, not broken),
//! 2. exact run id (any run, including archived and broken ones),
//! 3. unique run id prefix.
//!
//! The first tier with any match decides; two or more matches at that tier is
//! ambiguous. Broken runs have no readable metadata, so they never match by name.

use crate::error::{CodedError, ErrorCode};

/// Minimal view of a stored run for resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRef {
    pub run_id: String,
    pub name: Option<String>,
    pub archived: bool,
    pub broken: bool,
}

impl RunRef {
    pub fn is_active(&self) -> bool {
        !self.archived && !self.broken
    }
}

pub fn resolve_run<'a>(input: &str, runs: &'a [RunRef]) -> Result<&'a RunRef, CodedError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CodedError::new(ErrorCode::Usage, "run identifier is empty")
            .with_hint("agentrun ls"));
    }

    let by_name: Vec<&RunRef> = runs
        .iter()
        .filter(|run| run.is_active() && run.name.as_deref() == Some(input))
        .collect();
    if let Some(found) = single_or_ambiguous(input, by_name)? {
        return Ok(found);
    }

    let by_id: Vec<&RunRef> = runs.iter().filter(|run| run.run_id == input).collect();
    if let Some(found) = single_or_ambiguous(input, by_id)? {
        return Ok(found);
    }

    let by_prefix: Vec<&RunRef> = runs
        .iter()
        .filter(|run| run.run_id.starts_with(input))
        .collect();
    if let Some(found) = single_or_ambiguous(input, by_prefix)? {
        return Ok(found);
    }

    Err(
        CodedError::new(ErrorCode::RunNotFound, format!("no run matches '{input}'"))
            .with_detail("input", input)
            .with_hint("agentrun ls --all"),
    )
}

fn single_or_ambiguous<'a>(
    input: &str,
    mut matches: Vec<&'a RunRef>,
) -> Result<Option<&'a RunRef>, CodedError> {
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        _ => {
            let mut ids: Vec<&str> = matches.iter().map(|run| run.run_id.as_str()).collect();
            ids.sort_unstable();
            Err(CodedError::new(
                ErrorCode::RunAmbiguous,
                format!("'{input}' matches {} runs: {}", ids.len(), ids.join(", ")),
            )
            .with_detail("candidates", ids.join(","))
            .with_hint("use a longer id prefix"))
        }
    }
}
