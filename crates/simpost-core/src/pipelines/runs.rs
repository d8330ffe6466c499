use crate::common::constants::{RUN_LOG_EXTENSION, RUN_RESULT_EXTENSION};
use crate::domain::{PipelineError, PipelineResult};
use crate::modules::discovery::list_matching;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The run wrote its `.res` file.
    Complete,
    /// A `.log` exists without a `.res`: the run was interrupted or is still going.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEntry {
    pub log: PathBuf,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLedger {
    pub entries: Vec<RunEntry>,
}

impl RunLedger {
    pub fn complete(&self) -> impl Iterator<Item = &RunEntry> {
        self.with_status(RunStatus::Complete)
    }

    pub fn stale(&self) -> impl Iterator<Item = &RunEntry> {
        self.with_status(RunStatus::Stale)
    }

    fn with_status(&self, status: RunStatus) -> impl Iterator<Item = &RunEntry> {
        self.entries.iter().filter(move |entry| entry.status == status)
    }

    pub fn render(&self) -> String {
        let mut lines = vec![format!(
            "runs: {} complete, {} stale",
            self.complete().count(),
            self.stale().count()
        )];
        lines.extend(
            self.stale()
                .map(|entry| format!("stale: {}", entry.log.display())),
        );
        lines.join("\n")
    }
}

/// Classifies every run log in `dir` by whether its result file exists.
pub fn scan_runs(dir: &Path) -> PipelineResult<RunLedger> {
    let logs = list_matching(dir, &format!("*.{}", RUN_LOG_EXTENSION))?;
    let entries = logs
        .into_iter()
        .map(|log| {
            let status = if log.with_extension(RUN_RESULT_EXTENSION).is_file() {
                RunStatus::Complete
            } else {
                RunStatus::Stale
            };
            RunEntry { log, status }
        })
        .collect();
    Ok(RunLedger { entries })
}

/// Deletes the logs of stale runs and returns the removed paths.
pub fn remove_stale(ledger: &RunLedger) -> PipelineResult<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for entry in ledger.stale() {
        match fs::remove_file(&entry.log) {
            Ok(()) => {
                info!(log = %entry.log.display(), "removed stale run log");
                removed.push(entry.log.clone());
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                warn!(log = %entry.log.display(), "stale run log already gone");
            }
            Err(error) => {
                return Err(PipelineError::io_system(
                    "IO.RUN_LOG_REMOVE",
                    format!("failed to remove '{}': {}", entry.log.display(), error),
                ));
            }
        }
    }
    Ok(removed)
}
