//! Output-existence checks that make every stage resumable.

use crate::domain::{PipelineError, PipelineResult};
use crate::modules::storage::remove_volume;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CLAIM_SUFFIX: &str = ".claim";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Proceed,
    Skip,
}

/// Marker held while a group writes `output`. Removed on drop.
#[derive(Debug)]
pub struct OutputClaim {
    marker: Option<PathBuf>,
}

impl OutputClaim {
    pub fn marker(&self) -> Option<&Path> {
        self.marker.as_deref()
    }
}

impl Drop for OutputClaim {
    fn drop(&mut self) {
        if let Some(marker) = self.marker.take() {
            let _ = fs::remove_file(marker);
        }
    }
}

#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(OutputClaim),
    /// Another run holds the claim.
    Busy(PathBuf),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdempotencyGuard {
    exclusive_claims: bool,
}

impl IdempotencyGuard {
    pub fn new(exclusive_claims: bool) -> Self {
        Self { exclusive_claims }
    }

    pub fn exclusive_claims(&self) -> bool {
        self.exclusive_claims
    }

    pub fn check(&self, output: &Path) -> GuardDecision {
        if output.is_file() {
            debug!(output = %output.display(), "output exists");
            GuardDecision::Skip
        } else {
            GuardDecision::Proceed
        }
    }

    /// Removes an output that is always regenerated, with its header.
    pub fn clear_stale(&self, output: &Path) -> PipelineResult<bool> {
        let removed = remove_volume(output)?;
        if removed {
            info!(output = %output.display(), "removed stale output");
        }
        Ok(removed)
    }

    /// Fails when any output already exists; used in fresh-run mode before
    /// any group work starts.
    pub fn ensure_fresh<'a, I>(&self, outputs: I) -> PipelineResult<()>
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let existing: Vec<String> = outputs
            .into_iter()
            .filter(|path| path.exists())
            .map(|path| path.display().to_string())
            .collect();
        if existing.is_empty() {
            return Ok(());
        }
        Err(PipelineError::output_collision(
            "OUTPUT.EXISTS",
            format!(
                "{} output(s) already exist and a fresh run was requested: {}",
                existing.len(),
                existing.join(", ")
            ),
        ))
    }

    pub fn claim(&self, output: &Path) -> PipelineResult<ClaimOutcome> {
        if !self.exclusive_claims {
            return Ok(ClaimOutcome::Claimed(OutputClaim { marker: None }));
        }

        let marker = claim_path(output);
        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => Ok(ClaimOutcome::Claimed(OutputClaim {
                marker: Some(marker),
            })),
            Err(source) if source.kind() == ErrorKind::AlreadyExists => {
                Ok(ClaimOutcome::Busy(marker))
            }
            Err(source) => Err(PipelineError::io_system(
                "IO.CLAIM",
                format!("failed to create claim '{}': {}", marker.display(), source),
            )),
        }
    }
}

fn claim_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(CLAIM_SUFFIX);
    output.with_file_name(name)
}
