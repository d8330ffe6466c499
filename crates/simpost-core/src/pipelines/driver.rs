//! Per-group sequencing shared by every stage.
//!
//! A stage expands its discovered inputs into [`IndexTuple`]s, then runs one
//! independent unit of work per tuple. Tuples share no mutable state, so
//! [`run_groups`] may spread them over scoped worker threads. A failing tuple
//! is reported as abandoned and never stops its siblings.

use crate::common::GroupingPolicy;
use crate::domain::{
    ContributionCounts, ExecutionMode, GroupOutcome, GroupReport, IndexTuple, PipelineError,
    PipelineResult, SourceTag, StageReport,
};
use crate::modules::accumulator::VolumeAccumulator;
use crate::modules::discovery::DiscoveredFile;
use crate::modules::storage::VolumeStore;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverState {
    Discover,
    GroupByKey,
    Accumulate,
    Scale,
    Noise,
    Resample,
    PropagateMetadata,
    Done,
}

impl DriverState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::GroupByKey => "group-by-key",
            Self::Accumulate => "accumulate",
            Self::Scale => "scale",
            Self::Noise => "noise",
            Self::Resample => "resample",
            Self::PropagateMetadata => "propagate-metadata",
            Self::Done => "done",
        }
    }
}

impl Display for DriverState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Tracks where a group is in its state sequence so abandonment can say
/// which step failed.
#[derive(Debug)]
pub struct GroupProgress {
    group: String,
    state: DriverState,
    contributions: Option<ContributionCounts>,
}

impl GroupProgress {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            state: DriverState::Discover,
            contributions: None,
        }
    }

    /// Carried into the finished report whatever the outcome.
    pub fn record_contributions(&mut self, contributions: ContributionCounts) {
        self.contributions = Some(contributions);
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn advance(&mut self, state: DriverState) {
        debug!(group = %self.group, from = %self.state, to = %state, "group state");
        self.state = state;
    }

    pub fn finish(mut self, result: PipelineResult<GroupOutcome>) -> GroupReport {
        match result {
            Ok(outcome) => {
                match &outcome {
                    GroupOutcome::Skipped(reason) => {
                        warn!(group = %self.group, reason = %reason, "group skipped");
                    }
                    GroupOutcome::Insufficient { count } => {
                        warn!(
                            group = %self.group,
                            count,
                            "not enough contributions; no output generated"
                        );
                    }
                    GroupOutcome::Written(_) | GroupOutcome::Abandoned(_) => {}
                }
                self.advance(DriverState::Done);
                GroupReport::new(self.group, outcome).with_contributions(self.contributions)
            }
            Err(error) => {
                warn!(
                    group = %self.group,
                    state = %self.state,
                    error = %error.diagnostic_line(),
                    "group abandoned"
                );
                GroupReport::new(self.group, GroupOutcome::Abandoned(error))
                    .with_contributions(self.contributions)
            }
        }
    }
}

/// Contiguous window range spanning every discovered window. Windows inside
/// the range with no files still become groups and are reported as missing.
///
/// The range starts at the lowest discovered window, not at window 1, so a
/// batch simulated only for windows 3..=5 yields three groups and no missing
/// windows below 3. Gaps are reported only between the first and last window.
pub fn window_range(windows: &BTreeSet<u8>) -> Vec<u8> {
    match (windows.first(), windows.last()) {
        (Some(first), Some(last)) => (*first..=*last).collect(),
        _ => Vec::new(),
    }
}

pub fn index_tuples(files: &[DiscoveredFile], policy: GroupingPolicy) -> Vec<IndexTuple> {
    let windows: BTreeSet<u8> = files.iter().filter_map(|file| file.name.window).collect();
    let windows = window_range(&windows);
    match policy {
        GroupingPolicy::PerWindow => windows.into_iter().map(IndexTuple::window).collect(),
        GroupingPolicy::PerSource => {
            let sources: BTreeSet<Option<SourceTag>> =
                files.iter().map(|file| file.name.source.clone()).collect();
            windows
                .into_iter()
                .flat_map(|window| {
                    sources.iter().map(move |source| IndexTuple {
                        window: Some(window),
                        source: source.clone(),
                    })
                })
                .collect()
        }
    }
}

/// Files that belong to `tuple`. A tuple without a source takes every
/// radionuclide and VOI of its window.
pub fn files_for<'a>(files: &'a [DiscoveredFile], tuple: &IndexTuple) -> Vec<&'a DiscoveredFile> {
    files
        .iter()
        .filter(|file| tuple.window.is_none() || file.name.window == tuple.window)
        .filter(|file| tuple.source.is_none() || file.name.source == tuple.source)
        .collect()
}

pub fn missing_group_error(tuple: &IndexTuple, what: &str) -> PipelineError {
    PipelineError::group(
        "GROUP.MISSING_INPUT",
        format!("no {} found for {}", what, tuple),
    )
}

/// Sums every readable, same-shaped contribution. Unreadable or mismatched
/// files are logged and dropped. Returns the accumulator and the first
/// contributing path.
pub fn accumulate_contributions<'a, I>(
    store: &dyn VolumeStore,
    group: &str,
    paths: I,
) -> (VolumeAccumulator, Option<PathBuf>)
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut accumulator = VolumeAccumulator::new();
    let mut first = None;
    for path in paths {
        let volume = match store.read(path) {
            Ok(volume) => volume,
            Err(error) => {
                accumulator.reject();
                warn!(
                    group,
                    file = %path.display(),
                    error = %error.diagnostic_line(),
                    "skipping unreadable contribution"
                );
                continue;
            }
        };
        match accumulator.accumulate(&volume) {
            Ok(()) => {
                first.get_or_insert_with(|| path.to_path_buf());
            }
            Err(error) => warn!(
                group,
                file = %path.display(),
                error = %error.diagnostic_line(),
                "skipping contribution"
            ),
        }
    }
    (accumulator, first)
}

/// Runs `work` once per item and collects the reports in item order.
pub fn run_groups<T, F>(mode: ExecutionMode, items: &[T], work: F) -> Vec<GroupReport>
where
    T: Sync,
    F: Fn(&T) -> GroupReport + Sync,
{
    let workers = match mode {
        ExecutionMode::Serial => 1,
        ExecutionMode::Parallel(workers) => workers.clamp(1, items.len().max(1)),
    };
    if workers == 1 {
        return items.iter().map(&work).collect();
    }

    let next = AtomicUsize::new(0);
    let mut indexed: Vec<(usize, GroupReport)> = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(|| {
                    let mut done = Vec::new();
                    loop {
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        let Some(item) = items.get(index) else {
                            break;
                        };
                        done.push((index, work(item)));
                    }
                    done
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| match handle.join() {
                Ok(done) => done,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    });
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, report)| report).collect()
}

/// Turns a finished stage into its result. Groups abandoned for a reason
/// that stops the whole run (failed writes, internal faults) fail the stage.
pub fn finish_stage(report: StageReport) -> PipelineResult<StageReport> {
    let fatal = report.groups.iter().find_map(|group| match &group.outcome {
        GroupOutcome::Abandoned(error) if error.category().aborts_run() => Some(error.clone()),
        _ => None,
    });
    if let Some(error) = fatal {
        return Err(error);
    }
    info!(
        stage = %report.stage,
        groups = report.groups.len(),
        written = report.written().len(),
        abandoned = report.abandoned().len(),
        "stage finished"
    );
    Ok(report)
}
