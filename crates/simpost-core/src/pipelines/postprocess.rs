//! Projection post-processing, per window:
//!
//! ```text
//! sim*wNN.avg.im ──sum──▶ combined.avg.wNN.im ──scale──▶ prj.nf.avg.wNN.im
//!                                                        │
//!                                    noise (regenerated) ▼
//!                                                  prj.n.avg.wNN.im
//! ```
//!
//! Both projection files are then collapsed onto the canonical grid as
//! `collapsed.<name>` with summation semantics.

use super::PipelineContext;
use super::driver::{
    DriverState, GroupProgress, accumulate_contributions, files_for, finish_stage, index_tuples,
    missing_group_error, run_groups,
};
use crate::common::constants::{
    AVERAGE_TAG, COLLAPSED_PREFIX, COMBINED_PREFIX, IMAGE_EXTENSION, NOISE_FREE_PREFIX,
    NOISY_PREFIX,
};
use crate::domain::{
    GroupOutcome, IndexTuple, PipelineError, PipelineResult, PipelineStage, StageReport,
    WideVolume,
};
use crate::modules::accumulator::FinalizeMode;
use crate::modules::discovery::{DiscoveredFile, select_windowed_family};
use crate::modules::external::CollapseMode;
use crate::modules::guard::{ClaimOutcome, GuardDecision};
use crate::modules::metadata;
use crate::modules::noise::inject_noise;
use crate::modules::resample::{ResampleAxes, ResampleRequest, resample_to_canonical};
use crate::modules::scaling::{ScaleFactor, scale};
use std::path::{Path, PathBuf};
use tracing::info;

/// Output paths of one post-processing group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionOutputs {
    pub summed: PathBuf,
    pub noise_free: PathBuf,
    pub noisy: PathBuf,
    pub collapsed_noise_free: PathBuf,
    pub collapsed_noisy: PathBuf,
}

impl ProjectionOutputs {
    pub fn for_tuple(dir: &Path, tuple: &IndexTuple) -> Self {
        let name = |prefix: &str| projection_name(prefix, tuple);
        let collapsed = |prefix: &str| format!("{}{}", COLLAPSED_PREFIX, name(prefix));
        Self {
            summed: dir.join(name(COMBINED_PREFIX)),
            noise_free: dir.join(name(NOISE_FREE_PREFIX)),
            noisy: dir.join(name(NOISY_PREFIX)),
            collapsed_noise_free: dir.join(collapsed(NOISE_FREE_PREFIX)),
            collapsed_noisy: dir.join(collapsed(NOISY_PREFIX)),
        }
    }
}

/// `<prefix>[_<source>].avg.wNN.im`
pub fn projection_name(prefix: &str, tuple: &IndexTuple) -> String {
    let source = tuple
        .source
        .as_ref()
        .map(|source| format!("_{}", source))
        .unwrap_or_default();
    format!(
        "{}{}.{}.w{}.{}",
        prefix,
        source,
        AVERAGE_TAG,
        tuple.window_text().unwrap_or_default(),
        IMAGE_EXTENSION
    )
}

pub fn run_postprocess(
    context: &PipelineContext,
    factor: ScaleFactor,
) -> PipelineResult<StageReport> {
    let factor = factor.value()?;
    let config = context.config();
    let discovery =
        select_windowed_family(context.dir(), &config.simulation_prefix, IMAGE_EXTENSION)?;
    if discovery.is_empty() {
        return Err(PipelineError::configuration(
            "CONFIG.NO_INPUTS",
            format!(
                "no simulation images matching '{}*w??.{}' in '{}'",
                config.simulation_prefix,
                IMAGE_EXTENSION,
                context.dir().display()
            ),
        ));
    }

    let tuples = index_tuples(&discovery.files, config.grouping);
    let outputs: Vec<PathBuf> = tuples
        .iter()
        .flat_map(|tuple| {
            let outputs = ProjectionOutputs::for_tuple(context.dir(), tuple);
            [outputs.summed, outputs.noise_free, outputs.noisy]
        })
        .collect();
    context.check_fresh(outputs.iter())?;

    let reports = run_groups(context.mode(), &tuples, |tuple| {
        let mut progress = GroupProgress::new(tuple.to_string());
        let result = process_group(context, &discovery.files, tuple, factor, &mut progress);
        progress.finish(result)
    });

    let mut report = StageReport::new(PipelineStage::Postprocess);
    reports.into_iter().for_each(|group| report.push(group));
    finish_stage(report)
}

fn process_group(
    context: &PipelineContext,
    files: &[DiscoveredFile],
    tuple: &IndexTuple,
    factor: f64,
    progress: &mut GroupProgress,
) -> PipelineResult<GroupOutcome> {
    let outputs = ProjectionOutputs::for_tuple(context.dir(), tuple);
    let guard = context.guard();
    let store = context.store();
    let operations = context.operations();
    let _claim = match guard.claim(&outputs.noisy)? {
        ClaimOutcome::Claimed(claim) => claim,
        ClaimOutcome::Busy(marker) => {
            return Ok(GroupOutcome::Skipped(format!(
                "claimed by another run ({})",
                marker.display()
            )));
        }
    };
    let mut written = Vec::new();

    progress.advance(DriverState::GroupByKey);
    let members = files_for(files, tuple);
    if members.is_empty() {
        return Err(missing_group_error(tuple, "simulation images"));
    }

    let summed_exists = guard.check(&outputs.summed) == GuardDecision::Skip;
    let noise_free_exists = guard.check(&outputs.noise_free) == GuardDecision::Skip;
    if !(summed_exists && noise_free_exists) {
        let summed = if summed_exists {
            store.read(&outputs.summed)?.to_wide()
        } else {
            progress.advance(DriverState::Accumulate);
            let summed = sum_members(context, tuple, &members)?;
            written.push(outputs.summed.clone());
            summed
        };

        if !noise_free_exists {
            progress.advance(DriverState::Scale);
            store.write(&scale(&summed, factor).to_single(), &outputs.noise_free)?;
            metadata::propagate(operations, &outputs.summed, &outputs.noise_free)?;
            info!(output = %outputs.noise_free.display(), factor, "wrote noise-free projections");
            written.push(outputs.noise_free.clone());
        }
    }

    progress.advance(DriverState::Noise);
    inject_noise(store, operations, guard, &outputs.noise_free, &outputs.noisy)?;
    written.push(outputs.noisy.clone());

    progress.advance(DriverState::Resample);
    let canonical = context.config().canonical_size;
    if guard.check(&outputs.collapsed_noise_free) == GuardDecision::Proceed
        && resample_to_canonical(
            store,
            operations,
            ResampleRequest {
                input: &outputs.noise_free,
                output: &outputs.collapsed_noise_free,
                axes: ResampleAxes::InPlane,
                mode: CollapseMode::Sum,
                canonical,
            },
        )?
        .is_some()
    {
        written.push(outputs.collapsed_noise_free.clone());
    }
    // follows the regenerated noisy projections
    guard.clear_stale(&outputs.collapsed_noisy)?;
    if resample_to_canonical(
        store,
        operations,
        ResampleRequest {
            input: &outputs.noisy,
            output: &outputs.collapsed_noisy,
            axes: ResampleAxes::InPlane,
            mode: CollapseMode::Sum,
            canonical,
        },
    )?
    .is_some()
    {
        written.push(outputs.collapsed_noisy.clone());
    }

    progress.advance(DriverState::PropagateMetadata);
    Ok(GroupOutcome::Written(written))
}

fn sum_members(
    context: &PipelineContext,
    tuple: &IndexTuple,
    members: &[&DiscoveredFile],
) -> PipelineResult<WideVolume> {
    let outputs = ProjectionOutputs::for_tuple(context.dir(), tuple);
    let group = tuple.to_string();
    let (accumulator, first) = accumulate_contributions(
        context.store(),
        &group,
        members.iter().map(|file| file.path.as_path()),
    );
    let count = accumulator.count();
    let (Some(summed), Some(first)) = (accumulator.finalize_wide(FinalizeMode::Sum), first)
    else {
        return Err(PipelineError::group(
            "GROUP.NO_CONTRIBUTIONS",
            format!("none of the {} image(s) for {} could be summed", members.len(), tuple),
        ));
    };

    context.store().write(&summed.to_single(), &outputs.summed)?;
    metadata::propagate(context.operations(), &first, &outputs.summed)?;
    info!(output = %outputs.summed.display(), count, "wrote summed projections");
    Ok(summed)
}
