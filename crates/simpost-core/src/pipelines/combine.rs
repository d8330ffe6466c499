//! Per-window combination of every simulated source into one image through
//! the pairwise merge tree.

use super::PipelineContext;
use super::driver::{
    DriverState, GroupProgress, files_for, finish_stage, index_tuples, missing_group_error,
    run_groups,
};
use crate::common::constants::{AVERAGE_TAG, COMBINED_PREFIX, IMAGE_EXTENSION};
use crate::domain::{
    GroupOutcome, IndexTuple, PipelineError, PipelineResult, PipelineStage, StageReport,
    WideVolume,
};
use crate::modules::discovery::{DiscoveredFile, select_windowed_family};
use crate::modules::guard::{ClaimOutcome, GuardDecision};
use crate::modules::merge::{MergeOutcome, merge_pair, reduce_pairwise};
use crate::modules::metadata;
use crate::modules::storage::{VolumeStore, remove_volume, write_atomically};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Pending file or in-memory partial sum.
enum MergeOperand {
    Pending(PathBuf),
    Partial(WideVolume),
}

impl MergeOperand {
    fn load(self, store: &dyn VolumeStore) -> PipelineResult<WideVolume> {
        match self {
            Self::Pending(path) => store
                .read(&path)
                .map(|volume| volume.to_wide())
                .map_err(|error| {
                    PipelineError::group("GROUP.MERGE_INPUT", error.message().to_string())
                }),
            Self::Partial(volume) => Ok(volume),
        }
    }
}

/// Name of the combined image for `tuple`, e.g. `combined.w01.avg.im` or
/// `combined_Tc99m_liver.w01.avg.im`.
pub fn combined_name(tuple: &IndexTuple) -> String {
    let source = tuple
        .source
        .as_ref()
        .map(|source| format!("_{}", source))
        .unwrap_or_default();
    format!(
        "{}{}.w{}.{}.{}",
        COMBINED_PREFIX,
        source,
        tuple.window_text().unwrap_or_default(),
        AVERAGE_TAG,
        IMAGE_EXTENSION
    )
}

pub fn run_combine(context: &PipelineContext) -> PipelineResult<StageReport> {
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
        .map(|tuple| context.path(&combined_name(tuple)))
        .collect();
    context.check_fresh(outputs.iter())?;

    let reports = run_groups(context.mode(), &tuples, |tuple| {
        let mut progress = GroupProgress::new(tuple.to_string());
        let result = combine_group(context, &discovery.files, tuple, &mut progress);
        progress.finish(result)
    });

    let mut report = StageReport::new(PipelineStage::Combine);
    reports.into_iter().for_each(|group| report.push(group));
    finish_stage(report)
}

fn combine_group(
    context: &PipelineContext,
    files: &[DiscoveredFile],
    tuple: &IndexTuple,
    progress: &mut GroupProgress,
) -> PipelineResult<GroupOutcome> {
    let output = context.path(&combined_name(tuple));
    if context.guard().check(&output) == GuardDecision::Skip {
        return Ok(GroupOutcome::Skipped(format!("{} exists", output.display())));
    }
    let _claim = match context.guard().claim(&output)? {
        ClaimOutcome::Claimed(claim) => claim,
        ClaimOutcome::Busy(marker) => {
            return Ok(GroupOutcome::Skipped(format!(
                "claimed by another run ({})",
                marker.display()
            )));
        }
    };

    progress.advance(DriverState::GroupByKey);
    let members: Vec<PathBuf> = files_for(files, tuple)
        .into_iter()
        .map(|file| file.path.clone())
        .collect();
    let Some(header_source) = members.first().cloned() else {
        return Err(missing_group_error(tuple, "simulation images"));
    };

    progress.advance(DriverState::Accumulate);
    let store = context.store();
    let operands: Vec<MergeOperand> = members.into_iter().map(MergeOperand::Pending).collect();
    let outcome = reduce_pairwise(operands, |left, right, step| {
        debug!(
            group = %tuple,
            round = step.round,
            pair = step.pair,
            is_final = step.is_final,
            "merging pair"
        );
        let left = left.load(store)?;
        let right = right.load(store)?;
        Ok::<_, PipelineError>(MergeOperand::Partial(merge_pair(left, &right)?))
    })?;

    match outcome {
        MergeOutcome::Empty => return Err(missing_group_error(tuple, "simulation images")),
        MergeOutcome::Single(MergeOperand::Pending(path)) => {
            copy_single(&path, &output)?;
            info!(output = %output.display(), "single image copied as combined output");
        }
        MergeOutcome::Single(MergeOperand::Partial(volume))
        | MergeOutcome::Merged {
            value: MergeOperand::Partial(volume),
            ..
        } => {
            store.write(&volume.to_single(), &output)?;
            info!(output = %output.display(), "wrote combined image");
        }
        MergeOutcome::Merged {
            value: MergeOperand::Pending(path),
            ..
        } => copy_single(&path, &output)?,
    }

    progress.advance(DriverState::PropagateMetadata);
    if let Err(error) = metadata::propagate(context.operations(), &header_source, &output) {
        // an output without its header would be skipped on the next run
        remove_volume(&output)?;
        return Err(error);
    }
    Ok(GroupOutcome::Written(vec![output]))
}

fn copy_single(source: &Path, output: &Path) -> PipelineResult<()> {
    let bytes = fs::read(source).map_err(|error| {
        PipelineError::group(
            "GROUP.MERGE_INPUT",
            format!("failed to read '{}': {}", source.display(), error),
        )
    })?;
    write_atomically(output, &bytes)
}

#[cfg(test)]
mod tests {
    use super::{combined_name, run_combine};
    use crate::common::{GroupingPolicy, PipelineConfig};
    use crate::domain::{ErrorCategory, GroupOutcome, Header, IndexTuple, SourceTag, Volume};
    use crate::modules::storage::{
        RawVolumeStore, VolumeStore, header_path, read_header, write_header,
    };
    use crate::pipelines::PipelineContext;
    use std::path::Path;
    use tempfile::TempDir;

    fn image(dir: &Path, name: &str, value: f32) {
        RawVolumeStore
            .write(&Volume::filled(vec![3, 4], value), &dir.join(name))
            .expect("image");
    }

    #[test]
    fn combined_names_follow_window_and_source() {
        assert_eq!(combined_name(&IndexTuple::window(1)), "combined.w01.avg.im");
        let tuple = IndexTuple {
            window: Some(12),
            source: Some(SourceTag {
                radionuclide: "Lu177".to_string(),
                voi: "kidney".to_string(),
            }),
        };
        assert_eq!(combined_name(&tuple), "combined_Lu177_kidney.w12.avg.im");
    }

    #[test]
    fn five_sources_merge_into_their_sum() {
        let temp = TempDir::new().expect("tempdir should be created");
        let dir = temp.path();
        for (index, voi) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            image(dir, &format!("sim_Tc99m_{}.w01.avg.im", voi), index as f32 + 1.0);
        }
        let mut header = Header::default();
        header.set("Modality", "NM");
        write_header(&dir.join("sim_Tc99m_a.w01.avg.im"), &header).expect("header");

        let context = PipelineContext::new(dir, PipelineConfig::default());
        let report = run_combine(&context).expect("combine");

        assert_eq!(report.written().len(), 1);
        let combined = RawVolumeStore
            .read(&dir.join("combined.w01.avg.im"))
            .expect("combined");
        assert!(combined.data().iter().all(|value| *value == 15.0));
        assert_eq!(
            read_header(&dir.join("combined.w01.avg.im"))
                .expect("header")
                .get("Modality"),
            Some("NM")
        );
    }

    #[test]
    fn single_image_window_is_copied() {
        let temp = TempDir::new().expect("tempdir should be created");
        let dir = temp.path();
        image(dir, "sim_Tc99m_liver.w01.avg.im", 7.0);

        let context = PipelineContext::new(dir, PipelineConfig::default());
        run_combine(&context).expect("combine");

        let source = std::fs::read(dir.join("sim_Tc99m_liver.w01.avg.im")).expect("source");
        let copy = std::fs::read(dir.join("combined.w01.avg.im")).expect("copy");
        assert_eq!(source, copy);
    }

    #[test]
    fn missing_window_is_abandoned_but_siblings_complete() {
        let temp = TempDir::new().expect("tempdir should be created");
        let dir = temp.path();
        image(dir, "sim_Tc99m_liver.w01.avg.im", 1.0);
        image(dir, "sim_Tc99m_liver.w03.avg.im", 1.0);

        let context = PipelineContext::new(dir, PipelineConfig::default());
        let report = run_combine(&context).expect("combine");

        assert_eq!(report.groups.len(), 3);
        assert_eq!(report.written().len(), 2);
        let abandoned = report.abandoned();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].group, "w02");
        match &abandoned[0].outcome {
            GroupOutcome::Abandoned(error) => {
                assert_eq!(error.category(), ErrorCategory::Group);
                assert_eq!(error.code(), "GROUP.MISSING_INPUT");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn corrupt_header_abandons_only_its_window() {
        let temp = TempDir::new().expect("tempdir should be created");
        let dir = temp.path();
        image(dir, "sim_Tc99m_liver.w01.avg.im", 1.0);
        image(dir, "sim_Tc99m_liver.w02.avg.im", 1.0);
        std::fs::write(header_path(&dir.join("sim_Tc99m_liver.w02.avg.im")), "not json")
            .expect("corrupt header");

        let context = PipelineContext::new(dir, PipelineConfig::default());
        let report = run_combine(&context).expect("a corrupt header must not abort the stage");

        assert_eq!(report.written(), vec![&dir.join("combined.w01.avg.im")]);
        let abandoned = report.abandoned();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].group, "w02");
        match &abandoned[0].outcome {
            GroupOutcome::Abandoned(error) => {
                assert_eq!(error.category(), ErrorCategory::Group);
                assert_eq!(error.code(), "GROUP.HEADER_PARSE");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!dir.join("combined.w02.avg.im").exists());
    }

    #[test]
    fn per_source_grouping_keeps_sources_apart() {
        let temp = TempDir::new().expect("tempdir should be created");
        let dir = temp.path();
        image(dir, "sim_Tc99m_liver.w01.avg.im", 1.0);
        image(dir, "sim_Tc99m_lung.w01.avg.im", 2.0);

        let config = PipelineConfig {
            grouping: GroupingPolicy::PerSource,
            ..PipelineConfig::default()
        };
        let context = PipelineContext::new(dir, config);
        run_combine(&context).expect("combine");

        assert!(dir.join("combined_Tc99m_liver.w01.avg.im").is_file());
        assert!(dir.join("combined_Tc99m_lung.w01.avg.im").is_file());
    }

    #[test]
    fn many_raw_seeds_without_averages_is_a_configuration_error() {
        let temp = TempDir::new().expect("tempdir should be created");
        let dir = temp.path();
        image(dir, "sim_Tc99m_liver_1.w01.im", 1.0);
        image(dir, "sim_Tc99m_liver_2.w01.im", 1.0);

        let context = PipelineContext::new(dir, PipelineConfig::default());
        let error = run_combine(&context).expect_err("ambiguous seeds");
        assert_eq!(error.code(), "CONFIG.AMBIGUOUS_SEEDS");
        assert!(!dir.join("combined.w01.avg.im").exists());
    }

    #[test]
    fn empty_directory_is_a_configuration_error() {
        let temp = TempDir::new().expect("tempdir should be created");
        let context = PipelineContext::new(temp.path(), PipelineConfig::default());
        let error = run_combine(&context).expect_err("nothing to combine");
        assert_eq!(error.exit_code(), 2);
    }
}
