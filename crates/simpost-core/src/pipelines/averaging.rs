//! Seed averaging: every raw output of a completed run is averaged with the
//! same output of the other seeds into `<key>.avg.<ext>`.

use super::PipelineContext;
use super::driver::{
    DriverState, GroupProgress, accumulate_contributions, finish_stage, run_groups,
};
use crate::common::constants::{AVERAGE_TAG, IMAGE_EXTENSION, RUN_RESULT_EXTENSION};
use crate::domain::{
    ContributionCounts, GroupOutcome, PipelineResult, PipelineStage, StageReport,
};
use crate::modules::accumulator::FinalizeMode;
use crate::modules::discovery::{DiscoveredFile, discover_family};
use crate::modules::guard::{ClaimOutcome, GuardDecision};
use crate::modules::keys::PatternFamily;
use crate::modules::metadata;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct AverageGroup {
    key: String,
    output: PathBuf,
    inputs: Vec<PathBuf>,
}

/// Averages raw seed outputs with the given extension (`im` or `bis`).
pub fn run_averaging(context: &PipelineContext, extension: &str) -> PipelineResult<StageReport> {
    let discovered = discover_family(
        context.dir(),
        &format!("*.{}", extension),
        PatternFamily::RawSeed,
    )?;
    let groups = group_completed_runs(context, discovered, extension);
    context.check_fresh(groups.iter().map(|group| &group.output))?;

    let reports = run_groups(context.mode(), &groups, |group| {
        let mut progress = GroupProgress::new(group.key.clone());
        let result = average_group(context, group, extension, &mut progress);
        progress.finish(result)
    });

    let mut report = StageReport::new(PipelineStage::Average);
    reports.into_iter().for_each(|group| report.push(group));
    finish_stage(report)
}

fn group_completed_runs(
    context: &PipelineContext,
    discovered: Vec<DiscoveredFile>,
    extension: &str,
) -> Vec<AverageGroup> {
    let mut by_key: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut unfinished = 0_usize;
    for file in discovered {
        if context.config().require_completed_runs {
            let completed = file.name.run_name().is_some_and(|run| {
                context
                    .path(&format!("{}.{}", run, RUN_RESULT_EXTENSION))
                    .is_file()
            });
            if !completed {
                unfinished += 1;
                continue;
            }
        }
        by_key.entry(file.name.group_key).or_default().push(file.path);
    }
    if unfinished > 0 {
        info!(
            unfinished,
            extension, "ignoring outputs of runs without a result file"
        );
    }

    by_key
        .into_iter()
        .map(|(key, inputs)| AverageGroup {
            output: context.path(&format!("{}.{}.{}", key, AVERAGE_TAG, extension)),
            key,
            inputs,
        })
        .collect()
}

fn average_group(
    context: &PipelineContext,
    group: &AverageGroup,
    extension: &str,
    progress: &mut GroupProgress,
) -> PipelineResult<GroupOutcome> {
    if context.guard().check(&group.output) == GuardDecision::Skip {
        return Ok(GroupOutcome::Skipped(format!(
            "{} exists",
            group.output.display()
        )));
    }
    let _claim = match context.guard().claim(&group.output)? {
        ClaimOutcome::Claimed(claim) => claim,
        ClaimOutcome::Busy(marker) => {
            return Ok(GroupOutcome::Skipped(format!(
                "claimed by another run ({})",
                marker.display()
            )));
        }
    };

    progress.advance(DriverState::Accumulate);
    let (accumulator, first) = accumulate_contributions(
        context.store(),
        &group.key,
        group.inputs.iter().map(PathBuf::as_path),
    );
    let count = accumulator.count();
    progress.record_contributions(ContributionCounts {
        count,
        rejected: accumulator.rejected(),
    });
    if count <= 1 {
        return Ok(GroupOutcome::Insufficient { count });
    }
    if accumulator.rejected() > 0 {
        warn!(
            group = %group.key,
            rejected = accumulator.rejected(),
            count,
            "averaging without rejected contributions"
        );
    }
    let Some(mean) = accumulator.finalize(FinalizeMode::Mean) else {
        return Ok(GroupOutcome::Insufficient { count });
    };
    context.store().write(&mean, &group.output)?;

    if extension.eq_ignore_ascii_case(IMAGE_EXTENSION) {
        if let Some(first) = first {
            progress.advance(DriverState::PropagateMetadata);
            metadata::propagate(context.operations(), &first, &group.output)?;
        }
    }
    info!(
        output = %group.output.display(),
        count,
        "wrote seed average"
    );
    Ok(GroupOutcome::Written(vec![group.output.clone()]))
}

#[cfg(test)]
mod tests {
    use super::run_averaging;
    use crate::common::PipelineConfig;
    use crate::domain::{
        ContributionCounts, ErrorCategory, GroupOutcome, Header, Volume, render_human_summary,
    };
    use crate::modules::storage::{RawVolumeStore, VolumeStore, read_header, write_header};
    use crate::pipelines::PipelineContext;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn seed(dir: &Path, name: &str, volume: &Volume, completed_run: Option<&str>) {
        RawVolumeStore.write(volume, &dir.join(name)).expect("seed file");
        if let Some(run) = completed_run {
            fs::write(dir.join(format!("{}.res", run)), b"done").expect("result file");
        }
    }

    #[test]
    fn averages_completed_seeds_and_copies_first_header() {
        let temp = TempDir::new().expect("tempdir should be created");
        let dir = temp.path();
        for seed_index in 1..=3 {
            let run = format!("sim_Tc99m_liver_{}", seed_index);
            seed(
                dir,
                &format!("{}.w01.im", run),
                &Volume::filled(vec![128, 128], 10.0),
                Some(&run),
            );
        }
        let mut header = Header::default();
        header.set("Modality", "NM");
        write_header(&dir.join("sim_Tc99m_liver_1.w01.im"), &header).expect("header");
        // unfinished run
        seed(
            dir,
            "sim_Tc99m_liver_4.w01.im",
            &Volume::filled(vec![128, 128], 99.0),
            None,
        );

        let context = PipelineContext::new(dir, PipelineConfig::default());
        let report = run_averaging(&context, "im").expect("averaging");

        assert_eq!(report.groups.len(), 1);
        let output = dir.join("sim_Tc99m_liver.w01.avg.im");
        assert_eq!(
            report.groups[0].outcome,
            GroupOutcome::Written(vec![output.clone()])
        );
        let mean = RawVolumeStore.read(&output).expect("average");
        assert!(mean.data().iter().all(|value| *value == 10.0));
        assert_eq!(read_header(&output).expect("header").get("Modality"), Some("NM"));
    }

    #[test]
    fn report_counts_accepted_and_rejected_seeds() {
        let temp = TempDir::new().expect("tempdir should be created");
        let dir = temp.path();
        for (seed_index, shape) in [(1, vec![4, 4]), (2, vec![4, 4]), (3, vec![2, 4])] {
            let run = format!("sim_I123_brain_{}", seed_index);
            seed(
                dir,
                &format!("{}.w01.im", run),
                &Volume::filled(shape, 1.0),
                Some(&run),
            );
        }

        let context = PipelineContext::new(dir, PipelineConfig::default());
        let report = run_averaging(&context, "im").expect("averaging");

        assert_eq!(
            report.groups[0].contributions,
            Some(ContributionCounts {
                count: 2,
                rejected: 1
            })
        );
        assert!(render_human_summary(&report).contains("(2 contribution(s), 1 rejected)"));
    }

    #[test]
    fn single_contribution_writes_nothing() {
        let temp = TempDir::new().expect("tempdir should be created");
        let dir = temp.path();
        seed(
            dir,
            "sim_a_b_1.w02.im",
            &Volume::filled(vec![4, 4], 1.0),
            Some("sim_a_b_1"),
        );

        let context = PipelineContext::new(dir, PipelineConfig::default());
        let report = run_averaging(&context, "im").expect("averaging");
        assert_eq!(report.insufficient_count(), 1);
        assert_eq!(
            report.groups[0].contributions,
            Some(ContributionCounts {
                count: 1,
                rejected: 0
            })
        );
        assert!(!dir.join("sim_a_b.w02.avg.im").exists());
    }

    #[test]
    fn spectra_are_averaged_without_headers() {
        let temp = TempDir::new().expect("tempdir should be created");
        let dir = temp.path();
        for (seed_index, value) in [(1, 2.0_f32), (2, 4.0)] {
            let run = format!("sim_Lu177_kidney_{}", seed_index);
            let bytes = [value; 3].map(f32::to_le_bytes).concat();
            fs::write(dir.join(format!("{}.w03.bis", run)), bytes).expect("spectrum");
            fs::write(dir.join(format!("{}.res", run)), b"").expect("result");
        }

        let context = PipelineContext::new(dir, PipelineConfig::default());
        let report = run_averaging(&context, "bis").expect("averaging");
        assert_eq!(report.written().len(), 1);

        let spectrum = RawVolumeStore
            .read(&dir.join("sim_Lu177_kidney.w03.avg.bis"))
            .expect("spectrum");
        assert_eq!(spectrum.data(), &[3.0, 3.0, 3.0]);
        assert!(!dir.join("sim_Lu177_kidney.w03.avg.bis.hdr").exists());
    }

    #[test]
    fn second_run_skips_and_fresh_mode_collides() {
        let temp = TempDir::new().expect("tempdir should be created");
        let dir = temp.path();
        for seed_index in 1..=2 {
            let run = format!("sim_x_y_{}", seed_index);
            seed(
                dir,
                &format!("{}.w01.im", run),
                &Volume::filled(vec![2, 2], 1.0),
                Some(&run),
            );
        }

        let context = PipelineContext::new(dir, PipelineConfig::default());
        run_averaging(&context, "im").expect("first run");
        let second = run_averaging(&context, "im").expect("second run");
        assert_eq!(second.skipped_count(), 1);
        assert!(second.written().is_empty());

        let fresh = PipelineContext::new(dir, PipelineConfig::default()).with_require_fresh(true);
        let error = run_averaging(&fresh, "im").expect_err("collision");
        assert_eq!(error.category(), ErrorCategory::OutputCollision);
    }

    #[test]
    fn incomplete_runs_count_when_not_required() {
        let temp = TempDir::new().expect("tempdir should be created");
        let dir = temp.path();
        seed(dir, "sim_a_b_1.w01.im", &Volume::filled(vec![2], 1.0), None);
        seed(dir, "sim_a_b_2.w01.im", &Volume::filled(vec![2], 3.0), None);

        let strict = PipelineContext::new(dir, PipelineConfig::default());
        assert!(run_averaging(&strict, "im").expect("strict").groups.is_empty());

        let config = PipelineConfig {
            require_completed_runs: false,
            ..PipelineConfig::default()
        };
        let relaxed = PipelineContext::new(dir, config);
        let report = run_averaging(&relaxed, "im").expect("relaxed");
        assert_eq!(report.written().len(), 1);
        let mean = RawVolumeStore
            .read(&dir.join("sim_a_b.w01.avg.im"))
            .expect("mean");
        assert_eq!(mean.data(), &[2.0, 2.0]);
    }
}
