use super::PipelineContext;
use super::driver::{DriverState, GroupProgress, finish_stage};
use crate::common::constants::{
    ATTR_FRAME_DURATION_MS, ATTR_PIXEL_WIDTH_CM, ATTR_PROJECTION_COUNT, ATTR_SLICE_THICKNESS_CM,
};
use crate::domain::{GroupOutcome, PipelineError, PipelineResult, PipelineStage, StageReport};
use crate::modules::guard::GuardDecision;
use crate::modules::metadata;
use crate::modules::scaling::{ConcentrationCalibration, ScaleFactor, scale};
use std::path::{Path, PathBuf};
use tracing::info;

/// Values that replace missing (or wrong) header attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuantifyOverrides {
    pub frame_duration_s: Option<f64>,
    pub projection_count: Option<u32>,
    pub slice_thickness_cm: Option<f64>,
    pub pixel_width_cm: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantifyRequest {
    /// Calibration factor in cps/MBq.
    pub calibration_cps_per_mbq: f64,
    pub projection: PathBuf,
    pub reconstruction: PathBuf,
    pub output: PathBuf,
    pub overrides: QuantifyOverrides,
}

/// Converts a reconstruction in counts to activity concentration (Bq/mL).
pub fn run_quantify(
    context: &PipelineContext,
    request: &QuantifyRequest,
) -> PipelineResult<StageReport> {
    if !(request.calibration_cps_per_mbq.is_finite() && request.calibration_cps_per_mbq > 0.0) {
        return Err(PipelineError::configuration(
            "CONFIG.CALIBRATION_FACTOR",
            format!(
                "calibration factor must be positive, got {}; deriving a calibration factor is not supported",
                request.calibration_cps_per_mbq
            ),
        ));
    }
    for input in [&request.projection, &request.reconstruction] {
        if !input.is_file() {
            return Err(PipelineError::configuration(
                "CONFIG.MISSING_INPUT",
                format!("input '{}' does not exist", input.display()),
            ));
        }
    }
    context.check_fresh([&request.output])?;

    let mut progress = GroupProgress::new(request.output.display().to_string());
    let result = quantify(context, request, &mut progress);
    let mut report = StageReport::new(PipelineStage::Quantify);
    report.push(progress.finish(result));
    finish_stage(report)
}

fn quantify(
    context: &PipelineContext,
    request: &QuantifyRequest,
    progress: &mut GroupProgress,
) -> PipelineResult<GroupOutcome> {
    if context.guard().check(&request.output) == GuardDecision::Skip {
        return Ok(GroupOutcome::Skipped(format!(
            "{} exists",
            request.output.display()
        )));
    }

    let overrides = request.overrides;
    let frame_duration_s = match overrides.frame_duration_s {
        Some(value) => value,
        None => {
            header_number(context, &request.projection, ATTR_FRAME_DURATION_MS, "--frame-duration")?
                / 1000.0
        }
    };
    let projection_count = match overrides.projection_count {
        Some(value) => value,
        None => {
            let count =
                header_number(context, &request.projection, ATTR_PROJECTION_COUNT, "--projections")?;
            if count.fract() != 0.0 || count < 1.0 || count > f64::from(u32::MAX) {
                return Err(PipelineError::group(
                    "GROUP.ATTRIBUTE_VALUE",
                    format!(
                        "'{}' of '{}' must be a positive whole number, got {}",
                        ATTR_PROJECTION_COUNT,
                        request.projection.display(),
                        count
                    ),
                ));
            }
            count as u32
        }
    };
    let slice_thickness_cm = match overrides.slice_thickness_cm {
        Some(value) => value,
        None => header_number(
            context,
            &request.reconstruction,
            ATTR_SLICE_THICKNESS_CM,
            "--slice-thickness",
        )?,
    };
    let pixel_width_cm = match overrides.pixel_width_cm {
        Some(value) => value,
        None => header_number(
            context,
            &request.reconstruction,
            ATTR_PIXEL_WIDTH_CM,
            "--pixel-width",
        )?,
    };

    progress.advance(DriverState::Scale);
    let factor = ScaleFactor::Concentration(ConcentrationCalibration {
        calibration_cps_per_mbq: request.calibration_cps_per_mbq,
        frame_duration_s,
        projection_count,
        slice_thickness_cm,
        pixel_width_cm,
    })
    .value()?;
    let counts = context.store().read(&request.reconstruction)?;
    let concentration = scale(&counts.to_wide(), factor);
    context
        .store()
        .write(&concentration.to_single(), &request.output)?;

    progress.advance(DriverState::PropagateMetadata);
    metadata::propagate(context.operations(), &request.reconstruction, &request.output)?;
    info!(
        output = %request.output.display(),
        factor,
        frame_duration_s,
        projection_count,
        "wrote activity concentration"
    );
    Ok(GroupOutcome::Written(vec![request.output.clone()]))
}

fn header_number(
    context: &PipelineContext,
    file: &Path,
    attribute: &str,
    override_flag: &str,
) -> PipelineResult<f64> {
    let missing = || {
        PipelineError::group(
            "GROUP.MISSING_ATTRIBUTE",
            format!(
                "'{}' not found in the header of '{}'; pass {} to supply it",
                attribute,
                file.display(),
                override_flag
            ),
        )
    };
    let value = context
        .operations()
        .read_header_attribute(file, attribute)?
        .ok_or_else(missing)?;
    // header tools may print "<name>\t<value>"
    let last = value.split_whitespace().last().ok_or_else(missing)?;
    last.parse::<f64>().map_err(|_| missing())
}

#[cfg(test)]
mod tests {
    use super::{QuantifyOverrides, QuantifyRequest, run_quantify};
    use crate::common::PipelineConfig;
    use crate::domain::{ErrorCategory, GroupOutcome, Header, Volume};
    use crate::modules::storage::{RawVolumeStore, VolumeStore, write_header};
    use crate::pipelines::PipelineContext;
    use std::path::Path;
    use tempfile::TempDir;

    fn fixture(dir: &Path, with_voxel_size: bool) -> QuantifyRequest {
        let projection = dir.join("prj.n.avg.w01.im");
        let reconstruction = dir.join("recon.im");
        RawVolumeStore
            .write(&Volume::filled(vec![2, 4, 4], 5.0), &projection)
            .expect("projection");
        RawVolumeStore
            .write(&Volume::filled(vec![4, 4, 4], 1200.0), &reconstruction)
            .expect("reconstruction");

        let mut projection_header = Header::default();
        projection_header.set("Actual Frame Duration", "20000");
        projection_header.set("Number of Projections", "60");
        write_header(&projection, &projection_header).expect("header");
        if with_voxel_size {
            let mut recon_header = Header::default();
            recon_header.set("SliceThickness", "0.5");
            recon_header.set("PixelWidth", "0.5");
            write_header(&reconstruction, &recon_header).expect("header");
        }

        QuantifyRequest {
            calibration_cps_per_mbq: 100.0,
            projection,
            reconstruction,
            output: dir.join("recon.bqml.im"),
            overrides: QuantifyOverrides::default(),
        }
    }

    #[test]
    fn counts_become_becquerel_per_millilitre() {
        let temp = TempDir::new().expect("tempdir should be created");
        let request = fixture(temp.path(), true);
        let context = PipelineContext::new(temp.path(), PipelineConfig::default());

        let report = run_quantify(&context, &request).expect("quantify");
        assert_eq!(report.written().len(), 1);

        // 1200 / (20 s * 60) / 0.125 mL / 100 cps/MBq * 1e6
        let expected = 1200.0 / 1200.0 / 0.125 / 100.0 * 1.0e6;
        let output = RawVolumeStore.read(&request.output).expect("output");
        assert!(
            output
                .data()
                .iter()
                .all(|value| (f64::from(*value) - expected).abs() < 1.0e-2)
        );
    }

    #[test]
    fn missing_voxel_size_names_the_override() {
        let temp = TempDir::new().expect("tempdir should be created");
        let request = fixture(temp.path(), false);
        let context = PipelineContext::new(temp.path(), PipelineConfig::default());

        let report = run_quantify(&context, &request).expect("stage runs");
        match &report.groups[0].outcome {
            GroupOutcome::Abandoned(error) => {
                assert_eq!(error.code(), "GROUP.MISSING_ATTRIBUTE");
                assert!(error.message().contains("SliceThickness"));
                assert!(error.message().contains("--slice-thickness"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let with_overrides = QuantifyRequest {
            overrides: QuantifyOverrides {
                slice_thickness_cm: Some(0.5),
                pixel_width_cm: Some(0.5),
                ..QuantifyOverrides::default()
            },
            ..request
        };
        let report = run_quantify(&context, &with_overrides).expect("quantify");
        assert_eq!(report.written().len(), 1);
    }

    #[test]
    fn calibration_mode_is_rejected() {
        let temp = TempDir::new().expect("tempdir should be created");
        let request = QuantifyRequest {
            calibration_cps_per_mbq: 0.0,
            ..fixture(temp.path(), true)
        };
        let context = PipelineContext::new(temp.path(), PipelineConfig::default());
        let error = run_quantify(&context, &request).expect_err("calibration mode");
        assert_eq!(error.category(), ErrorCategory::Configuration);
        assert!(!request.output.exists());
    }
}
