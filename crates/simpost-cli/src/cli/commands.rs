use super::helpers::{build_context, report_exit_code};
use super::{CliError, GlobalArgs};
use simpost_core::common::constants::{IMAGE_EXTENSION, SPECTRUM_EXTENSION};
use simpost_core::domain::{PipelineError, StageReport};
use simpost_core::modules::scaling::ScaleFactor;
use simpost_core::pipelines::PipelineContext;
use simpost_core::pipelines::attenuation::run_attenuation;
use simpost_core::pipelines::averaging::run_averaging;
use simpost_core::pipelines::combine::run_combine;
use simpost_core::pipelines::postprocess::run_postprocess;
use simpost_core::pipelines::preflight::run_preflight;
use simpost_core::pipelines::quantify::{QuantifyOverrides, QuantifyRequest, run_quantify};
use simpost_core::pipelines::runs::{remove_stale, scan_runs};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(super) enum AverageKind {
    /// Projection images (`.im`)
    Images,
    /// Energy spectra (`.bis`)
    Spectra,
    All,
}

#[derive(clap::Args)]
pub(super) struct AverageArgs {
    /// Which seed outputs to average
    #[arg(long, value_enum, default_value = "all")]
    kind: AverageKind,
}

#[derive(clap::Args)]
pub(super) struct ExposureArgs {
    /// Administered activity in MBq
    #[arg(long, requires = "frame_duration", required_unless_present = "scale_factor")]
    activity: Option<f64>,

    /// Frame duration in seconds
    #[arg(long, requires = "activity")]
    frame_duration: Option<f64>,

    /// Multiply by this factor instead of activity times frame duration
    #[arg(long, conflicts_with_all = ["activity", "frame_duration"])]
    scale_factor: Option<f64>,
}

impl ExposureArgs {
    fn scale_factor(&self) -> Result<ScaleFactor, CliError> {
        match (self.scale_factor, self.activity, self.frame_duration) {
            (Some(factor), _, _) => Ok(ScaleFactor::Explicit(factor)),
            (None, Some(activity_mbq), Some(frame_duration_s)) => Ok(ScaleFactor::Exposure {
                activity_mbq,
                frame_duration_s,
            }),
            _ => Err(CliError::Usage(
                "either --activity with --frame-duration or --scale-factor is required"
                    .to_string(),
            )),
        }
    }
}

#[derive(clap::Args)]
pub(super) struct AttenuationArgs {
    /// Photon energy in keV; one attenuation map per value
    #[arg(long = "energy", value_name = "KEV", required = true, num_args = 1..)]
    energies: Vec<f64>,
}

#[derive(clap::Args)]
pub(super) struct QuantifyArgs {
    /// Calibration factor in cps/MBq
    #[arg(long)]
    calibration: f64,

    /// Projection file whose header holds frame duration and projection count
    #[arg(long)]
    projection: PathBuf,

    /// Reconstructed image in counts
    #[arg(long)]
    reconstruction: PathBuf,

    /// Output path; defaults to `<reconstruction stem>.bqml.im`
    #[arg(long)]
    output: Option<PathBuf>,

    /// Frame duration in seconds
    #[arg(long)]
    frame_duration: Option<f64>,

    /// Number of projections
    #[arg(long)]
    projections: Option<u32>,

    /// Slice thickness in cm
    #[arg(long)]
    slice_thickness: Option<f64>,

    /// Pixel width in cm
    #[arg(long)]
    pixel_width: Option<f64>,
}

#[derive(clap::Args)]
pub(super) struct ValidateArgs {
    /// Density map name (with or without `.im`)
    #[arg(long)]
    density_map: String,

    /// Source object files
    #[arg(required = true)]
    objects: Vec<String>,
}

#[derive(clap::Args)]
pub(super) struct RunsArgs {
    /// Delete logs of runs that never wrote a result file
    #[arg(long)]
    remove_stale: bool,
}

pub(super) fn run_average_command(global: &GlobalArgs, args: AverageArgs) -> Result<i32, CliError> {
    let context = build_context(global)?;
    let reports = average(&context, args.kind)?;
    if reports.iter().all(|report| report.groups.is_empty()) {
        return Err(CliError::Pipeline(PipelineError::configuration(
            "CONFIG.NO_INPUTS",
            format!(
                "no completed seed outputs to average in '{}'",
                context.dir().display()
            ),
        )));
    }
    Ok(report_exit_code(&reports))
}

pub(super) fn run_combine_command(global: &GlobalArgs) -> Result<i32, CliError> {
    let context = build_context(global)?;
    let report = run_combine(&context)?;
    Ok(report_exit_code(&[report]))
}

pub(super) fn run_postprocess_command(
    global: &GlobalArgs,
    args: ExposureArgs,
) -> Result<i32, CliError> {
    let factor = args.scale_factor()?;
    let context = build_context(global)?;
    let report = run_postprocess(&context, factor)?;
    Ok(report_exit_code(&[report]))
}

pub(super) fn run_pipeline_command(global: &GlobalArgs, args: ExposureArgs) -> Result<i32, CliError> {
    let factor = args.scale_factor()?;
    // rejected before any stage writes
    factor.value()?;
    let context = build_context(global)?;

    let mut reports = average(&context, AverageKind::All)?;
    reports.push(run_combine(&context)?);
    reports.push(run_postprocess(&context, factor)?);
    Ok(report_exit_code(&reports))
}

pub(super) fn run_attenuation_command(
    global: &GlobalArgs,
    args: AttenuationArgs,
) -> Result<i32, CliError> {
    let context = build_context(global)?;
    let report = run_attenuation(&context, &args.energies)?;
    Ok(report_exit_code(&[report]))
}

pub(super) fn run_quantify_command(global: &GlobalArgs, args: QuantifyArgs) -> Result<i32, CliError> {
    let context = build_context(global)?;
    let reconstruction = context.dir().join(&args.reconstruction);
    let output = match &args.output {
        Some(output) => context.dir().join(output),
        None => {
            let stem = reconstruction
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            reconstruction.with_file_name(format!("{}.bqml.{}", stem, IMAGE_EXTENSION))
        }
    };
    let request = QuantifyRequest {
        calibration_cps_per_mbq: args.calibration,
        projection: context.dir().join(&args.projection),
        reconstruction,
        output,
        overrides: QuantifyOverrides {
            frame_duration_s: args.frame_duration,
            projection_count: args.projections,
            slice_thickness_cm: args.slice_thickness,
            pixel_width_cm: args.pixel_width,
        },
    };
    let report = run_quantify(&context, &request)?;
    Ok(report_exit_code(&[report]))
}

pub(super) fn run_validate_command(global: &GlobalArgs, args: ValidateArgs) -> Result<i32, CliError> {
    let context = build_context(global)?;
    let report = run_preflight(&context, &args.density_map, &args.objects)?;
    println!("{}", report.render());
    Ok(0)
}

pub(super) fn run_runs_command(global: &GlobalArgs, args: RunsArgs) -> Result<i32, CliError> {
    let context = build_context(global)?;
    let ledger = scan_runs(context.dir())?;
    println!("{}", ledger.render());
    if args.remove_stale {
        let removed = remove_stale(&ledger)?;
        println!("removed {} stale run log(s)", removed.len());
    }
    Ok(0)
}

fn average(context: &PipelineContext, kind: AverageKind) -> Result<Vec<StageReport>, CliError> {
    let extensions: &[&str] = match kind {
        AverageKind::Images => &[IMAGE_EXTENSION],
        AverageKind::Spectra => &[SPECTRUM_EXTENSION],
        AverageKind::All => &[IMAGE_EXTENSION, SPECTRUM_EXTENSION],
    };
    let mut reports = Vec::with_capacity(extensions.len());
    for extension in extensions {
        reports.push(run_averaging(context, extension)?);
    }
    Ok(reports)
}
