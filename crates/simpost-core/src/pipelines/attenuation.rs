//! Attenuation maps from a water/air density map.

use super::PipelineContext;
use super::driver::{GroupProgress, finish_stage, run_groups};
use crate::common::constants::{
    ATTENUATION_ALIASES, ATTR_MODALITY, ATTR_PIXEL_SPACING_COLS, ATTR_PIXEL_SPACING_ROWS,
    ATTR_SLICES_SPACING, CT_CANONICAL_FILE, CT_FILE, DENSITY_AIR, DENSITY_WATER, HU_AIR,
    HU_WATER,
};
use crate::domain::{
    GroupOutcome, GroupReport, HeaderAttribute, PipelineError, PipelineResult, PipelineStage,
    StageReport, Volume,
};
use crate::modules::discovery::list_matching;
use crate::modules::external::CollapseMode;
use crate::modules::guard::GuardDecision;
use crate::modules::metadata;
use crate::modules::resample::{ResampleAxes, ResampleRequest, resample_to_canonical};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DENSITY_MAP_PATTERN: &str = "*dens*.im";

/// Converts a density map holding only air (0) and water (1000) to Hounsfield
/// units and rotates it by -90 degrees about the slice axis:
/// `out[z, i, j] = in[z, ny - 1 - j, i]`.
pub fn density_to_ct(density: &Volume) -> PipelineResult<Volume> {
    let &[nz, ny, nx] = density.shape() else {
        return Err(PipelineError::configuration(
            "CONFIG.DENSITY_MAP_RANK",
            format!(
                "density map must be 3-D, got shape {:?}",
                density.shape()
            ),
        ));
    };

    let unsupported = density
        .data()
        .iter()
        .filter(|value| **value != DENSITY_AIR && **value != DENSITY_WATER)
        .count();
    if unsupported > 0 {
        return Err(PipelineError::configuration(
            "CONFIG.DENSITY_VALUES",
            format!(
                "density map holds {} voxel(s) other than air ({}) and water ({})",
                unsupported, DENSITY_AIR, DENSITY_WATER
            ),
        ));
    }

    let data = density.data();
    let mut ct = Vec::with_capacity(data.len());
    for z in 0..nz {
        for i in 0..nx {
            for j in 0..ny {
                let value = data[(z * ny + (ny - 1 - j)) * nx + i];
                ct.push(if value == DENSITY_AIR { HU_AIR } else { HU_WATER });
            }
        }
    }
    Volume::new(vec![nz, nx, ny], ct)
}

fn spacing_attributes(pixel_size_cm: f64) -> Vec<HeaderAttribute> {
    let spacing_mm = (pixel_size_cm * 10.0 * 1.0e6).round() / 1.0e6;
    vec![
        HeaderAttribute::new(ATTR_PIXEL_SPACING_ROWS, spacing_mm.to_string()),
        HeaderAttribute::new(ATTR_PIXEL_SPACING_COLS, spacing_mm.to_string()),
        HeaderAttribute::new(ATTR_SLICES_SPACING, (-spacing_mm).to_string()),
        HeaderAttribute::new(ATTR_MODALITY, "CT"),
    ]
}

pub fn attenuation_name(index: usize) -> String {
    format!("atn.w{}.im", index)
}

pub fn run_attenuation(
    context: &PipelineContext,
    energies_kev: &[f64],
) -> PipelineResult<StageReport> {
    if energies_kev.is_empty() {
        return Err(PipelineError::configuration(
            "CONFIG.NO_ENERGIES",
            "at least one photon energy (keV) is required",
        ));
    }
    if let Some(bad) = energies_kev
        .iter()
        .find(|kev| !kev.is_finite() || **kev <= 0.0)
    {
        return Err(PipelineError::configuration(
            "CONFIG.PHOTON_ENERGY",
            format!("photon energy must be positive, got {}", bad),
        ));
    }

    let maps = list_matching(context.dir(), DENSITY_MAP_PATTERN)?;
    let Some(density_path) = maps.first() else {
        return Err(PipelineError::configuration(
            "CONFIG.MISSING_DENSITY_MAP",
            format!(
                "no density map matching '{}' in '{}'",
                DENSITY_MAP_PATTERN,
                context.dir().display()
            ),
        ));
    };
    if maps.len() > 1 {
        warn!(
            count = maps.len(),
            using = %density_path.display(),
            "several density maps found"
        );
    }

    let outputs: Vec<PathBuf> = (1..=energies_kev.len())
        .map(|index| context.path(&attenuation_name(index)))
        .collect();
    context.check_fresh(outputs.iter())?;

    let mut report = StageReport::new(PipelineStage::Attenuation);
    let (ct_report, ct_source) = prepare_ct(context, density_path)?;
    report.push(ct_report);

    let pixel_size_cm = context.config().attenuation.pixel_size_cm;
    let jobs: Vec<(usize, f64)> = energies_kev.iter().copied().enumerate().collect();
    let reports = run_groups(context.mode(), &jobs, |(index, kev)| {
        let output = context.path(&attenuation_name(index + 1));
        GroupProgress::new(format!("{} keV", kev)).finish(attenuation_map(
            context,
            &ct_source,
            &output,
            *kev,
            pixel_size_cm,
        ))
    });
    reports.into_iter().for_each(|group| report.push(group));

    if let Some(first) = outputs.first().filter(|path| path.is_file()) {
        report.push(GroupProgress::new("aliases").finish(link_aliases(context, first)));
    }
    finish_stage(report)
}

/// Writes `ct.im` and, when larger than the canonical grid, `ct_128.im`.
/// Returns the CT volume the attenuation maps are computed from.
fn prepare_ct(
    context: &PipelineContext,
    density_path: &Path,
) -> PipelineResult<(GroupReport, PathBuf)> {
    let ct_path = context.path(CT_FILE);
    let canonical_path = context.path(CT_CANONICAL_FILE);
    let mut written = Vec::new();

    if context.guard().check(&ct_path) == GuardDecision::Proceed {
        let density = context.store().read(density_path)?;
        let ct = density_to_ct(&density)?;
        context.store().write(&ct, &ct_path)?;
        info!(
            density = %density_path.display(),
            shape = ?ct.shape(),
            "wrote CT volume"
        );
        written.push(ct_path.clone());
    }

    let source = if context.guard().check(&canonical_path) == GuardDecision::Skip {
        canonical_path
    } else {
        match resample_to_canonical(
            context.store(),
            context.operations(),
            ResampleRequest {
                input: &ct_path,
                output: &canonical_path,
                axes: ResampleAxes::Volume,
                mode: CollapseMode::Average,
                canonical: context.config().canonical_size,
            },
        )? {
            Some(_) => {
                written.push(canonical_path.clone());
                canonical_path
            }
            None => ct_path,
        }
    };

    let outcome = if written.is_empty() {
        GroupOutcome::Skipped("CT volumes exist".to_string())
    } else {
        GroupOutcome::Written(written)
    };
    Ok((GroupReport::new("ct", outcome), source))
}

fn attenuation_map(
    context: &PipelineContext,
    ct_source: &Path,
    output: &Path,
    kev: f64,
    pixel_size_cm: f64,
) -> PipelineResult<GroupOutcome> {
    if context.guard().check(output) == GuardDecision::Skip {
        return Ok(GroupOutcome::Skipped(format!("{} exists", output.display())));
    }
    context
        .operations()
        .hu_to_attenuation(kev, pixel_size_cm, ct_source, output)?;
    metadata::set_attributes(
        context.operations(),
        output,
        &spacing_attributes(pixel_size_cm),
    )?;
    info!(output = %output.display(), kev, "wrote attenuation map");
    Ok(GroupOutcome::Written(vec![output.to_path_buf()]))
}

/// Points the reconstruction aliases at the first attenuation map.
fn link_aliases(context: &PipelineContext, target: &Path) -> PipelineResult<GroupOutcome> {
    let mut written = Vec::new();
    for alias in ATTENUATION_ALIASES {
        let path = context.path(alias);
        if path.symlink_metadata().is_ok() {
            fs::remove_file(&path).map_err(|source| {
                PipelineError::io_system(
                    "IO.OUTPUT_REMOVE",
                    format!("failed to remove '{}': {}", path.display(), source),
                )
            })?;
        }
        link(target, &path)?;
        written.push(path);
    }
    Ok(GroupOutcome::Written(written))
}

#[cfg(unix)]
fn link(target: &Path, alias: &Path) -> PipelineResult<()> {
    let relative = target.file_name().map(Path::new).unwrap_or(target);
    std::os::unix::fs::symlink(relative, alias).map_err(|source| {
        PipelineError::io_system(
            "IO.ALIAS",
            format!("failed to link '{}': {}", alias.display(), source),
        )
    })
}

#[cfg(not(unix))]
fn link(target: &Path, alias: &Path) -> PipelineResult<()> {
    fs::copy(target, alias).map(|_| ()).map_err(|source| {
        PipelineError::io_system(
            "IO.ALIAS",
            format!("failed to copy '{}': {}", alias.display(), source),
        )
    })
}
