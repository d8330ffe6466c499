//! Input validation run before a simulation batch is launched.

use super::PipelineContext;
use crate::common::constants::{DENSITY_AIR, DENSITY_MAX, IMAGE_EXTENSION};
use crate::domain::{PipelineError, PipelineResult, Volume};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSum {
    pub path: PathBuf,
    pub sum: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreflightReport {
    pub density_shape: Vec<usize>,
    pub object_sums: Vec<ObjectSum>,
    pub max_sum: f64,
}

impl PreflightReport {
    pub fn render(&self) -> String {
        let mut lines = vec![format!("density map shape: {:?}", self.density_shape)];
        lines.extend(self.object_sums.iter().map(|object| {
            format!("{}: sum {}", object.path.display(), object.sum)
        }));
        lines.push(format!("max object sum: {}", self.max_sum));
        lines.join("\n")
    }
}

/// Checks the density map and every source object. All problems are
/// collected before failing so one run reports them together.
pub fn run_preflight(
    context: &PipelineContext,
    density_map: &str,
    objects: &[String],
) -> PipelineResult<PreflightReport> {
    let mut problems = Vec::new();

    let density_path = context.path(&with_image_extension(density_map));
    let density_shape = match read_checked(context, &density_path, &mut problems) {
        Some(density) => {
            let out_of_range = density
                .data()
                .iter()
                .filter(|value| !(DENSITY_AIR..=DENSITY_MAX).contains(*value))
                .count();
            if out_of_range > 0 {
                problems.push(format!(
                    "density map '{}' has {} values outside [{}, {}]",
                    density_path.display(),
                    out_of_range,
                    DENSITY_AIR,
                    DENSITY_MAX
                ));
            }
            Some(density.shape().to_vec())
        }
        None => None,
    };

    if objects.is_empty() {
        problems.push("no source objects given".to_string());
    }
    // "liver" and "liver.im" name the same object
    let mut seen = BTreeSet::new();
    for name in objects {
        let file_name = with_image_extension(name);
        if seen.contains(&file_name) {
            problems.push(format!("source object '{}' is listed more than once", name));
        } else {
            seen.insert(file_name);
        }
    }

    let mut object_sums = Vec::new();
    let mut first_shape: Option<(PathBuf, Vec<usize>)> = None;
    for file_name in &seen {
        let path = context.path(file_name);
        let Some(object) = read_checked(context, &path, &mut problems) else {
            continue;
        };
        if object.data().iter().any(|value| *value < 0.0) {
            problems.push(format!("source object '{}' has negative values", path.display()));
        }
        match &first_shape {
            Some((first, shape)) if shape.as_slice() != object.shape() => {
                problems.push(format!(
                    "source object '{}' has shape {:?}, but '{}' has {:?}",
                    path.display(),
                    object.shape(),
                    first.display(),
                    shape
                ));
            }
            Some(_) => {}
            None => first_shape = Some((path.clone(), object.shape().to_vec())),
        }
        let sum = object.data().iter().map(|value| f64::from(*value)).sum();
        object_sums.push(ObjectSum { path, sum });
    }

    if let (Some(density_shape), Some((first, shape))) = (&density_shape, &first_shape)
        && density_shape != shape
    {
        problems.push(format!(
            "density map shape {:?} differs from source object shape {:?} ('{}')",
            density_shape,
            shape,
            first.display()
        ));
    }

    if !problems.is_empty() {
        for problem in &problems {
            warn!(problem = problem.as_str(), "preflight check failed");
        }
        return Err(PipelineError::configuration(
            "CONFIG.PREFLIGHT",
            format!(
                "{} preflight problem(s): {}",
                problems.len(),
                problems.join("; ")
            ),
        ));
    }

    let max_sum = object_sums
        .iter()
        .map(|object| object.sum)
        .fold(0.0_f64, f64::max);
    info!(
        objects = object_sums.len(),
        max_sum,
        "preflight checks passed"
    );
    Ok(PreflightReport {
        density_shape: density_shape.unwrap_or_default(),
        object_sums,
        max_sum,
    })
}

fn with_image_extension(name: &str) -> String {
    if Path::new(name).extension().is_some_and(|ext| ext == IMAGE_EXTENSION) {
        name.to_string()
    } else {
        format!("{}.{}", name, IMAGE_EXTENSION)
    }
}

fn read_checked(
    context: &PipelineContext,
    path: &Path,
    problems: &mut Vec<String>,
) -> Option<Volume> {
    if !path.is_file() {
        problems.push(format!("'{}' does not exist", path.display()));
        return None;
    }
    match context.store().read(path) {
        Ok(volume) if volume.rank() == 3 => Some(volume),
        Ok(volume) => {
            problems.push(format!(
                "'{}' must be 3-D, found shape {:?}",
                path.display(),
                volume.shape()
            ));
            None
        }
        Err(error) => {
            problems.push(error.message().to_string());
            None
        }
    }
}
