//! Downsampling to the canonical grid, with spacing attributes rewritten by
//! the same factors.

use crate::common::constants::{
    ATTR_PIXEL_SIZE, ATTR_PIXEL_SPACING_COLS, ATTR_PIXEL_SPACING_ROWS, ATTR_SLICES_SPACING,
};
use crate::domain::{HeaderAttribute, PipelineError, PipelineResult};
use crate::modules::external::{CollapseMode, ExternalOperations, ResampleFactors};
use crate::modules::metadata;
use crate::modules::storage::VolumeStore;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleAxes {
    /// Last two axes (projection rows and columns).
    InPlane,
    /// Last three axes.
    Volume,
}

impl ResampleAxes {
    const fn count(self) -> usize {
        match self {
            Self::InPlane => 2,
            Self::Volume => 3,
        }
    }
}

/// Factors that bring `shape` onto the canonical grid, or `None` when no
/// resampled axis exceeds it. Axes within the canonical size keep factor 1.
pub fn plan(
    shape: &[usize],
    axes: ResampleAxes,
    canonical: usize,
) -> PipelineResult<Option<ResampleFactors>> {
    let rank = shape.len();
    if rank < axes.count() {
        return Err(PipelineError::group(
            "GROUP.RESAMPLE_RANK",
            format!(
                "volume of shape {:?} has fewer than {} axes to resample",
                shape,
                axes.count()
            ),
        ));
    }

    let resampled = &shape[rank - axes.count()..];
    if resampled.iter().all(|len| *len <= canonical) {
        return Ok(None);
    }

    // axes already within the canonical size are never upsampled
    let factor = |len: usize| {
        if len > canonical {
            len as f64 / canonical as f64
        } else {
            1.0
        }
    };
    Ok(Some(ResampleFactors {
        x: factor(shape[rank - 1]),
        y: factor(shape[rank - 2]),
        z: (axes == ResampleAxes::Volume).then(|| factor(shape[rank - 3])),
    }))
}

#[derive(Debug, Clone, Copy)]
pub struct ResampleRequest<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub axes: ResampleAxes,
    pub mode: CollapseMode,
    pub canonical: usize,
}

/// Resamples `request.input` into `request.output` when it is larger than the
/// canonical grid. Returns the applied factors, or `None` when the input was
/// already small enough and nothing was written.
pub fn resample_to_canonical(
    store: &dyn VolumeStore,
    operations: &dyn ExternalOperations,
    request: ResampleRequest<'_>,
) -> PipelineResult<Option<ResampleFactors>> {
    let volume = store.read(request.input)?;
    let Some(factors) = plan(volume.shape(), request.axes, request.canonical)? else {
        info!(
            input = %request.input.display(),
            shape = ?volume.shape(),
            "already within canonical size; not resampled"
        );
        return Ok(None);
    };

    operations.resample(factors, request.mode, request.input, request.output)?;
    metadata::propagate(operations, request.input, request.output)?;
    rewrite_spacing(operations, request.input, request.output, factors)?;
    info!(
        output = %request.output.display(),
        x = factors.x,
        y = factors.y,
        "wrote resampled volume"
    );
    Ok(Some(factors))
}

/// Scales the spacing attributes of `source` by `factors` and writes them to
/// `target`. Absent attributes stay absent.
pub fn rewrite_spacing(
    operations: &dyn ExternalOperations,
    source: &Path,
    target: &Path,
    factors: ResampleFactors,
) -> PipelineResult<()> {
    let read = |name: &str| -> PipelineResult<Option<f64>> {
        Ok(operations
            .read_header_attribute(source, name)?
            .and_then(|value| parse_spacing(name, &value)))
    };

    let pixel_size = operations
        .read_header_attribute(source, ATTR_PIXEL_SIZE)?
        .map(|value| parse_pair(&value))
        .unwrap_or_default();
    let rows = read(ATTR_PIXEL_SPACING_ROWS)?.or(pixel_size.0);
    let cols = read(ATTR_PIXEL_SPACING_COLS)?.or(pixel_size.1);
    let slices = match factors.z {
        Some(_) => read(ATTR_SLICES_SPACING)?,
        None => None,
    };

    let mut attributes = Vec::new();
    if let Some(rows) = rows {
        attributes.push(HeaderAttribute::new(
            ATTR_PIXEL_SPACING_ROWS,
            (rows * factors.x).to_string(),
        ));
    }
    if let Some(cols) = cols {
        attributes.push(HeaderAttribute::new(
            ATTR_PIXEL_SPACING_COLS,
            (cols * factors.y).to_string(),
        ));
    }
    if let (Some(slices), Some(z)) = (slices, factors.z) {
        attributes.push(HeaderAttribute::new(
            ATTR_SLICES_SPACING,
            (slices * z).to_string(),
        ));
    }

    if attributes.is_empty() {
        warn!(
            source = %source.display(),
            "no spacing attributes found; resampled header keeps the original spacing"
        );
        return Ok(());
    }
    metadata::set_attributes(operations, target, &attributes)
}

fn parse_spacing(name: &str, value: &str) -> Option<f64> {
    match value.trim().parse::<f64>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(attribute = name, value, "spacing attribute is not a number");
            None
        }
    }
}

fn parse_pair(value: &str) -> (Option<f64>, Option<f64>) {
    let mut parts = value
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<f64>().ok());
    (parts.next().flatten(), parts.next().flatten())
}
