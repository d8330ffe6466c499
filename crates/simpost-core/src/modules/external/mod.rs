//! Boundary to the operations the pipeline delegates: header manipulation,
//! spatial collapse, Poisson noise and HU-to-attenuation conversion.

mod command;
mod native;

pub use command::CommandOperations;
pub use native::{NativeOperations, water_attenuation_per_cm};

use crate::common::{ToolBackend, ToolConfig};
use crate::domain::{HeaderAttribute, PipelineResult};
use std::fmt::{Display, Formatter};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollapseMode {
    /// Extensive quantities (counts, activity): collapsed samples are summed.
    Sum,
    /// Intensive quantities (density, attenuation): collapsed samples are averaged.
    Average,
}

impl Display for CollapseMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sum => "sum",
            Self::Average => "average",
        })
    }
}

/// Per-axis downsampling factors. `x` is the fastest axis; `z` is present
/// only for full 3-D collapses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResampleFactors {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
}

pub trait ExternalOperations: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Copies every header attribute of `source` onto `target`, overwriting.
    fn copy_header(&self, source: &Path, target: &Path) -> PipelineResult<()>;

    fn set_header_attributes(
        &self,
        target: &Path,
        attributes: &[HeaderAttribute],
    ) -> PipelineResult<()>;

    fn read_header_attribute(&self, file: &Path, name: &str) -> PipelineResult<Option<String>>;

    fn resample(
        &self,
        factors: ResampleFactors,
        mode: CollapseMode,
        input: &Path,
        output: &Path,
    ) -> PipelineResult<()>;

    fn add_noise(&self, input: &Path, output: &Path) -> PipelineResult<()>;

    fn hu_to_attenuation(
        &self,
        kev: f64,
        pixel_size_cm: f64,
        input: &Path,
        output: &Path,
    ) -> PipelineResult<()>;
}

pub fn operations_for(config: &ToolConfig) -> Box<dyn ExternalOperations> {
    match config.backend {
        ToolBackend::Native => Box::new(NativeOperations::new(config.noise_seed)),
        ToolBackend::Command => Box::new(CommandOperations::new(config.commands.clone())),
    }
}
