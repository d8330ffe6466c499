use crate::domain::{HeaderAttribute, PipelineResult};
use crate::modules::external::ExternalOperations;
use std::path::Path;
use tracing::debug;

/// Copies every header attribute of `source` onto the derived `target`.
pub fn propagate(
    operations: &dyn ExternalOperations,
    source: &Path,
    target: &Path,
) -> PipelineResult<()> {
    debug!(
        source = %source.display(),
        target = %target.display(),
        "propagating header"
    );
    operations.copy_header(source, target)
}

pub fn set_attributes(
    operations: &dyn ExternalOperations,
    target: &Path,
    attributes: &[HeaderAttribute],
) -> PipelineResult<()> {
    if attributes.is_empty() {
        return Ok(());
    }
    operations.set_header_attributes(target, attributes)
}
