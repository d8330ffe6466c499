use crate::domain::{PipelineError, PipelineResult};
use crate::modules::external::ExternalOperations;
use crate::modules::guard::IdempotencyGuard;
use crate::modules::metadata;
use crate::modules::storage::VolumeStore;
use std::path::Path;
use tracing::info;

/// Regenerates `noisy` from the noise-free `input`. Any previous noisy output
/// is removed first, so the result is always a fresh realization.
pub fn inject_noise(
    store: &dyn VolumeStore,
    operations: &dyn ExternalOperations,
    guard: &IdempotencyGuard,
    input: &Path,
    noisy: &Path,
) -> PipelineResult<()> {
    if !input.is_file() {
        return Err(PipelineError::group(
            "GROUP.NOISE_INPUT_MISSING",
            format!("noise-free input '{}' does not exist", input.display()),
        ));
    }

    let volume = store.read(input).map_err(|error| {
        PipelineError::group("GROUP.NOISE_INPUT_UNREADABLE", error.message())
    })?;
    if let Some((index, value)) = volume
        .data()
        .iter()
        .enumerate()
        .find(|(_, value)| !value.is_finite() || **value < 0.0)
    {
        return Err(PipelineError::group(
            "GROUP.NOISE_INPUT_INVALID",
            format!(
                "noise-free input '{}' holds {} at sample {}; expected finite non-negative means",
                input.display(),
                value,
                index
            ),
        ));
    }

    guard.clear_stale(noisy)?;
    operations.add_noise(input, noisy)?;
    metadata::propagate(operations, input, noisy)?;
    info!(output = %noisy.display(), "wrote noisy projections");
    Ok(())
}
