use crate::domain::{PipelineError, PipelineResult, Volume, WideVolume};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeMode {
    Mean,
    Sum,
}

/// Running double-precision sum of same-shaped volumes for one group.
///
/// The first accepted contribution fixes the shape; later contributions with
/// a different shape are rejected and leave the count untouched.
#[derive(Debug, Clone, Default)]
pub struct VolumeAccumulator {
    shape: Option<Vec<usize>>,
    sum: Vec<f64>,
    count: usize,
    rejected: usize,
}

impl VolumeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, volume: &Volume) -> PipelineResult<()> {
        match &self.shape {
            None => {
                self.shape = Some(volume.shape().to_vec());
                self.sum = volume.data().iter().map(|value| f64::from(*value)).collect();
            }
            Some(shape) if shape.as_slice() != volume.shape() => {
                self.rejected += 1;
                return Err(PipelineError::contribution(
                    "CONTRIB.SHAPE_MISMATCH",
                    format!(
                        "shape {:?} differs from the group's shape {:?}",
                        volume.shape(),
                        shape
                    ),
                ));
            }
            Some(_) => {
                for (total, value) in self.sum.iter_mut().zip(volume.data()) {
                    *total += f64::from(*value);
                }
            }
        }
        self.count += 1;
        Ok(())
    }

    /// Counts a contribution that could not be read at all.
    pub fn reject(&mut self) {
        self.rejected += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn shape(&self) -> Option<&[usize]> {
        self.shape.as_deref()
    }

    pub fn finalize_wide(self, mode: FinalizeMode) -> Option<WideVolume> {
        let shape = self.shape?;
        let data = match mode {
            FinalizeMode::Sum => self.sum,
            FinalizeMode::Mean => {
                let count = self.count as f64;
                self.sum.into_iter().map(|total| total / count).collect()
            }
        };
        WideVolume::new(shape, data).ok()
    }

    pub fn finalize(self, mode: FinalizeMode) -> Option<Volume> {
        self.finalize_wide(mode).map(|volume| volume.to_single())
    }
}
