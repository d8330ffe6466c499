//! Unit conversion between simulated counts and physical quantities.

use crate::domain::{PipelineError, PipelineResult, WideVolume};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConcentrationCalibration {
    /// Calibration factor in cps/MBq.
    pub calibration_cps_per_mbq: f64,
    pub frame_duration_s: f64,
    pub projection_count: u32,
    pub slice_thickness_cm: f64,
    pub pixel_width_cm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleFactor {
    /// Simulated cps/MBq to counts: activity (MBq) times frame duration (s).
    Exposure {
        activity_mbq: f64,
        frame_duration_s: f64,
    },
    /// Reconstructed counts to activity concentration (Bq/mL).
    Concentration(ConcentrationCalibration),
    Explicit(f64),
}

impl ScaleFactor {
    pub fn value(&self) -> PipelineResult<f64> {
        match *self {
            Self::Exposure {
                activity_mbq,
                frame_duration_s,
            } => {
                require_positive("activity (MBq)", activity_mbq)?;
                require_positive("frame duration (s)", frame_duration_s)?;
                Ok(activity_mbq * frame_duration_s)
            }
            Self::Concentration(calibration) => {
                require_positive(
                    "calibration factor (cps/MBq)",
                    calibration.calibration_cps_per_mbq,
                )?;
                require_positive("frame duration (s)", calibration.frame_duration_s)?;
                require_positive(
                    "number of projections",
                    f64::from(calibration.projection_count),
                )?;
                require_positive("slice thickness (cm)", calibration.slice_thickness_cm)?;
                require_positive("pixel width (cm)", calibration.pixel_width_cm)?;

                let acquisition_s =
                    calibration.frame_duration_s * f64::from(calibration.projection_count);
                // square in-plane voxels
                let voxel_ml = calibration.slice_thickness_cm
                    * calibration.pixel_width_cm
                    * calibration.pixel_width_cm;
                Ok(1.0e6 / (acquisition_s * voxel_ml * calibration.calibration_cps_per_mbq))
            }
            Self::Explicit(factor) => {
                require_positive("scale factor", factor)?;
                Ok(factor)
            }
        }
    }
}

fn require_positive(name: &str, value: f64) -> PipelineResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(PipelineError::configuration(
            "CONFIG.SCALE_FACTOR",
            format!("{} must be a positive finite number, got {}", name, value),
        ))
    }
}

pub fn scale(volume: &WideVolume, factor: f64) -> WideVolume {
    let mut scaled = volume.clone();
    for value in scaled.data_mut() {
        *value *= factor;
    }
    scaled
}
