use super::{CollapseMode, ExternalOperations, ResampleFactors};
use crate::common::constants::{SEED_OFFSET_BASIS, SEED_PRIME, WATER_MASS_ATTENUATION};
use crate::domain::{HeaderAttribute, PipelineError, PipelineResult, Volume};
use crate::modules::storage::{RawVolumeStore, VolumeStore, read_header, write_header};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};
use std::path::Path;
use tracing::debug;

/// In-process implementation of the external operations over the raw volume
/// format and JSON header sidecars.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeOperations {
    noise_seed: Option<u64>,
    store: RawVolumeStore,
}

impl NativeOperations {
    pub fn new(noise_seed: Option<u64>) -> Self {
        Self {
            noise_seed,
            store: RawVolumeStore,
        }
    }

    fn rng_for(&self, output: &Path) -> StdRng {
        match self.noise_seed {
            Some(seed) => {
                let name = output
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                StdRng::seed_from_u64(seed ^ fnv1a(name.as_bytes()))
            }
            None => StdRng::from_os_rng(),
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(SEED_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(SEED_PRIME)
    })
}

impl ExternalOperations for NativeOperations {
    fn backend_name(&self) -> &'static str {
        "native"
    }

    fn copy_header(&self, source: &Path, target: &Path) -> PipelineResult<()> {
        let source_header = read_header(source)?;
        let mut target_header = read_header(target)?;
        target_header.overwrite_from(&source_header);
        write_header(target, &target_header)
    }

    fn set_header_attributes(
        &self,
        target: &Path,
        attributes: &[HeaderAttribute],
    ) -> PipelineResult<()> {
        let mut header = read_header(target)?;
        for attribute in attributes {
            header.set(&attribute.name, attribute.value.clone());
        }
        write_header(target, &header)
    }

    fn read_header_attribute(&self, file: &Path, name: &str) -> PipelineResult<Option<String>> {
        Ok(read_header(file)?.get(name).map(str::to_string))
    }

    fn resample(
        &self,
        factors: ResampleFactors,
        mode: CollapseMode,
        input: &Path,
        output: &Path,
    ) -> PipelineResult<()> {
        let volume = self.store.read(input)?;
        let collapsed = collapse(&volume, factors, mode)?;
        debug!(
            input = %input.display(),
            from = ?volume.shape(),
            to = ?collapsed.shape(),
            %mode,
            "collapsed volume"
        );
        self.store.write(&collapsed, output)
    }

    fn add_noise(&self, input: &Path, output: &Path) -> PipelineResult<()> {
        let volume = self.store.read(input)?;
        let mut rng = self.rng_for(output);
        let mut noisy = Vec::with_capacity(volume.len());
        for value in volume.data() {
            let lambda = f64::from(*value);
            if lambda <= 0.0 {
                noisy.push(0.0);
                continue;
            }
            let poisson = Poisson::new(lambda).map_err(|source| {
                PipelineError::external(
                    "EXT.NOISE",
                    format!(
                        "cannot draw Poisson noise for mean {} in '{}': {}",
                        lambda,
                        input.display(),
                        source
                    ),
                )
            })?;
            noisy.push(poisson.sample(&mut rng) as f32);
        }

        let (shape, _) = volume.into_parts();
        self.store.write(&Volume::new(shape, noisy)?, output)?;
        self.copy_header(input, output)
    }

    fn hu_to_attenuation(
        &self,
        kev: f64,
        pixel_size_cm: f64,
        input: &Path,
        output: &Path,
    ) -> PipelineResult<()> {
        let mu_water = water_attenuation_per_cm(kev)?;
        let volume = self.store.read(input)?;
        let attenuation: Vec<f32> = volume
            .data()
            .iter()
            .map(|hu| {
                let mu = mu_water * (1.0 + f64::from(*hu) / 1000.0);
                (mu.max(0.0) * pixel_size_cm) as f32
            })
            .collect();
        let (shape, _) = volume.into_parts();
        self.store.write(&Volume::new(shape, attenuation)?, output)?;
        self.copy_header(input, output)
    }
}

/// Linear attenuation coefficient of water (1/cm) at `kev`.
pub fn water_attenuation_per_cm(kev: f64) -> PipelineResult<f64> {
    let (first, last) = (WATER_MASS_ATTENUATION[0], WATER_MASS_ATTENUATION[11]);
    if !kev.is_finite() || kev < first.0 || kev > last.0 {
        return Err(PipelineError::configuration(
            "CONFIG.PHOTON_ENERGY",
            format!(
                "photon energy {} keV is outside the supported range {}..={} keV",
                kev, first.0, last.0
            ),
        ));
    }

    for pair in WATER_MASS_ATTENUATION.windows(2) {
        let ((e0, mu0), (e1, mu1)) = (pair[0], pair[1]);
        if kev <= e1 {
            let t = (kev.ln() - e0.ln()) / (e1.ln() - e0.ln());
            // water density is 1 g/cm^3
            return Ok((mu0.ln() + t * (mu1.ln() - mu0.ln())).exp());
        }
    }
    Ok(last.1)
}

/// Area-weighted collapse along the trailing axes. Output sample `j` of an
/// axis covers the input interval `[j * f, (j + 1) * f)`, so fractional
/// factors split boundary samples between neighbours.
pub(crate) fn collapse(
    volume: &Volume,
    factors: ResampleFactors,
    mode: CollapseMode,
) -> PipelineResult<Volume> {
    let rank = volume.rank();
    let required = if factors.z.is_some() { 3 } else { 2 };
    if rank < required {
        return Err(PipelineError::group(
            "GROUP.RESAMPLE_RANK",
            format!(
                "cannot collapse {} axes of a rank-{} volume",
                required, rank
            ),
        ));
    }

    let mut shape = volume.shape().to_vec();
    let mut data: Vec<f64> = volume.data().iter().map(|v| f64::from(*v)).collect();
    let mut axes = vec![(rank - 1, factors.x), (rank - 2, factors.y)];
    if let Some(z) = factors.z {
        axes.push((rank - 3, z));
    }

    for (axis, factor) in axes {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(PipelineError::configuration(
                "CONFIG.RESAMPLE_FACTOR",
                format!("resample factor must be positive, got {}", factor),
            ));
        }
        (shape, data) = collapse_axis(&shape, &data, axis, factor, mode);
    }

    Volume::new(shape, data.into_iter().map(|value| value as f32).collect())
}

fn collapse_axis(
    shape: &[usize],
    data: &[f64],
    axis: usize,
    factor: f64,
    mode: CollapseMode,
) -> (Vec<usize>, Vec<f64>) {
    let len = shape[axis];
    let outer: usize = shape[..axis].iter().product();
    let inner: usize = shape[axis + 1..].iter().product();
    let new_len = ((len as f64 / factor).round() as usize).max(1);

    let weights: Vec<Vec<(usize, f64)>> = (0..new_len)
        .map(|j| {
            let lo = j as f64 * factor;
            let hi = ((j + 1) as f64 * factor).min(len as f64);
            let first = lo.floor() as usize;
            let last = (hi.ceil() as usize).min(len);
            (first..last)
                .filter_map(|i| {
                    let overlap = hi.min((i + 1) as f64) - lo.max(i as f64);
                    (overlap > 0.0).then_some((i, overlap))
                })
                .collect()
        })
        .collect();

    let normalizer = match mode {
        CollapseMode::Sum => 1.0,
        CollapseMode::Average => factor,
    };

    let mut out = vec![0.0; outer * new_len * inner];
    for o in 0..outer {
        for (j, taps) in weights.iter().enumerate() {
            let target = (o * new_len + j) * inner;
            for &(i, weight) in taps {
                let source = (o * len + i) * inner;
                for k in 0..inner {
                    out[target + k] += weight * data[source + k];
                }
            }
            for value in &mut out[target..target + inner] {
                *value /= normalizer;
            }
        }
    }

    let mut new_shape = shape.to_vec();
    new_shape[axis] = new_len;
    (new_shape, out)
}
