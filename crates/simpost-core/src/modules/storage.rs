//! Volume and header persistence.
//!
//! `.im` volumes are stored as a small binary preamble followed by
//! little-endian `f32` samples:
//!
//! ```text
//! b"SPIM" | rank: u32 LE | dims: rank x u32 LE | samples: f32 LE
//! ```
//!
//! Any other extension (energy spectra, `.bis`) is headerless `f32` and read
//! as a 1-D array. Descriptive headers live in a `<file>.hdr` JSON sidecar.

use crate::common::constants::{HEADER_SIDECAR_EXTENSION, IMAGE_EXTENSION};
use crate::domain::{Header, PipelineError, PipelineResult, Volume};
use std::fs;
use std::path::{Path, PathBuf};

const VOLUME_MAGIC: &[u8; 4] = b"SPIM";
const MAX_RANK: usize = 8;

pub trait VolumeStore: Send + Sync {
    fn read(&self, path: &Path) -> PipelineResult<Volume>;
    fn write(&self, volume: &Volume, path: &Path) -> PipelineResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawVolumeStore;

impl VolumeStore for RawVolumeStore {
    fn read(&self, path: &Path) -> PipelineResult<Volume> {
        let bytes = fs::read(path).map_err(|source| {
            PipelineError::group(
                "GROUP.VOLUME_READ",
                format!("failed to read volume '{}': {}", path.display(), source),
            )
        })?;

        if has_image_extension(path) {
            decode_image(&bytes).map_err(|message| {
                PipelineError::group(
                    "GROUP.VOLUME_DECODE",
                    format!("failed to decode volume '{}': {}", path.display(), message),
                )
            })
        } else {
            let samples = decode_samples(&bytes).map_err(|message| {
                PipelineError::group(
                    "GROUP.VOLUME_DECODE",
                    format!("failed to decode samples '{}': {}", path.display(), message),
                )
            })?;
            Volume::new(vec![samples.len()], samples)
        }
    }

    fn write(&self, volume: &Volume, path: &Path) -> PipelineResult<()> {
        let bytes = if has_image_extension(path) {
            encode_image(volume)
        } else {
            encode_samples(volume.data())
        };
        write_atomically(path, &bytes)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case(IMAGE_EXTENSION))
}

fn encode_image(volume: &Volume) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + 4 * volume.rank() + 4 * volume.len());
    bytes.extend_from_slice(VOLUME_MAGIC);
    bytes.extend_from_slice(&(volume.rank() as u32).to_le_bytes());
    for dim in volume.shape() {
        bytes.extend_from_slice(&(*dim as u32).to_le_bytes());
    }
    bytes.extend_from_slice(&encode_samples(volume.data()));
    bytes
}

fn decode_image(bytes: &[u8]) -> Result<Volume, String> {
    if bytes.len() < 8 || &bytes[..4] != VOLUME_MAGIC {
        return Err("missing SPIM preamble".to_string());
    }
    let rank = read_u32(bytes, 4) as usize;
    if rank == 0 || rank > MAX_RANK {
        return Err(format!("unsupported rank {}", rank));
    }
    let samples_offset = 8 + 4 * rank;
    if bytes.len() < samples_offset {
        return Err("truncated dimension table".to_string());
    }
    let shape: Vec<usize> = (0..rank)
        .map(|axis| read_u32(bytes, 8 + 4 * axis) as usize)
        .collect();
    let samples = decode_samples(&bytes[samples_offset..])?;
    let expected: usize = shape.iter().product();
    if samples.len() != expected {
        return Err(format!(
            "shape {:?} needs {} samples but file holds {}",
            shape,
            expected,
            samples.len()
        ));
    }
    Volume::new(shape, samples).map_err(|error| error.message().to_string())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn encode_samples(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|sample| sample.to_le_bytes())
        .collect()
}

fn decode_samples(bytes: &[u8]) -> Result<Vec<f32>, String> {
    if bytes.len() % 4 != 0 {
        return Err(format!(
            "sample payload of {} bytes is not a whole number of f32 values",
            bytes.len()
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Writes through a sibling temporary file and renames it into place, so an
/// interrupted write never leaves a partial file under the final name.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| {
            PipelineError::io_system(
                "IO.OUTPUT_DIRECTORY",
                format!(
                    "failed to create output directory '{}': {}",
                    parent.display(),
                    source
                ),
            )
        })?;
    }

    let staging = staging_path(path);
    fs::write(&staging, bytes)
        .and_then(|()| fs::rename(&staging, path))
        .map_err(|source| {
            let _ = fs::remove_file(&staging);
            PipelineError::io_system(
                "IO.VOLUME_WRITE",
                format!("failed to write '{}': {}", path.display(), source),
            )
        })
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".partial-{}", std::process::id()));
    path.with_file_name(name)
}

pub fn header_path(volume_path: &Path) -> PathBuf {
    let mut name = volume_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(HEADER_SIDECAR_EXTENSION);
    volume_path.with_file_name(name)
}

/// Reads the header sidecar of `volume_path`; a missing sidecar is an empty
/// header. Read and parse failures belong to the group being processed.
pub fn read_header(volume_path: &Path) -> PipelineResult<Header> {
    let path = header_path(volume_path);
    if !path.is_file() {
        return Ok(Header::default());
    }
    let source = fs::read_to_string(&path).map_err(|source| {
        PipelineError::group(
            "GROUP.HEADER_READ",
            format!("failed to read header '{}': {}", path.display(), source),
        )
    })?;
    serde_json::from_str(&source).map_err(|source| {
        PipelineError::group(
            "GROUP.HEADER_PARSE",
            format!("failed to parse header '{}': {}", path.display(), source),
        )
    })
}

pub fn write_header(volume_path: &Path, header: &Header) -> PipelineResult<()> {
    let path = header_path(volume_path);
    let mut content = serde_json::to_string_pretty(header).map_err(|source| {
        PipelineError::internal(
            "SYS.HEADER_SERIALIZE",
            format!("failed to serialize header '{}': {}", path.display(), source),
        )
    })?;
    content.push('\n');
    write_atomically(&path, content.as_bytes())
}

/// Removes a volume and its header sidecar. Returns whether the volume existed.
pub fn remove_volume(path: &Path) -> PipelineResult<bool> {
    let existed = path.exists();
    for candidate in [path.to_path_buf(), header_path(path)] {
        if candidate.exists() {
            fs::remove_file(&candidate).map_err(|source| {
                PipelineError::io_system(
                    "IO.OUTPUT_REMOVE",
                    format!("failed to remove '{}': {}", candidate.display(), source),
                )
            })?;
        }
    }
    Ok(existed)
}
