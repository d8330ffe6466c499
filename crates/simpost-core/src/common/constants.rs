//! Fixed names and numbers shared by the stage pipelines.
//!
//! Header attribute names follow the interfile-style keys written by the
//! simulation and reconstruction tools; output names are the canonical names
//! downstream reconstruction expects.

pub const CANONICAL_SIZE: usize = 128;

pub const IMAGE_EXTENSION: &str = "im";
pub const SPECTRUM_EXTENSION: &str = "bis";
pub const AVERAGE_TAG: &str = "avg";
pub const RUN_RESULT_EXTENSION: &str = "res";
pub const RUN_LOG_EXTENSION: &str = "log";
pub const HEADER_SIDECAR_EXTENSION: &str = "hdr";

pub const ATTR_PIXEL_SPACING_ROWS: &str = "Pixel Spacing Rows";
pub const ATTR_PIXEL_SPACING_COLS: &str = "Pixel Spacing Cols";
pub const ATTR_SLICES_SPACING: &str = "Slices Spacing";
pub const ATTR_PIXEL_SIZE: &str = "Pixel Size";
pub const ATTR_MODALITY: &str = "Modality";
pub const ATTR_FRAME_DURATION_MS: &str = "Actual Frame Duration";
pub const ATTR_PROJECTION_COUNT: &str = "Number of Projections";
pub const ATTR_SLICE_THICKNESS_CM: &str = "SliceThickness";
pub const ATTR_PIXEL_WIDTH_CM: &str = "PixelWidth";

pub const COLLAPSED_PREFIX: &str = "collapsed.";
pub const COMBINED_PREFIX: &str = "combined";
pub const NOISE_FREE_PREFIX: &str = "prj.nf";
pub const NOISY_PREFIX: &str = "prj.n";

pub const CT_FILE: &str = "ct.im";
pub const CT_CANONICAL_FILE: &str = "ct_128.im";
pub const ATTENUATION_ALIASES: [&str; 2] = ["atn.w1i1.im", "atn.w1i2.im"];

/// Density-map voxel values the attenuation stage understands.
pub const DENSITY_AIR: f32 = 0.0;
pub const DENSITY_WATER: f32 = 1000.0;
pub const HU_AIR: f32 = -1000.0;
pub const HU_WATER: f32 = 0.0;
pub const DENSITY_MAX: f32 = 5000.0;

/// Mass attenuation of water (keV, cm^2/g), photon energies relevant to
/// SPECT radionuclides. Interpolated log-log.
pub const WATER_MASS_ATTENUATION: [(f64, f64); 12] = [
    (30.0, 0.3756),
    (40.0, 0.2683),
    (50.0, 0.2269),
    (60.0, 0.2059),
    (80.0, 0.1837),
    (100.0, 0.1707),
    (150.0, 0.1505),
    (200.0, 0.1370),
    (300.0, 0.1186),
    (400.0, 0.1061),
    (500.0, 0.0969),
    (600.0, 0.0896),
];

/// FNV-1a parameters used to derive per-output noise seeds.
pub const SEED_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
pub const SEED_PRIME: u64 = 0x00000100000001B3;
