//! Run configuration loaded from an optional JSON file.
//!
//! Every field has a default so an empty object (or no file at all) yields a
//! working configuration; the CLI then layers its flags on top.

use super::constants::CANONICAL_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GroupingPolicy {
    /// Sum every radionuclide and VOI of a window together.
    #[default]
    PerWindow,
    /// Keep each radionuclide/VOI pair of a window as its own group.
    PerSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolBackend {
    #[default]
    Native,
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolCommands {
    pub copy_header: String,
    pub set_header: String,
    pub read_header: String,
    pub collapse: String,
    pub collapse3d: String,
    pub add_noise: String,
    pub hu_to_attenuation: String,
}

impl Default for ToolCommands {
    fn default() -> Self {
        Self {
            copy_header: "imgcpinfo".to_string(),
            set_header: "imsetinfo".to_string(),
            read_header: "imghdr".to_string(),
            collapse: "collapse".to_string(),
            collapse3d: "collapse3d".to_string(),
            add_noise: "addnoise".to_string(),
            hu_to_attenuation: "hu2atn".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolConfig {
    pub backend: ToolBackend,
    pub noise_seed: Option<u64>,
    pub commands: ToolCommands,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttenuationConfig {
    pub pixel_size_cm: f64,
}

impl Default for AttenuationConfig {
    fn default() -> Self {
        Self {
            pixel_size_cm: 0.48,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub canonical_size: usize,
    pub simulation_prefix: String,
    pub require_completed_runs: bool,
    pub grouping: GroupingPolicy,
    pub workers: usize,
    pub exclusive_claims: bool,
    pub tools: ToolConfig,
    pub attenuation: AttenuationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            canonical_size: CANONICAL_SIZE,
            simulation_prefix: "sim".to_string(),
            require_completed_runs: true,
            grouping: GroupingPolicy::PerWindow,
            workers: 1,
            exclusive_claims: false,
            tools: ToolConfig::default(),
            attenuation: AttenuationConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineConfigError {
    #[error("failed to read pipeline config '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse pipeline config '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid pipeline config '{}': {message}", path.display())]
    Invalid { path: PathBuf, message: String },
}

pub fn load_pipeline_config(
    config_path: impl AsRef<Path>,
) -> Result<PipelineConfig, PipelineConfigError> {
    let config_path = config_path.as_ref();
    let source = fs::read_to_string(config_path).map_err(|source| PipelineConfigError::Read {
        path: config_path.to_path_buf(),
        source,
    })?;
    let config: PipelineConfig =
        serde_json::from_str(&source).map_err(|source| PipelineConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })?;

    if config.canonical_size == 0 {
        return Err(PipelineConfigError::Invalid {
            path: config_path.to_path_buf(),
            message: "canonicalSize must be positive".to_string(),
        });
    }
    if !(config.attenuation.pixel_size_cm.is_finite() && config.attenuation.pixel_size_cm > 0.0)
    {
        return Err(PipelineConfigError::Invalid {
            path: config_path.to_path_buf(),
            message: "attenuation.pixelSizeCm must be a positive number".to_string(),
        });
    }

    Ok(config)
}
