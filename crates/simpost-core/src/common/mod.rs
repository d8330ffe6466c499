pub mod config;
pub mod constants;

pub use config::{
    AttenuationConfig, GroupingPolicy, PipelineConfig, PipelineConfigError, ToolBackend,
    ToolCommands, ToolConfig, load_pipeline_config,
};
