use super::{CliError, GlobalArgs};
use anyhow::Context;
use simpost_core::common::{GroupingPolicy, PipelineConfig, ToolBackend, load_pipeline_config};
use simpost_core::domain::{PipelineError, StageReport, render_human_summary};
use simpost_core::pipelines::PipelineContext;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(super) enum ToolsArg {
    /// In-process implementations
    Native,
    /// Spawn the configured external binaries
    Command,
}

impl From<ToolsArg> for ToolBackend {
    fn from(value: ToolsArg) -> Self {
        match value {
            ToolsArg::Native => Self::Native,
            ToolsArg::Command => Self::Command,
        }
    }
}

/// Logs go to stderr so stdout carries only summaries.
pub(super) fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // a second initialisation (e.g. repeated in-process runs) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub(super) fn load_config(global: &GlobalArgs) -> Result<PipelineConfig, CliError> {
    let mut config = match &global.config {
        Some(path) => load_pipeline_config(path).map_err(|error| {
            CliError::Pipeline(PipelineError::configuration(
                "CONFIG.FILE",
                error.to_string(),
            ))
        })?,
        None => PipelineConfig::default(),
    };

    if let Some(tools) = global.tools {
        config.tools.backend = tools.into();
    }
    if let Some(jobs) = global.jobs {
        if jobs == 0 {
            return Err(CliError::Usage("--jobs must be at least 1".to_string()));
        }
        config.workers = jobs;
    }
    if global.per_source {
        config.grouping = GroupingPolicy::PerSource;
    }
    Ok(config)
}

pub(super) fn build_context(global: &GlobalArgs) -> Result<PipelineContext, CliError> {
    if !global.dir.is_dir() {
        return Err(CliError::Pipeline(PipelineError::configuration(
            "CONFIG.WORKING_DIR",
            format!("'{}' is not a directory", global.dir.display()),
        )));
    }
    let config = load_config(global)?;
    let dir = std::fs::canonicalize(&global.dir).with_context(|| {
        format!("failed to resolve working directory '{}'", global.dir.display())
    })?;
    debug!(
        dir = %dir.display(),
        backend = ?config.tools.backend,
        workers = config.workers,
        grouping = ?config.grouping,
        "pipeline context ready"
    );
    Ok(PipelineContext::new(dir, config).with_require_fresh(global.require_fresh))
}

/// Prints each summary and returns 1 when any group was abandoned.
pub(super) fn report_exit_code(reports: &[StageReport]) -> i32 {
    for report in reports {
        println!("{}", render_human_summary(report));
    }
    if reports.iter().any(StageReport::has_abandoned) {
        1
    } else {
        0
    }
}
