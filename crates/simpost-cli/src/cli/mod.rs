mod commands;
mod helpers;

use clap::Parser;
use simpost_core::domain::PipelineError;
use std::path::PathBuf;

pub fn run_from_env() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(args) {
        Ok(code) => code,
        Err(error) => {
            let pipeline_error = error.as_pipeline_error();
            eprintln!("{}", pipeline_error.diagnostic_line());
            eprintln!("{}", pipeline_error.fatal_exit_line());
            pipeline_error.exit_code()
        }
    }
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let full_args = std::iter::once("simpost".to_string())
        .chain(args.into_iter().map(Into::into))
        .collect::<Vec<_>>();
    parse_and_dispatch(full_args)
}

fn parse_and_dispatch(args: Vec<String>) -> Result<i32, CliError> {
    match Cli::try_parse_from(&args) {
        Ok(cli) => {
            helpers::init_tracing(cli.global.verbose);
            dispatch_parsed(cli.global, cli.command)
        }
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                print!("{}", err);
                Ok(0)
            }
            _ => Err(CliError::Usage(err.to_string())),
        },
    }
}

#[derive(Parser)]
#[command(
    name = "simpost",
    version,
    about = "Post-processing for Monte-Carlo SPECT simulation outputs"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Args)]
pub(crate) struct GlobalArgs {
    /// Directory holding the simulation outputs
    #[arg(long, global = true, default_value = ".")]
    dir: PathBuf,

    /// Pipeline configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend for header, resampling and noise operations
    #[arg(long, global = true, value_enum)]
    tools: Option<helpers::ToolsArg>,

    /// Keep each radionuclide/VOI pair of a window as its own group
    #[arg(long, global = true)]
    per_source: bool,

    /// Number of groups processed concurrently
    #[arg(long, global = true)]
    jobs: Option<usize>,

    /// Fail instead of skipping when an output already exists
    #[arg(long, global = true)]
    require_fresh: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Average per-seed images and energy spectra of completed runs
    Average(commands::AverageArgs),
    /// Combine every simulated source of each energy window
    Combine,
    /// Sum, scale, noise and collapse the projections of each window
    Postprocess(commands::ExposureArgs),
    /// Run average, combine and postprocess in order
    Pipeline(commands::ExposureArgs),
    /// Build CT and attenuation maps from a water/air density map
    Attenuation(commands::AttenuationArgs),
    /// Convert a reconstruction to activity concentration (Bq/mL)
    Quantify(commands::QuantifyArgs),
    /// Check the density map and source objects before a simulation batch
    Validate(commands::ValidateArgs),
    /// List complete and stale simulation runs
    Runs(commands::RunsArgs),
}

fn dispatch_parsed(global: GlobalArgs, command: CliCommand) -> Result<i32, CliError> {
    match command {
        CliCommand::Average(args) => commands::run_average_command(&global, args),
        CliCommand::Combine => commands::run_combine_command(&global),
        CliCommand::Postprocess(args) => commands::run_postprocess_command(&global, args),
        CliCommand::Pipeline(args) => commands::run_pipeline_command(&global, args),
        CliCommand::Attenuation(args) => commands::run_attenuation_command(&global, args),
        CliCommand::Quantify(args) => commands::run_quantify_command(&global, args),
        CliCommand::Validate(args) => commands::run_validate_command(&global, args),
        CliCommand::Runs(args) => commands::run_runs_command(&global, args),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Pipeline(PipelineError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<PipelineError> for CliError {
    fn from(error: PipelineError) -> Self {
        Self::Pipeline(error)
    }
}

impl CliError {
    fn as_pipeline_error(&self) -> PipelineError {
        match self {
            Self::Usage(message) => {
                PipelineError::configuration("CONFIG.CLI_USAGE", message.trim_end().to_string())
            }
            Self::Pipeline(error) => error.clone(),
            Self::Internal(error) => PipelineError::internal("SYS.CLI", format!("{error:#}")),
        }
    }
}
