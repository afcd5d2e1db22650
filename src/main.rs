use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use pipeline_runner::clock::format_wait;
use pipeline_runner::config::{ConfigError, ConfigOverrides, PipelineConfig, PipelineSettings};
use pipeline_runner::logging::{init_logging, LogFormat, LoggingConfig};
use pipeline_runner::runner::Runner;

/// Log record format on stderr
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "pipeline-runner")]
#[command(version)]
#[command(about = "Keep the fetch, process and convert pipeline running")]
#[command(after_help = "Examples:
  pipeline-runner                       Run forever with ./pipeline.toml or defaults
  pipeline-runner once                  Run a single cycle and exit
  pipeline-runner check --json          Print the resolved configuration
  pipeline-runner -c prod.toml --retry-count 5")]
struct Cli {
    /// Configuration file (default: pipeline.toml in the working directory, if present)
    #[arg(long, short, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Working directory
    #[arg(long, short = 'd', value_name = "DIR", global = true)]
    dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(long, short, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Log record format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: CliLogFormat,

    /// Attempts per step (overrides config)
    #[arg(long, value_name = "N", global = true)]
    retry_count: Option<u32>,

    /// Seconds between attempts of a step (overrides config)
    #[arg(long, value_name = "SECONDS", global = true)]
    retry_delay: Option<u64>,

    /// Seconds between steps (overrides config)
    #[arg(long, value_name = "SECONDS", global = true)]
    wait_between_steps: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Run the pipeline forever (default when no command is given)
    Run,
    /// Run a single pipeline cycle and exit
    Once,
    /// Validate the configuration and print the resolved pipeline
    Check {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Exit codes
mod exit_codes {
    use std::process::ExitCode;

    /// A single cycle failed
    pub fn cycle_failed() -> ExitCode {
        ExitCode::from(1)
    }

    /// Configuration could not be loaded or is invalid
    pub fn config_error() -> ExitCode {
        ExitCode::from(2)
    }

    /// Stopped by Ctrl+C
    pub fn interrupted() -> ExitCode {
        ExitCode::from(130)
    }
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            retry_count: self.retry_count,
            retry_delay_secs: self.retry_delay,
            wait_between_steps_secs: self.wait_between_steps,
        }
    }
}

/// Load settings from file and environment, apply CLI overrides, validate
fn resolve_config(cli: &Cli, dir: &Path) -> Result<PipelineConfig, ConfigError> {
    let mut settings = PipelineSettings::load(cli.config.as_deref(), dir)?;
    cli.overrides().apply(&mut settings);
    PipelineConfig::try_from(settings)
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_logging(
        LoggingConfig::from_verbosity(cli.verbose, cli.quiet).with_format(cli.log_format.into()),
    );

    let dir = match cli.dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let config = match resolve_config(&cli, &dir) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return Ok(exit_codes::config_error());
        }
    };

    match cli.command.clone().unwrap_or(Commands::Run) {
        Commands::Check { json: true } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { json: false } => {
            print!("{}", render_config(&config));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Once => {
            let runner = Runner::new(config);
            match runner.run_cycle().await {
                Ok(()) => {
                    tracing::info!("Cycle completed");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    tracing::error!("Cycle failed: {}", e);
                    Ok(exit_codes::cycle_failed())
                }
            }
        }
        Commands::Run => {
            let runner = Runner::new(config);
            tracing::info!(
                dir = %runner.config().working_dir.display(),
                "Starting pipeline runner"
            );
            tokio::select! {
                () = runner.run() => Ok(ExitCode::SUCCESS),
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    tracing::warn!("Interrupt received, stopping");
                    Ok(exit_codes::interrupted())
                }
            }
        }
    }
}

/// Human-readable summary of the resolved configuration
fn render_config(config: &PipelineConfig) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Working directory: {}\n",
        config.working_dir.display()
    ));
    out.push_str(&format!(
        "Interpreter: {}\n",
        config.interpreter.as_deref().unwrap_or("(none)")
    ));
    out.push_str(&format!(
        "Retry: {} attempt(s), {} apart{}\n",
        config.retry.max_attempts,
        format_wait(config.retry.delay),
        if config.retry.fail_fast_on_missing {
            ", fail fast on missing programs"
        } else {
            ""
        }
    ));
    out.push_str(&format!(
        "Delays: {} between steps, {} cooldown, {} recovery\n",
        format_wait(config.delays.between_steps),
        format_wait(config.delays.cycle_cooldown),
        format_wait(config.delays.recovery)
    ));
    out.push_str("Steps:\n");
    for (i, step) in config.pipeline.steps().iter().enumerate() {
        out.push_str(&format!("  {}. {} -> {}\n", i + 1, step.name(), step.program));
    }
    out
}
