//! pgshift - prepares the embedded PostgreSQL data directory before the
//! service starts, upgrading it in place when the engine version changed.

#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use pgshift_core::config::ConfigSource;
use pgshift_core::{Config, Error};
use pgshift_runtime::DockerCli;
use pgshift_upgrade::{Orchestrator, Preparation, ShellExecutor, probe_from_config};
use tracing_subscriber::EnvFilter;

/// Exit status when a previous upgrade was interrupted and needs an operator.
const EXIT_INTERRUPTED: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "pgshift")]
#[command(
    version,
    about = "Prepare and upgrade the embedded PostgreSQL data directory",
    after_help = "Without a subcommand, `run` is assumed."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Echo pull progress, helper logs and command output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Initialize or upgrade the data directory (default)
    Run,

    /// Show on-disk version, expected version and upgrade ledgers
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    Config,
}

fn main() {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if cli.verbose {
        config.verbose = true;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let command = cli.command.unwrap_or(Commands::Run);
    std::process::exit(dispatch(&command, &config, cli.verbose));
}

fn dispatch(command: &Commands, config: &Config, verbose_flag: bool) -> i32 {
    if *command == Commands::Config {
        let mut summary = config.bootstrap_summary();
        if verbose_flag {
            summary.set("verbose", "true".to_string(), ConfigSource::CliArg);
        }
        print!("{}", summary.format());
        return 0;
    }

    let runtime = DockerCli::new(&config.docker_bin);
    let executor = ShellExecutor;
    let probe = probe_from_config(config);
    let orchestrator = Orchestrator::new(config, &runtime, &executor, probe.as_ref());

    match command {
        Commands::Run => match orchestrator.prepare() {
            Ok(prepared) => {
                match prepared {
                    Preparation::External => {}
                    Preparation::Initialized { path } => {
                        tracing::info!(path = %path.display(), "internal database initialized");
                    }
                    Preparation::Existing(outcome) => tracing::info!("{outcome}"),
                }
                0
            }
            Err(e) => report_failure(&e, config),
        },
        Commands::Status { json } => match orchestrator.status() {
            Ok(report) if *json => match serde_json::to_string_pretty(&report) {
                Ok(text) => {
                    println!("{text}");
                    0
                }
                Err(e) => report_failure(&Error::from(e), config),
            },
            Ok(report) => {
                print!("{}", report.render());
                0
            }
            Err(e) => report_failure(&e, config),
        },
        Commands::Config => 0,
    }
}

/// Log `err`, print captured output and remediation, and pick an exit code.
fn report_failure(err: &Error, config: &Config) -> i32 {
    tracing::error!(
        phase = err.phase(),
        error_type = err.error_type(),
        "{err}"
    );
    // Verbose runs already echoed the output as it was produced.
    if let Some(output) = err.output()
        && !config.verbose
    {
        eprintln!("{output}");
    }
    if let Some(remediation) = err.remediation() {
        eprintln!("{remediation}");
    }
    exit_code(err)
}

const fn exit_code(err: &Error) -> i32 {
    match err {
        Error::InterruptedUpgrade { .. } => EXIT_INTERRUPTED,
        _ => 1,
    }
}
