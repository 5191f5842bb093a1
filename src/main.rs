// float_cmp: only in tests where assert_eq! on f64 is intentional.
#![cfg_attr(test, allow(clippy::float_cmp))]

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use optioneer::commands;
use optioneer::config;

#[derive(Parser)]
#[command(
    name = "optioneer",
    about = "Semi-autonomous options trading engine driven by declarative plays",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the orchestrated monitoring loop.
    Run {
        /// Log intended orders instead of submitting them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run a single tick and exit.
    Once {
        #[arg(long)]
        dry_run: bool,
    },
    /// Dump current play state counts and last errors.
    Status,
    /// Validate every play record on disk.
    Validate,
    /// Alias for `run --dry-run`.
    DryRun,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("OPTIONEER_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();
    let data_root = config::data_root();

    let result = match cli.command {
        Command::Run { dry_run } => commands::run::run(&data_root, dry_run).await,
        Command::Once { dry_run } => commands::once::run(&data_root, dry_run).await,
        Command::Status => commands::status::run(&data_root),
        Command::Validate => commands::validate::run(&data_root),
        Command::DryRun => commands::run::run(&data_root, true).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        std::process::exit(e.exit_code());
    }
}
