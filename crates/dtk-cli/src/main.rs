//! driftkit command-line interface
//!
//! Exit codes: 0 when every selected metric finished successfully, 1 on
//! operational errors, 2 on configuration or argument errors.

mod commands;
mod project;
mod selector;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

use dtk_common::Result;

use commands::run::RunArgs;

#[derive(Parser)]
#[command(
    name = "dtk",
    version,
    about = "Declarative time-series anomaly monitoring"
)]
struct Cli {
    /// Project directory (defaults to the current directory)
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scaffold a new driftkit project
    Init {
        /// Project name; a directory of this name is created
        name: String,
    },
    /// Run LOAD -> DETECT -> ALERT for selected metrics
    Run(RunArgs),
    /// Send a synthetic alert through a metric's configured channels
    TestAlert {
        /// Metric name as declared in its file
        metric: String,
        /// Profile name from the profiles file
        #[arg(long)]
        profile: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match &cli.command {
        Command::Init { name } => {
            let cwd = std::env::current_dir()?;
            commands::init::execute(name, &cwd)?;
            Ok(0)
        }
        Command::Run(args) => commands::run::execute(&cli.project, args).await,
        Command::TestAlert { metric, profile } => {
            commands::test_alert::execute(&cli.project, metric, profile.as_deref()).await
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(category = e.category(), "{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}
