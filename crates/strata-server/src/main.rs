//! Strata CI entrypoint.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use strata_core::variables::VariableMap;

mod commands;
mod config;
mod handlers;
mod intake;
mod local;
mod telemetry;

use commands::Commands;
use config::ServerConfig;

#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about = "Strata CI scheduler", long_about = None)]
struct Cli {
    /// Configuration file; defaults to ./strata.{yml,yaml,toml,json} when present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if cli.json_logs {
        config.log.json = true;
    }
    telemetry::init_tracing(&config.log);

    match cli.command {
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Run {
            path,
            vars,
            workspace,
        } => {
            let workspace = std::path::absolute(&workspace)
                .with_context(|| format!("Invalid workspace {}", workspace.display()))?;
            config.scheduler.working_dir = workspace.to_string_lossy().into_owned();

            let variables: VariableMap = vars.into_iter().collect();
            let job = handlers::run(config, &path, variables).await?;
            handlers::print_summary(&job);
            handlers::exit_status(&job)?;
        }
        Commands::Serve => handlers::serve(config).await?,
    }

    Ok(())
}
