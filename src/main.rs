mod chain;
mod config;
mod processor;
mod scanner;
mod store;
mod supervisor;
mod utils;

#[cfg(test)]
mod testing;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    chain::client::EvmRpcClient,
    config::IngestConfig,
    processor::processor::Processor,
    scanner::{
        reorg::{check_reorg, ReorgCheck},
        scanner::Scanner,
    },
    store::db::{init_pool, run_migrations},
    supervisor::{shutdown_signal, Supervisor},
};

#[derive(Debug, Parser)]
#[command(name = "deposit-scanner", version, about = "EVM deposit ingestion pipeline")]
struct Cli {
    /// Load variables from this dotenv file before reading the environment
    #[arg(long, global = true, value_name = "PATH")]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Command {
    /// Run scanner and processor together (default)
    Run,
    /// Run the scanner only
    Scan,
    /// Run the processor only
    Process,
    /// Verify stored blocks against the chain once, rolling back if it moved
    CheckReorg,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Some(path) = &cli.env_file {
        dotenvy::from_path(path)
            .with_context(|| format!("failed to load env file {}", path.display()))?;
    }
    let config = IngestConfig::from_env()?;
    let command = cli.command.unwrap_or(Command::Run);

    let pool = init_pool(config.database_dsn())
        .await
        .context("failed to open database")?;
    run_migrations(&pool)
        .await
        .context("failed to apply migrations")?;

    if command == Command::CheckReorg {
        let client = EvmRpcClient::new(config.rpc_url(), config.rpc_timeout())?;
        let settings = config.scanner();
        let check = check_reorg(&pool, &client, &settings.chain, settings.reorg_check_depth).await;
        pool.close().await;
        match check? {
            ReorgCheck::Consistent { verified } => {
                info!(chain = %settings.chain, ?verified, "Stored blocks match the chain")
            }
            ReorgCheck::RolledBack { pivot, report } => info!(
                chain = %settings.chain,
                pivot,
                blocks_deleted = report.blocks_deleted,
                events_deleted = report.events_deleted,
                deposits_reverted = report.reverted_deposits.len(),
                "Stored state rolled back"
            ),
        }
        return Ok(());
    }

    let mut supervisor = Supervisor::new();

    if matches!(command, Command::Run | Command::Scan) {
        let client = Arc::new(EvmRpcClient::new(config.rpc_url(), config.rpc_timeout())?);
        let scanner = Scanner::new(client, pool.clone(), config.scanner().clone());
        let cancel = supervisor.token();
        supervisor.spawn("scanner", async move {
            scanner.run(cancel).await.map_err(anyhow::Error::from)
        });
    }

    if matches!(command, Command::Run | Command::Process) {
        let processor = Processor::new(pool.clone(), config.processor().clone());
        let cancel = supervisor.token();
        supervisor.spawn("processor", async move {
            processor.run(cancel).await.map_err(anyhow::Error::from)
        });
    }

    let result = supervisor.wait(shutdown_signal()).await;
    pool.close().await;
    result
}
