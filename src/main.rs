use clap::{Parser, Subcommand};
use tracing::{error, info};

use etherblox::chain::EthNodeClient;
use etherblox::config::{self, AppConfig};
use etherblox::error::Result;
use etherblox::indexer::Indexer;
use etherblox::store::Store;
use etherblox::{api, fixtures, telemetry};

#[derive(Parser)]
#[command(name = "etherblox", about = "Fork-aware chain indexer and query API")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Follow new block headers from the upstream node and index them.
    Poll,
    /// Serve the query API from the indexed store.
    Serve,
    /// Fetch blocks by hash from the node and write them as JSON fixtures.
    SaveBlocks {
        /// Directory the fixture files are written into.
        #[arg(long, default_value = "testdata")]
        out_dir: String,
        /// Block hashes to save, in replay order.
        hashes: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        error!(error = %err, "exiting");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let app_config = config::load(&cli.config)?;
    telemetry::init_tracing(&app_config.telemetry_config())?;

    match cli.command {
        Command::Poll => poll(app_config).await,
        Command::Serve => serve(app_config).await,
        Command::SaveBlocks { out_dir, hashes } => save_blocks(app_config, out_dir, hashes).await,
    }
}

async fn poll(app_config: AppConfig) -> Result<()> {
    let store = Store::open(app_config.store.expanded_path())?;
    let chain = EthNodeClient::connect(&app_config.node.ws_endpoint).await?;
    let tracked_addresses = app_config.tracked_addresses()?;

    let mut indexer = Indexer::new(
        store,
        chain,
        tracked_addresses,
        app_config.indexer.max_reorg_depth,
    )?;

    tokio::select! {
        result = indexer.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}

async fn serve(app_config: AppConfig) -> Result<()> {
    let store = Store::open(app_config.store.expanded_path())?;

    tokio::select! {
        result = api::serve(&app_config.server.bind, store) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}

async fn save_blocks(app_config: AppConfig, out_dir: String, hashes: Vec<String>) -> Result<()> {
    let chain = EthNodeClient::connect(&app_config.node.ws_endpoint).await?;
    let written = fixtures::save_blocks(&chain, &hashes, &out_dir).await?;

    for name in written {
        info!(file = %name, dir = %out_dir, "saved fixture block");
    }
    Ok(())
}
