use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use events_indexer::abi::ContractRegistry;
use events_indexer::chain::AlloyChainClient;
use events_indexer::config::AppCfg;
use events_indexer::indexer::Indexer;
use events_indexer::{storage, web_api};

const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

#[derive(Parser, Debug)]
#[command(name = "events-indexer")]
#[command(about = "Indexes smart-contract events into a local store and serves them over HTTP", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the YAML config. Defaults to ./config.yaml, which may be absent.
    #[arg(short, long, env = "INDEXER_CONFIG")]
    config: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).compact().init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => AppCfg::load(path, true)?,
        None => AppCfg::load(&PathBuf::from(DEFAULT_CONFIG_PATH), false)?,
    };

    info!("Starting {}", cfg.get_name());
    info!("RPC: {} (chain id {})", cfg.chain.rpc_url, cfg.chain.chain_id);
    info!("Storage: {:?} at {}", cfg.storage.backend, cfg.storage.path);

    let registry = ContractRegistry::load(&cfg.contracts)?;
    info!("Contracts: {}", registry.names().join(", "));

    let store = storage::open_store(&cfg.storage)?;
    let chain = AlloyChainClient::connect(&cfg.chain, cfg.indexing.poll_interval()).await?;

    let indexer = Arc::new(Indexer::new(chain, Arc::clone(&store), registry, cfg.indexing.clone()));
    indexer.start();

    let shutdown = {
        let indexer = Arc::clone(&indexer);
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown signal received");
            indexer.stop();
        }
    };

    let router = web_api::create_web_api(store);
    if let Err(e) = web_api::serve(&cfg.api.bind_address(), router, shutdown).await {
        indexer.stop();
        return Err(e);
    }

    info!("Shutdown complete");
    Ok(())
}
