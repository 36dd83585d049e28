use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tarsy::config;
use tarsy::orchestrator::{ChainRegistry, ChainRunner};
use tarsy::session_manager::SessionManager;
use tarsy_core::{EventBus, InMemoryHistoryRepository};

#[derive(Parser)]
#[command(
    name = "tarsy",
    about = "Alert-triage engine: routes alerts through chains of LLM-driven agents",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load configuration and serve alerts until shut down.
    Serve {
        /// Directory containing chains.yaml, mcp_servers.yaml, providers.yaml.
        #[arg(short, long)]
        config: PathBuf,

        /// Provider id used when a chain names no `llm_provider` of its own.
        /// Defaults to the alphabetically first configured provider.
        #[arg(long, env = "TARSY_DEFAULT_PROVIDER")]
        default_provider: Option<String>,

        /// Maximum number of alerts processed concurrently.
        #[arg(long, env = "TARSY_MAX_CONCURRENT_ALERTS", default_value_t = 4)]
        max_concurrent_alerts: usize,
    },
    /// Show version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("tarsy v{}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Serve { config: config_dir, default_provider, max_concurrent_alerts } => {
            init_tracing();
            serve(config_dir, default_provider, max_concurrent_alerts).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tarsy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(
    config_dir: PathBuf,
    default_provider: Option<String>,
    max_concurrent_alerts: usize,
) -> anyhow::Result<()> {
    let event_bus = Arc::new(EventBus::new());
    let history: Arc<dyn tarsy_core::HistoryRepository> = Arc::new(InMemoryHistoryRepository::new());

    let chains = config::load_chains(&config_dir.join("chains.yaml"))?;
    let mcp_registry = config::load_mcp_servers(&config_dir.join("mcp_servers.yaml"))?;
    let providers = config::load_providers(&config_dir.join("providers.yaml"), event_bus.clone())?;

    let default_provider = match default_provider {
        Some(id) => id,
        None => {
            let mut ids: Vec<&String> = providers.keys().collect();
            ids.sort();
            ids.into_iter()
                .next()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no llm providers configured"))?
        }
    };
    if !providers.contains_key(&default_provider) {
        anyhow::bail!("default provider '{default_provider}' is not among the configured providers");
    }
    tracing::info!(provider = %default_provider, "using default llm provider");

    let providers = Arc::new(providers);
    let chain_registry = Arc::new(ChainRegistry::new(chains));
    let chain_runner = Arc::new(ChainRunner::new(
        mcp_registry,
        providers.clone(),
        default_provider.clone(),
        history.clone(),
        event_bus.clone(),
    ));

    let manager = SessionManager::new(
        history,
        event_bus,
        chain_registry,
        chain_runner,
        providers,
        default_provider,
        max_concurrent_alerts,
    );

    let recovered = manager.recover_orphans().await?;
    tracing::info!(recovered, pod_id = %manager.pod_id(), "tarsy engine ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, exiting");
    Ok(())
}
