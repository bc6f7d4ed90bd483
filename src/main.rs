use anyhow::Result;
use chatmem_config::StoreConfig;
use chatmem_store::ConversationStore;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chatmem")]
#[command(about = "Administrative CLI for the chatmem conversation store", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE", default_value = "config.yaml")]
    config: PathBuf,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show live conversation statistics
    Stats,

    /// Delete all but the N most recently updated conversations
    Cleanup {
        /// How many conversations to retain
        #[arg(short, long)]
        keep: usize,
    },

    /// Delete every conversation. Irreversible.
    CleanupAll {
        /// Required confirmation flag
        #[arg(long, action = clap::ArgAction::SetTrue)]
        yes: bool,
    },

    /// Delete the conversation for one (user, channel) pair
    Clear {
        /// User identifier
        #[arg(short, long)]
        user: String,

        /// Channel identifier
        #[arg(short = 'n', long)]
        channel: String,
    },

    /// Show the effective store configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config = if cli.config.exists() {
        info!("Loading configuration from: {:?}", cli.config);
        StoreConfig::from_yaml(&cli.config)?
    } else {
        info!("Using default configuration");
        StoreConfig::default()
    };

    let store = ConversationStore::connect(config).await;

    match cli.command {
        Commands::Stats => {
            let stats = store.stats().await?;
            println!("Backend:          {}", stats.backend_kind);
            println!("Health:           {}", store.backend_health().await);
            println!("Active:           {}", stats.active_count);
            println!("Total messages:   {}", stats.total_messages);
            if let Some(oldest) = stats.oldest_updated_at {
                println!("Oldest update:    {}", oldest.to_rfc3339());
            }
            if let Some(newest) = stats.newest_updated_at {
                println!("Newest update:    {}", newest.to_rfc3339());
            }
        }
        Commands::Cleanup { keep } => {
            let removed = store.cleanup(keep).await?;
            println!("Removed {removed} conversations, kept at most {keep}");
        }
        Commands::CleanupAll { yes } => {
            if !yes {
                anyhow::bail!("cleanup-all deletes every conversation; pass --yes to confirm");
            }
            let removed = store.cleanup_all().await?;
            println!("Removed {removed} conversations");
        }
        Commands::Clear { user, channel } => {
            let existed = store.clear(&user, &channel).await?;
            if existed {
                println!("Cleared conversation for ({user}, {channel})");
            } else {
                println!("No conversation found for ({user}, {channel})");
            }
        }
        Commands::Config => {
            let report = store.config_report();
            println!("Backend:                       {}", report.backend_kind);
            println!(
                "Max messages per conversation: {}",
                report.max_messages_per_conversation
            );
            println!("Conversation TTL (secs):       {}", report.conversation_ttl_secs);
            println!("Context window size:           {}", report.context_window_size);
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
