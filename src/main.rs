use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paula::channels::FacebookChannel;
use paula::config::{config_schema_json, Config};
use paula::store::Store;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

/// Paula - conversational health coach backend.
#[derive(Parser, Debug)]
#[command(name = "paula", version, about)]
struct Cli {
    /// Config file (default: <config dir>/paula/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the webhook gateway
    Gateway {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides PORT and the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Create or update the database schema and exit
    Migrate,
    /// Subscribe the Facebook app to page events
    Subscribe,
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    /// Print the JSON schema of the config file
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("paula=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    if let Some(path) = &config.config_path {
        tracing::debug!("Loaded config from {}", path.display());
    }

    match cli.command {
        Commands::Gateway { host, port } => {
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let port = port.unwrap_or(config.port);
            paula::gateway::run_gateway(&host, port, config).await
        }
        Commands::Migrate => {
            let path = config.database_path();
            Store::open(&path)
                .with_context(|| format!("Failed to open database {}", path.display()))?;
            tracing::info!("Database schema is up to date at {}", path.display());
            Ok(())
        }
        Commands::Subscribe => {
            let token = config
                .facebook
                .page_access_token
                .clone()
                .context("FB_PAGE_ACCESS_TOKEN is not set")?;
            FacebookChannel::new(token, config.facebook.verify_token.clone().unwrap_or_default())
                .subscribe_app()
                .await
        }
        Commands::Config { cmd: ConfigCmd::Schema } => {
            println!("{}", serde_json::to_string_pretty(&config_schema_json()?)?);
            Ok(())
        }
    }
}
