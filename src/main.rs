use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use attractor::config::Settings;
use attractor::store::{GitVcs, ProjectStore};

#[derive(Parser)]
#[command(name = "attractor")]
#[command(version, about = "Git-backed issue tracker with supervised amplifier sessions")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the event and session server
    Serve {
        /// Port to serve on (overrides config and ATTRACTOR_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides config and ATTRACTOR_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Path to a TOML config file (defaults to ./attractor.toml if present)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Scaffold a new git-backed project store
    Init {
        /// Directory to create the store in
        path: PathBuf,

        /// Store identifier (random if omitted)
        #[arg(long)]
        store_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host, config } => {
            let mut settings = Settings::load(config.as_deref())?;
            if let Some(port) = port {
                settings.port = port;
            }
            if let Some(host) = host {
                settings.host = host;
            }
            attractor::logging::init(settings.log_json);
            attractor::server::start_server(settings).await?;
        }
        Commands::Init { path, store_id } => {
            attractor::logging::init(false);
            let store_id = store_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let store = tokio::task::spawn_blocking(move || {
                ProjectStore::init(path, &store_id, Arc::new(GitVcs::new()))
                    .map(|store| (store, store_id))
            })
            .await
            .context("Store initialization task failed")?;
            let (store, store_id) =
                store.context("Failed to initialize project store")?;
            println!("Initialized store {} at {}", store_id, store.path().display());
        }
    }

    Ok(())
}
