//! Anomos Tracker - neighbor assignment and tracking codes over HTTPS

use anomos_core::{CryptoContext, Identity};
use anomos_tracker::config::expand_path;
use anomos_tracker::{run_tracker, Config, TrackerHandle};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "anomos-tracker")]
#[command(about = "Anomos tracker", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.anomos-tracker/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve announces and scrapes
    Run {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the tracker certificate that peers should pin
    Cert,

    /// Initialize configuration
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);
    if let Commands::Init = cli.command {
        return init_config(&config_path);
    }

    let mut config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        tracing::warn!("No config at {}, using defaults", config_path.display());
        Config::default()
    };

    match cli.command {
        Commands::Run { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            let (ctx, identity) = load_identity(&config).await?;
            tracing::info!("Starting Anomos tracker {}", identity.peer_id());

            let (handle, commands) = TrackerHandle::channel();
            let result = run_tracker(config, identity, ctx, commands).await;
            drop(handle);
            result?;
            tracing::info!("Shutting down");
        }
        Commands::Cert => {
            let (_, identity) = load_identity(&config).await?;
            print!("{}", identity.cert_pem());
        }
        Commands::Init => {}
    }

    Ok(())
}

async fn load_identity(config: &Config) -> Result<(Arc<CryptoContext>, Arc<Identity>)> {
    let ctx = Arc::new(CryptoContext::new()?);
    let dir = config.data_dir();
    std::fs::create_dir_all(&dir)?;
    let hostname = config.hostname.clone();
    let passphrase = config.key_passphrase.clone();
    let keygen_ctx = ctx.clone();

    let identity = tokio::task::spawn_blocking(move || {
        Identity::load_or_generate(&keygen_ctx, &dir, &hostname, passphrase.as_deref())
    })
    .await??;
    Ok((ctx, Arc::new(identity)))
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        println!("Config already exists at: {}", path.display());
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let config = Config::default();
    std::fs::write(path, toml::to_string_pretty(&config)?)?;
    std::fs::create_dir_all(config.data_dir())?;

    println!("Initialized Anomos tracker at: {}", path.display());
    Ok(())
}
