//! Anomos - anonymizing P2P overlay peer

use anomos_core::{hash_to_hex, hex_to_hash, CryptoContext, Identity};
use anomos_peer::announce::TrackerClient;
use anomos_peer::config::{expand_path, Config};
use anomos_peer::{run_peer_loop, AppEvent, PeerHandle};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "anomos")]
#[command(about = "Anonymizing peer-to-peer overlay", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.anomos/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Tracker announce URL (overrides config)
    #[arg(long)]
    tracker: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the overlay and serve the configured swarms
    Run {
        /// Port for neighbor links (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Ask the tracker for swarm counts
    Scrape {
        /// Infohash (hex); all swarms when omitted
        info_hash: Option<String>,
    },

    /// Print this peer's id, creating the identity if needed
    Id,

    /// Initialize configuration
    Init,
}

#[tokio::main(flavor = "current_thread")]
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

    let mut config = load_config(&config_path)?;
    if let Some(url) = cli.tracker {
        config.tracker.url = url;
    }

    match cli.command {
        Commands::Run { port } => {
            if let Some(port) = port {
                config.network.listen_port = port;
            }
            run(config).await?;
        }
        Commands::Scrape { info_hash } => {
            scrape(&config, info_hash.as_deref()).await?;
        }
        Commands::Id => {
            let (_, identity) = load_identity(&config).await?;
            println!("{}", hex::encode(identity.peer_id().0));
        }
        Commands::Init => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        tracing::warn!("No config at {}, using defaults", path.display());
        Ok(Config::default())
    }
}

/// Load the identity from the data directory, generating it on first start
async fn load_identity(config: &Config) -> Result<(Arc<CryptoContext>, Arc<Identity>)> {
    let ctx = Arc::new(CryptoContext::new()?);
    let dir = config.data_dir();
    std::fs::create_dir_all(&dir)?;
    let hostname = config.network.hostname.clone();
    let passphrase = config.network.key_passphrase.clone();
    let keygen_ctx = ctx.clone();

    // Key generation takes seconds; keep it off the event loop
    let identity = tokio::task::spawn_blocking(move || {
        Identity::load_or_generate(&keygen_ctx, &dir, &hostname, passphrase.as_deref())
    })
    .await??;
    Ok((ctx, Arc::new(identity)))
}

async fn run(config: Config) -> Result<()> {
    let (ctx, identity) = load_identity(&config).await?;
    tracing::info!("Peer id {}", identity.peer_id());

    let (handle, commands) = PeerHandle::channel();
    let (app_tx, mut app_rx) = mpsc::unbounded_channel();

    // Piece transfer lives outside the overlay; report what arrives
    let reporter = tokio::spawn(async move {
        while let Some(event) = app_rx.recv().await {
            match event {
                AppEvent::Opened {
                    stream,
                    info_hash,
                    initiator,
                } => tracing::info!(
                    "Stream {} open for {} ({})",
                    stream,
                    hash_to_hex(&info_hash),
                    if initiator { "outgoing" } else { "incoming" }
                ),
                AppEvent::Closed { stream, .. } => tracing::info!("Stream {} closed", stream),
                AppEvent::Message {
                    stream, message, ..
                } => tracing::debug!("Stream {}: {:?}", stream, message),
            }
        }
    });

    let result = run_peer_loop(config, identity, ctx, commands, app_tx).await;
    drop(handle);
    reporter.abort();
    result
}

async fn scrape(config: &Config, info_hash: Option<&str>) -> Result<()> {
    let (_, identity) = load_identity(config).await?;
    let tracker = TrackerClient::new(&identity, &config.tracker)?;
    let info_hash = info_hash.map(hex_to_hash).transpose()?;
    let response = tracker.scrape(info_hash.as_ref()).await?;

    if response.files.is_empty() {
        println!("No swarms");
        return Ok(());
    }
    for (hash, entry) in &response.files {
        println!(
            "{}  seeders: {:>4}  leechers: {:>4}  completed: {:>6}",
            hex::encode(hash),
            entry.complete,
            entry.incomplete,
            entry.downloaded
        );
    }
    Ok(())
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
    let toml = toml::to_string_pretty(&config)?;
    std::fs::write(path, toml)?;
    std::fs::create_dir_all(config.data_dir())?;

    println!("Initialized Anomos at: {}", path.display());
    Ok(())
}
