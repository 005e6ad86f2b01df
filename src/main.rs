use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ferryd::config::Config;
use ferryd::server::Server;
use ferryd::tombstone::TombstoneTable;
use ferryd::tunnel::Tunnel;

/// Mirror a local folder to configured peers and accept their changes.
#[derive(Debug, Parser)]
#[command(name = "ferryd", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(default_value = "config.json")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load(&cli.config)?;
    info!("synchronizing folder {}", config.root.display());

    // One table for the whole process: tunnels record deletes they announce,
    // the server records deletes it applies, and every reconnect replays it.
    let tombstones = TombstoneTable::new();

    let mut links = Vec::new();
    for peer in &config.peers {
        info!("found peer config for {}:{}", peer.ip, peer.port);
        let tunnel = Tunnel::new(peer, &config.root, tombstones.clone())?;
        links.push(std::thread::spawn(move || tunnel.run()));
    }

    if config.serves_inbound() {
        let server = Server::new(&config.root, &config.password, tombstones);
        server.serve(config.port)?;
    } else if links.is_empty() {
        bail!("nothing to do: no peers configured and inbound listener disabled");
    } else {
        for link in links {
            let _ = link.join();
        }
    }
    Ok(())
}
