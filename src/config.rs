//! Static configuration: the local root, the inbound listener, and the
//! outbound peers.

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Local synchronization root; must exist and be a directory.
    #[serde(rename = "folder")]
    pub root: PathBuf,

    /// Inbound listener port; 0 disables the listener.
    #[serde(default)]
    pub port: u16,

    /// Credential required of inbound peers; empty disables the listener.
    #[serde(default)]
    pub password: String,

    /// Outbound peer links.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerEntry {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "Port")]
    pub port: u16,
    pub password: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("opening config {}", path.display()))?;
        let config: Config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let meta = std::fs::metadata(&self.root)
            .with_context(|| format!("folder {} does not exist", self.root.display()))?;
        if !meta.is_dir() {
            bail!("folder {} is not a directory", self.root.display());
        }
        for (i, peer) in self.peers.iter().enumerate() {
            peer.ip
                .parse::<IpAddr>()
                .map_err(|_| anyhow!("invalid IP for peer {i}: {}", peer.ip))?;
        }
        Ok(())
    }

    /// The listener runs only when both a port and a password are set.
    pub fn serves_inbound(&self) -> bool {
        self.port != 0 && !self.password.is_empty()
    }
}
