use std::fs::create_dir_all;

use clap::Parser;
use eyre::{bail, Result as EyreResult, WrapErr};
use jointmesh_config::{ConfigFile, NodeSection};
use jointmesh_network::NetworkConfig;
use jointmesh_primitives::id::UnitId;
use tracing::{info, warn};
use url::Url;

use crate::cli::RootArgs;

/// Initialize node configuration
#[derive(Debug, Parser)]
pub struct InitCommand {
    /// Port to accept peers on
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Do not accept inbound peers
    #[arg(long, conflicts_with = "port")]
    pub no_listen: bool,

    /// Serve device messages for wallets
    #[arg(long)]
    pub hub: bool,

    /// Follow a light vendor instead of the full history
    #[arg(long, requires = "light_vendor_url")]
    pub light: bool,

    /// Our externally reachable websocket url
    #[arg(long, value_name = "URL")]
    pub my_url: Option<Url>,

    /// ws:// vendor a light node connects to
    #[arg(long, value_name = "URL")]
    pub light_vendor_url: Option<Url>,

    /// ws:// peer to connect to on start, can be repeated
    #[arg(long = "boot-peer", value_name = "URL")]
    pub boot_peers: Vec<Url>,

    /// Witness address, can be repeated
    #[arg(long = "witness", value_name = "ADDRESS")]
    pub witnesses: Vec<String>,

    /// The only unit accepted without parents
    #[arg(long, value_name = "UNIT")]
    pub genesis_unit: Option<String>,

    /// Overwrite an existing configuration
    #[arg(long)]
    pub force: bool,
}

impl InitCommand {
    pub fn run(self, root_args: &RootArgs) -> EyreResult<()> {
        let path = &root_args.home;

        if ConfigFile::exists(path) {
            if !self.force {
                bail!("Node is already initialized in {:?}", path);
            }

            warn!(%path, "Overwriting existing configuration");
        }

        self.check_urls()?;

        create_dir_all(path)
            .wrap_err_with(|| format!("failed to create directory {path:?}"))?;

        let mut network = NetworkConfig::default();

        if self.no_listen || self.light {
            network.port = None;
        } else if let Some(port) = self.port {
            network.port = Some(port);
        }

        network.mode.hub = self.hub;
        network.mode.light = self.light;
        network.my_url = self.my_url.map(String::from);
        network.light_vendor_url = self.light_vendor_url.map(String::from);
        network.bootstrap.peers = self.boot_peers.into_iter().map(String::from).collect();

        let node = NodeSection::new(self.witnesses, self.genesis_unit.map(UnitId::from));

        ConfigFile::new(network, node).save(path)?;

        info!(%path, "Initialized a node");

        Ok(())
    }

    /// Peers we dial must be plain `ws`; our own url may sit behind a TLS
    /// proxy.
    fn check_urls(&self) -> EyreResult<()> {
        if let Some(url) = &self.my_url {
            if !matches!(url.scheme(), "ws" | "wss") {
                bail!("{url} is not a websocket url");
            }
        }

        for url in self.boot_peers.iter().chain(&self.light_vendor_url) {
            if url.scheme() != "ws" {
                bail!("{url} cannot be dialed, only ws:// urls are supported");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/init.rs"]
mod tests;
