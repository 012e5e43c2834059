use std::sync::Arc;

use clap::Parser;
use eyre::{bail, Result as EyreResult};
use jointmesh_config::ConfigFile;
use jointmesh_node::reference::{BasicCatchup, BasicValidator};
use jointmesh_node::{start, Collaborators, NodeConfig};
use jointmesh_store::memory::MemoryStore;
use tracing::info;

use crate::cli::RootArgs;

/// Run a node
#[derive(Debug, Parser)]
pub struct RunCommand {
    /// Override the configured port
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,
}

impl RunCommand {
    pub async fn run(self, root_args: RootArgs) -> EyreResult<()> {
        let path = root_args.home;

        if !ConfigFile::exists(&path) {
            bail!("Node is not initialized in {:?}", path);
        }

        let mut config = ConfigFile::load(&path)?;

        if let Some(port) = self.port {
            config.network.port = Some(port);
        }

        info!(
            %path,
            port = ?config.network.port,
            hub = config.network.mode.hub,
            light = config.network.mode.light,
            "Starting node"
        );

        let store = Arc::new(MemoryStore::new());
        let validator = Arc::new(BasicValidator::new(
            Arc::clone(&store),
            config.node.genesis_unit.clone(),
        ));
        let catchup = Arc::new(BasicCatchup::new(Arc::clone(&store)));

        start(
            NodeConfig::new(
                config.network,
                config.node.witnesses,
                config.node.genesis_unit,
            ),
            Collaborators::new(store, validator, catchup),
        )
        .await
    }
}
