//! Peer connections of a jointmesh node.
//!
//! [`run`] starts listening and dialing and hands back a [`NetworkClient`]
//! together with the stream of [`NetworkEvent`]s the node has to handle.

#![allow(clippy::multiple_inherent_impl, reason = "better readability")]

use std::sync::Arc;

use eyre::{Result as EyreResult, WrapErr};
use jointmesh_store::PeerDirectory;
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tracing::info;

pub mod client;
pub mod config;
pub mod correlator;
mod discovery;
pub mod liveness;
mod registry;
pub mod session;
mod transport;
pub mod types;

pub use client::NetworkClient;
pub use config::NetworkConfig;
pub use types::NetworkEvent;

pub async fn run(
    config: NetworkConfig,
    directory: Arc<dyn PeerDirectory>,
) -> EyreResult<(NetworkClient, mpsc::Receiver<NetworkEvent>)> {
    let (client, events) = NetworkClient::new(config, directory);

    for url in &client.config().bootstrap.peers {
        client
            .directory()
            .add_peer(&url.to_lowercase(), None)
            .await
            .wrap_err_with(|| format!("failed to seed bootstrap peer {url}"))?;
    }

    match client.config().port {
        Some(port) if !client.is_light() => {
            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .wrap_err_with(|| format!("failed to listen on port {port}"))?;

            info!(port, "listening for peers");

            drop(spawn(transport::listen(client.clone(), listener)));
        }
        _ => info!("not accepting inbound connections"),
    }

    drop(spawn(liveness::heartbeat_loop(client.clone())));
    drop(spawn(liveness::status_loop(client.clone())));

    if !client.is_light() {
        drop(spawn(discovery::maintain_outbound(client.clone())));
        drop(spawn(discovery::check_good_peers_after_start(client.clone())));
    }

    Ok((client, events))
}
