use async_trait::async_trait;
use jointmesh_network_primitives::frame::{Command, Subject};
use serde_json::Value;

/// Reports on work owned by other subsystems. The node is idle when all of
/// them are zero and no unit is being admitted.
pub trait IdleProbe: Send + Sync {
    fn used_connections(&self) -> usize;

    fn queued_jobs(&self) -> usize;

    fn held_locks(&self) -> usize;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopIdleProbe;

impl IdleProbe for NoopIdleProbe {
    fn used_connections(&self) -> usize {
        0
    }

    fn queued_jobs(&self) -> usize {
        0
    }

    fn held_locks(&self) -> usize {
        0
    }
}

/// Device message relay run by hubs.
#[async_trait]
pub trait HubService: Send + Sync {
    /// `hub/login`, `hub/refresh` and `hub/delete`. `challenge` is the one
    /// we sent the peer on connect.
    async fn handle_justsaying(
        &self,
        peer: &str,
        subject: Subject,
        body: &Value,
        challenge: Option<&str>,
    ) -> Result<(), String>;

    async fn handle_request(
        &self,
        peer: &str,
        command: Command,
        params: Option<&Value>,
    ) -> Result<Value, String>;
}

/// History and proofs served to light clients.
#[async_trait]
pub trait LightVendorService: Send + Sync {
    async fn handle_request(&self, command: Command, params: Option<&Value>)
        -> Result<Value, String>;
}
