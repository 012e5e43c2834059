//! Per-session ordering of network events.
//!
//! Every session gets one worker task that handles its events in arrival
//! order. Sessions still proceed independently of each other.

use std::collections::HashMap;

use jointmesh_network::session::SessionId;
use jointmesh_network::NetworkEvent;
use tokio::spawn;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{BoxedFuture, Node};

#[derive(Debug, Default)]
pub(crate) struct SessionQueues {
    queues: HashMap<SessionId, mpsc::UnboundedSender<NetworkEvent>>,
}

impl SessionQueues {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues `event` behind the earlier events of its session. The queue
    /// is dropped after `Disconnected`, which ends the worker once it has
    /// drained.
    pub(crate) fn push(&mut self, node: &Node, event: NetworkEvent) {
        let (id, disconnected) = match &event {
            NetworkEvent::Connected { session }
            | NetworkEvent::Justsaying { session, .. }
            | NetworkEvent::Request { session, .. } => (session.id(), false),
            NetworkEvent::Disconnected { session } => (session.id(), true),
            _ => {
                debug!(?event, "ignoring network event");
                return;
            }
        };

        let queue = self
            .queues
            .entry(id)
            .or_insert_with(|| node.spawn_session_worker());

        if let Err(mpsc::error::SendError(event)) = queue.send(event) {
            debug!(session = id, "session worker is gone, starting another");

            let queue = node.spawn_session_worker();
            let _ignored = queue.send(event);
            drop(self.queues.insert(id, queue));
        }

        if disconnected {
            drop(self.queues.remove(&id));
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queues.len()
    }
}

impl Node {
    fn spawn_session_worker(&self) -> mpsc::UnboundedSender<NetworkEvent> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let node = self.clone();

        let task: BoxedFuture<'static, ()> = Box::pin(async move {
            while let Some(event) = receiver.recv().await {
                let closed = match &event {
                    NetworkEvent::Justsaying { session, .. }
                    | NetworkEvent::Request { session, .. } => session.is_closed(),
                    _ => false,
                };

                if closed {
                    debug!(?event, "dropping traffic of a closed session");
                    continue;
                }

                node.handle_event(event).await;
            }
        });

        drop(spawn(task));

        sender
    }
}
