use std::sync::Arc;

use jointmesh_network_primitives::frame::{Justsaying, Request};

use crate::session::Session;

/// What the network layer hands to the node. Responses never show up here,
/// they are delivered to whoever sent the request.
#[derive(Debug)]
#[non_exhaustive]
pub enum NetworkEvent {
    Connected {
        session: Arc<Session>,
    },
    Justsaying {
        session: Arc<Session>,
        justsaying: Justsaying,
    },
    Request {
        session: Arc<Session>,
        request: Request,
    },
    Disconnected {
        session: Arc<Session>,
    },
}
