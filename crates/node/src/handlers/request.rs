use std::sync::Arc;

use eyre::Result as EyreResult;
use jointmesh_network::session::{Session, CLOSE_NORMAL};
use jointmesh_network_primitives::catchup::{CatchupRequest, HashTreeRequest};
use jointmesh_network_primitives::frame::{Command, Request, Tag};
use jointmesh_network_primitives::payloads::JointResponse;
use jointmesh_primitives::id::UnitId;
use jointmesh_primitives::joint::Joint;
use serde_json::Value;
use tracing::{debug, info};

use crate::Node;

impl Node {
    pub(crate) async fn handle_request(
        &self,
        session: &Arc<Session>,
        request: Request,
    ) -> EyreResult<()> {
        let Request {
            command,
            params,
            tag,
        } = request;

        let Ok(command) = command.parse::<Command>() else {
            debug!(peer = session.peer(), command, "unknown command");
            session.send_error_response(&tag, &format!("unknown command: {command}"));
            return Ok(());
        };

        let result = self
            .serve_request(session, command, params.as_ref(), &tag)
            .await;

        release_unanswered(session, &tag, &result);

        result
    }

    async fn serve_request(
        &self,
        session: &Arc<Session>,
        command: Command,
        params: Option<&Value>,
        tag: &Tag,
    ) -> EyreResult<()> {
        match command {
            // normally answered by the network layer
            Command::Heartbeat => session.send_response(tag, None),
            Command::Subscribe => self.serve_subscribe(session, params, tag).await?,
            Command::GetJoint => {
                let Some(unit) = params.and_then(Value::as_str) else {
                    session.send_error_response(tag, "no unit");
                    return Ok(());
                };

                let unit = UnitId::from(unit);
                let response = match self.store().read_joint(&unit).await? {
                    Some(joint) => JointResponse::Found {
                        joint: Box::new(joint),
                    },
                    None => JointResponse::NotFound {
                        joint_not_found: unit,
                    },
                };

                session.send_response_as(tag, &response);
            }
            Command::PostJoint => {
                let Some(joint) = params
                    .cloned()
                    .and_then(|params| serde_json::from_value::<Joint>(params).ok())
                else {
                    session.send_error_response(tag, "no unit");
                    return Ok(());
                };

                match self.handle_posted_joint(session, joint).await? {
                    Ok(()) => session.send_response(tag, Some(Value::from("accepted"))),
                    Err(error) => session.send_error_response(tag, &error),
                }
            }
            Command::Catchup => {
                let Some(request) = params
                    .cloned()
                    .and_then(|params| serde_json::from_value::<CatchupRequest>(params).ok())
                else {
                    session.send_error_response(tag, "bad catchup request");
                    return Ok(());
                };

                match self.serve_catchup(&request).await {
                    Ok(chain) => session.send_response_as(tag, &chain),
                    Err(error) => session.send_error_response(tag, &error),
                }
            }
            Command::GetHashTree => {
                let Some(request) = params
                    .cloned()
                    .and_then(|params| serde_json::from_value::<HashTreeRequest>(params).ok())
                else {
                    session.send_error_response(tag, "bad hash tree request");
                    return Ok(());
                };

                match self.serve_hash_tree(&request).await {
                    Ok(tree) => session.send_response_as(tag, &tree),
                    Err(error) => session.send_error_response(tag, &error),
                }
            }
            Command::GetPeers => {
                let urls: Vec<String> = self
                    .network()
                    .outbound()
                    .iter()
                    .map(|session| session.peer().to_owned())
                    .collect();

                session.send_response_as(tag, &urls);
            }
            Command::GetWitnesses => {
                let witnesses = self.store().my_witnesses().await?;
                session.send_response_as(tag, &witnesses);
            }
            Command::HubDeliver | Command::HubGetTempPubkey | Command::HubTempPubkey => {
                let Some(hub) = self.hub() else {
                    session.send_error_response(tag, "I'm not a hub");
                    return Ok(());
                };

                match hub.handle_request(session.peer(), command, params).await {
                    Ok(response) => session.send_response(tag, Some(response)),
                    Err(error) => session.send_error_response(tag, &error),
                }
            }
            Command::LightGetHistory
            | Command::LightGetLinkProofs
            | Command::LightGetParentsAndLastBallAndWitnessListUnit => {
                self.serve_light_request(session, command, params, tag)
                    .await?;
            }
        }

        Ok(())
    }

    async fn serve_subscribe(
        &self,
        session: &Arc<Session>,
        params: Option<&Value>,
        tag: &Tag,
    ) -> EyreResult<()> {
        let Some(params) = params.and_then(Value::as_object) else {
            session.send_error_response(tag, "no params");
            return Ok(());
        };

        let Some(subscription_id) = params.get("subscription_id").and_then(Value::as_str) else {
            session.send_error_response(tag, "no subscription_id");
            return Ok(());
        };

        let is_self = self
            .network()
            .sessions()
            .iter()
            .any(|other| other.flags().subscription_id.as_deref() == Some(subscription_id));

        if is_self {
            info!(peer = session.peer(), "connected to self");

            if session.is_outbound() {
                self.network()
                    .directory()
                    .mark_self(session.peer())
                    .await?;
            }

            session.send_error_response(tag, "self-connect");
            session.close(CLOSE_NORMAL, "self-connect");

            return Ok(());
        }

        if self.network().is_light() {
            session.send_error_response(tag, "I'm light, cannot subscribe you to updates");
            return Ok(());
        }

        session.update_flags(|flags| flags.subscribed = true);
        session.send_response(tag, Some(Value::from("subscribed")));

        if self.state().is_catching_up() {
            return Ok(());
        }

        match params.get("last_mci").and_then(Value::as_u64) {
            Some(mci) => self.send_joints_since_mci(session, mci).await,
            None => self.send_free_joints(session).await,
        }
    }

    async fn serve_light_request(
        &self,
        session: &Session,
        command: Command,
        params: Option<&Value>,
        tag: &Tag,
    ) -> EyreResult<()> {
        if self.network().is_light() {
            session.send_error_response(tag, "I'm light myself, can't serve you");
            return Ok(());
        }

        if session.is_outbound() {
            session.send_error_response(tag, "light clients have to be inbound");
            return Ok(());
        }

        let Some(vendor) = self.inner.collaborators.light_vendor.as_ref() else {
            session.send_error_response(tag, "not a light vendor");
            return Ok(());
        };

        let response = match vendor.handle_request(command, params).await {
            Ok(response) => response,
            Err(error) => {
                session.send_error_response(tag, &error);
                return Ok(());
            }
        };

        if command == Command::LightGetHistory {
            let addresses = params
                .and_then(|params| params.get("addresses"))
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str);

            for address in addresses {
                self.store()
                    .watch_light_address(session.peer(), address)
                    .await?;
            }
        }

        session.send_response(tag, Some(response));

        Ok(())
    }
}

/// Answers a failed request with an error unless a response already went
/// out, which also releases the tag so the peer can ask again.
pub(crate) fn release_unanswered(session: &Session, tag: &Tag, result: &EyreResult<()>) {
    let Err(err) = result else {
        return;
    };

    if session.is_answering(tag) {
        session.send_error_response(tag, "internal error");
    } else {
        debug!(peer = session.peer(), %tag, %err, "request failed after it was answered");
    }
}
