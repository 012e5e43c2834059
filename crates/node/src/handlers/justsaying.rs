use core::mem;
use std::sync::Arc;

use eyre::{Result as EyreResult, WrapErr};
use jointmesh_network::session::{Session, CLOSE_NORMAL};
use jointmesh_network_primitives::frame::Subject;
use jointmesh_network_primitives::payloads::VersionInfo;
use jointmesh_node_primitives::events::NodeEvent;
use jointmesh_primitives::common::random_token;
use jointmesh_primitives::constants::{is_valid_address, ALT, PROTOCOL_VERSION};
use jointmesh_primitives::joint::Joint;
use jointmesh_primitives::peer::host_of;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::Node;

const ECHO_STRING_LENGTH: usize = 30;

impl Node {
    pub(crate) async fn handle_justsaying(
        &self,
        session: &Arc<Session>,
        subject: &str,
        body: Value,
    ) -> EyreResult<()> {
        let Ok(subject) = subject.parse::<Subject>() else {
            debug!(peer = session.peer(), subject, "ignoring unknown notice");
            return Ok(());
        };

        match subject {
            Subject::Refresh => {
                if !self.state().is_catching_up() {
                    match body.as_u64() {
                        Some(mci) => self.send_joints_since_mci(session, mci).await?,
                        None => self.send_free_joints(session).await?,
                    }
                }
            }
            Subject::Version => self.handle_version(session, body),
            Subject::Joint => self.handle_pushed_joint(session, body).await?,
            Subject::FreeJointsEnd | Subject::Result | Subject::Info => {
                debug!(peer = session.peer(), %subject, %body, "peer says");
            }
            Subject::Error => warn!(peer = session.peer(), %body, "peer reported an error"),
            Subject::PrivatePayment => {
                if body.is_array() {
                    self.emit(NodeEvent::PrivatePayment {
                        peer: session.peer().to_owned(),
                        body,
                    });
                } else {
                    session.send_error("private_payment content must be array");
                }
            }
            Subject::Bugreport => self.emit(NodeEvent::BugReport {
                peer: session.peer().to_owned(),
                body,
            }),
            Subject::MyUrl => self.handle_my_url(session, &body).await?,
            Subject::WantEcho => self.handle_want_echo(session, &body),
            Subject::YourEcho => self.handle_your_echo(session, &body).await?,
            Subject::HubLogin | Subject::HubRefresh | Subject::HubDelete => {
                self.handle_hub_notice(session, subject, &body).await;
            }
            Subject::HubChallenge | Subject::HubMessage => {
                self.emit(NodeEvent::MessageFromHub {
                    peer: session.peer().to_owned(),
                    subject: subject.to_string(),
                    body,
                });
            }
            Subject::LightHaveUpdates => {
                if !self.network().is_light() {
                    session.send_error("I'm not light");
                } else if !session.flags().light_vendor {
                    session.send_error("You are not my light vendor");
                } else {
                    self.emit(NodeEvent::MessageForLight {
                        peer: session.peer().to_owned(),
                        subject: subject.to_string(),
                        body,
                    });
                }
            }
            Subject::LightNewAddressToWatch => {
                self.handle_new_address_to_watch(session, &body).await?;
            }
        }

        Ok(())
    }

    fn handle_version(&self, session: &Session, body: Value) {
        let version: VersionInfo = match serde_json::from_value(body) {
            Ok(version) => version,
            Err(err) => {
                debug!(peer = session.peer(), %err, "malformed version");
                session.send_error("malformed version");
                return;
            }
        };

        if version.protocol_version != PROTOCOL_VERSION {
            session.send_error(&format!(
                "Incompatible versions, mine {PROTOCOL_VERSION}, yours {}",
                version.protocol_version
            ));
            session.close(CLOSE_NORMAL, "incompatible versions");
            return;
        }

        if version.alt != ALT {
            session.send_error(&format!(
                "Incompatible alts, mine {ALT}, yours {}",
                version.alt
            ));
            session.close(CLOSE_NORMAL, "incompatible alts");
            return;
        }

        debug!(
            peer = session.peer(),
            program = version.program,
            program_version = version.program_version,
            "peer version"
        );
    }

    async fn handle_pushed_joint(&self, session: &Arc<Session>, body: Value) -> EyreResult<()> {
        let Ok(joint) = serde_json::from_value::<Joint>(body) else {
            session.send_error("no unit");
            return Ok(());
        };

        if joint.has_ball() && !self.is_genesis(joint.id()) {
            session.send_error("only requested joint can contain a ball");
            return Ok(());
        }

        if self.network().is_light() && !session.flags().light_vendor {
            session.send_error("I'm a light client and you are not my vendor");
            return Ok(());
        }

        self.handle_online_joint(session, joint).await
    }

    /// An inbound peer tells us where it can be dialed. We check the claim
    /// by dialing it and sending a random string that the peer has to echo
    /// back over this connection.
    async fn handle_my_url(&self, session: &Session, body: &Value) -> EyreResult<()> {
        let Some(url) = body.as_str().filter(|url| !url.is_empty()) else {
            return Ok(());
        };

        if session.is_outbound() {
            return Ok(());
        }

        let repeated = session.update_flags(|flags| mem::replace(&mut flags.advertised_own_url, true));
        if repeated {
            return Ok(());
        }

        let url = url.to_lowercase();
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Ok(());
        }

        session.update_flags(|flags| flags.claimed_url = Some(url.clone()));

        let verified = self
            .network()
            .directory()
            .verified_url(session.host())
            .await
            .wrap_err("failed to read verified url")?;

        if verified.as_deref() == Some(url.as_str()) {
            return Ok(());
        }

        let echo = random_token(ECHO_STRING_LENGTH);
        session.update_flags(|flags| flags.sent_echo_string = Some(echo.clone()));

        match self.network().connect(&url).await {
            Ok(reverse) => reverse.send_justsaying(Subject::WantEcho, Value::from(echo)),
            Err(err) => debug!(%url, ?err, "failed to connect to claimed url"),
        }

        Ok(())
    }

    fn handle_want_echo(&self, session: &Session, body: &Value) {
        if session.is_outbound() {
            return;
        }

        let Some(echo) = body.as_str() else {
            return;
        };

        let Some(claimed_url) = session.flags().claimed_url else {
            return;
        };

        let Some(reverse) = self.network().outbound_by_url(&claimed_url) else {
            debug!(url = %claimed_url, "no reverse connection to echo over");
            return;
        };

        reverse.send_justsaying(Subject::YourEcho, Value::from(echo));
    }

    async fn handle_your_echo(&self, session: &Session, body: &Value) -> EyreResult<()> {
        if session.is_outbound() {
            return Ok(());
        }

        let flags = session.flags();

        let (Some(claimed_url), Some(sent)) = (flags.claimed_url, flags.sent_echo_string) else {
            return Ok(());
        };

        if body.as_str() != Some(sent.as_str()) {
            debug!(peer = session.peer(), "wrong echo string");
            return Ok(());
        }

        let directory = self.network().directory();

        directory.add_peer_host(host_of(&claimed_url)).await?;
        directory.add_peer(&claimed_url, Some(session.host())).await?;
        directory
            .set_verified_url(session.host(), &claimed_url)
            .await?;

        session.update_flags(|flags| flags.sent_echo_string = None);

        info!(host = session.host(), url = %claimed_url, "verified peer url");

        Ok(())
    }

    async fn handle_hub_notice(&self, session: &Session, subject: Subject, body: &Value) {
        let Some(hub) = self.hub() else {
            session.send_error("I'm not a hub");
            return;
        };

        let challenge = session.flags().challenge;

        if let Err(error) = hub
            .handle_justsaying(session.peer(), subject, body, challenge.as_deref())
            .await
        {
            session.send_error(&error);
        }
    }

    async fn handle_new_address_to_watch(&self, session: &Session, body: &Value) -> EyreResult<()> {
        if self.network().is_light() {
            session.send_error("I'm light myself, can't serve you");
            return Ok(());
        }

        if session.is_outbound() {
            session.send_error("light clients have to be inbound");
            return Ok(());
        }

        let Some(address) = body.as_str().filter(|address| is_valid_address(address)) else {
            session.send_error("address not valid");
            return Ok(());
        };

        self.store()
            .watch_light_address(session.peer(), address)
            .await?;

        session.send_info(Value::from(format!("now watching {address}")));

        Ok(())
    }
}
