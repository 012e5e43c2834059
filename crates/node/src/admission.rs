//! Joint admission: deduplication, validation, saving, forwarding and
//! waking up joints that were waiting for the admitted one.
//!
//! Every entry point goes through [`Node::admit`], which runs the parts all
//! of them share and reports an [`Admission`]. What to tell the peer and
//! what to do next differs per entry point and is decided by the caller.

use std::sync::Arc;

use eyre::Result as EyreResult;
use jointmesh_network::session::Session;
use jointmesh_network_primitives::frame::{Command, Subject};
use jointmesh_network_primitives::payloads::{JointResponse, JointResult};
use jointmesh_node_primitives::events::NodeEvent;
use jointmesh_node_primitives::validation::ValidationOutcome;
use jointmesh_primitives::common::unix_millis;
use jointmesh_primitives::id::UnitId;
use jointmesh_primitives::joint::Joint;
use jointmesh_primitives::peer::PeerEvent;
use jointmesh_store::types::{JointStatus, PurgedUnit, UnhandledJoint};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::handlers::Awaiting;
use crate::state::UnitGuard;
use crate::{BoxedFuture, Node};

pub(crate) const ACCEPTED: &str = "accepted";

/// What happened to a joint offered for admission.
#[derive(Debug)]
pub(crate) enum Admission {
    /// Another task is admitting the same unit.
    InWork,
    Known,
    KnownBad,
    KnownUnverified,
    /// Bad unit. It and its dependents were purged.
    UnitError(String),
    /// Bad envelope. The unit and its dependents were purged.
    JointError(String),
    TransientError(String),
    NeedHashTree,
    /// The unit stays claimed until the caller drops `guard`, so that it can
    /// be saved as unhandled before anyone else looks at it.
    NeedParentUnits {
        missing: Vec<UnitId>,
        guard: UnitGuard,
    },
    /// Saved; watchers were notified.
    Accepted,
    AcceptedUnsigned,
}

impl Node {
    pub(crate) async fn admit(
        &self,
        origin: Option<&Arc<Session>>,
        joint: &Joint,
        saved: bool,
    ) -> EyreResult<Admission> {
        let unit = joint.id();

        let Some(guard) = self.state().units_in_work.try_acquire(unit) else {
            debug!(%unit, "unit is already being handled");
            return Ok(Admission::InWork);
        };

        match self.store().check_new_joint(joint).await? {
            JointStatus::Known => return Ok(Admission::Known),
            JointStatus::KnownBad => return Ok(Admission::KnownBad),
            JointStatus::KnownUnverified if !saved => return Ok(Admission::KnownUnverified),
            JointStatus::New | JointStatus::KnownUnverified => {}
        }

        let admission = match self.validator().validate(joint).await {
            ValidationOutcome::UnitError(error) => {
                info!(%unit, %error, "invalid unit");

                let purged = self.store().purge_joint_and_dependencies(joint, &error).await?;
                self.notify_purged(unit, &error, purged);
                self.after_invalid(origin, joint).await;

                Admission::UnitError(error)
            }
            ValidationOutcome::JointError(error) => {
                info!(%unit, %error, "invalid joint");

                self.store().save_known_bad_joint(joint, &error).await?;
                let purged = self.store().purge_dependencies(unit, &error).await?;
                self.notify_purged(unit, &error, purged);
                self.after_invalid(origin, joint).await;

                Admission::JointError(error)
            }
            ValidationOutcome::TransientError(error) => {
                info!(%unit, %error, "validation will be retried later");

                Admission::TransientError(error)
            }
            ValidationOutcome::NeedHashTree => {
                debug!(%unit, "need hash tree");

                Admission::NeedHashTree
            }
            ValidationOutcome::NeedParentUnits(missing) => {
                debug!(%unit, ?missing, "missing parents");

                return Ok(Admission::NeedParentUnits { missing, guard });
            }
            ValidationOutcome::Ok { .. } if joint.is_unsigned() => {
                warn!(%unit, "validator accepted an unsigned joint as signed");

                Admission::TransientError("unsigned joint cannot be saved".to_owned())
            }
            ValidationOutcome::Ok { state, lock } => {
                self.store().save_joint(joint, &state).await?;
                drop(lock);

                debug!(%unit, serial = state.is_serial(), "saved joint");

                if let Some(origin) = origin {
                    let event = if state.is_serial() {
                        PeerEvent::NewGood
                    } else {
                        PeerEvent::Nonserial
                    };
                    self.record_event(origin, event).await;
                }

                self.notify_watchers(joint).await;

                if !self.state().is_catching_up() {
                    self.emit(NodeEvent::NewJoint {
                        joint: Box::new(joint.clone()),
                    });
                }

                Admission::Accepted
            }
            ValidationOutcome::OkUnsigned { serial } => {
                if !joint.is_unsigned() {
                    warn!(%unit, "validator accepted a signed joint as unsigned");
                }

                self.emit(NodeEvent::Validated {
                    unit: unit.clone(),
                    serial,
                });

                Admission::AcceptedUnsigned
            }
        };

        drop(guard);

        Ok(admission)
    }

    async fn after_invalid(&self, origin: Option<&Arc<Session>>, joint: &Joint) {
        if let Some(origin) = origin {
            self.record_event(origin, PeerEvent::Invalid).await;
        }

        if joint.is_unsigned() {
            self.emit(NodeEvent::Validated {
                unit: joint.id().clone(),
                serial: false,
            });
        }
    }

    pub(crate) async fn record_event(&self, session: &Session, event: PeerEvent) {
        if let Err(err) = self
            .network()
            .directory()
            .record_event(session.host(), event)
            .await
        {
            warn!(host = session.host(), %event, ?err, "failed to record peer event");
        }
    }

    /// Tells each peer that sent a purged dependent why it was dropped.
    fn notify_purged(&self, parent: &UnitId, error: &str, purged: Vec<PurgedUnit>) {
        for PurgedUnit { unit, peer } in purged {
            debug!(%unit, %parent, "purged dependent unit");

            let Some(session) = peer.and_then(|peer| self.network().session_by_peer(&peer)) else {
                continue;
            };

            session.send_error_result(
                &unit,
                format!("error on (indirect) parent unit {parent}: {error}"),
            );
        }
    }

    /// A joint pushed to us by a peer, either unsolicited or in answer to
    /// `get_joint`.
    pub(crate) async fn handle_online_joint(
        &self,
        session: &Arc<Session>,
        mut joint: Joint,
    ) -> EyreResult<()> {
        joint.unit.main_chain_index = None;
        let unit = joint.id().clone();

        match self.admit(Some(session), &joint, false).await? {
            Admission::InWork => session.send_info(json!({
                "unit": unit,
                "info": "already handling this unit",
            })),
            Admission::UnitError(error)
            | Admission::JointError(error)
            | Admission::TransientError(error) => session.send_error_result(&unit, error),
            Admission::NeedHashTree => {
                let state = self.state();
                if !state.is_catching_up() && !state.is_waiting_for_catchup_chain() {
                    self.request_catchup(session).await?;
                }
            }
            Admission::NeedParentUnits { missing, guard } => {
                session.send_info(json!({
                    "unit": unit,
                    "info": format!("unresolved dependencies: {}", join_units(&missing)),
                }));

                self.store()
                    .save_unhandled_joint(&joint, &missing, Some(session.peer()))
                    .await?;
                drop(guard);

                self.request_new_missing_joints(session, &missing).await?;
            }
            Admission::Accepted => {
                session.send_result(&JointResult::new(unit.clone(), ACCEPTED));

                if self.should_forward() {
                    self.forward_joint(Some(session), &joint);
                }

                self.find_and_handle_joints_that_are_ready(Some(unit)).await?;
            }
            Admission::AcceptedUnsigned => {}
            Admission::Known => {
                session.send_result(&JointResult::new(unit, "known"));
                self.record_event(session, PeerEvent::KnownGood).await;
            }
            Admission::KnownBad => {
                session.send_result(&JointResult::new(unit, "known_bad"));
                self.record_event(session, PeerEvent::KnownBad).await;
            }
            Admission::KnownUnverified => {
                session.send_result(&JointResult::new(unit, "known_unverified"));
            }
        }

        Ok(())
    }

    /// A joint sent with `post_joint`. The result is what the peer is
    /// answered with.
    pub(crate) async fn handle_posted_joint(
        &self,
        session: &Arc<Session>,
        mut joint: Joint,
    ) -> EyreResult<Result<(), String>> {
        joint.unit.main_chain_index = None;
        let unit = joint.id().clone();

        let result = match self.admit(Some(session), &joint, false).await? {
            Admission::InWork => Err("already handling this unit".to_owned()),
            Admission::UnitError(error)
            | Admission::JointError(error)
            | Admission::TransientError(error) => Err(error),
            Admission::NeedHashTree => Err("need hash tree".to_owned()),
            Admission::NeedParentUnits { .. } => Err("unknown parents".to_owned()),
            Admission::Accepted => {
                if self.should_forward() {
                    self.forward_joint(Some(session), &joint);
                }

                self.find_and_handle_joints_that_are_ready(Some(unit)).await?;

                Ok(())
            }
            Admission::AcceptedUnsigned => Err("you can't send unsigned units".to_owned()),
            Admission::Known => {
                self.record_event(session, PeerEvent::KnownGood).await;
                Err("known".to_owned())
            }
            Admission::KnownBad => {
                self.record_event(session, PeerEvent::KnownBad).await;
                Err("known bad".to_owned())
            }
            Admission::KnownUnverified => Err("known unverified".to_owned()),
        };

        Ok(result)
    }

    /// A joint that was waiting in the unhandled store and whose parents
    /// are now all known.
    pub(crate) async fn handle_saved_joint(&self, unhandled: UnhandledJoint) -> EyreResult<()> {
        let UnhandledJoint {
            joint,
            received_at,
            peer,
        } = unhandled;
        let unit = joint.id().clone();

        let session = peer
            .as_deref()
            .and_then(|peer| self.network().session_by_peer(peer))
            .filter(|session| !session.is_closed());

        match self.admit(session.as_ref(), &joint, true).await? {
            Admission::InWork | Admission::Known | Admission::KnownBad => {}
            Admission::KnownUnverified => debug!(%unit, "saved joint is still unverified"),
            Admission::UnitError(error)
            | Admission::JointError(error)
            | Admission::TransientError(error) => {
                if let Some(session) = &session {
                    session.send_error_result(&unit, error);
                }
            }
            Admission::NeedHashTree => info!(%unit, "saved joint needs hash tree, will retry"),
            Admission::NeedParentUnits { missing, guard } => {
                warn!(%unit, ?missing, "saved joint still has unresolved dependencies");

                self.store()
                    .save_unhandled_joint(&joint, &missing, peer.as_deref())
                    .await?;
                drop(guard);

                let target = match session {
                    Some(session) => Some(session),
                    None => self.network().select_next_peer(None).await,
                };

                if let Some(target) = target {
                    self.request_new_missing_joints(&target, &missing).await?;
                }
            }
            Admission::Accepted => {
                if let Some(session) = &session {
                    session.send_result(&JointResult::new(unit.clone(), ACCEPTED));
                }

                let forwarding = self.network().config().timeouts.forwarding;
                let age = unix_millis().saturating_sub(received_at);
                if self.should_forward() && u128::from(age) < forwarding.as_millis() {
                    self.forward_joint(session.as_ref(), &joint);
                }

                self.store().remove_unhandled_joint(&unit).await?;

                self.find_and_handle_joints_that_are_ready(Some(unit)).await?;
            }
            Admission::AcceptedUnsigned => self.store().remove_unhandled_joint(&unit).await?,
        }

        Ok(())
    }

    /// Readmits unhandled joints whose parents are all saved now. With a
    /// unit, only its dependents are considered.
    pub(crate) fn find_and_handle_joints_that_are_ready(
        &self,
        unit: Option<UnitId>,
    ) -> BoxedFuture<'_, EyreResult<()>> {
        Box::pin(async move {
            let ready = self.store().ready_dependent_joints(unit.as_ref()).await?;

            for unhandled in ready {
                let dependent = unhandled.joint.id().clone();

                if let Err(err) = self.handle_saved_joint(unhandled).await {
                    warn!(unit = %dependent, ?err, "failed to handle saved joint");
                }
            }

            Ok(())
        })
    }

    fn should_forward(&self) -> bool {
        !self.state().is_catching_up() && !self.network().is_light()
    }

    /// Sends `joint` to every subscribed session except `origin`.
    pub(crate) fn forward_joint(&self, origin: Option<&Arc<Session>>, joint: &Joint) {
        for session in self.network().sessions() {
            if origin.is_some_and(|origin| origin.id() == session.id()) {
                continue;
            }

            if session.flags().subscribed {
                session.send_justsaying_as(Subject::Joint, joint);
            }
        }
    }

    /// Requests the units in `units` that nobody is handling or waiting
    /// for yet.
    pub(crate) async fn request_new_missing_joints(
        &self,
        session: &Arc<Session>,
        units: &[UnitId],
    ) -> EyreResult<()> {
        let mut new_units = Vec::new();

        for unit in units {
            if self.state().units_in_work.contains(unit) || self.has_pending_joint_request(unit) {
                debug!(%unit, "unit is already requested");
                continue;
            }

            match self.store().check_new_unit(unit).await? {
                JointStatus::New => new_units.push(unit.clone()),
                JointStatus::Known | JointStatus::KnownUnverified => {}
                JointStatus::KnownBad => warn!(%unit, "missing unit is known bad"),
            }
        }

        // things may have moved on while we were asking the store
        new_units.retain(|unit| {
            !self.state().units_in_work.contains(unit) && !self.has_pending_joint_request(unit)
        });

        self.request_joints(session, new_units);

        Ok(())
    }

    fn has_pending_joint_request(&self, unit: &UnitId) -> bool {
        let params = Value::from(unit.as_str());

        self.network()
            .has_pending_request(Command::GetJoint, Some(&params))
    }

    pub(crate) fn request_joints(&self, session: &Arc<Session>, units: Vec<UnitId>) {
        let stall = self.network().config().timeouts.stall;

        for unit in units {
            if !self.state().mark_requested(&unit, stall) {
                debug!(%unit, "unit was requested moments ago");
                continue;
            }

            let receiver = self.network().request(
                session,
                Command::GetJoint,
                Some(Value::from(unit.as_str())),
                true,
            );

            self.spawn_reply_handler(receiver, Awaiting::Joint(unit));
        }
    }

    pub(crate) async fn handle_response_to_joint_request(
        &self,
        session: &Arc<Session>,
        requested: &UnitId,
        response: Option<&Value>,
    ) -> EyreResult<()> {
        self.state().forget_requested(requested);

        let Some(response) = response else {
            session.send_error("no joint in response");
            return Ok(());
        };

        if let Some(error) = response.get("error").and_then(Value::as_str) {
            debug!(unit = %requested, error, "get_joint failed");
            return Ok(());
        }

        let joint = match serde_json::from_value::<JointResponse>(response.clone()) {
            Ok(JointResponse::Found { joint }) => *joint,
            Ok(JointResponse::NotFound { joint_not_found }) => {
                if &joint_not_found == requested {
                    self.handle_joint_not_found(session, requested).await?;
                }
                return Ok(());
            }
            Err(err) => {
                debug!(unit = %requested, %err, "malformed get_joint response");
                session.send_error("no unit");
                return Ok(());
            }
        };

        if joint.id() != requested {
            session.send_error(&format!("I didn't request this unit from you: {}", joint.id()));
            return Ok(());
        }

        self.handle_online_joint(session, joint).await
    }

    async fn handle_joint_not_found(&self, session: &Arc<Session>, unit: &UnitId) -> EyreResult<()> {
        if !self.state().is_catching_up() {
            info!(%unit, peer = session.peer(), "unit does not exist");

            let error = format!("unit {unit} does not exist");
            let purged = self.store().purge_dependencies(unit, &error).await?;
            self.notify_purged(unit, &error, purged);

            return Ok(());
        }

        if !self.store().hash_tree_units().await?.contains(unit) {
            debug!(%unit, "unit does not exist (catching up)");
            return Ok(());
        }

        if let Some(next) = self.network().select_next_peer(Some(session.as_ref())).await {
            debug!(%unit, peer = next.peer(), "asking another peer for a unit of the hash tree");
            self.request_joints(&next, vec![unit.clone()]);
        }

        Ok(())
    }
}

pub(crate) fn join_units(units: &[UnitId]) -> String {
    units
        .iter()
        .map(UnitId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
