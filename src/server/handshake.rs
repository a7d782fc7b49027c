//! Session handshakes. A DS or RS session goes through phase 1 (start
//! messages, protocol version agreement) and, from protocol V2 on, phase 2
//! (session attributes or topology exchange) before its handler is
//! registered in the domain and its units started.

use std::sync::Arc;

use rand::Rng;

use tokio::sync::MutexGuard as AsyncMutexGuard;
use tokio::time::{self, Duration};

use crate::proto::{
    AssuredMode, ReplMsg, ReplServerStartMsg, ServerId, ServerStartMsg,
    ServerState, ServerStatus,
    StartSessionMsg, StatusEvent, TopologyMsg, CURRENT_PROTOCOL_VERSION,
    PROTOCOL_V2, UNSET_GENERATION_ID,
};
use crate::server::domain::Domain;
use crate::server::handler::{ConnectionHandler, DsAttrs, HandlerSetup};
use crate::server::session::{SessionRx, SessionTx};
use crate::utils::ChorusError;

/// Bound on waiting for each handshake message from the peer.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed part of the domain lock wait of an incoming RS handshake.
const RS_LOCK_WAIT_BASE: Duration = Duration::from_secs(3);

/// Upper bound of the random part of that wait, in millisecs.
const RS_LOCK_WAIT_JITTER_MS: u64 = 5000;

/// How often, and how many times, to check whether a previous handler of a
/// reconnecting DS is gone.
const OLD_HANDLER_POLL: Duration = Duration::from_millis(100);
const OLD_HANDLER_POLLS: u32 = 30;

/// Waits for the next handshake message.
pub(crate) async fn recv_handshake_msg(
    rx: &mut SessionRx,
) -> Result<ReplMsg, ChorusError> {
    match time::timeout(HANDSHAKE_TIMEOUT, rx.recv()).await? {
        Some(msg) => Ok(msg),
        None => Err(ChorusError::transport("session closed during handshake")),
    }
}

/// Closes the session and returns the error.
fn refuse(tx: &SessionTx, err: ChorusError) -> Result<(), ChorusError> {
    tx.close();
    pf_warn!("handshake refused: {}", err);
    Err(err)
}

impl Domain {
    /// Our own start message for a peer speaking `protocol_version`.
    pub(crate) async fn repl_server_start_msg(
        &self,
        protocol_version: u16,
    ) -> ReplServerStartMsg {
        let server_state = self.get_db_server_state().await;
        self.ctx.with_config(|c| ReplServerStartMsg {
            server_id: c.server_id,
            server_url: c.listen_addr.clone(),
            base_dn: self.base_dn().to_string(),
            window_size: c.window_size,
            server_state,
            protocol_version,
            generation_id: self.generation_id(),
            group_id: c.group_id,
            degraded_status_threshold: c.degraded_status_threshold,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn handler_setup(
        &self,
        server_id: ServerId,
        server_url: &str,
        protocol_version: u16,
        group_id: u8,
        generation_id: i64,
        send_window: u32,
        server_state: ServerState,
    ) -> HandlerSetup {
        self.ctx.with_config(|c| HandlerSetup {
            server_id,
            server_url: server_url.to_string(),
            base_dn: self.base_dn().to_string(),
            protocol_version,
            group_id,
            generation_id,
            send_window,
            recv_window: c.window_size,
            queue_size: c.queue_size,
            server_state,
        })
    }

    /// Takes the domain lock for an RS handshake, waiting a randomized
    /// bound so that two servers connecting to each other at the same time
    /// do not both hold out.
    async fn lock_for_rs_handshake(
        &self,
    ) -> Result<AsyncMutexGuard<'_, ()>, ChorusError> {
        let jitter = rand::thread_rng().gen_range(0..RS_LOCK_WAIT_JITTER_MS);
        let wait = RS_LOCK_WAIT_BASE + Duration::from_millis(jitter);
        time::timeout(wait, self.lock()).await.map_err(|_| {
            ChorusError::transport(format!(
                "domain {} busy, RS handshake abandoned",
                self.base_dn()
            ))
        })
    }

    /// Runs the rest of a DS handshake after its `ServerStart` arrived.
    pub async fn handshake_ds(
        self: &Arc<Self>,
        start: ServerStartMsg,
        tx: SessionTx,
        mut rx: SessionRx,
    ) -> Result<(), ChorusError> {
        let ds_id = start.server_id;

        // a reconnecting DS may still have its old handler winding down
        for _ in 0..OLD_HANDLER_POLLS {
            if self.ds_handler(ds_id).is_none() {
                break;
            }
            time::sleep(OLD_HANDLER_POLL).await;
        }

        let protocol_version =
            start.protocol_version.min(CURRENT_PROTOCOL_VERSION);
        if protocol_version == 0 {
            return refuse(
                &tx,
                ChorusError::protocol(format!(
                    "DS {} speaks no known protocol version",
                    ds_id
                )),
            );
        }
        let reply = self.repl_server_start_msg(protocol_version).await;
        tx.send(ReplMsg::ReplServerStart(reply))?;

        if self.check_for_duplicate_ds(ds_id) {
            return refuse(
                &tx,
                ChorusError::consistency(format!(
                    "DS {} already connected to {}",
                    ds_id,
                    self.base_dn()
                )),
            );
        }

        let session = if protocol_version >= PROTOCOL_V2 {
            match recv_handshake_msg(&mut rx).await {
                Ok(ReplMsg::StartSession(session)) => session,
                Ok(other) => {
                    return refuse(
                        &tx,
                        ChorusError::protocol(format!(
                            "expected StartSession from DS {}, got {}",
                            ds_id,
                            other.kind_name()
                        )),
                    );
                }
                Err(e) => return refuse(&tx, e),
            }
        } else {
            StartSessionMsg {
                status: ServerStatus::Normal,
                ref_urls: vec![],
                assured_flag: false,
                assured_mode: AssuredMode::SafeRead,
                safe_data_level: 1,
            }
        };
        if !session.status.is_valid_initial() {
            return refuse(
                &tx,
                ChorusError::protocol(format!(
                    "DS {} announced invalid initial status {}",
                    ds_id, session.status
                )),
            );
        }

        let setup = self.handler_setup(
            ds_id,
            &start.server_url,
            protocol_version,
            start.group_id,
            start.generation_id,
            start.window_size,
            start.server_state,
        );
        let handler = ConnectionHandler::new_ds(
            setup,
            DsAttrs {
                status: session.status,
                ref_urls: session.ref_urls,
                assured_flag: session.assured_flag,
                assured_mode: session.assured_mode,
                safe_data_level: session.safe_data_level,
            },
            tx,
        );

        let _guard = self.lock().await;
        if self.is_shut_down() || self.check_for_duplicate_ds(ds_id) {
            handler.abort("duplicate DS or domain shut down");
            return Err(ChorusError::consistency(format!(
                "DS {} refused by {}",
                ds_id,
                self.base_dn()
            )));
        }

        let domain_gen = self.generation_id();
        let mut bad_gen = false;
        if domain_gen == UNSET_GENERATION_ID {
            if start.generation_id != UNSET_GENERATION_ID {
                self.set_generation_id(start.generation_id, false).await?;
            }
        } else if start.generation_id != domain_gen {
            pf_warn!(
                "DS {} has generation id {} but domain {} has {}",
                ds_id,
                start.generation_id,
                self.base_dn(),
                domain_gen
            );
            bad_gen = handler.change_status(StatusEvent::ToBadGenId).is_some();
        }

        if protocol_version >= PROTOCOL_V2 {
            let topo = self.create_topology_msg_for_ds(ds_id);
            handler.send(ReplMsg::Topology(topo))?;
        }
        if bad_gen {
            handler.send(ReplMsg::ChangeStatus {
                requested: ServerStatus::BadGenerationId,
                new_status: ServerStatus::BadGenerationId,
            })?;
        }

        self.register(handler.clone());
        handler.start_units(self.clone(), rx);
        self.send_topo_info_to_dss(Some(ds_id));
        self.send_topo_info_to_rss();
        self.start_status_analyzer();

        pf_info!(
            "DS {} joined {} with status {}",
            ds_id,
            self.base_dn(),
            handler.status()
        );
        Ok(())
    }

    /// Reconciles generation IDs with a new RS peer, registers its handler
    /// and starts it. Caller holds the domain lock.
    async fn admit_rs(
        self: &Arc<Self>,
        handler: Arc<ConnectionHandler>,
        topo: Option<TopologyMsg>,
        rx: SessionRx,
    ) -> Result<(), ChorusError> {
        let domain_gen = self.generation_id();
        let remote_gen = handler.generation_id();
        if domain_gen == UNSET_GENERATION_ID {
            if remote_gen != UNSET_GENERATION_ID {
                self.set_generation_id(remote_gen, false).await?;
            }
        } else if remote_gen != UNSET_GENERATION_ID && remote_gen != domain_gen
        {
            pf_warn!(
                "RS {} has generation id {} but domain {} has {}",
                handler.server_id(),
                remote_gen,
                self.base_dn(),
                domain_gen
            );
        }

        if let Some(topo) = topo {
            let info = topo
                .rs_infos
                .iter()
                .find(|i| i.rs_id == handler.server_id())
                .cloned();
            handler.set_rs_topology(info.as_ref(), topo.ds_infos);
        }

        self.register(handler.clone());
        handler.start_units(self.clone(), rx);
        self.send_topo_info_to_dss(None);

        pf_info!(
            "RS {} at {} joined {}",
            handler.server_id(),
            handler.server_url(),
            self.base_dn()
        );
        Ok(())
    }

    /// Runs the rest of an incoming RS handshake after its `ReplServerStart`
    /// arrived.
    pub async fn handshake_incoming_rs(
        self: &Arc<Self>,
        start: ReplServerStartMsg,
        tx: SessionTx,
        mut rx: SessionRx,
    ) -> Result<(), ChorusError> {
        let rs_id = start.server_id;
        let protocol_version =
            start.protocol_version.min(CURRENT_PROTOCOL_VERSION);

        let _guard = match self.lock_for_rs_handshake().await {
            Ok(guard) => guard,
            Err(e) => return refuse(&tx, e),
        };
        if self.is_shut_down() || rs_id == self.ctx.server_id() {
            return refuse(
                &tx,
                ChorusError::consistency(format!(
                    "RS {} refused by {}",
                    rs_id,
                    self.base_dn()
                )),
            );
        }
        if self.check_for_duplicate_rs(rs_id, &start.server_url) {
            tx.close();
            return Err(ChorusError::consistency(format!(
                "RS {} already connected to {}",
                rs_id,
                self.base_dn()
            )));
        }

        let reply = self.repl_server_start_msg(protocol_version).await;
        tx.send(ReplMsg::ReplServerStart(reply))?;

        let topo = if protocol_version >= PROTOCOL_V2 {
            let topo = match recv_handshake_msg(&mut rx).await {
                Ok(ReplMsg::Topology(topo)) => topo,
                Ok(other) => {
                    return refuse(
                        &tx,
                        ChorusError::protocol(format!(
                            "expected Topology from RS {}, got {}",
                            rs_id,
                            other.kind_name()
                        )),
                    );
                }
                Err(e) => return refuse(&tx, e),
            };
            tx.send(ReplMsg::Topology(self.create_topology_msg_for_rs()))?;
            Some(topo)
        } else {
            None
        };

        let weight = topo
            .as_ref()
            .and_then(|t| t.rs_infos.iter().find(|i| i.rs_id == rs_id))
            .map_or(1, |i| i.weight);
        let setup = self.handler_setup(
            rs_id,
            &start.server_url,
            protocol_version,
            start.group_id,
            start.generation_id,
            start.window_size,
            start.server_state,
        );
        let handler = ConnectionHandler::new_rs(setup, weight, tx);
        self.admit_rs(handler, topo, rx).await
    }

    /// Handshake of a session this server opened to the RS at `rs_url`.
    pub async fn handshake_outgoing_rs(
        self: &Arc<Self>,
        rs_url: &str,
        tx: SessionTx,
        mut rx: SessionRx,
    ) -> Result<(), ChorusError> {
        let start = self.repl_server_start_msg(CURRENT_PROTOCOL_VERSION).await;
        tx.send(ReplMsg::ReplServerStart(start))?;

        let reply = match recv_handshake_msg(&mut rx).await {
            Ok(ReplMsg::ReplServerStart(reply)) => reply,
            Ok(other) => {
                return refuse(
                    &tx,
                    ChorusError::protocol(format!(
                        "expected ReplServerStart from {}, got {}",
                        rs_url,
                        other.kind_name()
                    )),
                );
            }
            Err(e) => return refuse(&tx, e),
        };
        if reply.base_dn != self.base_dn() {
            return refuse(
                &tx,
                ChorusError::protocol(format!(
                    "RS at {} answered for {} instead of {}",
                    rs_url,
                    reply.base_dn,
                    self.base_dn()
                )),
            );
        }
        let rs_id = reply.server_id;
        let protocol_version =
            reply.protocol_version.min(CURRENT_PROTOCOL_VERSION);

        let _guard = match self.lock_for_rs_handshake().await {
            Ok(guard) => guard,
            Err(e) => return refuse(&tx, e),
        };
        if self.is_shut_down() || self.check_for_duplicate_rs(rs_id, rs_url) {
            tx.close();
            return Err(ChorusError::consistency(format!(
                "RS {} at {} not admitted to {}",
                rs_id,
                rs_url,
                self.base_dn()
            )));
        }

        let topo = if protocol_version >= PROTOCOL_V2 {
            tx.send(ReplMsg::Topology(self.create_topology_msg_for_rs()))?;
            match recv_handshake_msg(&mut rx).await {
                Ok(ReplMsg::Topology(topo)) => Some(topo),
                Ok(other) => {
                    return refuse(
                        &tx,
                        ChorusError::protocol(format!(
                            "expected Topology from RS {}, got {}",
                            rs_id,
                            other.kind_name()
                        )),
                    );
                }
                Err(e) => return refuse(&tx, e),
            }
        } else {
            None
        };

        let weight = topo
            .as_ref()
            .and_then(|t| t.rs_infos.iter().find(|i| i.rs_id == rs_id))
            .map_or(1, |i| i.weight);
        let setup = self.handler_setup(
            rs_id,
            rs_url,
            protocol_version,
            reply.group_id,
            reply.generation_id,
            reply.window_size,
            reply.server_state,
        );
        let handler = ConnectionHandler::new_rs(setup, weight, tx);
        self.admit_rs(handler, topo, rx).await
    }
}
