//! Topology, generation ID reconciliation, DS status changes and routed
//! messages of a domain. Everything here runs under the domain lock.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::{self, Duration};

use crate::proto::{
    MonitorData, ReplMsg, RoutableMsg, RouteTarget, RoutedPayload, RsInfo,
    ServerId, ServerStatus, StatusEvent, TopologyMsg, PROTOCOL_V2,
    UNSET_GENERATION_ID,
};
use crate::server::domain::Domain;
use crate::server::handler::{ConnectionHandler, UnitKind};
use crate::utils::ChorusError;

// generation ID
impl Domain {
    /// Sets the generation ID; changing it clears every change log. Returns
    /// the previous one. Caller holds the domain lock.
    pub(crate) async fn set_generation_id(
        &self,
        generation_id: i64,
        saved: bool,
    ) -> Result<i64, ChorusError> {
        let old = self.generation_id();
        if old != generation_id {
            self.clear_logs().await?;
            self.generation_id.store(generation_id, Ordering::Release);
            self.generation_id_saved.store(saved, Ordering::Release);
            let persisted = (saved && generation_id != UNSET_GENERATION_ID)
                .then_some(generation_id);
            self.ctx
                .env
                .save_generation_id(self.base_dn(), persisted)
                .await
                .map_err(ChorusError::into_storage)?;
            pf_info!(
                "domain {} generation id {} -> {}",
                self.base_dn(),
                old,
                generation_id
            );
        }
        Ok(old)
    }

    /// Forgets an unsaved generation ID once no DS with it is reachable any
    /// more, neither locally nor behind a peer RS. Caller holds the domain
    /// lock.
    pub(crate) async fn may_reset_generation_id(&self) {
        let generation_id = self.generation_id();
        if generation_id == UNSET_GENERATION_ID || self.generation_id_saved() {
            return;
        }
        if !self.ds_handlers().is_empty() {
            return;
        }
        let reachable = self.rs_handlers().iter().any(|rs| {
            rs.generation_id() == generation_id && rs.has_remote_ds()
        });
        if reachable {
            return;
        }
        if let Err(e) =
            self.set_generation_id(UNSET_GENERATION_ID, false).await
        {
            pf_error!("cannot reset generation id of {}: {}", self.base_dn(), e);
        }
    }

    /// Handles a generation ID reset request from a DS or an RS.
    pub async fn reset_generation_id(
        &self,
        sender: &Arc<ConnectionHandler>,
        generation_id: i64,
    ) {
        let _guard = self.lock().await;
        pf_info!(
            "{:?} requests generation id {} for {}",
            sender,
            generation_id,
            self.base_dn()
        );

        if let Err(e) = self.set_generation_id(generation_id, false).await {
            pf_error!("cannot reset generation id of {}: {}", self.base_dn(), e);
            return;
        }

        // peer RSs reset too; only forward what a DS asked for
        for rs in self.rs_handlers() {
            rs.set_generation_id(generation_id);
            if sender.is_ds()
                && rs.send(ReplMsg::ResetGenerationId { generation_id }).is_err()
            {
                rs.abort("cannot forward generation id reset");
            }
        }
        if sender.is_ds() {
            sender.set_generation_id(generation_id);
        }

        for ds in self.ds_handlers() {
            self.change_status_for_reset_gen_id(&ds, generation_id);
        }

        self.send_topo_info_to_dss(None);
        self.send_topo_info_to_rss();
    }

    /// Drives a DS through the status machine after a generation ID reset.
    fn change_status_for_reset_gen_id(
        &self,
        ds: &Arc<ConnectionHandler>,
        generation_id: i64,
    ) {
        let status = ds.status();
        if status == ServerStatus::FullUpdate {
            pf_info!("{:?} in full update, generation id reset ignored", ds);
            return;
        }
        if status == ServerStatus::BadGenerationId
            && generation_id == ds.generation_id()
        {
            // same ID again: reconnect to get back in sync
            ds.abort("generation id now matches, reconnect required");
            return;
        }
        if generation_id == UNSET_GENERATION_ID
            || generation_id != ds.generation_id()
        {
            if let Some(new_status) =
                ds.change_status(StatusEvent::ToBadGenId)
            {
                self.notify_status(ds, new_status, new_status);
            }
        }
    }

    fn notify_status(
        &self,
        ds: &Arc<ConnectionHandler>,
        requested: ServerStatus,
        new_status: ServerStatus,
    ) {
        if ds
            .send(ReplMsg::ChangeStatus {
                requested,
                new_status,
            })
            .is_err()
        {
            ds.abort("cannot send status change");
        }
    }
}

// DS status
impl Domain {
    /// Applies a status change requested by a DS and broadcasts it.
    pub async fn process_new_status(
        &self,
        ds: &Arc<ConnectionHandler>,
        requested: ServerStatus,
    ) {
        let _guard = self.lock().await;
        let current = ds.status();
        match ds.change_status(StatusEvent::leading_to(requested)) {
            Some(new_status) => {
                pf_info!("{:?} status {} -> {}", ds, current, new_status);
                self.send_topo_info_to_dss(Some(ds.server_id()));
                self.send_topo_info_to_rss();
            }
            None => {
                pf_warn!(
                    "{:?} cannot go from {} to {}, request dropped",
                    ds,
                    current,
                    requested
                );
            }
        }
    }

    /// Status change decided by this server (the status analyzer). Returns
    /// true if the status changed.
    pub(crate) async fn change_status_from_analyzer(
        &self,
        ds: &Arc<ConnectionHandler>,
        event: StatusEvent,
    ) -> bool {
        let _guard = self.lock().await;
        let registered = self
            .ds_handler(ds.server_id())
            .is_some_and(|h| Arc::ptr_eq(&h, ds));
        if !registered || ds.is_stopping() {
            return false;
        }
        let current = ds.status();
        match ds.change_status(event) {
            Some(new_status) if new_status != current => {
                pf_info!("{:?} status {} -> {}", ds, current, new_status);
                self.notify_status(ds, new_status, new_status);
                self.send_topo_info_to_dss(Some(ds.server_id()));
                self.send_topo_info_to_rss();
                true
            }
            _ => false,
        }
    }
}

// topology
impl Domain {
    pub(crate) fn local_rs_info(&self) -> RsInfo {
        self.ctx.with_config(|c| RsInfo {
            rs_id: c.server_id,
            generation_id: self.generation_id(),
            group_id: c.group_id,
            weight: c.weight,
        })
    }

    /// Topology for a DS: every other DS (local or behind a peer RS) and
    /// every RS including this one.
    pub fn create_topology_msg_for_ds(&self, dest: ServerId) -> TopologyMsg {
        let me = self.ctx.server_id();
        let mut topo = TopologyMsg::default();
        for ds in self.ds_handlers() {
            if ds.server_id() != dest {
                topo.ds_infos.extend(ds.ds_info(me));
            }
        }
        topo.rs_infos.push(self.local_rs_info());
        for rs in self.rs_handlers() {
            topo.ds_infos.extend(
                rs.remote_ds().into_iter().filter(|ds| ds.ds_id != dest),
            );
            topo.rs_infos.extend(rs.rs_info());
        }
        topo.ds_infos.sort_by_key(|ds| ds.ds_id);
        topo
    }

    /// Topology for a peer RS: our DSs and our own RS info.
    pub fn create_topology_msg_for_rs(&self) -> TopologyMsg {
        let me = self.ctx.server_id();
        let mut ds_infos: Vec<_> =
            self.ds_handlers().iter().filter_map(|ds| ds.ds_info(me)).collect();
        ds_infos.sort_by_key(|ds| ds.ds_id);
        TopologyMsg {
            ds_infos,
            rs_infos: vec![self.local_rs_info()],
        }
    }

    pub(crate) fn send_topo_info_to_dss(&self, exclude: Option<ServerId>) {
        for ds in self.ds_handlers() {
            if Some(ds.server_id()) == exclude
                || ds.protocol_version() < PROTOCOL_V2
            {
                continue;
            }
            let topo = self.create_topology_msg_for_ds(ds.server_id());
            if ds.send(ReplMsg::Topology(topo)).is_err() {
                pf_debug!("cannot send topology to {:?}", ds);
            }
        }
    }

    pub(crate) fn send_topo_info_to_rss(&self) {
        let topo = self.create_topology_msg_for_rs();
        for rs in self.rs_handlers() {
            if rs.protocol_version() < PROTOCOL_V2 {
                continue;
            }
            if rs.send(ReplMsg::Topology(topo.clone())).is_err() {
                pf_debug!("cannot send topology to {:?}", rs);
            }
        }
    }

    /// Handles a topology message from a peer RS.
    pub async fn receive_topo_info_from_rs(
        &self,
        topo: TopologyMsg,
        rs: &Arc<ConnectionHandler>,
        allow_reset_gen_id: bool,
    ) {
        let _guard = self.lock().await;
        self.receive_topo_info_from_rs_locked(topo, rs, allow_reset_gen_id)
            .await;
    }

    pub(crate) async fn receive_topo_info_from_rs_locked(
        &self,
        topo: TopologyMsg,
        rs: &Arc<ConnectionHandler>,
        allow_reset_gen_id: bool,
    ) {
        let info = topo.rs_infos.iter().find(|i| i.rs_id == rs.server_id());
        rs.set_rs_topology(info, topo.ds_infos.clone());

        if allow_reset_gen_id {
            self.may_reset_generation_id().await;
            if self.generation_id() == UNSET_GENERATION_ID
                && rs.generation_id() != UNSET_GENERATION_ID
            {
                if let Err(e) =
                    self.set_generation_id(rs.generation_id(), false).await
                {
                    pf_error!(
                        "cannot adopt generation id of {:?}: {}",
                        rs,
                        e
                    );
                }
            }
        }

        let generation_id = self.generation_id();
        if generation_id != UNSET_GENERATION_ID
            && rs.generation_id() != generation_id
        {
            let details = format!(
                "{:?} has generation id {} but domain {} has {}",
                rs,
                rs.generation_id(),
                self.base_dn(),
                generation_id
            );
            pf_warn!("{}", details);
            self.send_error(rs, rs.server_id(), details);
        }

        self.send_topo_info_to_dss(None);
    }

    /// True if a DS with this ID is already connected, locally or behind a
    /// peer RS.
    pub(crate) fn check_for_duplicate_ds(&self, ds_id: ServerId) -> bool {
        if self.ds_handler(ds_id).is_some() {
            pf_error!("DS {} already connected to {}", ds_id, self.base_dn());
            return true;
        }
        if let Some(rs) =
            self.rs_handlers().into_iter().find(|rs| rs.is_remote_ds(ds_id))
        {
            pf_error!(
                "DS {} already connected to {} through {:?}",
                ds_id,
                self.base_dn(),
                rs
            );
            return true;
        }
        false
    }

    /// True if an RS with this ID is already connected. A second session
    /// from the same address is expected (both sides connect) and only
    /// traced.
    pub(crate) fn check_for_duplicate_rs(
        &self,
        rs_id: ServerId,
        rs_url: &str,
    ) -> bool {
        match self.rs_handler(rs_id) {
            Some(existing) if existing.server_url() == rs_url => {
                pf_debug!("already connected to RS {} at {}", rs_id, rs_url);
                true
            }
            Some(existing) => {
                pf_error!(
                    "RS {} at {} has the same id as connected RS at {}",
                    rs_id,
                    rs_url,
                    existing.server_url()
                );
                true
            }
            None => false,
        }
    }

    /// Whether a session to the RS at this address is up.
    pub fn is_connected_to_rs(&self, rs_url: &str) -> bool {
        self.rs_handlers().iter().any(|rs| rs.server_url() == rs_url)
    }

    /// Tears a handler down and unregisters it. Called by the handler's own
    /// units when they end, and by anything else that wants it gone.
    pub async fn stop_server(
        &self,
        handler: &Arc<ConnectionHandler>,
        from_unit: Option<UnitKind>,
    ) {
        handler.shutdown(from_unit).await;

        let _guard = self.lock().await;
        if !self.unregister(handler) {
            return;
        }
        pf_info!("{:?} left domain {}", handler, self.base_dn());

        if handler.is_ds() && self.ds_handlers().is_empty() {
            self.stop_status_analyzer();
        }
        self.may_reset_generation_id().await;
        self.send_topo_info_to_dss(None);
        if handler.is_ds() {
            self.send_topo_info_to_rss();
        }
    }
}

// routed messages and monitoring
impl Domain {
    fn send_error(
        &self,
        via: &Arc<ConnectionHandler>,
        dest: ServerId,
        details: String,
    ) {
        let msg = RoutableMsg {
            sender: self.ctx.server_id(),
            destination: RouteTarget::Server(dest),
            payload: RoutedPayload::Error { details },
        };
        if via.send(ReplMsg::Routable(msg)).is_err() {
            pf_debug!("cannot send error to {:?}", via);
        }
    }

    /// Replication state of this server for the domain.
    pub async fn monitor_data(&self) -> MonitorData {
        let mut ds_states: Vec<_> = self
            .ds_handlers()
            .iter()
            .map(|ds| (ds.server_id(), ds.server_state()))
            .collect();
        ds_states.sort_by_key(|(id, _)| *id);
        let mut rs_states: Vec<_> = self
            .rs_handlers()
            .iter()
            .map(|rs| (rs.server_id(), rs.server_state()))
            .collect();
        rs_states.sort_by_key(|(id, _)| *id);
        MonitorData {
            rs_id: self.ctx.server_id(),
            db_state: self.get_db_server_state().await,
            ds_states,
            rs_states,
        }
    }

    /// Latest monitor data received from each peer RS.
    pub fn remote_monitor_data(&self) -> HashMap<ServerId, MonitorData> {
        self.remote_monitor
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Handlers a routable message from `from` must go to.
    fn get_destination_servers(
        &self,
        msg: &RoutableMsg,
        from: &Arc<ConnectionHandler>,
    ) -> Vec<Arc<ConnectionHandler>> {
        let mut dests = vec![];
        match msg.destination {
            RouteTarget::AllServers => {
                if from.is_ds() {
                    dests.extend(
                        self.rs_handlers()
                            .into_iter()
                            .filter(|rs| rs.has_remote_ds()),
                    );
                }
                dests.extend(
                    self.ds_handlers()
                        .into_iter()
                        .filter(|ds| !Arc::ptr_eq(ds, from)),
                );
            }
            RouteTarget::Server(id) => {
                if let Some(ds) = self.ds_handler(id) {
                    dests.push(ds);
                } else if from.is_ds() {
                    dests.extend(
                        self.rs_handlers()
                            .into_iter()
                            .find(|rs| rs.is_remote_ds(id)),
                    );
                } else if let Some(rs) = self.rs_handler(id) {
                    dests.push(rs);
                }
            }
            RouteTarget::ClosestServer => {}
        }
        dests
    }

    /// Delivers or relays a routable message.
    pub async fn process_routable(
        &self,
        msg: RoutableMsg,
        from: &Arc<ConnectionHandler>,
    ) {
        let me = self.ctx.server_id();
        let for_me = match msg.destination {
            RouteTarget::Server(id) => id == me,
            RouteTarget::ClosestServer => true,
            RouteTarget::AllServers => false,
        };
        if for_me {
            self.handle_routable_locally(msg, from).await;
            return;
        }

        let dests = self.get_destination_servers(&msg, from);
        if dests.is_empty() {
            let details = format!(
                "no route to {:?} in {} from {}",
                msg.destination,
                self.base_dn(),
                msg.sender
            );
            pf_warn!("{}", details);
            if !matches!(msg.payload, RoutedPayload::Error { .. }) {
                self.send_error(from, msg.sender, details);
            }
            return;
        }
        for dest in dests {
            if dest.send(ReplMsg::Routable(msg.clone())).is_err() {
                pf_debug!("cannot relay routable to {:?}", dest);
            }
        }
    }

    async fn handle_routable_locally(
        &self,
        msg: RoutableMsg,
        from: &Arc<ConnectionHandler>,
    ) {
        match msg.payload {
            RoutedPayload::MonitorRequest => {
                let reply = RoutableMsg {
                    sender: self.ctx.server_id(),
                    destination: RouteTarget::Server(msg.sender),
                    payload: RoutedPayload::Monitor(self.monitor_data().await),
                };
                if from.send(ReplMsg::Routable(reply)).is_err() {
                    pf_debug!("cannot send monitor data to {:?}", from);
                }
            }
            RoutedPayload::Monitor(data) => {
                if let Ok(mut remote) = self.remote_monitor.lock() {
                    remote.insert(msg.sender, data);
                }
                self.monitor_arrived.notify_waiters();
            }
            RoutedPayload::Error { details } => {
                pf_warn!("error from {} in {}: {}", msg.sender, self.base_dn(), details);
            }
            RoutedPayload::Opaque(_) => {
                let details = format!(
                    "server {} does not consume routed payloads",
                    self.ctx.server_id()
                );
                self.send_error(from, msg.sender, details);
            }
        }
    }

    /// Asks every peer RS for its monitor data; answers arrive through
    /// `process_routable`.
    fn request_remote_monitor_data(&self, peers: &[Arc<ConnectionHandler>]) {
        for rs in peers {
            let msg = RoutableMsg {
                sender: self.ctx.server_id(),
                destination: RouteTarget::Server(rs.server_id()),
                payload: RoutedPayload::MonitorRequest,
            };
            if rs.send(ReplMsg::Routable(msg)).is_err() {
                pf_debug!("cannot request monitor data from {:?}", rs);
            }
        }
    }

    /// Fresh monitor data of every connected peer RS. Peers that have not
    /// answered within `wait` are left out.
    pub async fn gather_monitor_data(
        &self,
        wait: Duration,
    ) -> HashMap<ServerId, MonitorData> {
        let peers = self.rs_handlers();
        if let Ok(mut remote) = self.remote_monitor.lock() {
            remote.clear();
        }
        let answered = || {
            self.remote_monitor
                .lock()
                .map(|r| peers.iter().all(|rs| r.contains_key(&rs.server_id())))
                .unwrap_or(true)
        };

        let all_in = async {
            loop {
                let arrived = self.monitor_arrived.notified();
                if answered() {
                    break;
                }
                arrived.await;
            }
        };
        self.request_remote_monitor_data(&peers);
        if time::timeout(wait, all_in).await.is_err() {
            pf_debug!(
                "monitor data of {} incomplete after {:?}",
                self.base_dn(),
                wait
            );
        }
        self.remote_monitor_data()
    }
}
