//! Replication domain: everything a replication server knows about one
//! suffix.
//!
//! Locking discipline:
//!   - `domain_lock` (async, coarse) is held by every operation that reads
//!     then writes the handler registries, changes the generation ID or a DS
//!     status, or broadcasts topology: handshake completion, disconnect,
//!     status changes, topology receipt, generation ID reset. It is never
//!     held by `put()` and fan-out.
//!   - the registries, the ack table and each ack entry have their own
//!     short-lived std locks, never held across an await.
//!   - the change log map has its own async lock, only held to look up or
//!     create a log.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use futures::future;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};
use tokio::time::{self, Duration};

use crate::changelog::{ChangelogCursor, ChangelogLog, LogParams};
use crate::proto::{
    AckMsg, AssuredMode, ChangeNumber, MonitorData, ReplMsg, ServerId,
    ServerState, ServerStatus, UpdateMsg, PROTOCOL_V2, UNSET_GENERATION_ID,
};
use crate::server::ack::AckWaitEntry;
use crate::server::analyzer::StatusAnalyzer;
use crate::server::config::{SafeDataShortfall, ServerContext};
use crate::server::handler::{ConnectionHandler, HandlerCounters};
use crate::utils::ChorusError;

/// A passive consumer of a domain's fan-out, e.g. an external changelog
/// indexer. Receives every forwarded update, without status filtering and
/// without taking part in assured replication.
#[async_trait]
pub trait UpdateSubscriber: Send + Sync {
    async fn deliver(&self, msg: Arc<UpdateMsg>);
}

/// Outcome of the assured preparation step of `put()`.
enum PreparedAssured {
    /// Not handled as assured: nothing is acknowledged.
    NotAssured,

    /// Acknowledged as soon as the update is logged.
    Immediate(AckMsg),

    /// Waits for acks from the servers in the entry.
    Wait(Arc<AckWaitEntry>, HashSet<ServerId>),
}

/// One replicated suffix.
pub struct Domain {
    base_dn: String,
    pub(crate) ctx: Arc<ServerContext>,

    pub(crate) domain_lock: AsyncMutex<()>,

    pub(crate) ds_handlers: RwLock<HashMap<ServerId, Arc<ConnectionHandler>>>,
    pub(crate) rs_handlers: RwLock<HashMap<ServerId, Arc<ConnectionHandler>>>,

    logs: AsyncMutex<HashMap<ServerId, Arc<ChangelogLog>>>,

    /// Clears in progress; running catch-ups give up their cursors while
    /// this is non-zero.
    clears_in_progress: AtomicUsize,
    clearing: Notify,

    pub(crate) generation_id: AtomicI64,

    /// Whether the generation ID is attached to logged data.
    pub(crate) generation_id_saved: AtomicBool,

    acks: Mutex<HashMap<ChangeNumber, Arc<AckWaitEntry>>>,

    subscribers: RwLock<Vec<Arc<dyn UpdateSubscriber>>>,

    pub(crate) analyzer: Mutex<Option<StatusAnalyzer>>,

    /// Latest monitor data received from other replication servers.
    pub(crate) remote_monitor: Mutex<HashMap<ServerId, MonitorData>>,
    pub(crate) monitor_arrived: Notify,

    shut_down: AtomicBool,
}

impl Domain {
    /// Creates the domain and reopens the change logs and generation ID it
    /// left in the change log environment.
    pub async fn new_and_setup(
        base_dn: &str,
        ctx: Arc<ServerContext>,
    ) -> Result<Arc<Self>, ChorusError> {
        let saved_gen = ctx
            .env
            .load_generation_id(base_dn)
            .await
            .map_err(ChorusError::into_storage)?;
        let domain = Arc::new(Domain {
            base_dn: base_dn.to_string(),
            ctx,
            domain_lock: AsyncMutex::new(()),
            ds_handlers: RwLock::new(HashMap::new()),
            rs_handlers: RwLock::new(HashMap::new()),
            logs: AsyncMutex::new(HashMap::new()),
            clears_in_progress: AtomicUsize::new(0),
            clearing: Notify::new(),
            generation_id: AtomicI64::new(
                saved_gen.unwrap_or(UNSET_GENERATION_ID),
            ),
            generation_id_saved: AtomicBool::new(saved_gen.is_some()),
            acks: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(vec![]),
            analyzer: Mutex::new(None),
            remote_monitor: Mutex::new(HashMap::new()),
            monitor_arrived: Notify::new(),
            shut_down: AtomicBool::new(false),
        });

        let existing = domain
            .ctx
            .env
            .list()
            .await
            .map_err(ChorusError::into_storage)?;
        for (dn, replica_id) in existing {
            if dn == domain.base_dn {
                domain.get_or_create_log(replica_id).await?;
            }
        }
        pf_info!(
            "domain {} ready, generation id {}",
            domain.base_dn,
            domain.generation_id()
        );
        Ok(domain)
    }

    #[inline]
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    #[inline]
    pub fn generation_id(&self) -> i64 {
        self.generation_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn generation_id_saved(&self) -> bool {
        self.generation_id_saved.load(Ordering::Acquire)
    }

    /// Takes the coarse domain lock.
    pub(crate) async fn lock(&self) -> AsyncMutexGuard<'_, ()> {
        self.domain_lock.lock().await
    }

    /// Snapshot of the connected directory servers.
    pub fn ds_handlers(&self) -> Vec<Arc<ConnectionHandler>> {
        self.ds_handlers
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the connected replication servers.
    pub fn rs_handlers(&self) -> Vec<Arc<ConnectionHandler>> {
        self.rs_handlers
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ds_handler(&self, id: ServerId) -> Option<Arc<ConnectionHandler>> {
        self.ds_handlers.read().ok()?.get(&id).cloned()
    }

    pub fn rs_handler(&self, id: ServerId) -> Option<Arc<ConnectionHandler>> {
        self.rs_handlers.read().ok()?.get(&id).cloned()
    }

    fn any_handler(&self, id: ServerId) -> Option<Arc<ConnectionHandler>> {
        self.ds_handler(id).or_else(|| self.rs_handler(id))
    }

    /// Adds a handler to the registry of its role. Caller holds the domain
    /// lock.
    pub(crate) fn register(&self, handler: Arc<ConnectionHandler>) {
        let registry = if handler.is_ds() {
            &self.ds_handlers
        } else {
            &self.rs_handlers
        };
        if let Ok(mut registry) = registry.write() {
            registry.insert(handler.server_id(), handler);
        }
    }

    /// Removes exactly this handler (not a newer one with the same ID).
    /// Caller holds the domain lock.
    pub(crate) fn unregister(&self, handler: &Arc<ConnectionHandler>) -> bool {
        let registry = if handler.is_ds() {
            &self.ds_handlers
        } else {
            &self.rs_handlers
        };
        let Ok(mut registry) = registry.write() else {
            return false;
        };
        match registry.get(&handler.server_id()) {
            Some(registered) if Arc::ptr_eq(registered, handler) => {
                registry.remove(&handler.server_id());
                true
            }
            _ => false,
        }
    }

    pub fn add_subscriber(&self, subscriber: Arc<dyn UpdateSubscriber>) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.push(subscriber);
        }
    }

    pub fn remove_subscriber(&self, subscriber: &Arc<dyn UpdateSubscriber>) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.retain(|s| !Arc::ptr_eq(s, subscriber));
        }
    }

    fn subscribers(&self) -> Vec<Arc<dyn UpdateSubscriber>> {
        self.subscribers
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Number of assured updates still waiting for acks.
    pub fn pending_acks(&self) -> usize {
        self.acks.lock().map(|acks| acks.len()).unwrap_or(0)
    }
}

// change logs
impl Domain {
    /// Change log of `replica_id`, created on first use.
    pub(crate) async fn get_or_create_log(
        &self,
        replica_id: ServerId,
    ) -> Result<Arc<ChangelogLog>, ChorusError> {
        let mut logs = self.logs.lock().await;
        if let Some(log) = logs.get(&replica_id) {
            return Ok(log.clone());
        }

        let store = self
            .ctx
            .env
            .open(&self.base_dn, replica_id)
            .await
            .map_err(ChorusError::into_storage)?;
        let log = ChangelogLog::new_and_setup(
            &self.base_dn,
            replica_id,
            store,
            self.ctx.with_config(|c| c.log_params()),
            self.ctx.shutdown.clone(),
        )
        .await?;
        logs.insert(replica_id, log.clone());
        Ok(log)
    }

    /// Attaches the current generation ID to logged data.
    async fn mark_generation_id_saved(&self) -> Result<(), ChorusError> {
        if self.generation_id_saved.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let generation_id = self.generation_id();
        if generation_id != UNSET_GENERATION_ID {
            self.ctx
                .env
                .save_generation_id(&self.base_dn, Some(generation_id))
                .await
                .map_err(ChorusError::into_storage)?;
        }
        Ok(())
    }

    pub async fn log(&self, replica_id: ServerId) -> Option<Arc<ChangelogLog>> {
        self.logs.lock().await.get(&replica_id).cloned()
    }

    /// Snapshot of every change log of the domain.
    pub async fn logs(&self) -> Vec<Arc<ChangelogLog>> {
        self.logs.lock().await.values().cloned().collect()
    }

    /// Empties every change log. Catch-ups in progress are cut short first,
    /// so that a peer that stopped granting window does not hold a cursor
    /// on a log being cleared.
    pub(crate) async fn clear_logs(&self) -> Result<(), ChorusError> {
        self.clears_in_progress.fetch_add(1, Ordering::AcqRel);
        self.clearing.notify_waiters();
        let mut result = Ok(());
        for log in self.logs().await {
            if let Err(e) = log.clear().await {
                let e = e.into_storage();
                self.ctx.shutdown.trigger(format!(
                    "cannot clear changelogs of {}: {}",
                    self.base_dn, e
                ));
                result = Err(e);
                break;
            }
        }
        self.clears_in_progress.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Pushes new runtime parameters into every change log.
    pub(crate) async fn apply_log_params(&self, params: &LogParams) {
        for log in self.logs().await {
            log.set_params(params.clone());
        }
    }

    /// Newest logged change per replica.
    pub async fn get_db_server_state(&self) -> ServerState {
        let mut state = ServerState::new();
        for log in self.logs().await {
            if let Some(last) = log.last_change() {
                state.update(last);
            }
        }
        state
    }

    /// Number of changes currently held in the domain's change logs.
    pub async fn changes_count(&self) -> Result<u64, ChorusError> {
        let mut total = 0;
        for log in self.logs().await {
            total += log.changes_count().await?;
        }
        Ok(total)
    }

    /// Number of logged changes newer than what `state` has seen.
    pub async fn missing_changes(
        &self,
        state: &ServerState,
    ) -> Result<u64, ChorusError> {
        let mut missing = 0;
        for log in self.logs().await {
            let Some(last) = log.last_change() else {
                continue;
            };
            let from = match state.get(log.replica_id()) {
                Some(seen) if seen >= last => continue,
                Some(seen) => seen.successor(),
                None => match log.first_change() {
                    Some(first) => first,
                    None => continue,
                },
            };
            missing += log.count(from, last).await?;
        }
        Ok(missing)
    }

    /// Sends a newly connected peer every logged change it has not seen, in
    /// change number order across replicas, honoring its send window.
    pub(crate) async fn catch_up(
        &self,
        handler: &Arc<ConnectionHandler>,
    ) -> Result<(), ChorusError> {
        let eligible = if handler.is_ds() {
            handler.status().accepts_updates()
        } else {
            handler.generation_id() == self.generation_id()
        };
        if !eligible {
            return Ok(());
        }

        let state = handler.server_state();
        let mut heads: Vec<(ChangelogCursor, Arc<UpdateMsg>)> = vec![];
        for log in self.logs().await {
            let mut cursor =
                log.open_cursor_after(state.get(log.replica_id())).await?;
            if let Some(msg) = cursor.next().await? {
                heads.push((cursor, msg));
            }
        }

        let mut sent = 0;
        loop {
            let Some(idx) = heads
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, msg))| msg.cn)
                .map(|(idx, _)| idx)
            else {
                break;
            };
            let msg = heads[idx].1.clone();
            let msg = if msg.assured { msg.not_assured() } else { msg };
            let cleared = self.clearing.notified();
            if self.clears_in_progress.load(Ordering::Acquire) > 0 {
                pf_debug!("catch-up of {:?} cut short by a clear", handler);
                break;
            }
            tokio::select! {
                delivered = handler.send_update(msg) => {
                    if !delivered {
                        break;
                    }
                },
                _ = cleared => {
                    pf_debug!("catch-up of {:?} cut short by a clear", handler);
                    break;
                },
            }
            sent += 1;
            match heads[idx].0.next().await? {
                Some(next) => heads[idx].1 = next,
                None => {
                    heads.swap_remove(idx);
                }
            }
        }

        if sent > 0 {
            pf_debug!("caught up {:?} with {} changes", handler, sent);
        }
        Ok(())
    }
}

// update routing
impl Domain {
    /// Routes one update received from `source`: logs it, prepares assured
    /// bookkeeping and fans it out.
    pub async fn put(
        self: &Arc<Self>,
        update: Arc<UpdateMsg>,
        source: &Arc<ConnectionHandler>,
    ) -> Result<(), ChorusError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ChorusError::transport(format!(
                "domain {} is shut down",
                self.base_dn
            )));
        }
        source.on_received(&update);

        if self.generation_id() == UNSET_GENERATION_ID {
            let source_gen = source.generation_id();
            if source_gen != UNSET_GENERATION_ID
                && self
                    .generation_id
                    .compare_exchange(
                        UNSET_GENERATION_ID,
                        source_gen,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                pf_info!(
                    "domain {} adopted generation id {} from {:?}",
                    self.base_dn,
                    source_gen,
                    source
                );
            }
        }

        // eligible ackers are fixed before anyone can see the update
        let prepared =
            if update.assured && source.protocol_version() >= PROTOCOL_V2 {
                match update.assured_mode {
                    AssuredMode::SafeRead => {
                        self.prepare_safe_read(&update, source)
                    }
                    AssuredMode::SafeData => {
                        self.prepare_safe_data(&update, source)
                    }
                }
            } else {
                PreparedAssured::NotAssured
            };

        let log = self.get_or_create_log(update.cn.replica_id).await?;
        let appended = match log.append(update.clone()).await {
            Ok(appended) => appended,
            Err(e) => {
                let e = e.into_storage();
                self.ctx.shutdown.trigger(format!(
                    "cannot log {} in {}: {}",
                    update.cn, self.base_dn, e
                ));
                return Err(e);
            }
        };

        if appended && !self.generation_id_saved() {
            self.mark_generation_id_saved().await?;
        }

        let eligible = match prepared {
            PreparedAssured::NotAssured => HashSet::new(),
            PreparedAssured::Immediate(ack) => {
                self.send_ack(source, ack);
                HashSet::new()
            }
            PreparedAssured::Wait(entry, eligible) => {
                if appended {
                    self.register_ack_entry(entry);
                    eligible
                } else {
                    // already logged and forwarded earlier
                    self.send_ack(source, AckMsg::new(update.cn));
                    HashSet::new()
                }
            }
        };
        if !appended {
            return Ok(());
        }

        self.fan_out(&update, source, &eligible).await;
        Ok(())
    }

    async fn fan_out(
        &self,
        update: &Arc<UpdateMsg>,
        source: &Arc<ConnectionHandler>,
        eligible: &HashSet<ServerId>,
    ) {
        let plain = if update.assured {
            update.not_assured()
        } else {
            update.clone()
        };
        let pick = |id: ServerId| {
            if eligible.contains(&id) {
                update.clone()
            } else {
                plain.clone()
            }
        };

        let generation_id = self.generation_id();
        if source.is_ds() {
            for rs in self.rs_handlers() {
                if rs.generation_id() != generation_id {
                    pf_trace!(
                        "not forwarding {} to {:?}: generation id {} != {}",
                        update.cn,
                        rs,
                        rs.generation_id(),
                        generation_id
                    );
                    continue;
                }
                rs.add(pick(rs.server_id())).await;
            }
        }

        for ds in self.ds_handlers() {
            if Arc::ptr_eq(&ds, source) {
                continue;
            }
            let status = ds.status();
            if !status.accepts_updates() {
                pf_trace!(
                    "not forwarding {} to {:?} in status {}",
                    update.cn,
                    ds,
                    status
                );
                continue;
            }
            ds.add(pick(ds.server_id())).await;
        }

        for subscriber in self.subscribers() {
            subscriber.deliver(plain.clone()).await;
        }
    }

    fn prepare_safe_read(
        &self,
        update: &UpdateMsg,
        source: &Arc<ConnectionHandler>,
    ) -> PreparedAssured {
        let group_id = self.ctx.group_id();
        if source.group_id() != group_id {
            pf_debug!(
                "safe-read {} from {:?} of group {}: not assured here",
                update.cn,
                source,
                source.group_id()
            );
            return PreparedAssured::NotAssured;
        }

        let mut expected = vec![];
        let mut wrong_status = vec![];
        for ds in self.ds_handlers() {
            if Arc::ptr_eq(&ds, source)
                || ds.group_id() != group_id
                || ds.protocol_version() < PROTOCOL_V2
            {
                continue;
            }
            match ds.status() {
                ServerStatus::Normal => expected.push(ds.server_id()),
                ServerStatus::Degraded => wrong_status.push(ds.server_id()),
                _ => {}
            }
        }
        if source.is_ds() {
            let generation_id = self.generation_id();
            for rs in self.rs_handlers() {
                if rs.group_id() == group_id
                    && rs.generation_id() == generation_id
                    && rs.protocol_version() >= PROTOCOL_V2
                {
                    expected.push(rs.server_id());
                }
            }
        }

        if expected.is_empty() {
            let mut ack = AckMsg::new(update.cn);
            ack.has_wrong_status = !wrong_status.is_empty();
            ack.failed_servers = wrong_status;
            return PreparedAssured::Immediate(ack);
        }
        let eligible = expected.iter().copied().collect();
        PreparedAssured::Wait(
            Arc::new(AckWaitEntry::safe_read(
                update.cn,
                source.clone(),
                expected,
                wrong_status,
            )),
            eligible,
        )
    }

    fn prepare_safe_data(
        &self,
        update: &UpdateMsg,
        source: &Arc<ConnectionHandler>,
    ) -> PreparedAssured {
        let group_id = self.ctx.group_id();
        let generation_id = self.generation_id();
        let level = update.safe_data_level;
        if level < 1 {
            pf_error!(
                "safe-data {} from {:?} with unknown level {}",
                update.cn,
                source,
                level
            );
            return PreparedAssured::NotAssured;
        }
        if source.group_id() != group_id
            || generation_id <= 0
            || source.generation_id() != generation_id
        {
            pf_debug!(
                "safe-data {} from {:?} (group {}, generation id {}): \
                 not assured here",
                update.cn,
                source,
                source.group_id(),
                source.generation_id()
            );
            return PreparedAssured::NotAssured;
        }

        // level 1 is reached once a DS's update is logged here; an RS
        // forwarding a safe-data update only gets this server's ack, and
        // only when it asked for more than itself
        if !source.is_ds() {
            return if level > 1 {
                PreparedAssured::Immediate(AckMsg::new(update.cn))
            } else {
                PreparedAssured::NotAssured
            };
        }
        if level == 1 {
            return PreparedAssured::Immediate(AckMsg::new(update.cn));
        }

        let expected: Vec<ServerId> = self
            .rs_handlers()
            .iter()
            .filter(|rs| {
                rs.group_id() == group_id
                    && rs.generation_id() == generation_id
                    && rs.protocol_version() >= PROTOCOL_V2
            })
            .map(|rs| rs.server_id())
            .collect();

        if expected.len() < usize::from(level - 1) {
            HandlerCounters::bump(&source.counters().safe_data_capped);
            let shortfall = self.ctx.with_config(|c| c.safe_data_shortfall);
            if shortfall == SafeDataShortfall::Warn {
                pf_warn!(
                    "safe-data {} from {:?} asked level {}, only {} reachable",
                    update.cn,
                    source,
                    level,
                    expected.len() + 1
                );
            }
        }

        if expected.is_empty() {
            return PreparedAssured::Immediate(AckMsg::new(update.cn));
        }
        let eligible = expected.iter().copied().collect();
        PreparedAssured::Wait(
            Arc::new(AckWaitEntry::safe_data(
                update.cn,
                source.clone(),
                expected,
            )),
            eligible,
        )
    }
}

// acknowledgments
impl Domain {
    fn register_ack_entry(self: &Arc<Self>, entry: Arc<AckWaitEntry>) {
        let cn = entry.cn();
        if let Ok(mut acks) = self.acks.lock() {
            acks.insert(cn, entry.clone());
        }

        let timeout = Duration::from_millis(
            self.ctx.with_config(|c| c.assured_timeout_ms),
        );
        let domain = self.clone();
        let timer = tokio::spawn(async move {
            time::sleep(timeout).await;
            domain.on_ack_timeout(cn);
        });
        entry.set_timer(timer.abort_handle());
    }

    fn take_ack_entry(&self, entry: &Arc<AckWaitEntry>) {
        if let Ok(mut acks) = self.acks.lock() {
            if acks.get(&entry.cn()).is_some_and(|e| Arc::ptr_eq(e, entry)) {
                acks.remove(&entry.cn());
            }
        }
    }

    fn ack_entry(&self, cn: &ChangeNumber) -> Option<Arc<AckWaitEntry>> {
        self.acks.lock().ok()?.get(cn).cloned()
    }

    /// Sends an ack to its requester; a requester that cannot be reached is
    /// disconnected.
    fn send_ack(&self, requester: &Arc<ConnectionHandler>, ack: AckMsg) {
        if let Err(e) = requester.send(ReplMsg::Ack(ack)) {
            requester.abort(&format!("cannot send ack: {}", e));
        }
    }

    /// Records an ack received from `from`; sends the final ack to the
    /// requester if this completes the entry.
    pub async fn process_ack(
        &self,
        ack: AckMsg,
        from: &Arc<ConnectionHandler>,
    ) {
        let Some(entry) = self.ack_entry(&ack.cn) else {
            pf_debug!("no assured update {} waiting, ack from {:?}", ack.cn, from);
            return;
        };
        if let Some(final_ack) = entry.process_ack(from.server_id(), &ack) {
            self.take_ack_entry(&entry);
            pf_trace!("assured update {} acknowledged", entry.cn());
            self.send_ack(entry.requester(), final_ack);
        }
    }

    /// Timer expiry of an assured update.
    fn on_ack_timeout(&self, cn: ChangeNumber) {
        let Some(entry) = self.ack_entry(&cn) else {
            return;
        };
        let Some((ack, missing)) = entry.on_timeout() else {
            return;
        };
        self.take_ack_entry(&entry);
        pf_debug!(
            "assured update {} timed out waiting for {:?}",
            cn,
            missing
        );

        let requester = entry.requester();
        match entry.mode() {
            AssuredMode::SafeRead => HandlerCounters::bump(
                &requester.counters().assured_sr_received_timeout,
            ),
            AssuredMode::SafeData => HandlerCounters::bump(
                &requester.counters().assured_sd_received_timeout,
            ),
        }
        for id in missing.iter() {
            if let Some(handler) = self.any_handler(*id) {
                match entry.mode() {
                    AssuredMode::SafeRead => HandlerCounters::bump(
                        &handler.counters().assured_sr_sent_timeout,
                    ),
                    AssuredMode::SafeData => HandlerCounters::bump(
                        &handler.counters().assured_sd_sent_timeout,
                    ),
                }
            }
        }
        self.send_ack(requester, ack);
    }
}

// lifecycle
impl Domain {
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Disconnects every peer, drops pending assured updates and closes the
    /// change logs. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_status_analyzer();

        let mut handlers = self.ds_handlers();
        handlers.extend(self.rs_handlers());
        future::join_all(handlers.iter().map(|h| h.shutdown(None))).await;
        {
            let _guard = self.lock().await;
            if let Ok(mut ds) = self.ds_handlers.write() {
                ds.clear();
            }
            if let Ok(mut rs) = self.rs_handlers.write() {
                rs.clear();
            }
        }

        let entries: Vec<_> = self
            .acks
            .lock()
            .map(|mut acks| acks.drain().map(|(_, e)| e).collect())
            .unwrap_or_default();
        for entry in entries {
            entry.abandon();
        }

        for log in self.logs().await {
            if let Err(e) = log.shutdown().await {
                pf_error!(
                    "error closing changelog {}/{}: {}",
                    self.base_dn,
                    log.replica_id(),
                    e
                );
            }
        }
        pf_info!("domain {} shut down", self.base_dn);
    }
}
