//! Per-connection handlers.
//!
//! One `ConnectionHandler` exists per connected peer of a domain, either a
//! directory server (DS) or another replication server (RS). It owns the
//! session to the peer, a bounded outbound queue of updates, both flow
//! control windows and the peer's replication state, and runs two units:
//! a reader dispatching inbound messages into the domain and a writer
//! draining the outbound queue (after catching the peer up from the change
//! logs).

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::proto::{
    AssuredMode, ChangeNumber, DsInfo, ReplMsg, RsInfo, ServerId, ServerState,
    ServerStatus, StatusEvent, UpdateMsg,
};
use crate::server::domain::Domain;
use crate::server::session::{SessionRx, SessionTx};
use crate::utils::ChorusError;

/// How long the writer waits for a send credit before re-checking whether
/// it should stop.
const SEND_WINDOW_POLL: Duration = Duration::from_millis(500);

/// Consecutive credit polls after which the peer is probed for its window.
const PROBE_AFTER_POLLS: u32 = 10;

/// Bound on joining a unit during shutdown.
const UNIT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The two concurrent units of a handler.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UnitKind {
    Reader,
    Writer,
}

/// Session attributes of a connected directory server.
#[derive(Debug, Clone)]
pub(crate) struct DsAttrs {
    pub status: ServerStatus,
    pub ref_urls: Vec<String>,
    pub assured_flag: bool,
    pub assured_mode: AssuredMode,
    pub safe_data_level: u8,
}

/// What a peer replication server told us about itself and its DSs.
#[derive(Debug, Clone, Default)]
pub(crate) struct RsAttrs {
    pub weight: u32,
    pub remote_ds: Vec<DsInfo>,
}

enum PeerKind {
    DataServer(Mutex<DsAttrs>),
    ReplServer(Mutex<RsAttrs>),
}

/// Monitoring counters of one handler.
#[derive(Debug, Default)]
pub struct HandlerCounters {
    pub in_count: AtomicU64,
    pub out_count: AtomicU64,

    pub assured_sr_received: AtomicU64,
    pub assured_sr_received_timeout: AtomicU64,
    pub assured_sr_sent: AtomicU64,
    pub assured_sr_sent_timeout: AtomicU64,

    pub assured_sd_received: AtomicU64,
    pub assured_sd_received_timeout: AtomicU64,
    pub assured_sd_sent: AtomicU64,
    pub assured_sd_sent_timeout: AtomicU64,

    /// Safe-data updates whose level had to be lowered.
    pub safe_data_capped: AtomicU64,
}

impl HandlerCounters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Receive-side flow control window.
#[derive(Debug)]
struct RecvWindow {
    size: u32,
    remaining: u32,
}

impl RecvWindow {
    /// Grants half a window more once less than half is left.
    fn check(&mut self) -> Option<u32> {
        let half = (self.size / 2).max(1);
        if self.remaining < half {
            self.remaining += half;
            Some(half)
        } else {
            None
        }
    }
}

/// Identity and sizing of a handler, gathered during the handshake.
#[derive(Debug, Clone)]
pub(crate) struct HandlerSetup {
    pub server_id: ServerId,
    pub server_url: String,
    pub base_dn: String,
    pub protocol_version: u16,
    pub group_id: u8,
    pub generation_id: i64,

    /// Window the peer granted us.
    pub send_window: u32,

    /// Window we grant the peer.
    pub recv_window: u32,

    pub queue_size: usize,

    /// What the peer had already seen when connecting.
    pub server_state: ServerState,
}

/// Handler of one connected peer.
pub struct ConnectionHandler {
    server_id: ServerId,
    server_url: String,
    base_dn: String,
    protocol_version: u16,
    group_id: u8,
    peer: PeerKind,

    generation_id: AtomicI64,

    /// Newest change per replica the peer is known to have: received from
    /// it or sent to it.
    server_state: Mutex<ServerState>,

    session: SessionTx,

    queue_tx: mpsc::Sender<Arc<UpdateMsg>>,
    queue_rx: AsyncMutex<mpsc::Receiver<Arc<UpdateMsg>>>,

    recv_window: Mutex<RecvWindow>,
    send_window: Semaphore,

    tx_stop: watch::Sender<bool>,
    units: Mutex<Vec<(UnitKind, JoinHandle<()>)>>,

    counters: HandlerCounters,
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}({}@{})",
            if self.is_ds() { "DS" } else { "RS" },
            self.server_id,
            self.base_dn
        )
    }
}

impl ConnectionHandler {
    fn new(setup: HandlerSetup, peer: PeerKind, session: SessionTx) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(setup.queue_size.max(1));
        let (tx_stop, _) = watch::channel(false);
        ConnectionHandler {
            server_id: setup.server_id,
            server_url: setup.server_url,
            base_dn: setup.base_dn,
            protocol_version: setup.protocol_version,
            group_id: setup.group_id,
            peer,
            generation_id: AtomicI64::new(setup.generation_id),
            server_state: Mutex::new(setup.server_state),
            session,
            queue_tx,
            queue_rx: AsyncMutex::new(queue_rx),
            recv_window: Mutex::new(RecvWindow {
                size: setup.recv_window,
                remaining: setup.recv_window,
            }),
            send_window: Semaphore::new(setup.send_window as usize),
            tx_stop,
            units: Mutex::new(vec![]),
            counters: HandlerCounters::default(),
        }
    }

    pub(crate) fn new_ds(
        setup: HandlerSetup,
        attrs: DsAttrs,
        session: SessionTx,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            setup,
            PeerKind::DataServer(Mutex::new(attrs)),
            session,
        ))
    }

    pub(crate) fn new_rs(
        setup: HandlerSetup,
        weight: u32,
        session: SessionTx,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            setup,
            PeerKind::ReplServer(Mutex::new(RsAttrs {
                weight,
                remote_ds: vec![],
            })),
            session,
        ))
    }

    #[inline]
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    #[inline]
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    #[inline]
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    #[inline]
    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    #[inline]
    pub fn group_id(&self) -> u8 {
        self.group_id
    }

    #[inline]
    pub fn is_ds(&self) -> bool {
        matches!(self.peer, PeerKind::DataServer(_))
    }

    #[inline]
    pub fn generation_id(&self) -> i64 {
        self.generation_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_generation_id(&self, generation_id: i64) {
        self.generation_id.store(generation_id, Ordering::Release);
    }

    #[inline]
    pub fn counters(&self) -> &HandlerCounters {
        &self.counters
    }

    pub fn server_state(&self) -> ServerState {
        self.server_state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// Status of a DS; replication servers always count as NORMAL.
    pub fn status(&self) -> ServerStatus {
        match &self.peer {
            PeerKind::DataServer(attrs) => attrs
                .lock()
                .map(|a| a.status)
                .unwrap_or(ServerStatus::NotConnected),
            PeerKind::ReplServer(_) => ServerStatus::Normal,
        }
    }

    /// Applies a status event to a DS. Returns the new status, or `None`
    /// if the transition is not allowed (status unchanged) or the peer is
    /// not a DS.
    pub(crate) fn change_status(
        &self,
        event: StatusEvent,
    ) -> Option<ServerStatus> {
        match &self.peer {
            PeerKind::DataServer(attrs) => {
                let mut attrs = attrs.lock().ok()?;
                let new_status = attrs.status.transition(event)?;
                attrs.status = new_status;
                Some(new_status)
            }
            PeerKind::ReplServer(_) => None,
        }
    }

    /// Topology entry of a DS connected to replication server `rs_id`.
    pub(crate) fn ds_info(&self, rs_id: ServerId) -> Option<DsInfo> {
        match &self.peer {
            PeerKind::DataServer(attrs) => {
                let attrs = attrs.lock().ok()?;
                Some(DsInfo {
                    ds_id: self.server_id,
                    rs_id,
                    generation_id: self.generation_id(),
                    status: attrs.status,
                    assured_flag: attrs.assured_flag,
                    assured_mode: attrs.assured_mode,
                    safe_data_level: attrs.safe_data_level,
                    group_id: self.group_id,
                    ref_urls: attrs.ref_urls.clone(),
                })
            }
            PeerKind::ReplServer(_) => None,
        }
    }

    /// Topology entry of a peer RS.
    pub(crate) fn rs_info(&self) -> Option<RsInfo> {
        match &self.peer {
            PeerKind::ReplServer(attrs) => {
                let attrs = attrs.lock().ok()?;
                Some(RsInfo {
                    rs_id: self.server_id,
                    generation_id: self.generation_id(),
                    group_id: self.group_id,
                    weight: attrs.weight,
                })
            }
            PeerKind::DataServer(_) => None,
        }
    }

    /// Records what a peer RS reported about itself and the DSs behind it.
    pub(crate) fn set_rs_topology(&self, info: Option<&RsInfo>, ds: Vec<DsInfo>) {
        if let PeerKind::ReplServer(attrs) = &self.peer {
            if let Some(info) = info {
                self.set_generation_id(info.generation_id);
            }
            if let Ok(mut attrs) = attrs.lock() {
                if let Some(info) = info {
                    attrs.weight = info.weight;
                }
                attrs.remote_ds = ds;
            }
        }
    }

    /// DSs connected behind a peer RS.
    pub(crate) fn remote_ds(&self) -> Vec<DsInfo> {
        match &self.peer {
            PeerKind::ReplServer(attrs) => attrs
                .lock()
                .map(|a| a.remote_ds.clone())
                .unwrap_or_default(),
            PeerKind::DataServer(_) => vec![],
        }
    }

    pub(crate) fn has_remote_ds(&self) -> bool {
        !self.remote_ds().is_empty()
    }

    pub(crate) fn is_remote_ds(&self, ds_id: ServerId) -> bool {
        self.remote_ds().iter().any(|ds| ds.ds_id == ds_id)
    }

    /// Sends a message directly on the session, bypassing the update queue.
    pub fn send(&self, msg: ReplMsg) -> Result<(), ChorusError> {
        self.session.send(msg)
    }

    /// Closes the session so that both units wind down; the reader then
    /// unregisters the handler.
    pub(crate) fn abort(&self, reason: &str) {
        pf_warn!("closing session with {:?}: {}", self, reason);
        self.session.close();
        self.tx_stop.send_replace(true);
        self.send_window.close();
    }

    #[inline]
    pub fn is_stopping(&self) -> bool {
        *self.tx_stop.borrow()
    }

    async fn stopped(&self) {
        let mut rx_stop = self.tx_stop.subscribe();
        while !*rx_stop.borrow_and_update() {
            if rx_stop.changed().await.is_err() {
                return;
            }
        }
    }
}

// flow control and queueing
impl ConnectionHandler {
    /// Records an update received from the peer.
    pub(crate) fn on_received(&self, msg: &UpdateMsg) {
        if let Ok(mut state) = self.server_state.lock() {
            state.update(msg.cn);
        }
        HandlerCounters::bump(&self.counters.in_count);
        if msg.assured {
            match msg.assured_mode {
                AssuredMode::SafeRead => {
                    HandlerCounters::bump(&self.counters.assured_sr_received)
                }
                AssuredMode::SafeData => {
                    HandlerCounters::bump(&self.counters.assured_sd_received)
                }
            }
        }
    }

    /// True if the peer already has `cn`.
    pub(crate) fn has_seen(&self, cn: &ChangeNumber) -> bool {
        self.server_state
            .lock()
            .map(|state| state.cover_cn(cn))
            .unwrap_or(false)
    }

    fn mark_sent(&self, msg: &UpdateMsg) {
        if let Ok(mut state) = self.server_state.lock() {
            state.update(msg.cn);
        }
        HandlerCounters::bump(&self.counters.out_count);
        if msg.assured {
            match msg.assured_mode {
                AssuredMode::SafeRead => {
                    HandlerCounters::bump(&self.counters.assured_sr_sent)
                }
                AssuredMode::SafeData => {
                    HandlerCounters::bump(&self.counters.assured_sd_sent)
                }
            }
        }
    }

    /// Enqueues an update for the peer. Waits while the queue is full;
    /// gives up (returning false) once the handler is stopping.
    pub async fn add(&self, msg: Arc<UpdateMsg>) -> bool {
        if self.is_stopping() {
            return false;
        }
        tokio::select! {
            res = self.queue_tx.send(msg) => res.is_ok(),
            _ = self.stopped() => false,
        }
    }

    /// Number of updates waiting in the outbound queue.
    pub fn queue_len(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    /// Takes the next update to send: skips updates the peer already has,
    /// then waits for a send credit. Returns `None` once stopping.
    pub async fn take(&self) -> Option<Arc<UpdateMsg>> {
        let mut queue_rx = self.queue_rx.lock().await;
        loop {
            let msg = tokio::select! {
                msg = queue_rx.recv() => msg?,
                _ = self.stopped() => return None,
            };
            if self.has_seen(&msg.cn) {
                pf_trace!("{:?} already has {}", self, msg.cn);
                continue;
            }
            if !self.acquire_send_credit().await {
                return None;
            }
            self.mark_sent(&msg);
            return Some(msg);
        }
    }

    /// Waits for one send credit, polling so that a stop request is noticed
    /// and probing the peer if the window stays closed.
    async fn acquire_send_credit(&self) -> bool {
        let mut polls = 0;
        loop {
            if self.is_stopping() {
                return false;
            }
            match time::timeout(SEND_WINDOW_POLL, self.send_window.acquire())
                .await
            {
                Ok(Ok(permit)) => {
                    permit.forget();
                    return true;
                }
                Ok(Err(_)) => return false,
                Err(_) => {
                    polls += 1;
                    if polls % PROBE_AFTER_POLLS == 0 {
                        pf_debug!("send window to {:?} closed, probing", self);
                        if self.session.send(ReplMsg::WindowProbe).is_err() {
                            return false;
                        }
                    }
                }
            }
        }
    }

    /// Sends one catch-up update straight from the change log, honoring the
    /// send window. Returns false once stopping.
    pub(crate) async fn send_update(&self, msg: Arc<UpdateMsg>) -> bool {
        if self.has_seen(&msg.cn) {
            return true;
        }
        if !self.acquire_send_credit().await {
            return false;
        }
        self.mark_sent(&msg);
        self.session.send(ReplMsg::Update(msg)).is_ok()
    }

    /// Credits granted by the peer.
    pub(crate) fn update_window(&self, num_ack: u32) {
        self.send_window.add_permits(num_ack as usize);
    }

    /// Consumes one receive credit and grants more if running low.
    pub(crate) fn dec_and_check_window(&self) -> Result<(), ChorusError> {
        let grant = {
            let mut window = self
                .recv_window
                .lock()
                .map_err(|_| ChorusError::msg("recv window poisoned"))?;
            window.remaining = window.remaining.saturating_sub(1);
            window.check()
        };
        if let Some(num_ack) = grant {
            self.session.send(ReplMsg::Window { num_ack })?;
        }
        Ok(())
    }

    /// The peer thinks its window is closed: resend what is left, or grant
    /// more if it really is exhausted.
    pub(crate) fn process_window_probe(&self) -> Result<(), ChorusError> {
        let grant = {
            let mut window = self
                .recv_window
                .lock()
                .map_err(|_| ChorusError::msg("recv window poisoned"))?;
            if window.remaining > 0 {
                Some(window.remaining)
            } else {
                window.check()
            }
        };
        if let Some(num_ack) = grant {
            self.session.send(ReplMsg::Window { num_ack })?;
        }
        Ok(())
    }

    /// Currently available send credits.
    pub fn send_credits(&self) -> usize {
        self.send_window.available_permits()
    }
}

// unit lifecycle
impl ConnectionHandler {
    /// Spawns the reader and writer units.
    pub(crate) fn start_units(
        self: &Arc<Self>,
        domain: Arc<Domain>,
        session_rx: SessionRx,
    ) {
        let reader = tokio::spawn(Self::reader_thread(
            self.clone(),
            domain.clone(),
            session_rx,
        ));
        let writer = tokio::spawn(Self::writer_thread(self.clone(), domain));
        if let Ok(mut units) = self.units.lock() {
            units.push((UnitKind::Reader, reader));
            units.push((UnitKind::Writer, writer));
        }
    }

    /// Stops the handler: closes the session, wakes both units and joins
    /// them with a bounded wait, skipping the unit this is called from.
    /// Only the first call does anything.
    pub(crate) async fn shutdown(&self, from_unit: Option<UnitKind>) {
        if self.tx_stop.send_replace(true) {
            return;
        }
        self.session.close();
        self.send_window.close();

        let units: Vec<_> = self
            .units
            .lock()
            .map(|mut units| units.drain(..).collect())
            .unwrap_or_default();
        for (kind, handle) in units {
            if Some(kind) == from_unit {
                continue;
            }
            if time::timeout(UNIT_JOIN_TIMEOUT, handle).await.is_err() {
                pf_warn!("{:?} unit of {:?} did not stop in time", kind, self);
            }
        }
        pf_debug!("handler {:?} shut down", self);
    }

    /// Reader unit: dispatches every inbound message into the domain.
    async fn reader_thread(
        handler: Arc<Self>,
        domain: Arc<Domain>,
        mut session_rx: SessionRx,
    ) {
        pf_debug!("reader of {:?} spawned", handler);

        loop {
            let msg = tokio::select! {
                msg = session_rx.recv() => msg,
                _ = handler.stopped() => None,
            };
            let Some(msg) = msg else {
                break;
            };

            match msg {
                ReplMsg::Update(update) => {
                    if let Err(e) = handler.dec_and_check_window() {
                        pf_debug!("cannot grant window to {:?}: {}", handler, e);
                        break;
                    }
                    if let Err(e) = domain.put(update, &handler).await {
                        pf_error!("error storing update from {:?}: {}", handler, e);
                        if e.is_fatal() {
                            break;
                        }
                    }
                }

                ReplMsg::Ack(ack) => domain.process_ack(ack, &handler).await,

                ReplMsg::Window { num_ack } => handler.update_window(num_ack),

                ReplMsg::WindowProbe => {
                    if let Err(e) = handler.process_window_probe() {
                        pf_debug!("cannot answer probe of {:?}: {}", handler, e);
                        break;
                    }
                }

                ReplMsg::ChangeStatus { requested, .. } => {
                    if handler.is_ds() {
                        domain.process_new_status(&handler, requested).await;
                    } else {
                        pf_warn!("ignoring status change from {:?}", handler);
                    }
                }

                ReplMsg::Topology(topo) => {
                    if handler.is_ds() {
                        pf_debug!("ignoring topology from {:?}", handler);
                    } else {
                        domain.receive_topo_info_from_rs(topo, &handler, true).await;
                    }
                }

                ReplMsg::ResetGenerationId { generation_id } => {
                    domain.reset_generation_id(&handler, generation_id).await;
                }

                ReplMsg::Routable(routable) => {
                    domain.process_routable(routable, &handler).await;
                }

                other => {
                    pf_warn!(
                        "unexpected {} from {:?} after handshake",
                        other.kind_name(),
                        handler
                    );
                    break;
                }
            }
        }

        pf_debug!("reader of {:?} exitted", handler);
        domain.stop_server(&handler, Some(UnitKind::Reader)).await;
    }

    /// Writer unit: catches the peer up from the change logs, then drains
    /// the outbound queue.
    async fn writer_thread(handler: Arc<Self>, domain: Arc<Domain>) {
        pf_debug!("writer of {:?} spawned", handler);

        if let Err(e) = domain.catch_up(&handler).await {
            pf_error!("error catching up {:?}: {}", handler, e);
        }

        while let Some(msg) = handler.take().await {
            if handler.session.send(ReplMsg::Update(msg)).is_err() {
                break;
            }
        }

        pf_debug!("writer of {:?} exitted", handler);
        domain.stop_server(&handler, Some(UnitKind::Writer)).await;
    }
}
