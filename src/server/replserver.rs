//! The replication server: owns the shared context and the registry of
//! domains, accepts sessions and keeps connections to peer replication
//! servers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::changelog::{ChangelogEnv, FileEnv, MemEnv};
use crate::proto::ReplMsg;
use crate::server::config::{ReplServerConfig, ServerContext};
use crate::server::domain::Domain;
use crate::server::handshake::recv_handshake_msg;
use crate::server::session::{tcp_session, SessionRx, SessionTx};
use crate::utils::{
    tcp_bind_with_retry, tcp_connect_with_retry, ChorusError, ShutdownSignal,
};

/// A replication server process.
pub struct ReplicationServer {
    ctx: Arc<ServerContext>,

    /// Map from suffix -> domain.
    domains: AsyncMutex<HashMap<String, Arc<Domain>>>,

    /// Address the listener actually bound to.
    bound_addr: Mutex<Option<SocketAddr>>,

    /// Join handles of the acceptor and connector threads.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationServer {
    /// Creates the server with the change log environment its config asks
    /// for, and opens a domain for every configured suffix and every suffix
    /// with existing change logs.
    pub async fn new_and_setup(
        config: ReplServerConfig,
        shutdown: ShutdownSignal,
    ) -> Result<Arc<Self>, ChorusError> {
        config.validate()?;
        let env: Arc<dyn ChangelogEnv> = if config.changelog_dir.is_empty() {
            Arc::new(MemEnv::new())
        } else {
            Arc::new(
                FileEnv::new_and_setup(Path::new(&config.changelog_dir))
                    .await?,
            )
        };
        Self::new_with_env(config, env, shutdown).await
    }

    /// Same as `new_and_setup` over a given change log environment.
    pub async fn new_with_env(
        config: ReplServerConfig,
        env: Arc<dyn ChangelogEnv>,
        shutdown: ShutdownSignal,
    ) -> Result<Arc<Self>, ChorusError> {
        config.validate()?;
        let mut base_dns = config.base_dns.clone();
        for (base_dn, _) in env.list().await.map_err(ChorusError::into_storage)? {
            if !base_dns.contains(&base_dn) {
                base_dns.push(base_dn);
            }
        }

        let server = Arc::new(ReplicationServer {
            ctx: Arc::new(ServerContext::new(config, env, shutdown)),
            domains: AsyncMutex::new(HashMap::new()),
            bound_addr: Mutex::new(None),
            tasks: Mutex::new(vec![]),
        });
        for base_dn in base_dns {
            server.get_or_create_domain(&base_dn).await?;
        }
        pf_info!("replication server {} set up", server.ctx.server_id());
        Ok(server)
    }

    #[inline]
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.ctx.shutdown
    }

    /// Domain of `base_dn`, created on first use.
    pub async fn get_or_create_domain(
        &self,
        base_dn: &str,
    ) -> Result<Arc<Domain>, ChorusError> {
        let mut domains = self.domains.lock().await;
        if let Some(domain) = domains.get(base_dn) {
            return Ok(domain.clone());
        }
        let domain = Domain::new_and_setup(base_dn, self.ctx.clone()).await?;
        domains.insert(base_dn.to_string(), domain.clone());
        Ok(domain)
    }

    pub async fn domain(&self, base_dn: &str) -> Option<Arc<Domain>> {
        self.domains.lock().await.get(base_dn).cloned()
    }

    pub async fn domains(&self) -> Vec<Arc<Domain>> {
        self.domains.lock().await.values().cloned().collect()
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.lock().ok().and_then(|addr| *addr)
    }

    /// Runs the handshake of a newly accepted session, dispatching on its
    /// first message.
    pub async fn accept_session(
        &self,
        tx: SessionTx,
        mut rx: SessionRx,
    ) -> Result<(), ChorusError> {
        let first = match recv_handshake_msg(&mut rx).await {
            Ok(msg) => msg,
            Err(e) => {
                tx.close();
                return Err(e);
            }
        };
        match first {
            ReplMsg::ServerStart(start) => {
                let domain = self.get_or_create_domain(&start.base_dn).await?;
                domain.handshake_ds(start, tx, rx).await
            }
            ReplMsg::ReplServerStart(start) => {
                let domain = self.get_or_create_domain(&start.base_dn).await?;
                domain.handshake_incoming_rs(start, tx, rx).await
            }
            other => {
                tx.close();
                logged_err!(
                    "unexpected {} as first message of a session",
                    other.kind_name()
                )
            }
        }
    }

    /// Opens a session to the RS at `rs_url` for one domain.
    pub async fn connect_to_rs(
        &self,
        rs_url: &str,
        domain: &Arc<Domain>,
    ) -> Result<(), ChorusError> {
        let addr: SocketAddr = rs_url.parse()?;
        let conn = tcp_connect_with_retry(addr, 0).await?;
        let (tx, rx, _) = tcp_session(conn, rs_url.to_string());
        domain.handshake_outgoing_rs(rs_url, tx, rx).await
    }

    /// Binds the listening socket and spawns the acceptor thread. Returns
    /// the bound address.
    pub async fn start_listener(
        self: &Arc<Self>,
    ) -> Result<SocketAddr, ChorusError> {
        let listen_addr: SocketAddr =
            self.ctx.with_config(|c| c.listen_addr.clone()).parse()?;
        let listener = tcp_bind_with_retry(listen_addr, 10).await?;
        let bound = listener.local_addr()?;
        if let Ok(mut addr) = self.bound_addr.lock() {
            *addr = Some(bound);
        }

        let handle = tokio::spawn(Self::acceptor_thread(self.clone(), listener));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
        pf_info!("accepting replication sessions on {}", bound);
        Ok(bound)
    }

    /// Spawns the connector thread, which keeps a session open to every
    /// configured peer RS for every domain.
    pub fn start_connector(self: &Arc<Self>) {
        let handle = tokio::spawn(Self::connector_thread(self.clone()));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    /// Validates a new configuration and applies it at runtime. The server
    /// ID and listening address are fixed for the process lifetime.
    pub async fn apply_config(
        &self,
        config: ReplServerConfig,
    ) -> Result<(), ChorusError> {
        config.validate()?;
        let current = self.ctx.config();
        if config.server_id != current.server_id {
            pf_warn!(
                "server_id change {} -> {} ignored",
                current.server_id,
                config.server_id
            );
        }
        if config.listen_addr != current.listen_addr {
            pf_warn!(
                "listen_addr change {} -> {} applies after restart",
                current.listen_addr,
                config.listen_addr
            );
        }
        if config.changelog_dir != current.changelog_dir {
            pf_warn!("changelog_dir change applies after restart");
        }

        let new_dns: Vec<_> = config
            .base_dns
            .iter()
            .filter(|dn| !current.base_dns.contains(dn))
            .cloned()
            .collect();
        let log_params = config.log_params();
        self.ctx.set_config(config);

        for base_dn in new_dns {
            self.get_or_create_domain(&base_dn).await?;
        }
        for domain in self.domains().await {
            domain.apply_log_params(&log_params).await;
            domain.update_status_analyzer();
        }
        pf_info!("configuration updated");
        Ok(())
    }

    /// Starts listening and connecting, then waits for the shutdown signal
    /// and shuts everything down.
    pub async fn run(self: &Arc<Self>) -> Result<(), ChorusError> {
        self.start_listener().await?;
        self.start_connector();

        self.ctx.shutdown.triggered().await;
        pf_warn!(
            "shutting down: {}",
            self.ctx
                .shutdown
                .reason()
                .unwrap_or_else(|| "requested".into())
        );
        self.shutdown().await;
        Ok(())
    }

    /// Stops accepting and connecting and shuts every domain down.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if !self.ctx.shutdown.is_triggered() {
            self.ctx.shutdown.trigger("server shutdown");
        }
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
        for domain in self.domains().await {
            domain.shutdown().await;
        }
    }
}

// acceptor and connector threads
impl ReplicationServer {
    async fn acceptor_thread(server: Arc<Self>, listener: TcpListener) {
        pf_debug!("acceptor thread spawned");

        let shutdown = server.ctx.shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_warn!("error accepting connection: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = conn.set_nodelay(true) {
                        pf_warn!("cannot set nodelay for {}: {}", peer, e);
                    }
                    let (tx, rx, _) = tcp_session(conn, peer.to_string());
                    let server = server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.accept_session(tx, rx).await {
                            pf_debug!("session from {} not admitted: {}", peer, e);
                        }
                    });
                },

                _ = shutdown.triggered() => break,
            }
        }

        pf_debug!("acceptor thread exitted");
    }

    async fn connector_thread(server: Arc<Self>) {
        pf_debug!("connector thread spawned");

        let shutdown = server.ctx.shutdown.clone();
        let retry_ms = server.ctx.with_config(|c| c.connect_retry_ms.max(1));
        let mut interval = time::interval(Duration::from_millis(retry_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = shutdown.triggered() => break,
            }

            let (peers, listen_addr) = server.ctx.with_config(|c| {
                (c.replication_servers.clone(), c.listen_addr.clone())
            });
            let own = server.bound_addr().map(|a| a.to_string());
            for domain in server.domains().await {
                for rs_url in peers.iter() {
                    if *rs_url == listen_addr
                        || own.as_deref() == Some(rs_url.as_str())
                        || domain.is_connected_to_rs(rs_url)
                    {
                        continue;
                    }
                    if let Err(e) = server.connect_to_rs(rs_url, &domain).await
                    {
                        pf_debug!(
                            "cannot connect {} to RS {}: {}",
                            domain.base_dn(),
                            rs_url,
                            e
                        );
                    }
                }
            }
        }

        pf_debug!("connector thread exitted");
    }
}

#[cfg(test)]
mod replserver_tests {
    use super::*;
    use crate::proto::{
        now_millis, AckMsg, AssuredMode, ChangeNumber, DsInfo, MonitorData,
        ReplServerStartMsg, RoutableMsg, RouteTarget, RoutedPayload, RsInfo,
        ServerId, ServerStartMsg, ServerState, ServerStatus, StartSessionMsg,
        TopologyMsg, UpdateMsg, CURRENT_PROTOCOL_VERSION, UNSET_GENERATION_ID,
    };
    use crate::server::domain::UpdateSubscriber;
    use crate::server::handler::HandlerCounters;
    use crate::server::session::session_pair;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    const DN: &str = "dc=example,dc=com";
    const WAIT: Duration = Duration::from_secs(3);
    const QUIET: Duration = Duration::from_millis(300);

    fn test_config(server_id: ServerId) -> ReplServerConfig {
        ReplServerConfig {
            server_id,
            base_dns: vec![DN.into()],
            assured_timeout_ms: 300,
            degraded_status_threshold: 0,
            flush_interval_ms: 10,
            status_analyzer_interval_ms: 50,
            ..Default::default()
        }
    }

    async fn new_server(
        config: ReplServerConfig,
        env: Arc<dyn ChangelogEnv>,
    ) -> Result<Arc<ReplicationServer>, ChorusError> {
        ReplicationServer::new_with_env(config, env, ShutdownSignal::new())
            .await
    }

    async fn domain_of(
        server: &ReplicationServer,
    ) -> Result<Arc<Domain>, ChorusError> {
        server
            .domain(DN)
            .await
            .ok_or_else(|| ChorusError::msg("domain missing"))
    }

    fn update(ts_offset: i64, replica_id: ServerId) -> UpdateMsg {
        UpdateMsg::new(
            ChangeNumber::new(now_millis() + ts_offset, 0, replica_id),
            DN,
            Bytes::from_static(b"change"),
        )
    }

    fn ds_info(ds_id: ServerId, rs_id: ServerId, generation_id: i64) -> DsInfo {
        DsInfo {
            ds_id,
            rs_id,
            generation_id,
            status: ServerStatus::Normal,
            assured_flag: false,
            assured_mode: AssuredMode::SafeRead,
            safe_data_level: 1,
            group_id: 1,
            ref_urls: vec![],
        }
    }

    /// Test-side end of a session, playing a DS or an RS.
    struct Peer {
        tx: SessionTx,
        rx: SessionRx,
    }

    impl Peer {
        fn send(&self, msg: ReplMsg) -> Result<(), ChorusError> {
            self.tx.send(msg)
        }

        async fn recv_where(
            &mut self,
            what: &str,
            pred: impl Fn(&ReplMsg) -> bool,
        ) -> Result<ReplMsg, ChorusError> {
            loop {
                match time::timeout(WAIT, self.rx.recv()).await? {
                    Some(msg) if pred(&msg) => return Ok(msg),
                    Some(_) => continue,
                    None => {
                        return Err(ChorusError::transport(format!(
                            "session closed waiting for {}",
                            what
                        )))
                    }
                }
            }
        }

        async fn recv_update(&mut self) -> Result<Arc<UpdateMsg>, ChorusError> {
            match self
                .recv_where("update", |m| matches!(m, ReplMsg::Update(_)))
                .await?
            {
                ReplMsg::Update(update) => Ok(update),
                _ => unreachable!(),
            }
        }

        async fn recv_ack(&mut self) -> Result<AckMsg, ChorusError> {
            match self
                .recv_where("ack", |m| matches!(m, ReplMsg::Ack(_)))
                .await?
            {
                ReplMsg::Ack(ack) => Ok(ack),
                _ => unreachable!(),
            }
        }

        async fn recv_status(
            &mut self,
            status: ServerStatus,
        ) -> Result<(), ChorusError> {
            self.recv_where("status change", |m| {
                matches!(m, ReplMsg::ChangeStatus { new_status, .. }
                         if *new_status == status)
            })
            .await?;
            Ok(())
        }

        /// True if nothing matching arrives for a while.
        async fn stays_quiet(&mut self, pred: impl Fn(&ReplMsg) -> bool) -> bool {
            loop {
                match time::timeout(QUIET, self.rx.recv()).await {
                    Err(_) | Ok(None) => return true,
                    Ok(Some(msg)) if pred(&msg) => return false,
                    Ok(Some(_)) => continue,
                }
            }
        }
    }

    async fn connect_ds(
        server: &Arc<ReplicationServer>,
        ds_id: ServerId,
        generation_id: i64,
        window_size: u32,
    ) -> Result<Peer, ChorusError> {
        let ((tx, rx), (tx_srv, rx_srv)) = session_pair();
        let srv = server.clone();
        let handshake =
            tokio::spawn(async move { srv.accept_session(tx_srv, rx_srv).await });

        let mut peer = Peer { tx, rx };
        peer.send(ReplMsg::ServerStart(ServerStartMsg {
            server_id: ds_id,
            server_url: format!("ds-{}", ds_id),
            base_dn: DN.into(),
            window_size,
            server_state: ServerState::new(),
            protocol_version: CURRENT_PROTOCOL_VERSION,
            generation_id,
            group_id: 1,
        }))?;
        peer.recv_where("ReplServerStart", |m| {
            matches!(m, ReplMsg::ReplServerStart(_))
        })
        .await?;
        peer.send(ReplMsg::StartSession(StartSessionMsg {
            status: ServerStatus::Normal,
            ref_urls: vec![],
            assured_flag: false,
            assured_mode: AssuredMode::SafeRead,
            safe_data_level: 1,
        }))?;
        handshake.await??;
        Ok(peer)
    }

    async fn connect_rs(
        server: &Arc<ReplicationServer>,
        rs_id: ServerId,
        generation_id: i64,
        remote_ds: &[ServerId],
    ) -> Result<Peer, ChorusError> {
        let ((tx, rx), (tx_srv, rx_srv)) = session_pair();
        let srv = server.clone();
        let handshake =
            tokio::spawn(async move { srv.accept_session(tx_srv, rx_srv).await });

        let mut peer = Peer { tx, rx };
        peer.send(ReplMsg::ReplServerStart(ReplServerStartMsg {
            server_id: rs_id,
            server_url: format!("rs-{}", rs_id),
            base_dn: DN.into(),
            window_size: 100,
            server_state: ServerState::new(),
            protocol_version: CURRENT_PROTOCOL_VERSION,
            generation_id,
            group_id: 1,
            degraded_status_threshold: 0,
        }))?;
        peer.recv_where("ReplServerStart", |m| {
            matches!(m, ReplMsg::ReplServerStart(_))
        })
        .await?;
        peer.send(ReplMsg::Topology(TopologyMsg {
            ds_infos: remote_ds
                .iter()
                .map(|id| ds_info(*id, rs_id, generation_id))
                .collect(),
            rs_infos: vec![RsInfo {
                rs_id,
                generation_id,
                group_id: 1,
                weight: 1,
            }],
        }))?;
        handshake.await??;
        Ok(peer)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn safe_data_level2_success() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let mut ds = connect_ds(&server, 11, 42, 100).await?;
        let mut rs_a = connect_rs(&server, 21, 42, &[]).await?;
        let mut rs_b = connect_rs(&server, 22, 42, &[]).await?;
        let domain = domain_of(&server).await?;

        let upd = update(0, 11).with_assured(AssuredMode::SafeData, 2);
        let cn = upd.cn;
        ds.send(ReplMsg::Update(Arc::new(upd)))?;
        assert!(rs_a.recv_update().await?.assured);
        assert!(rs_b.recv_update().await?.assured);

        rs_a.send(ReplMsg::Ack(AckMsg::new(cn)))?;
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(domain.pending_acks(), 1);

        rs_b.send(ReplMsg::Ack(AckMsg::new(cn)))?;
        let ack = ds.recv_ack().await?;
        assert_eq!(ack.cn, cn);
        assert!(ack.is_success());

        // a late duplicate changes nothing
        rs_a.send(ReplMsg::Ack(AckMsg::new(cn)))?;
        assert!(ds.stays_quiet(|m| matches!(m, ReplMsg::Ack(_))).await);
        assert_eq!(domain.pending_acks(), 0);

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn safe_data_timeout_names_missing() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let mut ds = connect_ds(&server, 11, 42, 100).await?;
        let mut rs_a = connect_rs(&server, 21, 42, &[]).await?;
        let mut rs_b = connect_rs(&server, 22, 42, &[]).await?;
        let domain = domain_of(&server).await?;

        let upd = update(0, 11).with_assured(AssuredMode::SafeData, 2);
        let cn = upd.cn;
        ds.send(ReplMsg::Update(Arc::new(upd)))?;
        rs_a.recv_update().await?;
        rs_b.recv_update().await?;
        rs_a.send(ReplMsg::Ack(AckMsg::new(cn)))?;

        let ack = ds.recv_ack().await?;
        assert_eq!(ack.cn, cn);
        assert!(ack.has_timeout);
        assert_eq!(ack.failed_servers, vec![22]);

        let ds_handler = domain
            .ds_handler(11)
            .ok_or_else(|| ChorusError::msg("DS 11 missing"))?;
        let rs_handler = domain
            .rs_handler(22)
            .ok_or_else(|| ChorusError::msg("RS 22 missing"))?;
        assert_eq!(
            HandlerCounters::get(
                &ds_handler.counters().assured_sd_received_timeout
            ),
            1
        );
        assert_eq!(
            HandlerCounters::get(&rs_handler.counters().assured_sd_sent_timeout),
            1
        );

        // the ack that arrives after the timeout is ignored
        rs_b.send(ReplMsg::Ack(AckMsg::new(cn)))?;
        assert!(ds.stays_quiet(|m| matches!(m, ReplMsg::Ack(_))).await);

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn safe_read_waits_for_normal_ds() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let mut ds_a = connect_ds(&server, 11, 42, 100).await?;
        let mut ds_b = connect_ds(&server, 12, 42, 100).await?;

        let upd = update(0, 11).with_assured(AssuredMode::SafeRead, 1);
        let cn = upd.cn;
        ds_a.send(ReplMsg::Update(Arc::new(upd)))?;
        assert!(ds_b.recv_update().await?.assured);
        ds_b.send(ReplMsg::Ack(AckMsg::new(cn)))?;
        assert!(ds_a.recv_ack().await?.is_success());

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn generation_id_adoption() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let domain = domain_of(&server).await?;
        assert_eq!(domain.generation_id(), UNSET_GENERATION_ID);

        let mut ds_a = connect_ds(&server, 11, 42, 100).await?;
        assert_eq!(domain.generation_id(), 42);

        let mut ds_b = connect_ds(&server, 12, 7, 100).await?;
        ds_b.recv_status(ServerStatus::BadGenerationId).await?;
        let handler_b = domain
            .ds_handler(12)
            .ok_or_else(|| ChorusError::msg("DS 12 missing"))?;
        assert_eq!(handler_b.status(), ServerStatus::BadGenerationId);

        let mut ds_c = connect_ds(&server, 13, 42, 100).await?;
        ds_a.send(ReplMsg::Update(Arc::new(update(0, 11))))?;
        assert_eq!(ds_c.recv_update().await?.cn.replica_id, 11);
        assert!(ds_b.stays_quiet(|m| matches!(m, ReplMsg::Update(_))).await);
        assert!(ds_a.stays_quiet(|m| matches!(m, ReplMsg::Update(_))).await);

        // still connected
        assert!(domain.ds_handler(12).is_some());
        assert_eq!(domain.generation_id(), 42);

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fan_out_filters_rs_by_generation() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let mut ds = connect_ds(&server, 11, 42, 100).await?;
        let mut rs_a = connect_rs(&server, 21, 42, &[]).await?;
        let mut rs_b = connect_rs(&server, 22, 7, &[]).await?;

        ds.send(ReplMsg::Update(Arc::new(update(0, 11))))?;
        assert_eq!(rs_a.recv_update().await?.cn.replica_id, 11);
        assert!(rs_b.stays_quiet(|m| matches!(m, ReplMsg::Update(_))).await);

        // updates from an RS go to DSs only
        rs_a.send(ReplMsg::Update(Arc::new(update(1, 31))))?;
        assert_eq!(ds.recv_update().await?.cn.replica_id, 31);
        assert!(rs_b.stays_quiet(|m| matches!(m, ReplMsg::Update(_))).await);

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn catch_up_from_changelog() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let ds_a = connect_ds(&server, 11, 42, 100).await?;
        let domain = domain_of(&server).await?;
        for i in 0..5 {
            ds_a.send(ReplMsg::Update(Arc::new(update(i, 11))))?;
        }
        for _ in 0..50 {
            if domain.changes_count().await? == 5 {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(domain.changes_count().await?, 5);

        let mut ds_b = connect_ds(&server, 12, 42, 100).await?;
        let mut last = None;
        for _ in 0..5 {
            let upd = ds_b.recv_update().await?;
            assert!(last.map_or(true, |l| l < upd.cn));
            last = Some(upd.cn);
        }

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reset_generation_id_from_ds() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let ds_a = connect_ds(&server, 11, 42, 100).await?;
        let mut ds_b = connect_ds(&server, 13, 42, 100).await?;
        let mut rs = connect_rs(&server, 21, 42, &[]).await?;
        let domain = domain_of(&server).await?;

        ds_a.send(ReplMsg::Update(Arc::new(update(0, 11))))?;
        ds_b.recv_update().await?;

        ds_a.send(ReplMsg::ResetGenerationId { generation_id: 100 })?;
        rs.recv_where("forwarded reset", |m| {
            matches!(m, ReplMsg::ResetGenerationId { generation_id: 100 })
        })
        .await?;
        ds_b.recv_status(ServerStatus::BadGenerationId).await?;

        assert_eq!(domain.generation_id(), 100);
        assert_eq!(domain.changes_count().await?, 0);
        assert!(domain.get_db_server_state().await.is_empty());
        let handler_a = domain
            .ds_handler(11)
            .ok_or_else(|| ChorusError::msg("DS 11 missing"))?;
        assert_eq!(handler_a.generation_id(), 100);
        assert_eq!(handler_a.status(), ServerStatus::Normal);
        let handler_rs = domain
            .rs_handler(21)
            .ok_or_else(|| ChorusError::msg("RS 21 missing"))?;
        assert_eq!(handler_rs.generation_id(), 100);

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ds_status_change_broadcast() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let mut ds_a = connect_ds(&server, 11, 42, 100).await?;
        let mut ds_b = connect_ds(&server, 12, 42, 100).await?;
        let domain = domain_of(&server).await?;

        let reports = |status: ServerStatus| {
            move |m: &ReplMsg| match m {
                ReplMsg::Topology(topo) => topo
                    .ds_infos
                    .iter()
                    .any(|ds| ds.ds_id == 12 && ds.status == status),
                _ => false,
            }
        };

        ds_b.send(ReplMsg::ChangeStatus {
            requested: ServerStatus::Degraded,
            new_status: ServerStatus::Degraded,
        })?;
        ds_a.recv_where("DEGRADED topology", reports(ServerStatus::Degraded))
            .await?;

        // a DEGRADED DS still gets updates
        let upd_1 = update(0, 11);
        ds_a.send(ReplMsg::Update(Arc::new(upd_1.clone())))?;
        assert_eq!(ds_b.recv_update().await?.cn, upd_1.cn);

        ds_b.send(ReplMsg::ChangeStatus {
            requested: ServerStatus::FullUpdate,
            new_status: ServerStatus::FullUpdate,
        })?;
        ds_a.recv_where("FULL_UPDATE topology", reports(ServerStatus::FullUpdate))
            .await?;

        // a DS in FULL_UPDATE gets none
        let upd_2 = update(1, 11);
        ds_a.send(ReplMsg::Update(Arc::new(upd_2.clone())))?;
        assert!(ds_b.stays_quiet(|m| matches!(m, ReplMsg::Update(_))).await);

        // not allowed out of FULL_UPDATE
        ds_b.send(ReplMsg::ChangeStatus {
            requested: ServerStatus::Normal,
            new_status: ServerStatus::Normal,
        })?;
        time::sleep(QUIET).await;
        let handler_b = domain
            .ds_handler(12)
            .ok_or_else(|| ChorusError::msg("DS 12 missing"))?;
        assert_eq!(handler_b.status(), ServerStatus::FullUpdate);
        drop(handler_b);

        // back to NORMAL by reconnecting; the missed update is caught up
        ds_b.tx.close();
        for _ in 0..100 {
            if domain.ds_handler(12).is_none() {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        let mut ds_b = connect_ds(&server, 12, 42, 100).await?;
        ds_b.recv_where("missed update", |m| {
            matches!(m, ReplMsg::Update(u) if u.cn == upd_2.cn)
        })
        .await?;
        let upd_3 = update(2, 11);
        ds_a.send(ReplMsg::Update(Arc::new(upd_3.clone())))?;
        ds_b.recv_where("new update", |m| {
            matches!(m, ReplMsg::Update(u) if u.cn == upd_3.cn)
        })
        .await?;

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn status_analyzer_tracks_lagging_ds() -> Result<(), ChorusError> {
        let mut config = test_config(1);
        config.degraded_status_threshold = 2;
        let server = new_server(config, Arc::new(MemEnv::new())).await?;
        let ds_a = connect_ds(&server, 11, 42, 100).await?;
        let mut ds_b = connect_ds(&server, 12, 42, 1).await?;
        let domain = domain_of(&server).await?;
        assert!(domain.has_status_analyzer());

        for i in 0..3 {
            ds_a.send(ReplMsg::Update(Arc::new(update(i, 11))))?;
        }
        ds_b.recv_status(ServerStatus::Degraded).await?;

        ds_b.send(ReplMsg::Window { num_ack: 10 })?;
        ds_b.recv_status(ServerStatus::Normal).await?;

        server.shutdown().await;
        assert!(!domain.has_status_analyzer());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn topology_reports_remote_ds() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let mut ds = connect_ds(&server, 11, 42, 100).await?;
        let _rs = connect_rs(&server, 21, 42, &[31]).await?;

        let msg = ds
            .recv_where("topology with RS 21", |m| match m {
                ReplMsg::Topology(topo) => {
                    topo.rs_infos.iter().any(|rs| rs.rs_id == 21)
                }
                _ => false,
            })
            .await?;
        let ReplMsg::Topology(topo) = msg else {
            unreachable!()
        };
        assert!(topo.ds_infos.iter().any(|d| d.ds_id == 31 && d.rs_id == 21));
        assert!(topo.ds_infos.iter().all(|d| d.ds_id != 11));
        assert!(topo.rs_infos.iter().any(|rs| rs.rs_id == 1));

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn routable_monitor_and_relay() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let mut ds = connect_ds(&server, 11, 42, 100).await?;
        let mut rs = connect_rs(&server, 21, 42, &[31]).await?;

        ds.send(ReplMsg::Routable(RoutableMsg {
            sender: 11,
            destination: RouteTarget::Server(1),
            payload: RoutedPayload::MonitorRequest,
        }))?;
        let msg = ds
            .recv_where("monitor data", |m| {
                matches!(m, ReplMsg::Routable(RoutableMsg {
                    payload: RoutedPayload::Monitor(_), ..
                }))
            })
            .await?;
        let ReplMsg::Routable(RoutableMsg {
            payload: RoutedPayload::Monitor(data),
            ..
        }) = msg
        else {
            unreachable!()
        };
        assert_eq!(data.rs_id, 1);
        assert!(data.ds_states.iter().any(|(id, _)| *id == 11));
        assert!(data.rs_states.iter().any(|(id, _)| *id == 21));

        // relayed to the RS that reports DS 31
        let opaque = RoutableMsg {
            sender: 11,
            destination: RouteTarget::Server(31),
            payload: RoutedPayload::Opaque(Bytes::from_static(b"init")),
        };
        ds.send(ReplMsg::Routable(opaque.clone()))?;
        let relayed = rs
            .recv_where("relayed routable", |m| matches!(m, ReplMsg::Routable(_)))
            .await?;
        assert_eq!(relayed, ReplMsg::Routable(opaque));

        // nobody to route to
        ds.send(ReplMsg::Routable(RoutableMsg {
            sender: 11,
            destination: RouteTarget::Server(99),
            payload: RoutedPayload::Opaque(Bytes::new()),
        }))?;
        ds.recv_where("routing error", |m| {
            matches!(m, ReplMsg::Routable(RoutableMsg {
                payload: RoutedPayload::Error { .. }, ..
            }))
        })
        .await?;

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn duplicate_ds_refused() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let _ds = connect_ds(&server, 11, 42, 100).await?;

        let ((tx, mut rx), (tx_srv, rx_srv)) = session_pair();
        let srv = server.clone();
        let handshake =
            tokio::spawn(async move { srv.accept_session(tx_srv, rx_srv).await });
        tx.send(ReplMsg::ServerStart(ServerStartMsg {
            server_id: 11,
            server_url: "ds-11-again".into(),
            base_dn: DN.into(),
            window_size: 100,
            server_state: ServerState::new(),
            protocol_version: CURRENT_PROTOCOL_VERSION,
            generation_id: 42,
            group_id: 1,
        }))?;
        assert!(handshake.await?.is_err());

        // the reply may have been sent before the refusal; then the session
        // ends
        while let Some(msg) = time::timeout(WAIT, rx.recv()).await? {
            assert!(matches!(msg, ReplMsg::ReplServerStart(_)));
        }

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unexpected_first_message() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let ((tx, _rx), (tx_srv, rx_srv)) = session_pair();
        tx.send(ReplMsg::WindowProbe)?;
        assert!(server.accept_session(tx_srv, rx_srv).await.is_err());
        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn generation_id_saved_with_data() -> Result<(), ChorusError> {
        let env: Arc<dyn ChangelogEnv> = Arc::new(MemEnv::new());
        let server = new_server(test_config(1), env.clone()).await?;
        let ds_a = connect_ds(&server, 11, 42, 100).await?;
        let mut ds_b = connect_ds(&server, 12, 42, 100).await?;
        ds_a.send(ReplMsg::Update(Arc::new(update(0, 11))))?;
        ds_b.recv_update().await?;

        let domain = domain_of(&server).await?;
        assert!(domain.generation_id_saved());
        assert_eq!(env.load_generation_id(DN).await?, Some(42));
        server.shutdown().await;

        let server = new_server(test_config(1), env.clone()).await?;
        let domain = domain_of(&server).await?;
        assert_eq!(domain.generation_id(), 42);
        assert!(domain.generation_id_saved());
        assert!(domain.get_db_server_state().await.get(11).is_some());
        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unsaved_generation_id_reset_on_leave() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let ds = connect_ds(&server, 11, 42, 100).await?;
        let domain = domain_of(&server).await?;
        assert_eq!(domain.generation_id(), 42);

        ds.tx.close();
        for _ in 0..100 {
            if domain.generation_id() == UNSET_GENERATION_ID {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(domain.generation_id(), UNSET_GENERATION_ID);
        assert!(domain.ds_handlers().is_empty());
        assert!(!domain.has_status_analyzer());

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn apply_config_at_runtime() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let _ds = connect_ds(&server, 11, 42, 100).await?;
        let domain = domain_of(&server).await?;
        assert!(!domain.has_status_analyzer());

        let mut config = test_config(1);
        config.degraded_status_threshold = 10;
        config.base_dns.push("dc=other".into());
        server.apply_config(config).await?;
        assert!(domain.has_status_analyzer());
        assert!(server.domain("dc=other").await.is_some());

        let mut config = test_config(1);
        config.window_size = 1;
        assert!(server.apply_config(config).await.is_err());

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tcp_replication_between_servers() -> Result<(), ChorusError> {
        let mut config_a = test_config(1);
        config_a.listen_addr = "127.0.0.1:54871".into();
        let server_a = new_server(config_a, Arc::new(MemEnv::new())).await?;
        server_a.start_listener().await?;

        let mut config_b = test_config(2);
        config_b.listen_addr = "127.0.0.1:54872".into();
        config_b.replication_servers = vec!["127.0.0.1:54871".into()];
        config_b.connect_retry_ms = 100;
        let server_b = new_server(config_b, Arc::new(MemEnv::new())).await?;
        server_b.start_listener().await?;
        server_b.start_connector();

        let domain_a = domain_of(&server_a).await?;
        let domain_b = domain_of(&server_b).await?;
        for _ in 0..100 {
            if domain_a.rs_handler(2).is_some() && domain_b.rs_handler(1).is_some()
            {
                break;
            }
            time::sleep(Duration::from_millis(50)).await;
        }
        assert!(domain_b.is_connected_to_rs("127.0.0.1:54871"));

        // B adopts 42 from its DS and announces it to A
        let mut ds_b = connect_ds(&server_b, 12, 42, 100).await?;
        for _ in 0..100 {
            if domain_a.generation_id() == 42 {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        let ds_a = connect_ds(&server_a, 11, 42, 100).await?;
        ds_a.send(ReplMsg::Update(Arc::new(update(0, 11))))?;
        assert_eq!(ds_b.recv_update().await?.cn.replica_id, 11);

        server_b.shutdown().await;
        server_a.shutdown().await;
        Ok(())
    }

    /// Collects what a domain hands to its subscribers.
    struct Collector(mpsc::UnboundedSender<Arc<UpdateMsg>>);

    #[async_trait]
    impl UpdateSubscriber for Collector {
        async fn deliver(&self, msg: Arc<UpdateMsg>) {
            let _ = self.0.send(msg);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscriber_gets_filtered_updates() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let ds_a = connect_ds(&server, 11, 42, 100).await?;
        let mut ds_b = connect_ds(&server, 12, 7, 100).await?;
        ds_b.recv_status(ServerStatus::BadGenerationId).await?;
        let domain = domain_of(&server).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber: Arc<dyn UpdateSubscriber> = Arc::new(Collector(tx));
        domain.add_subscriber(subscriber.clone());

        let mut cns = vec![];
        for i in 0..3 {
            let upd = update(i, 11).with_assured(AssuredMode::SafeData, 1);
            cns.push(upd.cn);
            ds_a.send(ReplMsg::Update(Arc::new(upd)))?;
        }
        for cn in cns {
            let got = time::timeout(WAIT, rx.recv())
                .await?
                .ok_or_else(|| ChorusError::msg("subscriber channel closed"))?;
            assert_eq!(got.cn, cn);
            assert!(!got.assured);
        }
        assert!(ds_b.stays_quiet(|m| matches!(m, ReplMsg::Update(_))).await);

        domain.remove_subscriber(&subscriber);
        drop(subscriber);
        ds_a.send(ReplMsg::Update(Arc::new(update(10, 11))))?;
        assert!(!matches!(time::timeout(QUIET, rx.recv()).await, Ok(Some(_))));

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn safe_data_from_rs_acked_above_level1() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let _ds = connect_ds(&server, 11, 42, 100).await?;
        let mut rs = connect_rs(&server, 21, 42, &[31]).await?;

        let upd = update(0, 31).with_assured(AssuredMode::SafeData, 1);
        rs.send(ReplMsg::Update(Arc::new(upd)))?;
        assert!(rs.stays_quiet(|m| matches!(m, ReplMsg::Ack(_))).await);

        let upd = update(1, 31).with_assured(AssuredMode::SafeData, 2);
        let cn = upd.cn;
        rs.send(ReplMsg::Update(Arc::new(upd)))?;
        let ack = rs.recv_ack().await?;
        assert_eq!(ack.cn, cn);
        assert!(ack.is_success());

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn safe_data_needs_generation_id() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let mut ds = connect_ds(&server, 11, UNSET_GENERATION_ID, 100).await?;
        let domain = domain_of(&server).await?;
        assert_eq!(domain.generation_id(), UNSET_GENERATION_ID);

        let upd = update(0, 11).with_assured(AssuredMode::SafeData, 1);
        ds.send(ReplMsg::Update(Arc::new(upd)))?;
        assert!(ds.stays_quiet(|m| matches!(m, ReplMsg::Ack(_))).await);

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn gather_monitor_data_from_peers() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let _ds = connect_ds(&server, 11, 42, 100).await?;
        let mut rs_a = connect_rs(&server, 21, 42, &[31]).await?;
        let mut rs_b = connect_rs(&server, 22, 42, &[]).await?;
        let domain = domain_of(&server).await?;

        let gather = {
            let domain = domain.clone();
            tokio::spawn(async move { domain.gather_monitor_data(WAIT).await })
        };
        for (rs, rs_id) in [(&mut rs_a, 21), (&mut rs_b, 22)] {
            rs.recv_where("monitor request", |m| {
                matches!(m, ReplMsg::Routable(RoutableMsg {
                    payload: RoutedPayload::MonitorRequest, ..
                }))
            })
            .await?;
            rs.send(ReplMsg::Routable(RoutableMsg {
                sender: rs_id,
                destination: RouteTarget::Server(1),
                payload: RoutedPayload::Monitor(MonitorData {
                    rs_id,
                    db_state: ServerState::new(),
                    ds_states: vec![(31, ServerState::new())],
                    rs_states: vec![],
                }),
            }))?;
        }
        let remote = gather.await?;
        assert_eq!(remote.len(), 2);
        assert_eq!(remote[&21].rs_id, 21);
        assert_eq!(remote[&22].ds_states.len(), 1);

        // a peer that does not answer is left out once the wait is over
        let gather = {
            let domain = domain.clone();
            tokio::spawn(async move { domain.gather_monitor_data(QUIET).await })
        };
        rs_a.recv_where("monitor request", |m| {
            matches!(m, ReplMsg::Routable(RoutableMsg {
                payload: RoutedPayload::MonitorRequest, ..
            }))
        })
        .await?;
        rs_a.send(ReplMsg::Routable(RoutableMsg {
            sender: 21,
            destination: RouteTarget::Server(1),
            payload: RoutedPayload::Monitor(MonitorData {
                rs_id: 21,
                db_state: ServerState::new(),
                ds_states: vec![],
                rs_states: vec![],
            }),
        }))?;
        let remote = gather.await?;
        assert_eq!(remote.keys().copied().collect::<Vec<_>>(), vec![21]);

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reset_not_blocked_by_stalled_catch_up() -> Result<(), ChorusError> {
        let server = new_server(test_config(1), Arc::new(MemEnv::new())).await?;
        let ds_a = connect_ds(&server, 11, 42, 100).await?;
        let domain = domain_of(&server).await?;
        for i in 0..5 {
            ds_a.send(ReplMsg::Update(Arc::new(update(i, 11))))?;
        }
        for _ in 0..50 {
            if domain.changes_count().await? == 5 {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }

        // one credit: catch-up stops after the first change, cursor open
        let mut ds_b = connect_ds(&server, 12, 42, 1).await?;
        ds_b.recv_update().await?;

        ds_a.send(ReplMsg::ResetGenerationId { generation_id: 100 })?;
        ds_b.recv_status(ServerStatus::BadGenerationId).await?;
        for _ in 0..100 {
            if domain.generation_id() == 100 {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(domain.generation_id(), 100);
        assert_eq!(domain.changes_count().await?, 0);

        // handshakes go on
        let _ds_c = connect_ds(&server, 13, 100, 100).await?;
        assert!(domain.ds_handler(13).is_some());

        server.shutdown().await;
        Ok(())
    }
}
