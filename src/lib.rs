//! Chorus: replication server core of a multi-master directory service.

#[macro_use]
mod utils;

mod changelog;
mod proto;
mod server;

// public interface: error, logging and termination
pub use utils::{logger_init, ChorusError, ErrorKind, ShutdownSignal, ME};

// public interface: protocol values and messages
pub use proto::{
    now_millis, AckMsg, AssuredMode, ChangeNumber, ChangeNumberGenerator,
    DsInfo, MonitorData, ReplMsg, ReplServerStartMsg, RoutableMsg,
    RouteTarget, RoutedPayload, RsInfo, ServerId, ServerStartMsg,
    ServerState, ServerStatus, StartSessionMsg, StatusEvent, TopologyMsg,
    UpdateMsg, CURRENT_PROTOCOL_VERSION, PROTOCOL_V1, PROTOCOL_V2,
    UNSET_GENERATION_ID,
};

// public interface: change logs and storage engines
pub use changelog::{
    ChangelogCursor, ChangelogEnv, ChangelogLog, ChangelogStore, FileEnv,
    FileStore, LogParams, MemEnv, MemStore, StoreRecord,
};

// public interface: replication server
pub use server::{
    session_pair, tcp_session, ConnectionHandler, Domain, HandlerCounters,
    ReplServerConfig, ReplicationServer, SafeDataShortfall, ServerContext,
    SessionRx, SessionTx, UnitKind, UpdateSubscriber,
};
