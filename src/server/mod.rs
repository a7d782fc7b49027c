//! Replication server: per-suffix domains routing updates between connected
//! directory servers and peer replication servers.

mod ack;
mod analyzer;
mod config;
mod domain;
mod handler;
mod handshake;
mod replserver;
mod session;
mod topology;

pub use config::{ReplServerConfig, SafeDataShortfall, ServerContext};
pub use domain::{Domain, UpdateSubscriber};
pub use handler::{ConnectionHandler, HandlerCounters, UnitKind};
pub use replserver::ReplicationServer;
pub use session::{session_pair, tcp_session, SessionRx, SessionTx};
