//! Replication protocol message types.

use std::sync::Arc;

use bytes::Bytes;
use get_size::GetSize;
use serde::{Deserialize, Serialize};

use crate::proto::{ChangeNumber, ServerId, ServerState, ServerStatus};

/// Protocol version of the first release: single-phase handshake, no assured
/// replication.
pub const PROTOCOL_V1: u16 = 1;

/// Protocol version adding the topology phase of the handshake and assured
/// replication.
pub const PROTOCOL_V2: u16 = 2;

/// Version spoken by this server.
pub const CURRENT_PROTOCOL_VERSION: u16 = PROTOCOL_V2;

/// Generation ID value meaning "not yet initialized".
pub const UNSET_GENERATION_ID: i64 = -1;

/// Assured replication sub-mode.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum AssuredMode {
    SafeRead,
    SafeData,
}

/// One replicated change. Immutable once created; shared by reference
/// among every queue it is fanned out to.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct UpdateMsg {
    pub cn: ChangeNumber,

    /// Suffix (base DN) this change belongs to.
    pub service_id: String,

    pub assured: bool,

    pub assured_mode: AssuredMode,

    pub safe_data_level: u8,

    /// Opaque encoded change.
    pub body: Bytes,
}

impl UpdateMsg {
    pub fn new(cn: ChangeNumber, service_id: impl ToString, body: Bytes) -> Self {
        UpdateMsg {
            cn,
            service_id: service_id.to_string(),
            assured: false,
            assured_mode: AssuredMode::SafeRead,
            safe_data_level: 1,
            body,
        }
    }

    /// Marks the message as assured in the given mode.
    pub fn with_assured(mut self, mode: AssuredMode, level: u8) -> Self {
        self.assured = true;
        self.assured_mode = mode;
        self.safe_data_level = level.max(1);
        self
    }

    /// A distinct copy with the assured flag cleared. The body bytes are
    /// shared, not copied.
    pub fn not_assured(&self) -> Arc<UpdateMsg> {
        Arc::new(UpdateMsg {
            cn: self.cn,
            service_id: self.service_id.clone(),
            assured: false,
            assured_mode: self.assured_mode,
            safe_data_level: self.safe_data_level,
            body: self.body.clone(),
        })
    }
}

impl GetSize for UpdateMsg {
    fn get_heap_size(&self) -> usize {
        self.service_id.get_heap_size() + self.body.len()
    }
}

/// Acknowledgment of an assured update, possibly partial.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct AckMsg {
    pub cn: ChangeNumber,
    pub has_timeout: bool,
    pub has_wrong_status: bool,
    pub has_replay_error: bool,

    /// Servers that did not acknowledge in time or reported an error.
    pub failed_servers: Vec<ServerId>,
}

impl AckMsg {
    pub fn new(cn: ChangeNumber) -> Self {
        AckMsg {
            cn,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        !self.has_timeout && !self.has_wrong_status && !self.has_replay_error
    }
}

/// Description of a directory server in a topology snapshot.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct DsInfo {
    pub ds_id: ServerId,

    /// Replication server the DS is connected to.
    pub rs_id: ServerId,

    pub generation_id: i64,
    pub status: ServerStatus,
    pub assured_flag: bool,
    pub assured_mode: AssuredMode,
    pub safe_data_level: u8,
    pub group_id: u8,
    pub ref_urls: Vec<String>,
}

/// Description of a replication server in a topology snapshot.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RsInfo {
    pub rs_id: ServerId,
    pub generation_id: i64,
    pub group_id: u8,
    pub weight: u32,
}

/// Topology snapshot of one domain.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct TopologyMsg {
    pub ds_infos: Vec<DsInfo>,
    pub rs_infos: Vec<RsInfo>,
}

/// First handshake message of a directory server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ServerStartMsg {
    pub server_id: ServerId,
    pub server_url: String,
    pub base_dn: String,
    pub window_size: u32,
    pub server_state: ServerState,
    pub protocol_version: u16,
    pub generation_id: i64,
    pub group_id: u8,
}

/// First handshake message of a replication server, also the reply of a
/// replication server to any first handshake message.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ReplServerStartMsg {
    pub server_id: ServerId,
    pub server_url: String,
    pub base_dn: String,
    pub window_size: u32,
    pub server_state: ServerState,
    pub protocol_version: u16,
    pub generation_id: i64,
    pub group_id: u8,
    pub degraded_status_threshold: u32,
}

/// Second handshake message of a directory server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct StartSessionMsg {
    pub status: ServerStatus,
    pub ref_urls: Vec<String>,
    pub assured_flag: bool,
    pub assured_mode: AssuredMode,
    pub safe_data_level: u8,
}

/// Destination of a routable message.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum RouteTarget {
    Server(ServerId),
    AllServers,
    ClosestServer,
}

/// Replication state report of one replication server.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct MonitorData {
    pub rs_id: ServerId,

    /// Newest change stored per replica in this server's change logs.
    pub db_state: ServerState,

    /// Per connected directory server, what it has seen.
    pub ds_states: Vec<(ServerId, ServerState)>,

    /// Per connected replication server, what it has seen.
    pub rs_states: Vec<(ServerId, ServerState)>,
}

/// Payload of a routable message.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RoutedPayload {
    Error { details: String },
    MonitorRequest,
    Monitor(MonitorData),

    /// Opaque payload such as a total-update request, relayed as-is.
    Opaque(Bytes),
}

/// A message addressed to a server rather than broadcast to the domain.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RoutableMsg {
    pub sender: ServerId,
    pub destination: RouteTarget,
    pub payload: RoutedPayload,
}

/// Every message of the replication protocol.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ReplMsg {
    ServerStart(ServerStartMsg),
    ReplServerStart(ReplServerStartMsg),
    StartSession(StartSessionMsg),
    Topology(TopologyMsg),

    Update(Arc<UpdateMsg>),
    Ack(AckMsg),

    /// Grants `num_ack` more send-window credits to the receiver.
    Window { num_ack: u32 },

    /// Asks the receiver to resend its window if it has credits left.
    WindowProbe,

    /// Status change request of a DS, or a status change notification to
    /// one.
    ChangeStatus {
        requested: ServerStatus,
        new_status: ServerStatus,
    },

    ResetGenerationId { generation_id: i64 },

    Routable(RoutableMsg),
}

impl ReplMsg {
    /// Short name for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ReplMsg::ServerStart(_) => "ServerStart",
            ReplMsg::ReplServerStart(_) => "ReplServerStart",
            ReplMsg::StartSession(_) => "StartSession",
            ReplMsg::Topology(_) => "Topology",
            ReplMsg::Update(_) => "Update",
            ReplMsg::Ack(_) => "Ack",
            ReplMsg::Window { .. } => "Window",
            ReplMsg::WindowProbe => "WindowProbe",
            ReplMsg::ChangeStatus { .. } => "ChangeStatus",
            ReplMsg::ResetGenerationId { .. } => "ResetGenerationId",
            ReplMsg::Routable(_) => "Routable",
        }
    }
}
