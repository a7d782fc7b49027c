//! Replication protocol value types and messages.

mod changenumber;
mod messages;
mod serverstate;
mod status;

pub use changenumber::{
    now_millis, ChangeNumber, ChangeNumberGenerator, ServerId, CN_KEY_LEN,
    COUNTER_REPLICA_ID,
};
pub use messages::{
    AckMsg, AssuredMode, DsInfo, MonitorData, ReplMsg, ReplServerStartMsg,
    RoutableMsg, RouteTarget, RoutedPayload, RsInfo, ServerStartMsg,
    StartSessionMsg, TopologyMsg, UpdateMsg, CURRENT_PROTOCOL_VERSION,
    PROTOCOL_V1, PROTOCOL_V2, UNSET_GENERATION_ID,
};
pub use serverstate::ServerState;
pub use status::{ServerStatus, StatusEvent};
