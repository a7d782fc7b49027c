//! Directory server connection status and its transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a directory server as seen by a replication server.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
pub enum ServerStatus {
    NotConnected,
    Normal,
    Degraded,
    FullUpdate,
    BadGenerationId,
}

/// Events requesting a status transition.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum StatusEvent {
    ToNotConnected,
    ToNormal,
    ToDegraded,
    ToFullUpdate,
    ToBadGenId,
}

impl ServerStatus {
    /// Statuses a directory server may announce when it starts its session.
    pub fn is_valid_initial(self) -> bool {
        matches!(
            self,
            ServerStatus::Normal
                | ServerStatus::Degraded
                | ServerStatus::FullUpdate
                | ServerStatus::BadGenerationId
        )
    }

    /// Applies `event` to `self` according to the transition table. Returns
    /// `None` if the transition is not allowed, in which case the caller
    /// must leave the status unchanged.
    pub fn transition(self, event: StatusEvent) -> Option<ServerStatus> {
        use ServerStatus::*;
        use StatusEvent::*;

        match (self, event) {
            (_, ToNotConnected) => Some(NotConnected),

            (NotConnected | Normal | Degraded, ToNormal) => Some(Normal),
            (NotConnected | Normal | Degraded, ToDegraded) => Some(Degraded),
            (NotConnected | Normal | Degraded | BadGenerationId, ToBadGenId) => {
                Some(BadGenerationId)
            }

            (Normal | Degraded | FullUpdate | BadGenerationId, ToFullUpdate) => {
                Some(FullUpdate)
            }

            _ => None,
        }
    }

    /// True if ordinary fan-out traffic may be sent to a server in this
    /// status.
    #[inline]
    pub fn accepts_updates(self) -> bool {
        !matches!(
            self,
            ServerStatus::BadGenerationId | ServerStatus::FullUpdate
        )
    }
}

impl StatusEvent {
    /// The event that would lead to `status`, if any.
    pub fn leading_to(status: ServerStatus) -> StatusEvent {
        match status {
            ServerStatus::NotConnected => StatusEvent::ToNotConnected,
            ServerStatus::Normal => StatusEvent::ToNormal,
            ServerStatus::Degraded => StatusEvent::ToDegraded,
            ServerStatus::FullUpdate => StatusEvent::ToFullUpdate,
            ServerStatus::BadGenerationId => StatusEvent::ToBadGenId,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ServerStatus::NotConnected => "NOT_CONNECTED",
            ServerStatus::Normal => "NORMAL",
            ServerStatus::Degraded => "DEGRADED",
            ServerStatus::FullUpdate => "FULL_UPDATE",
            ServerStatus::BadGenerationId => "BAD_GENERATION_ID",
        };
        write!(f, "{}", name)
    }
}
