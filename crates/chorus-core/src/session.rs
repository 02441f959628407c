use std::fmt;

use crate::ids::ConnectionId;
use crate::message::Sequence;

/// Delivery state of one live channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientSession {
    pub connection_id: ConnectionId,
    /// Highest sequence the client claims to have received.
    pub known_offset: Sequence,
    /// The transport resumed a prior session without a gap.
    pub recovered: bool,
}

impl ClientSession {
    pub fn new(connection_id: ConnectionId, known_offset: Option<Sequence>, recovered: bool) -> Self {
        Self {
            connection_id,
            known_offset: known_offset.unwrap_or(Sequence::ZERO),
            recovered,
        }
    }
}

/// Per-connection recovery state machine.
///
/// `Connecting -> Active -> CaughtUp -> Disconnected`. A connection whose
/// replay failed stays `Active` until it disconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Active,
    CaughtUp,
    Disconnected,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::CaughtUp => "caught_up",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
