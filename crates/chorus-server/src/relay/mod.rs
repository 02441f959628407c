//! Cross-instance transport for committed messages.
//!
//! Implementations:
//! - [`ChannelRelay`]: in-process tokio broadcast (instances sharing a process, tests)
//! - [`TcpRelay`]: newline-delimited JSON to a [`RelayHub`]

use async_trait::async_trait;
use chorus_core::BroadcastEvent;
use tokio::sync::broadcast;

mod channel;
mod hub;
mod tcp;

pub use channel::ChannelRelay;
pub use hub::RelayHub;
pub use tcp::{TcpRelay, TcpRelayOptions};

/// One relayed message: the committed message and the instance that
/// committed it.
pub type RelayFrame = BroadcastEvent;

/// Default capacity for relay broadcast channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("relay frame encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Publishes frames to every other instance and yields frames they publish.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Send a frame toward the other instances. Best effort.
    async fn publish(&self, frame: &RelayFrame) -> Result<(), RelayError>;

    /// Frames received by this relay. Frames this instance published may be
    /// included; receivers filter by origin.
    fn subscribe(&self) -> broadcast::Receiver<RelayFrame>;

    fn name(&self) -> &'static str;
}
