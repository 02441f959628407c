use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Relay, RelayError, RelayFrame, DEFAULT_CHANNEL_CAPACITY};

/// In-process relay over a tokio broadcast channel.
///
/// Clones share the channel, so each clone acts as one instance's view of
/// the same bus.
#[derive(Clone)]
pub struct ChannelRelay {
    sender: broadcast::Sender<RelayFrame>,
}

impl ChannelRelay {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for ChannelRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Relay for ChannelRelay {
    async fn publish(&self, frame: &RelayFrame) -> Result<(), RelayError> {
        // No subscribers just means no other instance is listening.
        let _ = self.sender.send(frame.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayFrame> {
        self.sender.subscribe()
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}
