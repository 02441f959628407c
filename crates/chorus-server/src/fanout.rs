//! Broadcast fan-out: local registry first, then other instances.

use std::sync::Arc;

use chorus_core::{BroadcastEvent, DeliveryError, InstanceId, Message};
use chorus_telemetry::names;
use metrics::counter;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events;
use crate::registry::ConnectionRegistry;
use crate::relay::Relay;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Local clients got the message; other instances may not have.
    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),
}

impl From<BusError> for DeliveryError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::RelayUnavailable(msg) => DeliveryError::RelayUnavailable(msg),
        }
    }
}

/// How published messages reach clients on other instances.
#[derive(Clone)]
pub enum Topology {
    /// Single instance.
    Direct,
    /// Frames go through a relay to every other instance.
    Relayed(Arc<dyn Relay>),
}

impl Topology {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Relayed(relay) => relay.name(),
        }
    }
}

pub struct FanoutBus {
    registry: Arc<ConnectionRegistry>,
    topology: Topology,
    instance_id: InstanceId,
}

impl FanoutBus {
    pub fn new(registry: Arc<ConnectionRegistry>, topology: Topology, instance_id: InstanceId) -> Self {
        Self {
            registry,
            topology,
            instance_id,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Deliver a committed message to every connected client on every
    /// instance. Local clients are served before the relay is tried.
    pub async fn publish(&self, message: Message) -> Result<(), BusError> {
        self.emit_local(&message);

        let Topology::Relayed(relay) = &self.topology else {
            return Ok(());
        };
        let frame = BroadcastEvent::new(self.instance_id.clone(), message);
        relay.publish(&frame).await.map_err(|e| {
            counter!(names::RELAY_PUBLISH_FAILURES_TOTAL).increment(1);
            BusError::RelayUnavailable(e.to_string())
        })
    }

    /// Emit to this instance's registry only.
    pub fn emit_local(&self, message: &Message) {
        let json = Arc::new(events::chat_message(message));
        self.registry.emit(message.sequence, json);
    }

    /// Forward frames from other instances into the local registry until
    /// `cancel` fires. Returns `None` for the direct topology.
    pub fn start_relay_listener(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let Topology::Relayed(relay) = &self.topology else {
            return None;
        };
        let mut rx = relay.subscribe();
        let bus = Arc::clone(self);

        Some(tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = rx.recv() => frame,
                    () = cancel.cancelled() => break,
                };
                match frame {
                    Ok(frame) if frame.origin == bus.instance_id => {}
                    Ok(frame) => {
                        counter!(names::RELAY_RECEIVED_TOTAL).increment(1);
                        debug!(origin = %frame.origin, sequence = %frame.sequence(), "relayed message");
                        bus.emit_local(&frame.message);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "relay listener lagged, clients recover on reconnect");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }
}
