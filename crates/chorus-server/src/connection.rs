//! Per-client connection state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use chorus_core::{ConnectionId, Sequence, SessionPhase, SessionToken};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Live events held while a replay is running. Past this the client is
/// closed and recovers on reconnect.
pub const MAX_PENDING_EVENTS: usize = 10_000;

/// How chat events reach the client.
enum Delivery {
    /// Replay in progress; live events wait here until it ends.
    CatchingUp { pending: Vec<(Sequence, Arc<String>)> },
    /// Events go straight to the send queue. Sequences at or below `floor`
    /// were already replayed and are skipped.
    Live { floor: Sequence },
}

/// Result of handing a chat event to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Queued,
    /// Held until replay finishes.
    Held,
    /// Already delivered by replay, or the connection is closed.
    Skipped,
    /// Send queue full.
    Dropped,
}

/// A connected WebSocket client.
pub struct ClientConnection {
    pub id: ConnectionId,
    session_token: SessionToken,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    closed: CancellationToken,
    delivery: Mutex<Delivery>,
    phase: Mutex<SessionPhase>,
    /// Whether the client has responded to the last ping.
    pub is_alive: AtomicBool,
    /// Count of messages dropped due to full channel.
    pub dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// A connection that holds live events until [`finish_catch_up`](Self::finish_catch_up).
    pub fn catching_up(id: ConnectionId, token: SessionToken, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self::with_delivery(id, token, tx, Delivery::CatchingUp { pending: Vec::new() })
    }

    /// A connection that receives live events immediately.
    pub fn live(id: ConnectionId, token: SessionToken, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self::with_delivery(id, token, tx, Delivery::Live { floor: Sequence::ZERO })
    }

    fn with_delivery(
        id: ConnectionId,
        session_token: SessionToken,
        tx: mpsc::Sender<Arc<String>>,
        delivery: Delivery,
    ) -> Self {
        Self {
            id,
            session_token,
            tx,
            closed: CancellationToken::new(),
            delivery: Mutex::new(delivery),
            phase: Mutex::new(SessionPhase::Connecting),
            is_alive: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
        }
    }

    pub fn session_token(&self) -> &SessionToken {
        &self.session_token
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock() = phase;
    }

    /// Hand a broadcast chat event to this connection. Never blocks.
    pub fn deliver(&self, sequence: Sequence, json: Arc<String>) -> DeliveryStatus {
        if self.is_closed() {
            return DeliveryStatus::Skipped;
        }
        let mut delivery = self.delivery.lock();
        match &mut *delivery {
            Delivery::CatchingUp { pending } => {
                if pending.len() >= MAX_PENDING_EVENTS {
                    tracing::warn!(client_id = %self.id, "pending buffer overflow during replay, closing");
                    self.close();
                    return DeliveryStatus::Dropped;
                }
                pending.push((sequence, json));
                DeliveryStatus::Held
            }
            Delivery::Live { floor } if sequence <= *floor => DeliveryStatus::Skipped,
            Delivery::Live { .. } => {
                if self.send(json) {
                    DeliveryStatus::Queued
                } else {
                    DeliveryStatus::Dropped
                }
            }
        }
    }

    /// Send a text frame to the client without blocking.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Send a replayed frame, waiting for queue capacity.
    ///
    /// Returns `false` once the connection is closed.
    pub async fn send_replayed(&self, message: Arc<String>) -> bool {
        tokio::select! {
            result = self.tx.send(message) => result.is_ok(),
            () = self.closed.cancelled() => false,
        }
    }

    /// End replay: flush held events newer than `last_replayed` in sequence
    /// order, then switch to live delivery. Returns the number flushed.
    pub async fn finish_catch_up(&self, last_replayed: Sequence) -> usize {
        let mut floor = last_replayed;
        let mut flushed = 0;
        loop {
            let mut batch = {
                let mut delivery = self.delivery.lock();
                match &mut *delivery {
                    Delivery::CatchingUp { pending } if pending.is_empty() => {
                        *delivery = Delivery::Live { floor };
                        return flushed;
                    }
                    Delivery::CatchingUp { pending } => std::mem::take(pending),
                    Delivery::Live { .. } => return flushed,
                }
            };
            batch.sort_by_key(|(seq, _)| *seq);
            for (seq, json) in batch {
                if seq <= floor {
                    continue;
                }
                if !self.send_replayed(json).await {
                    return flushed;
                }
                floor = seq;
                flushed += 1;
            }
        }
    }

    /// Close the connection's queue to further events.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Free slots in the send queue.
    pub fn send_capacity(&self) -> usize {
        self.tx.capacity()
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }
}
