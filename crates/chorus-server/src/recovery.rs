//! Gap recovery: replay everything after the client's last-known sequence,
//! then hand the connection over to live delivery.

use std::sync::Arc;

use chorus_core::{ClientSession, DeliveryError, Sequence, SessionPhase};
use chorus_store::{read_after, LogStore};
use chorus_telemetry::names;
use futures::StreamExt;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::connection::ClientConnection;
use crate::events;

#[derive(Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The transport resumed the session; nothing to replay.
    Skipped,
    CaughtUp { replayed: u64, last_sequence: Sequence },
    /// The channel closed mid-replay.
    Cancelled { replayed: u64 },
    /// Replay stopped on a storage fault. The connection stays open but is
    /// not marked caught up.
    Failed { replayed: u64, error: DeliveryError },
}

pub struct RecoveryManager {
    store: Arc<dyn LogStore>,
    page_size: u32,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn LogStore>, page_size: u32) -> Self {
        Self { store, page_size }
    }

    /// Drive one connection from `Active` to `CaughtUp`.
    ///
    /// Replayed messages go to `connection` only, in ascending order, waiting
    /// for queue capacity. Live broadcasts that arrive meanwhile are held by
    /// the connection and flushed once replay ends.
    #[instrument(skip_all, fields(client_id = %session.connection_id, known_offset = %session.known_offset))]
    pub async fn recover(
        &self,
        connection: &ClientConnection,
        session: &ClientSession,
        cancel: &CancellationToken,
    ) -> RecoveryOutcome {
        connection.set_phase(SessionPhase::Active);
        if session.recovered {
            connection.set_phase(SessionPhase::CaughtUp);
            return RecoveryOutcome::Skipped;
        }

        let stream = read_after(Arc::clone(&self.store), session.known_offset, self.page_size);
        tokio::pin!(stream);

        let mut replayed: u64 = 0;
        let mut last = session.known_offset;
        let outcome = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break RecoveryOutcome::Cancelled { replayed },
                next = stream.next() => next,
            };
            match next {
                None => {
                    break RecoveryOutcome::CaughtUp {
                        replayed,
                        last_sequence: last,
                    }
                }
                Some(Ok(message)) => {
                    let json = Arc::new(events::chat_message(&message));
                    if !connection.send_replayed(json).await {
                        break RecoveryOutcome::Cancelled { replayed };
                    }
                    last = message.sequence;
                    replayed += 1;
                }
                Some(Err(e)) => {
                    break RecoveryOutcome::Failed {
                        replayed,
                        error: DeliveryError::TransientStorageFault(e.to_string()),
                    }
                }
            }
        };
        counter!(names::RECOVERY_REPLAYED_TOTAL).increment(replayed);

        match &outcome {
            RecoveryOutcome::CaughtUp { replayed, last_sequence } => {
                let done = Arc::new(events::recovery_complete(*replayed, *last_sequence));
                if connection.send_replayed(done).await {
                    let _ = connection.finish_catch_up(*last_sequence).await;
                    connection.set_phase(SessionPhase::CaughtUp);
                }
                info!(replayed, last_sequence = %last_sequence, "client caught up");
            }
            RecoveryOutcome::Failed { replayed, error } => {
                counter!(names::RECOVERY_FAILURES_TOTAL).increment(1);
                warn!(replayed, error = %error, "replay truncated");
                let _ = connection.finish_catch_up(last).await;
            }
            RecoveryOutcome::Cancelled { .. } | RecoveryOutcome::Skipped => {}
        }
        outcome
    }
}
