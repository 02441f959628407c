//! Ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::connection::ClientConnection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client stopped responding within the timeout window.
    TimedOut,
    Cancelled,
}

/// Watch a connection's pong flag.
///
/// At each `interval` tick the alive flag is checked and reset. After
/// `timeout / interval` (at least 1) consecutive missed ticks the client is
/// considered dead.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check_interval = time::interval(interval);
    // The first tick fires immediately.
    let _ = check_interval.tick().await;
    let mut missed_pongs: u32 = 0;
    #[allow(clippy::cast_possible_truncation)]
    let max_missed = (timeout.as_millis() / interval.as_millis().max(1)).max(1) as u32;

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                if connection.check_alive() {
                    missed_pongs = 0;
                } else {
                    missed_pongs += 1;
                    if missed_pongs >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use chorus_core::{ConnectionId, SessionToken};
    use tokio::sync::mpsc;

    use super::*;

    fn make_connection() -> Arc<ClientConnection> {
        let (tx, _rx) = mpsc::channel(4);
        Arc::new(ClientConnection::live(ConnectionId::new(), SessionToken::new(), tx))
    }

    #[tokio::test]
    async fn heartbeat_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_heartbeat(
            make_connection(),
            Duration::from_secs(100),
            Duration::from_secs(300),
            cancel,
        )
        .await;
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let conn = make_connection();
        conn.is_alive.store(false, Ordering::Relaxed);
        let result = run_heartbeat(
            conn,
            Duration::from_secs(10),
            Duration::from_secs(30),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result, HeartbeatResult::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn responsive_client_stays_alive() {
        let conn = make_connection();
        let cancel = CancellationToken::new();
        let handle = {
            let conn = conn.clone();
            let cancel = cancel.clone();
            tokio::spawn(run_heartbeat(
                conn,
                Duration::from_secs(10),
                Duration::from_secs(20),
                cancel,
            ))
        };

        for _ in 0..6 {
            conn.mark_alive();
            time::sleep(Duration::from_secs(10)).await;
        }
        assert!(!handle.is_finished());
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }
}
