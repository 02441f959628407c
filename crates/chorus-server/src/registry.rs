//! Connection registry: live connections plus parked sessions awaiting a
//! reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chorus_core::{ConnectionId, Sequence, SessionPhase, SessionToken};
use chorus_telemetry::names;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::connection::{ClientConnection, DeliveryStatus};

/// Dropped sends after which a slow client is removed.
pub const MAX_TOTAL_DROPS: u64 = 100;

/// State held for a disconnected, caught-up client.
struct ParkedSession {
    parked_at: Instant,
    /// Frames the client has not seen, oldest first.
    missed: Vec<Arc<String>>,
    overflowed: bool,
}

#[derive(Default)]
struct Inner {
    live: HashMap<ConnectionId, Arc<ClientConnection>>,
    parked: HashMap<SessionToken, Mutex<ParkedSession>>,
}

/// Tracks every connection on this instance.
///
/// Broadcasts hold the read lock while enqueuing; removal, parking and
/// resumption take the write lock, so none of them interleave with an
/// in-flight broadcast.
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    max_parked_events: usize,
}

impl ConnectionRegistry {
    pub fn new(max_parked_events: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_parked_events,
        }
    }

    pub fn register(&self, connection: Arc<ClientConnection>) {
        let id = connection.id.clone();
        let _ = self.inner.write().live.insert(id.clone(), connection);
        gauge!(names::WS_CONNECTIONS_ACTIVE).increment(1.0);
        debug!(client_id = %id, "connection registered");
    }

    /// Remove a connection and close its queue.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let removed = self.inner.write().live.remove(id);
        if let Some(conn) = &removed {
            conn.close();
            gauge!(names::WS_CONNECTIONS_ACTIVE).decrement(1.0);
            debug!(client_id = %id, "connection unregistered");
        }
        removed
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.inner.read().live.get(id).cloned()
    }

    /// Visit every live connection under the read lock.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<ClientConnection>)) {
        for conn in self.inner.read().live.values() {
            f(conn);
        }
    }

    /// Deliver a chat event to every live connection and buffer it for every
    /// parked session. Slow clients past [`MAX_TOTAL_DROPS`] are removed.
    pub fn emit(&self, sequence: Sequence, json: Arc<String>) {
        let mut slow = Vec::new();
        {
            let inner = self.inner.read();
            for conn in inner.live.values() {
                if conn.deliver(sequence, json.clone()) == DeliveryStatus::Dropped {
                    counter!(names::WS_BROADCAST_DROPS_TOTAL).increment(1);
                    if conn.drop_count() >= MAX_TOTAL_DROPS || conn.is_closed() {
                        slow.push(conn.id.clone());
                    }
                }
            }
            for parked in inner.parked.values() {
                let mut parked = parked.lock();
                if parked.overflowed {
                    continue;
                }
                if parked.missed.len() >= self.max_parked_events {
                    parked.overflowed = true;
                    parked.missed.clear();
                } else {
                    parked.missed.push(json.clone());
                }
            }
        }

        for id in slow {
            warn!(client_id = %id, "removing slow client");
            let _ = self.unregister(&id);
        }
    }

    /// Move a caught-up connection into the parked set.
    ///
    /// `drain` runs under the write lock after the connection stops receiving
    /// broadcasts and returns frames still queued for it. Returns `false`
    /// (and unregisters) when the connection never caught up.
    pub fn park(
        &self,
        connection: &ClientConnection,
        drain: impl FnOnce() -> Vec<Arc<String>>,
    ) -> bool {
        if connection.phase() != SessionPhase::CaughtUp {
            let _ = self.unregister(&connection.id);
            return false;
        }

        let mut inner = self.inner.write();
        if inner.live.remove(&connection.id).is_none() {
            return false;
        }
        connection.close();
        gauge!(names::WS_CONNECTIONS_ACTIVE).decrement(1.0);

        let missed = drain();
        let overflowed = missed.len() > self.max_parked_events;
        let _ = inner.parked.insert(
            connection.session_token().clone(),
            Mutex::new(ParkedSession {
                parked_at: Instant::now(),
                missed: if overflowed { Vec::new() } else { missed },
                overflowed,
            }),
        );
        debug!(client_id = %connection.id, session_token = %connection.session_token(), "session parked");
        true
    }

    /// Resume a parked session onto a fresh live connection.
    ///
    /// Missed frames are queued on `connection` and it is registered under
    /// the same write lock, so nothing broadcast in between is lost. Returns
    /// `false` when there is no usable parked session for the token; the
    /// caller then treats the client as new.
    pub fn resume(&self, connection: Arc<ClientConnection>, max_age: Duration) -> bool {
        let token = connection.session_token().clone();
        let mut inner = self.inner.write();
        let Some(parked) = inner.parked.remove(&token) else {
            return false;
        };
        let parked = parked.into_inner();

        if parked.overflowed || parked.parked_at.elapsed() > max_age {
            counter!(names::SESSIONS_EXPIRED_TOTAL).increment(1);
            debug!(session_token = %token, "parked session unusable");
            return false;
        }
        if parked.missed.len() > connection.send_capacity() {
            counter!(names::SESSIONS_EXPIRED_TOTAL).increment(1);
            return false;
        }

        let missed = parked.missed.len();
        for json in parked.missed {
            let _ = connection.send(json);
        }
        let id = connection.id.clone();
        let _ = inner.live.insert(id.clone(), connection);
        drop(inner);

        gauge!(names::WS_CONNECTIONS_ACTIVE).increment(1.0);
        counter!(names::SESSIONS_RESUMED_TOTAL).increment(1);
        info!(client_id = %id, session_token = %token, missed, "session resumed");
        true
    }

    /// Discard parked sessions older than `max_age` or overflowed.
    pub fn expire_parked(&self, max_age: Duration) -> usize {
        let mut inner = self.inner.write();
        let before = inner.parked.len();
        inner.parked.retain(|_, p| {
            let p = p.get_mut();
            !p.overflowed && p.parked_at.elapsed() <= max_age
        });
        let expired = before - inner.parked.len();
        if expired > 0 {
            counter!(names::SESSIONS_EXPIRED_TOTAL).increment(expired as u64);
            debug!(expired, "expired parked sessions");
        }
        expired
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().live.len()
    }

    pub fn parked_count(&self) -> usize {
        self.inner.read().parked.len()
    }
}

/// Periodically expire parked sessions until `cancel` fires.
pub fn start_sweeper(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    max_age: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = registry.expire_parked(max_age);
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn msg(s: &str) -> Arc<String> {
        Arc::new(s.to_owned())
    }

    fn live_conn(cap: usize) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(cap);
        let conn = ClientConnection::live(ConnectionId::new(), SessionToken::new(), tx);
        conn.set_phase(SessionPhase::CaughtUp);
        (Arc::new(conn), rx)
    }

    fn resumed_conn(
        token: &SessionToken,
        cap: usize,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(cap);
        let conn = ClientConnection::live(ConnectionId::new(), token.clone(), tx);
        (Arc::new(conn), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push((*m).clone());
        }
        out
    }

    #[test]
    fn register_and_unregister() {
        let reg = ConnectionRegistry::new(8);
        let (conn, _rx) = live_conn(4);
        reg.register(conn.clone());
        assert_eq!(reg.connection_count(), 1);
        assert!(reg.get(&conn.id).is_some());

        let removed = reg.unregister(&conn.id).unwrap();
        assert!(removed.is_closed());
        assert_eq!(reg.connection_count(), 0);
        assert!(reg.unregister(&conn.id).is_none());
    }

    #[test]
    fn emit_reaches_every_live_connection_once() {
        let reg = ConnectionRegistry::new(8);
        let (a, mut rx_a) = live_conn(4);
        let (b, mut rx_b) = live_conn(4);
        reg.register(a);
        reg.register(b);

        reg.emit(Sequence(1), msg("hello"));
        assert_eq!(drain(&mut rx_a), vec!["hello"]);
        assert_eq!(drain(&mut rx_b), vec!["hello"]);
    }

    #[test]
    fn unregistered_connection_gets_nothing() {
        let reg = ConnectionRegistry::new(8);
        let (a, mut rx_a) = live_conn(4);
        reg.register(a.clone());
        let _ = reg.unregister(&a.id);
        reg.emit(Sequence(1), msg("late"));
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn for_each_visits_all() {
        let reg = ConnectionRegistry::new(8);
        for _ in 0..3 {
            reg.register(live_conn(1).0);
        }
        let mut n = 0;
        reg.for_each(|_| n += 1);
        assert_eq!(n, 3);
    }

    #[test]
    fn slow_client_removed_after_max_drops() {
        let reg = ConnectionRegistry::new(8);
        let (slow, _rx) = live_conn(1);
        let (fast, mut rx_fast) = live_conn(512);
        reg.register(slow.clone());
        reg.register(fast);

        for i in 0..=MAX_TOTAL_DROPS {
            reg.emit(Sequence(i as i64 + 1), msg("x"));
        }
        assert!(reg.get(&slow.id).is_none());
        assert!(slow.is_closed());
        assert_eq!(reg.connection_count(), 1);
        assert_eq!(drain(&mut rx_fast).len(), MAX_TOTAL_DROPS as usize + 1);
    }

    #[tokio::test]
    async fn concurrent_removal_during_broadcast_is_safe() {
        let reg = Arc::new(ConnectionRegistry::new(8));
        let mut conns = Vec::new();
        for _ in 0..50 {
            let (c, rx) = live_conn(1024);
            reg.register(c.clone());
            conns.push((c, rx));
        }

        let emitter = {
            let reg = reg.clone();
            tokio::spawn(async move {
                for i in 1..=200 {
                    reg.emit(Sequence(i), msg("m"));
                    tokio::task::yield_now().await;
                }
            })
        };
        let remover = {
            let reg = reg.clone();
            let ids: Vec<_> = conns.iter().map(|(c, _)| c.id.clone()).collect();
            tokio::spawn(async move {
                for id in ids {
                    let _ = reg.unregister(&id);
                    tokio::task::yield_now().await;
                }
            })
        };
        emitter.await.unwrap();
        remover.await.unwrap();

        assert_eq!(reg.connection_count(), 0);
        // Nothing arrives once removal has been observed.
        reg.emit(Sequence(1000), msg("after"));
        for (_, rx) in &mut conns {
            assert!(!drain(rx).iter().any(|m| m == "after"));
        }
    }

    #[test]
    fn park_buffers_and_resume_flushes() {
        let reg = ConnectionRegistry::new(8);
        let (conn, _rx) = live_conn(4);
        reg.register(conn.clone());

        assert!(reg.park(&conn, || vec![msg("queued")]));
        assert_eq!(reg.connection_count(), 0);
        assert_eq!(reg.parked_count(), 1);

        reg.emit(Sequence(7), msg("missed"));

        let (fresh, mut rx) = resumed_conn(conn.session_token(), 8);
        assert!(reg.resume(fresh.clone(), Duration::from_secs(60)));
        assert_eq!(drain(&mut rx), vec!["queued", "missed"]);
        assert_eq!(reg.parked_count(), 0);
        assert_eq!(reg.connection_count(), 1);

        reg.emit(Sequence(8), msg("live"));
        assert_eq!(drain(&mut rx), vec!["live"]);
    }

    #[test]
    fn park_refuses_connection_that_never_caught_up() {
        let reg = ConnectionRegistry::new(8);
        let (conn, _rx) = live_conn(4);
        conn.set_phase(SessionPhase::Active);
        reg.register(conn.clone());
        assert!(!reg.park(&conn, Vec::new));
        assert_eq!(reg.parked_count(), 0);
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn resume_unknown_token_fails() {
        let reg = ConnectionRegistry::new(8);
        let (fresh, _rx) = resumed_conn(&SessionToken::new(), 8);
        assert!(!reg.resume(fresh, Duration::from_secs(60)));
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn parked_overflow_prevents_resume() {
        let reg = ConnectionRegistry::new(2);
        let (conn, _rx) = live_conn(4);
        reg.register(conn.clone());
        assert!(reg.park(&conn, Vec::new));
        for i in 1..=3 {
            reg.emit(Sequence(i), msg("m"));
        }
        let (fresh, _rx2) = resumed_conn(conn.session_token(), 8);
        assert!(!reg.resume(fresh, Duration::from_secs(60)));
    }

    #[test]
    fn expired_session_cannot_resume() {
        let reg = ConnectionRegistry::new(8);
        let (conn, _rx) = live_conn(4);
        reg.register(conn.clone());
        assert!(reg.park(&conn, Vec::new));
        std::thread::sleep(Duration::from_millis(5));
        let (fresh, _rx2) = resumed_conn(conn.session_token(), 8);
        assert!(!reg.resume(fresh, Duration::from_millis(1)));
    }

    #[test]
    fn expire_parked_removes_old_sessions() {
        let reg = ConnectionRegistry::new(8);
        let (conn, _rx) = live_conn(4);
        reg.register(conn.clone());
        assert!(reg.park(&conn, Vec::new));
        assert_eq!(reg.expire_parked(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(reg.expire_parked(Duration::from_millis(1)), 1);
        assert_eq!(reg.parked_count(), 0);
    }
}
