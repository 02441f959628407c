//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chorus_core::{ClientSession, ConnectionId, Sequence, SessionPhase, SessionToken};
use chorus_telemetry::names;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::ClientConnection;
use crate::events;
use crate::fanout::FanoutBus;
use crate::heartbeat::{run_heartbeat, HeartbeatResult};
use crate::ingest::{IngestOutcome, IngestionGate};
use crate::recovery::RecoveryManager;
use crate::registry::ConnectionRegistry;
use crate::rpc::{RpcRequest, RpcResponse, SubmitParams};

pub const SUBMIT_METHOD: &str = "chat.submit";

/// Query parameters of `GET /ws`.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Highest sequence the client has already seen.
    pub last_known_sequence: Option<i64>,
    /// Token from a previous `connection.established`, for resumption.
    pub session_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub recovery_enabled: bool,
    /// How long a parked session can be resumed.
    pub max_disconnection: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_send_queue: 1024,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            recovery_enabled: true,
            max_disconnection: Duration::from_secs(120),
        }
    }
}

/// Everything a session needs, shared by all sessions on the instance.
pub struct SessionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub gate: Arc<IngestionGate>,
    pub bus: Arc<FanoutBus>,
    pub recovery: Arc<RecoveryManager>,
    pub options: SessionOptions,
    /// Held from append through publish so local clients see commit order.
    commit_order: Mutex<()>,
}

impl SessionContext {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        gate: Arc<IngestionGate>,
        bus: Arc<FanoutBus>,
        recovery: Arc<RecoveryManager>,
        options: SessionOptions,
    ) -> Self {
        Self {
            registry,
            gate,
            bus,
            recovery,
            options,
            commit_order: Mutex::new(()),
        }
    }
}

type Outbound = (mpsc::Receiver<Arc<String>>, Option<Arc<String>>);

/// Run a WebSocket session for a connected client.
///
/// 1. Resumes the parked session named by `sessionToken`, or registers a new
///    connection that holds live events until replay ends
/// 2. Sends `connection.established`
/// 3. Replays missed messages (non-recovered sessions only)
/// 4. Dispatches `chat.submit` requests and acknowledges them
/// 5. Parks or unregisters the connection on disconnect. A connection the
///    registry evicts ends the session, so the client reconnects and replays.
#[instrument(skip_all, fields(client_id = %client_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    client_id: ConnectionId,
    params: ConnectParams,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, send_rx) = mpsc::channel::<Arc<String>>(ctx.options.max_send_queue);
    let connection_start = Instant::now();
    counter!(names::WS_CONNECTIONS_TOTAL).increment(1);

    let (connection, recovered) = attach(&ctx, client_id.clone(), &params, send_tx);
    info!(session_token = %connection.session_token(), recovered, "client connected");

    let established = events::connection_established(&client_id, connection.session_token(), recovered);
    if ws_tx.send(WsMessage::Text(established.into())).await.is_err() {
        detach(&ctx, &connection, None, false);
        return;
    }

    let session_cancel = shutdown.child_token();

    let writer = tokio::spawn(write_loop(
        ws_tx,
        send_rx,
        ctx.options.heartbeat_interval,
        session_cancel.clone(),
    ));

    let heartbeat = {
        let connection = connection.clone();
        let interval = ctx.options.heartbeat_interval;
        let timeout = ctx.options.heartbeat_timeout;
        let cancel = session_cancel.clone();
        tokio::spawn(async move {
            if run_heartbeat(connection, interval, timeout, cancel.clone()).await
                == HeartbeatResult::TimedOut
            {
                warn!("client unresponsive, disconnecting");
                cancel.cancel();
            }
        })
    };

    let replay = {
        let connection = connection.clone();
        let recovery = ctx.recovery.clone();
        let known_offset = params.last_known_sequence.map(|k| Sequence(k.max(0)));
        let session = ClientSession::new(client_id.clone(), known_offset, recovered);
        let cancel = session_cancel.clone();
        tokio::spawn(async move {
            let _ = recovery.recover(&connection, &session, &cancel).await;
        })
    };

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = session_cancel.cancelled() => break,
            () = connection.closed() => {
                info!(dropped = connection.drop_count(), "connection evicted, closing socket");
                break;
            }
        };
        let text = match frame {
            Some(Ok(WsMessage::Text(t))) => t.to_string(),
            Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(s) => s.to_owned(),
                Err(_) => {
                    debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                connection.mark_alive();
                continue;
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        };

        let Some(response) = handle_text(&text, &ctx).await else {
            continue;
        };
        match serde_json::to_string(&response) {
            Ok(json) => {
                if !connection.send(Arc::new(json)) {
                    info!("failed to enqueue response (channel full or closed)");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize response"),
        }
    }

    session_cancel.cancel();
    replay.abort();
    let _ = replay.await;
    heartbeat.abort();
    let outbound = writer.await.ok();
    detach(&ctx, &connection, outbound, shutdown.is_cancelled());

    counter!(names::WS_DISCONNECTIONS_TOTAL).increment(1);
    info!(
        duration_secs = connection_start.elapsed().as_secs_f64(),
        dropped = connection.drop_count(),
        "client disconnected"
    );
}

/// Resume the parked session for the requested token, or register a fresh
/// connection under a new token. Returns the connection and whether it was
/// resumed.
fn attach(
    ctx: &SessionContext,
    client_id: ConnectionId,
    params: &ConnectParams,
    send_tx: mpsc::Sender<Arc<String>>,
) -> (Arc<ClientConnection>, bool) {
    if ctx.options.recovery_enabled {
        if let Some(token) = params.session_token.as_deref().filter(|t| !t.is_empty()) {
            let resumed = Arc::new(ClientConnection::live(
                client_id.clone(),
                SessionToken::from_raw(token),
                send_tx.clone(),
            ));
            if ctx.registry.resume(resumed.clone(), ctx.options.max_disconnection) {
                return (resumed, true);
            }
            debug!(session_token = token, "no resumable session, starting fresh");
        }
    }

    let connection = Arc::new(ClientConnection::catching_up(
        client_id,
        SessionToken::new(),
        send_tx,
    ));
    ctx.registry.register(connection.clone());
    (connection, false)
}

/// Take the connection out of the live set. Caught-up sessions are parked
/// with the chat events still queued for them; responses to the old socket
/// are discarded.
fn detach(
    ctx: &SessionContext,
    connection: &ClientConnection,
    outbound: Option<Outbound>,
    shutting_down: bool,
) {
    let parkable = ctx.options.recovery_enabled && !shutting_down;
    match outbound {
        Some((mut rx, unsent)) if parkable => {
            let parked = ctx.registry.park(connection, move || {
                let mut missed: Vec<_> = unsent.into_iter().collect();
                while let Ok(frame) = rx.try_recv() {
                    missed.push(frame);
                }
                missed.retain(|frame| events::is_chat_message(frame));
                missed
            });
            if parked {
                debug!(session_token = %connection.session_token(), "session parked for resumption");
            }
        }
        _ => {
            let _ = ctx.registry.unregister(&connection.id);
        }
    }
    connection.set_phase(SessionPhase::Disconnected);
}

/// Forward queued frames to the socket with periodic Ping frames. Hands the
/// queue back, together with any frame it failed to write, when the session
/// ends.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Arc<String>>,
    ping_every: Duration,
    cancel: CancellationToken,
) -> Outbound {
    let mut ping_interval = tokio::time::interval(ping_every);
    // Skip the immediate first tick
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return (rx, None),
            msg = rx.recv() => {
                let Some(text) = msg else { return (rx, None) };
                let frame = WsMessage::Text(text.as_str().to_owned().into());
                tokio::select! {
                    result = ws_tx.send(frame) => {
                        if result.is_err() {
                            cancel.cancel();
                            return (rx, Some(text));
                        }
                    }
                    () = cancel.cancelled() => return (rx, Some(text)),
                }
            }
            _ = ping_interval.tick() => {
                if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    cancel.cancel();
                    return (rx, None);
                }
            }
        }
    }
}

/// Handle one inbound text frame. Returns the response to send, if any.
///
/// Rejected submissions get no response; the client retries with the same
/// dedup token after its own timeout.
pub async fn handle_text(text: &str, ctx: &SessionContext) -> Option<RpcResponse> {
    let Ok(request) = serde_json::from_str::<RpcRequest>(text) else {
        return Some(RpcResponse::parse_error());
    };
    if request.method != SUBMIT_METHOD {
        return Some(RpcResponse::method_not_found(request.id, &request.method));
    }
    let params = match request.params.map(serde_json::from_value::<SubmitParams>) {
        Some(Ok(params)) => params,
        Some(Err(e)) => return Some(RpcResponse::invalid_params(request.id, e.to_string())),
        None => return Some(RpcResponse::invalid_params(request.id, "missing params")),
    };

    let _ordered = ctx.commit_order.lock().await;
    match ctx.gate.ingest(params.into()).await {
        IngestOutcome::Accepted(message) => {
            let sequence = message.sequence;
            if let Err(e) = ctx.bus.publish(message).await {
                warn!(%sequence, error = %e, "cross-instance fan-out failed");
            }
            Some(RpcResponse::success(
                request.id,
                json!({ "status": "accepted", "sequence": sequence }),
            ))
        }
        IngestOutcome::Duplicate => Some(RpcResponse::success(
            request.id,
            json!({ "status": "duplicate" }),
        )),
        IngestOutcome::Rejected(e) => {
            warn!(error = %e, retryable = e.is_retryable(), "submission rejected, no ack sent");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use chorus_core::{DedupScope, InstanceId};
    use chorus_store::{Database, LogStore, SqliteLog};

    use super::*;
    use crate::fanout::Topology;

    fn context() -> SessionContext {
        let store: Arc<dyn LogStore> = Arc::new(SqliteLog::new(Database::in_memory().unwrap()));
        let registry = Arc::new(ConnectionRegistry::new(16));
        SessionContext::new(
            registry.clone(),
            Arc::new(IngestionGate::new(store.clone(), DedupScope::Global)),
            Arc::new(FanoutBus::new(registry, Topology::Direct, InstanceId::new())),
            Arc::new(RecoveryManager::new(store, 16)),
            SessionOptions::default(),
        )
    }

    fn submit(id: i64, content: &str, token: &str) -> String {
        json!({
            "id": id,
            "method": SUBMIT_METHOD,
            "params": { "content": content, "dedupToken": token },
        })
        .to_string()
    }

    #[test]
    fn connect_params_from_query() {
        let p: ConnectParams =
            serde_json::from_value(json!({"lastKnownSequence": 4, "sessionToken": "sess_x"})).unwrap();
        assert_eq!(p.last_known_sequence, Some(4));
        assert_eq!(p.session_token.as_deref(), Some("sess_x"));
        let empty: ConnectParams = serde_json::from_value(json!({})).unwrap();
        assert!(empty.last_known_sequence.is_none());
    }

    #[tokio::test]
    async fn submit_is_acknowledged_with_sequence() {
        let ctx = context();
        let resp = handle_text(&submit(1, "hello", "tok-1"), &ctx).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.id, Some(json!(1)));
        let result = resp.result.unwrap();
        assert_eq!(result["status"], "accepted");
        assert_eq!(result["sequence"], 1);
    }

    #[tokio::test]
    async fn repeated_submit_is_acknowledged_as_duplicate() {
        let ctx = context();
        let _ = handle_text(&submit(1, "hello", "tok-1"), &ctx).await;
        let resp = handle_text(&submit(2, "hello", "tok-1"), &ctx).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.result.unwrap()["status"], "duplicate");
    }

    #[tokio::test]
    async fn accepted_submit_is_broadcast_once() {
        let ctx = context();
        let (tx, mut rx) = mpsc::channel(8);
        ctx.registry
            .register(Arc::new(ClientConnection::live(ConnectionId::new(), SessionToken::new(), tx)));

        let _ = handle_text(&submit(1, "hello", "tok-1"), &ctx).await;
        let _ = handle_text(&submit(2, "hello", "tok-1"), &ctx).await;

        let frame: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], events::CHAT_MESSAGE);
        assert_eq!(frame["data"]["content"], "hello");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_json_is_parse_error() {
        let resp = handle_text("{not json", &context()).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "PARSE_ERROR");
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let resp = handle_text(r#"{"id":3,"method":"chat.delete"}"#, &context())
            .await
            .unwrap();
        assert_eq!(resp.id, Some(json!(3)));
        assert_eq!(resp.error.unwrap().code, "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn missing_or_bad_params_are_invalid() {
        let ctx = context();
        let missing = handle_text(r#"{"id":1,"method":"chat.submit"}"#, &ctx).await.unwrap();
        assert_eq!(missing.error.unwrap().code, "INVALID_PARAMS");
        let bad = handle_text(r#"{"id":2,"method":"chat.submit","params":{"content":5}}"#, &ctx)
            .await
            .unwrap();
        assert_eq!(bad.error.unwrap().code, "INVALID_PARAMS");
    }

    #[test]
    fn resume_falls_back_to_fresh_token() {
        let ctx = context();
        let (tx, _rx) = mpsc::channel(8);
        let params = ConnectParams {
            last_known_sequence: None,
            session_token: Some("sess_unknown".into()),
        };
        let (conn, recovered) = attach(&ctx, ConnectionId::new(), &params, tx);
        assert!(!recovered);
        assert_ne!(conn.session_token().as_str(), "sess_unknown");
        assert_eq!(ctx.registry.connection_count(), 1);
    }

    fn chat_frame(seq: i64, content: &str) -> Arc<String> {
        Arc::new(events::chat_message(&chorus_core::Message {
            sequence: Sequence(seq),
            content: content.into(),
            dedup_token: None,
            sender_label: None,
            committed_at: chrono::Utc::now(),
        }))
    }

    fn content_of(frame: &str) -> String {
        let v: serde_json::Value = serde_json::from_str(frame).unwrap();
        v["data"]["content"].as_str().unwrap().to_owned()
    }

    #[test]
    fn parked_session_resumes_with_missed_frames() {
        let ctx = context();
        let (tx, rx) = mpsc::channel(8);
        let (conn, _) = attach(&ctx, ConnectionId::new(), &ConnectParams::default(), tx);
        conn.set_phase(SessionPhase::CaughtUp);
        assert!(conn.send(chat_frame(5, "queued")));
        detach(&ctx, &conn, Some((rx, Some(chat_frame(4, "unsent")))), false);
        assert_eq!(ctx.registry.parked_count(), 1);
        assert_eq!(conn.phase(), SessionPhase::Disconnected);

        ctx.registry.emit(Sequence(7), chat_frame(7, "missed"));

        let (tx2, mut rx2) = mpsc::channel(8);
        let params = ConnectParams {
            last_known_sequence: None,
            session_token: Some(conn.session_token().as_str().to_owned()),
        };
        let (resumed, recovered) = attach(&ctx, ConnectionId::new(), &params, tx2);
        assert!(recovered);
        assert_eq!(resumed.session_token(), conn.session_token());
        assert_eq!(content_of(&rx2.try_recv().unwrap()), "unsent");
        assert_eq!(content_of(&rx2.try_recv().unwrap()), "queued");
        assert_eq!(content_of(&rx2.try_recv().unwrap()), "missed");
    }

    #[test]
    fn parked_session_drops_responses_for_old_socket() {
        let ctx = context();
        let (tx, rx) = mpsc::channel(8);
        let (conn, _) = attach(&ctx, ConnectionId::new(), &ConnectParams::default(), tx);
        conn.set_phase(SessionPhase::CaughtUp);
        let ack = RpcResponse::success(Some(json!(1)), json!({ "status": "duplicate" }));
        assert!(conn.send(Arc::new(serde_json::to_string(&ack).unwrap())));
        assert!(conn.send(chat_frame(2, "kept")));
        detach(&ctx, &conn, Some((rx, None)), false);

        let (tx2, mut rx2) = mpsc::channel(8);
        let params = ConnectParams {
            last_known_sequence: None,
            session_token: Some(conn.session_token().as_str().to_owned()),
        };
        let (_, recovered) = attach(&ctx, ConnectionId::new(), &params, tx2);
        assert!(recovered);
        assert_eq!(content_of(&rx2.try_recv().unwrap()), "kept");
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submits_reach_live_clients_in_commit_order() {
        let ctx = Arc::new(context());
        let (tx, mut rx) = mpsc::channel(1024);
        let conn = ClientConnection::live(ConnectionId::new(), SessionToken::new(), tx);
        conn.set_phase(SessionPhase::CaughtUp);
        ctx.registry.register(Arc::new(conn));

        let tasks: Vec<_> = (0..200)
            .map(|i| {
                let ctx = ctx.clone();
                tokio::spawn(async move { handle_text(&submit(i, "m", ""), &ctx).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().unwrap().success);
        }

        let mut sequences = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
            sequences.push(v["data"]["sequence"].as_i64().unwrap());
        }
        assert_eq!(sequences, (1..=200).collect::<Vec<i64>>());
    }

    #[test]
    fn shutdown_unregisters_instead_of_parking() {
        let ctx = context();
        let (tx, rx) = mpsc::channel(8);
        let (conn, _) = attach(&ctx, ConnectionId::new(), &ConnectParams::default(), tx);
        conn.set_phase(SessionPhase::CaughtUp);
        detach(&ctx, &conn, Some((rx, None)), true);
        assert_eq!(ctx.registry.parked_count(), 0);
        assert_eq!(ctx.registry.connection_count(), 0);
    }
}
