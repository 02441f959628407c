use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Relay, RelayError, RelayFrame, DEFAULT_CHANNEL_CAPACITY};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct TcpRelayOptions {
    pub max_frame_size: usize,
    pub max_backoff: Duration,
    /// Outbound frames buffered while the socket is busy.
    pub queue_capacity: usize,
}

impl Default for TcpRelayOptions {
    fn default() -> Self {
        Self {
            max_frame_size: 2 * 1024 * 1024,
            max_backoff: Duration::from_secs(30),
            queue_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Relay client connected to a [`RelayHub`](super::RelayHub).
///
/// A background task keeps the connection up, reconnecting with exponential
/// backoff. Publishing while disconnected fails fast with
/// [`RelayError::Unavailable`].
pub struct TcpRelay {
    outbound: mpsc::Sender<String>,
    inbound: broadcast::Sender<RelayFrame>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl TcpRelay {
    /// Start connecting to the hub at `addr`. Returns immediately.
    pub fn connect(addr: impl Into<String>, options: TcpRelayOptions, cancel: &CancellationToken) -> Self {
        let (outbound, out_rx) = mpsc::channel(options.queue_capacity.max(1));
        let (inbound, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = cancel.child_token();

        let _ = tokio::spawn(run_connection(
            addr.into(),
            options,
            out_rx,
            inbound.clone(),
            connected.clone(),
            cancel.clone(),
        ));

        Self {
            outbound,
            inbound,
            connected,
            cancel,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Drop for TcpRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Relay for TcpRelay {
    async fn publish(&self, frame: &RelayFrame) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::Unavailable("not connected to hub".into()));
        }
        let line = serde_json::to_string(frame)?;
        self.outbound
            .try_send(line)
            .map_err(|e| RelayError::Unavailable(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayFrame> {
        self.inbound.subscribe()
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

async fn run_connection(
    addr: String,
    options: TcpRelayOptions,
    mut out_rx: mpsc::Receiver<String>,
    inbound: broadcast::Sender<RelayFrame>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let attempt = tokio::select! {
            result = TcpStream::connect(&addr) => result,
            () = cancel.cancelled() => return,
        };

        match attempt {
            Ok(stream) => {
                backoff = INITIAL_BACKOFF;
                info!(hub = %addr, "connected to relay hub");
                connected.store(true, Ordering::Release);
                let reason = pump(stream, &options, &mut out_rx, &inbound, &cancel).await;
                connected.store(false, Ordering::Release);
                if cancel.is_cancelled() {
                    return;
                }
                warn!(hub = %addr, reason = %reason, "relay hub connection lost");
            }
            Err(e) => {
                debug!(hub = %addr, error = %e, backoff_secs = backoff.as_secs(), "relay hub connect failed");
            }
        }

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            () = cancel.cancelled() => return,
        }
        backoff = (backoff * 2).min(options.max_backoff.max(INITIAL_BACKOFF));
    }
}

/// Move frames until the connection ends; returns why it ended.
async fn pump(
    stream: TcpStream,
    options: &TcpRelayOptions,
    out_rx: &mut mpsc::Receiver<String>,
    inbound: &broadcast::Sender<RelayFrame>,
    cancel: &CancellationToken,
) -> String {
    let _ = stream.set_nodelay(true);
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(options.max_frame_size));
    let (mut sink, mut lines) = framed.split();

    loop {
        tokio::select! {
            () = cancel.cancelled() => return "shutdown".into(),
            out = out_rx.recv() => match out {
                Some(line) => {
                    if let Err(e) = sink.send(line).await {
                        return e.to_string();
                    }
                }
                None => return "relay dropped".into(),
            },
            line = lines.next() => match line {
                Some(Ok(line)) => match serde_json::from_str::<RelayFrame>(&line) {
                    Ok(frame) => {
                        let _ = inbound.send(frame);
                    }
                    Err(e) => warn!(error = %e, "invalid relay frame"),
                },
                Some(Err(e)) => return e.to_string(),
                None => return "hub closed connection".into(),
            },
        }
    }
}
