use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frames queued per peer before the hub starts dropping for it.
const PEER_QUEUE: usize = 1024;

type Peers = Arc<RwLock<HashMap<u64, mpsc::Sender<Arc<String>>>>>;

/// Star-topology relay: every line a peer sends is forwarded to all other
/// connected peers. Frames are forwarded as-is.
pub struct RelayHub {
    listener: TcpListener,
    max_frame_size: usize,
    peers: Peers,
}

impl RelayHub {
    pub async fn bind(addr: &str, max_frame_size: usize) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            max_frame_size,
            peers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the live peer count, usable after `run` takes the hub.
    pub fn peer_counter(&self) -> impl Fn() -> usize + Send + Sync + 'static {
        let peers = self.peers.clone();
        move || peers.read().len()
    }

    /// Accept peers until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(addr = ?self.listener.local_addr().ok(), "relay hub listening");
        let mut next_id: u64 = 0;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        next_id += 1;
                        debug!(peer = next_id, %peer_addr, "relay peer connected");
                        let _ = tokio::spawn(serve_peer(
                            next_id,
                            stream,
                            self.peers.clone(),
                            self.max_frame_size,
                            cancel.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "relay hub accept failed"),
                },
                () = cancel.cancelled() => break,
            }
        }
        info!("relay hub stopped");
    }
}

async fn serve_peer(
    id: u64,
    stream: TcpStream,
    peers: Peers,
    max_frame_size: usize,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(PEER_QUEUE);
    let _ = peers.write().insert(id, tx);

    let framed = Framed::new(stream, LinesCodec::new_with_max_length(max_frame_size));
    let (mut sink, mut lines) = framed.split();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            out = rx.recv() => match out {
                Some(line) => {
                    if sink.send(line.as_str().to_owned()).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    let line = Arc::new(line);
                    for (peer, peer_tx) in peers.read().iter() {
                        if *peer != id && peer_tx.try_send(line.clone()).is_err() {
                            warn!(peer, "relay peer queue full, dropping frame");
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(peer = id, error = %e, "relay peer read failed");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = peers.write().remove(&id);
    debug!(peer = id, "relay peer disconnected");
}
