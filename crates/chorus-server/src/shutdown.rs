//! Graceful shutdown: stop accepting, let sessions detach, then wait for
//! background tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::ConnectionRegistry;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Owns the instance-wide cancellation token. Every session runs on a child
/// of it, so cancelling ends all sessions without parking them.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    registry: Option<Arc<ConnectionRegistry>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            registry: None,
        }
    }

    /// A coordinator that waits for `registry` to empty before awaiting tasks.
    pub fn for_registry(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            token: CancellationToken::new(),
            registry: Some(registry),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, wait for live connections to detach, then for `handles`.
    /// Both waits share one `timeout` budget.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let deadline = Instant::now() + timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();

        if let Some(registry) = &self.registry {
            let open = registry.connection_count();
            info!(connections = open, "draining sessions");
            while registry.connection_count() > 0 && Instant::now() < deadline {
                tokio::time::sleep(DRAIN_POLL).await;
            }
            let remaining = registry.connection_count();
            if remaining > 0 {
                warn!(remaining, "sessions still open at shutdown deadline");
            }
        }

        info!(task_count = handles.len(), "waiting for background tasks");
        if tokio::time::timeout_at(deadline, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("shutdown deadline passed with tasks still running");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
