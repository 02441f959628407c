//! WebSocket broadcast server: ingestion, fan-out, recovery and the axum
//! surface around them.

pub mod connection;
pub mod events;
pub mod fanout;
pub mod health;
pub mod heartbeat;
pub mod ingest;
pub mod recovery;
pub mod registry;
pub mod relay;
pub mod rpc;
pub mod server;
pub mod session;
pub mod shutdown;

pub use fanout::{BusError, FanoutBus, Topology};
pub use ingest::{IngestOutcome, IngestionGate};
pub use recovery::{RecoveryManager, RecoveryOutcome};
pub use registry::ConnectionRegistry;
pub use server::{ChorusServer, ServerConfig, ServerHandle};
pub use session::{ConnectParams, SessionOptions};
