//! Settings type definitions.
//!
//! All types use camelCase JSON and `#[serde(default)]`, so a settings file
//! only needs the keys it changes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chorus_core::DedupScope;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChorusSettings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub recovery: RecoverySettings,
    pub relay: RelaySettings,
    pub logging: LoggingSettings,
}

impl ChorusSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_send_queue == 0 {
            return Err(SettingsError::invalid("server.maxSendQueue", "must be > 0"));
        }
        if self.server.heartbeat_interval_secs == 0
            || self.server.heartbeat_timeout_secs < self.server.heartbeat_interval_secs
        {
            return Err(SettingsError::invalid(
                "server.heartbeatTimeoutSecs",
                "must be at least heartbeatIntervalSecs, which must be > 0",
            ));
        }
        if self.storage.replay_page_size == 0 {
            return Err(SettingsError::invalid("storage.replayPageSize", "must be > 0"));
        }
        if self.relay.mode == RelayMode::Tcp && self.relay.hub_addr.is_empty() {
            return Err(SettingsError::invalid("relay.hubAddr", "required when relay.mode is tcp"));
        }
        Ok(())
    }
}

/// WebSocket server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Per-connection outbound queue depth.
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Directory served at `/` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            max_send_queue: 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 1024 * 1024,
            static_dir: None,
        }
    }
}

/// Durable log settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub db_path: String,
    /// Drop all history at startup.
    pub reset_on_start: bool,
    /// Rows fetched per page during recovery replay.
    pub replay_page_size: u32,
    pub dedup_scope: DedupScope,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: chorus_home().join("chorus.db").to_string_lossy().into_owned(),
            reset_on_start: false,
            replay_page_size: 256,
            dedup_scope: DedupScope::Global,
        }
    }
}

impl StorageSettings {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.db_path)
    }
}

/// Transport continuity (parked session) settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoverySettings {
    /// Park caught-up sessions on disconnect so a quick reconnect resumes.
    pub enabled: bool,
    pub max_disconnection_secs: u64,
    /// Events buffered per parked session before it is discarded.
    pub max_buffered_events: usize,
    pub sweep_interval_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_disconnection_secs: 120,
            max_buffered_events: 1024,
            sweep_interval_secs: 10,
        }
    }
}

/// Cross-instance fan-out topology.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Single instance; publish emits straight to the local registry.
    #[default]
    Direct,
    /// Multi instance; events travel through a TCP relay hub.
    Tcp,
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Tcp => f.write_str("tcp"),
        }
    }
}

impl FromStr for RelayMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "tcp" => Ok(Self::Tcp),
            other => Err(format!("unknown relay mode: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub mode: RelayMode,
    pub hub_addr: String,
    /// Run the relay hub inside this instance, listening on `hubAddr`.
    pub embed_hub: bool,
    /// Stable instance identity; generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub reconnect_max_backoff_secs: u64,
    /// Max bytes of one relay frame.
    pub max_frame_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            mode: RelayMode::Direct,
            hub_addr: "127.0.0.1:3900".into(),
            embed_hub: false,
            instance_id: None,
            reconnect_max_backoff_secs: 30,
            max_frame_size: 2 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module level overrides, e.g. `{"chorus_store": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
    pub metrics_enabled: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            module_levels: BTreeMap::new(),
            metrics_enabled: true,
        }
    }
}

/// `~/.chorus`, falling back to `/tmp/.chorus`.
pub fn chorus_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".chorus")
}
