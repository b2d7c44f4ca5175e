use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Server-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP endpoint the acceptor binds.
    pub bind_address: SocketAddr,
    /// Ceiling on concurrently registered sessions.
    pub max_sessions: usize,
    /// How long an accepted connection may take to present its Logon.
    pub logon_timeout_secs: u64,
    /// Bound on graceful logout (drain + peer ack) before force-close.
    pub logout_timeout_secs: u64,
    /// Timer-wheel granularity; heartbeat deadlines may overshoot by at
    /// most one tick.
    pub tick_interval_secs: u64,
    /// Heartbeat interval offered to peers whose Logon omits tag 108.
    pub default_heartbeat_secs: u64,
    /// Accepted drift for inbound SendingTime, both directions.
    pub max_clock_skew_secs: u64,
    /// Outbound FIFO bound per session; a full queue disconnects.
    pub outbound_queue_capacity: usize,
    /// Per-session mailbox bound.
    pub mailbox_capacity: usize,
    pub storage: StorageBackend,
    /// TLS termination; `None` accepts plain TCP.
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4050".parse().expect("static socket addr"),
            max_sessions: 256,
            logon_timeout_secs: 30,
            logout_timeout_secs: 10,
            tick_interval_secs: 1,
            default_heartbeat_secs: 30,
            max_clock_skew_secs: 120,
            outbound_queue_capacity: 1024,
            mailbox_capacity: 1024,
            storage: StorageBackend::File {
                base_dir: PathBuf::from("data/journal"),
            },
            tls: None,
        }
    }
}

impl ServerConfig {
    pub fn logon_timeout(&self) -> Duration {
        Duration::from_secs(self.logon_timeout_secs)
    }

    pub fn logout_timeout(&self) -> Duration {
        Duration::from_secs(self.logout_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageBackend {
    /// Heap-only journal; counters and replay do not survive restarts.
    Memory,
    /// JSONL journal with sequence indexes under `base_dir`.
    File { base_dir: PathBuf },
}

/// PEM paths for TLS termination. With `client_ca_path` set the handshake
/// demands and verifies a client certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub client_ca_path: Option<PathBuf>,
}
