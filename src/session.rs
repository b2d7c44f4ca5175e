//! Session identity, status, per-session mailbox, and the cloneable handle
//! the rest of the server uses to reach a session task.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProtocolError;
use crate::protocol::FixMessage;

/// A session is the logical channel between two CompIDs; it survives
/// reconnects and keys the message journal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    /// Our CompID for this session.
    pub local_comp_id: String,
    /// The counterparty's CompID.
    pub remote_comp_id: String,
}

impl SessionId {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local_comp_id: local.into(),
            remote_comp_id: remote.into(),
        }
    }

    /// Filesystem-safe stem for journal file names.
    pub fn file_stem(&self) -> String {
        format!(
            "{}__{}",
            sanitize(&self.local_comp_id),
            sanitize(&self.remote_comp_id)
        )
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}<->{}", self.local_comp_id, self.remote_comp_id)
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    LogonSent,
    LoggedOn,
    LogoutSent,
    Disconnecting,
}

impl SessionStatus {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            SessionStatus::Disconnected => 0,
            SessionStatus::Connecting => 1,
            SessionStatus::LogonSent => 2,
            SessionStatus::LoggedOn => 3,
            SessionStatus::LogoutSent => 4,
            SessionStatus::Disconnecting => 5,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionStatus::Connecting,
            2 => SessionStatus::LogonSent,
            3 => SessionStatus::LoggedOn,
            4 => SessionStatus::LogoutSent,
            5 => SessionStatus::Disconnecting,
            _ => SessionStatus::Disconnected,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Disconnected => "Disconnected",
            SessionStatus::Connecting => "Connecting",
            SessionStatus::LogonSent => "LogonSent",
            SessionStatus::LoggedOn => "LoggedOn",
            SessionStatus::LogoutSent => "LogoutSent",
            SessionStatus::Disconnecting => "Disconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    PeerClosed,
    ProtocolError,
    Timeout,
    LogonTimeout,
    SequenceTooLow,
    Backpressure,
    StoreFailure,
    ApplicationRequested,
    ShuttingDown,
}

/// Everything a session task can be asked to process. One mailbox per
/// session; the owning task drains it strictly in order.
#[derive(Debug)]
pub enum SessionEvent {
    /// A complete, checksum-verified frame from the transport.
    Frame(Bytes),
    /// The reader hit a framing violation; close without reply.
    ProtocolViolation(ProtocolError),
    /// Coarse timer-wheel tick.
    Tick,
    /// Application-originated outbound message.
    SendApp(FixMessage),
    /// Peer closed its half of the connection.
    PeerClosed,
    /// Transport-level read failure.
    TransportError(std::io::ErrorKind),
    /// Graceful logout requested by the operator or server shutdown.
    Shutdown,
}

/// Point-in-time operator view of one session.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub id: SessionId,
    pub status: SessionStatus,
    pub next_inbound_seq: u64,
    pub next_outbound_seq: u64,
}

/// Counters the owning task publishes for lock-free observation.
#[derive(Debug)]
pub(crate) struct StatsCell {
    status: AtomicU8,
    next_inbound: AtomicU64,
    next_outbound: AtomicU64,
}

impl StatsCell {
    pub(crate) fn new(status: SessionStatus, next_inbound: u64, next_outbound: u64) -> Self {
        Self {
            status: AtomicU8::new(status.as_u8()),
            next_inbound: AtomicU64::new(next_inbound),
            next_outbound: AtomicU64::new(next_outbound),
        }
    }

    pub(crate) fn publish(&self, status: SessionStatus, next_inbound: u64, next_outbound: u64) {
        self.status.store(status.as_u8(), Ordering::Relaxed);
        self.next_inbound.store(next_inbound, Ordering::Relaxed);
        self.next_outbound.store(next_outbound, Ordering::Relaxed);
    }

    fn snapshot(&self, id: &SessionId) -> SessionStats {
        SessionStats {
            id: id.clone(),
            status: SessionStatus::from_u8(self.status.load(Ordering::Relaxed)),
            next_inbound_seq: self.next_inbound.load(Ordering::Relaxed),
            next_outbound_seq: self.next_outbound.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable handle to a running session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    events_tx: mpsc::Sender<SessionEvent>,
    stats: Arc<StatsCell>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Queue an application message for sending; awaits mailbox capacity.
    pub async fn send_app(&self, msg: FixMessage) -> Result<(), crate::error::FixaError> {
        self.events_tx
            .send(SessionEvent::SendApp(msg))
            .await
            .map_err(|_| crate::error::FixaError::ChannelClosed)
    }

    /// Request a graceful logout.
    pub fn shutdown(&self) {
        let _ = self.events_tx.try_send(SessionEvent::Shutdown);
    }

    /// Timer-wheel tick; dropped when the mailbox is full (the next tick
    /// will land once the backlog drains).
    pub(crate) fn tick(&self) {
        let _ = self.events_tx.try_send(SessionEvent::Tick);
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.snapshot(&self.id)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.events_tx.is_closed()
    }

    /// Raw event sender for the connection's reader task.
    pub(crate) fn sender(&self) -> mpsc::Sender<SessionEvent> {
        self.events_tx.clone()
    }
}

/// Create a session mailbox and its handle.
pub(crate) fn session_channel(
    id: SessionId,
    stats: Arc<StatsCell>,
    capacity: usize,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        SessionHandle {
            id,
            events_tx: tx,
            stats,
        },
        rx,
    )
}
