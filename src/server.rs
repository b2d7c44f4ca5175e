//! Server assembly: per-session reader/writer/driver tasks, the shared
//! timer wheel, and the public [`FixServer`] entry point.
//!
//! Each connection gets three tasks: a reader that frames bytes into the
//! session mailbox, a writer that drains the outbound FIFO, and a driver
//! that owns the [`SessionState`] and executes its actions. All session
//! mutation happens on the driver, so inbound processing is strictly
//! serialized and outbound sequence assignment can never transpose.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::acceptor;
use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::framer::Framer;
use crate::handler::{ApplicationHandler, IdentityResolver};
use crate::protocol::{self, FixMessage};
use crate::registry::SessionRegistry;
use crate::resend::{self, ReplayStep};
use crate::session::{
    DisconnectReason, SessionEvent, SessionHandle, SessionId, SessionStats, SessionStatus,
    StatsCell,
};
use crate::state::{Action, SessionState};
use crate::storage::{Direction, MessageStore};

pub(crate) struct EngineShared {
    pub(crate) config: ServerConfig,
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) handler: Arc<dyn ApplicationHandler>,
    pub(crate) resolver: Arc<dyn IdentityResolver>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) registry: Arc<SessionRegistry>,
    #[cfg(feature = "tls")]
    pub(crate) tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
}

/// The FIX server. [`FixServer::bind`] starts the acceptor and timer tasks
/// and returns a handle for observation and shutdown.
pub struct FixServer;

impl FixServer {
    /// Bind with the journal selected by `config.storage` and the system
    /// clock.
    pub async fn bind(
        config: ServerConfig,
        handler: Arc<dyn ApplicationHandler>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Result<ServerHandle> {
        let store = crate::storage::make_store(&config.storage);
        Self::bind_with(config, store, handler, resolver, Arc::new(SystemClock)).await
    }

    /// Bind with every collaborator injected; used by embedders and tests.
    pub async fn bind_with(
        config: ServerConfig,
        store: Arc<dyn MessageStore>,
        handler: Arc<dyn ApplicationHandler>,
        resolver: Arc<dyn IdentityResolver>,
        clock: Arc<dyn Clock>,
    ) -> Result<ServerHandle> {
        #[cfg(not(feature = "tls"))]
        if config.tls.is_some() {
            return Err(crate::error::FixaError::InvalidConfig(
                "tls configured but fixa was built without the tls feature".into(),
            ));
        }
        #[cfg(feature = "tls")]
        let tls_acceptor = config
            .tls
            .as_ref()
            .map(acceptor::build_tls_acceptor)
            .transpose()?;

        let listener = TcpListener::bind(config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::new(SessionRegistry::new(
            config.max_sessions,
            config.mailbox_capacity,
        ));
        let logout_timeout = config.logout_timeout();
        let tick_interval = config.tick_interval();

        let shared = Arc::new(EngineShared {
            config,
            store,
            handler,
            resolver,
            clock,
            registry: Arc::clone(&registry),
            #[cfg(feature = "tls")]
            tls_acceptor,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let acceptor_task = tokio::spawn(acceptor::run_acceptor(
            Arc::clone(&shared),
            listener,
            shutdown_rx.clone(),
        ));
        let timer_task = tokio::spawn(run_timer_wheel(
            Arc::clone(&registry),
            tick_interval,
            shutdown_rx,
        ));

        info!(%local_addr, "fix server listening");
        Ok(ServerHandle {
            local_addr,
            registry,
            shutdown_tx,
            acceptor_task,
            timer_task,
            logout_timeout,
        })
    }
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown_tx: watch::Sender<bool>,
    acceptor_task: JoinHandle<()>,
    timer_task: JoinHandle<()>,
    logout_timeout: Duration,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn snapshot(&self) -> Vec<SessionStats> {
        self.registry.snapshot()
    }

    /// Stop accepting, fan out graceful logouts, and wait (bounded) for
    /// session tasks to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.registry
            .shutdown_all(self.logout_timeout + Duration::from_secs(1))
            .await;
        let _ = self.acceptor_task.await;
        let _ = self.timer_task.await;
    }
}

/// Single coarse timer driving every session's heartbeat deadlines. Ticks
/// are delivered through the per-session mailboxes, never by touching
/// session state from here.
async fn run_timer_wheel(
    registry: Arc<SessionRegistry>,
    tick_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => registry.tick_all(),
        }
    }
}

/// Wire a freshly authorized connection into its three session tasks.
/// `first_frame` is the Logon the acceptor already read; `leftover` is
/// whatever bytes followed it in the same read.
pub(crate) fn spawn_session<S>(
    shared: Arc<EngineShared>,
    stream: S,
    state: SessionState,
    events_rx: mpsc::Receiver<SessionEvent>,
    handle: SessionHandle,
    stats: Arc<StatsCell>,
    first_frame: Bytes,
    leftover: BytesMut,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(shared.config.outbound_queue_capacity);
    let writer = tokio::spawn(run_writer(write_half, out_rx));
    let reader = tokio::spawn(run_reader(read_half, handle.sender(), leftover));
    tokio::spawn(run_session_driver(
        shared, state, events_rx, out_tx, writer, reader, stats, first_frame,
    ));
}

async fn run_reader<R>(mut read_half: R, events_tx: mpsc::Sender<SessionEvent>, buf: BytesMut)
where
    R: AsyncRead + Unpin,
{
    let framer = Framer::new();
    let mut buf = buf;
    loop {
        loop {
            match framer.extract(&mut buf) {
                Ok(Some(frame)) => {
                    if events_tx.send(SessionEvent::Frame(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = events_tx.send(SessionEvent::ProtocolViolation(e)).await;
                    return;
                }
            }
        }
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = events_tx.send(SessionEvent::PeerClosed).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = events_tx.send(SessionEvent::TransportError(e.kind())).await;
                return;
            }
        }
    }
}

async fn run_writer<W>(mut write_half: W, mut rx: mpsc::Receiver<Bytes>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        write_half.write_all(&frame).await?;
    }
    write_half.flush().await?;
    write_half.shutdown().await?;
    Ok(())
}

enum Flow {
    Continue,
    /// Flush the outbound FIFO (bounded), then close.
    Drain(DisconnectReason),
    /// Close immediately; queued frames are discarded.
    Close(DisconnectReason),
}

#[allow(clippy::too_many_arguments)]
async fn run_session_driver(
    shared: Arc<EngineShared>,
    mut state: SessionState,
    mut events_rx: mpsc::Receiver<SessionEvent>,
    out_tx: mpsc::Sender<Bytes>,
    mut writer: JoinHandle<std::io::Result<()>>,
    reader: JoinHandle<()>,
    stats: Arc<StatsCell>,
    first_frame: Bytes,
) {
    let id = state.id().clone();
    let mut logout_deadline: Option<tokio::time::Instant> = None;

    let actions = state.on_frame(
        first_frame,
        shared.clock.monotonic(),
        shared.clock.wall(),
    );
    let logged_on = state.status() == SessionStatus::LoggedOn;
    let mut flow = execute_actions(shared.as_ref(), &mut state, &id, &out_tx, actions).await;
    stats.publish(state.status(), state.next_inbound(), state.next_outbound());
    if logged_on && matches!(flow, Flow::Continue) {
        info!(session = %id, "logged on");
        shared.handler.on_logon(&id).await;
    }

    let (reason, drain) = loop {
        match flow {
            Flow::Continue => {}
            Flow::Drain(r) => break (r, true),
            Flow::Close(r) => break (r, false),
        }

        let event = match logout_deadline {
            Some(deadline) => tokio::select! {
                ev = events_rx.recv() => ev,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(session = %id, "logout wait expired");
                    state.mark_disconnecting();
                    break (DisconnectReason::Timeout, true);
                }
            },
            None => events_rx.recv().await,
        };
        let Some(event) = event else {
            break (DisconnectReason::PeerClosed, false);
        };

        let is_shutdown = matches!(event, SessionEvent::Shutdown);
        let actions = match event {
            SessionEvent::Frame(frame) => {
                state.on_frame(frame, shared.clock.monotonic(), shared.clock.wall())
            }
            SessionEvent::ProtocolViolation(e) => {
                warn!(session = %id, %e, "framing violation; closing without reply");
                state.mark_disconnecting();
                vec![Action::Disconnect(DisconnectReason::ProtocolError)]
            }
            SessionEvent::Tick => state.on_tick(shared.clock.monotonic()),
            SessionEvent::SendApp(msg) => {
                if state.status() == SessionStatus::LoggedOn {
                    vec![Action::Send(msg)]
                } else {
                    debug!(session = %id, status = %state.status(), "dropping app send");
                    Vec::new()
                }
            }
            SessionEvent::PeerClosed => state.on_transport_closed(),
            SessionEvent::TransportError(kind) => {
                warn!(session = %id, ?kind, "transport error");
                state.on_transport_closed()
            }
            SessionEvent::Shutdown => state.on_shutdown(),
        };
        flow = execute_actions(shared.as_ref(), &mut state, &id, &out_tx, actions).await;
        stats.publish(state.status(), state.next_inbound(), state.next_outbound());
        if is_shutdown
            && state.status() == SessionStatus::LogoutSent
            && logout_deadline.is_none()
        {
            logout_deadline =
                Some(tokio::time::Instant::now() + shared.config.logout_timeout());
        }
    };

    reader.abort();
    drop(out_tx);
    if drain {
        if tokio::time::timeout(shared.config.logout_timeout(), &mut writer)
            .await
            .is_err()
        {
            warn!(session = %id, "write drain deadline exceeded; forcing close");
            writer.abort();
        }
    } else {
        writer.abort();
    }

    shared.registry.unregister(&id);
    stats.publish(
        SessionStatus::Disconnected,
        state.next_inbound(),
        state.next_outbound(),
    );
    shared.handler.on_logout(&id, reason).await;
    info!(session = %id, ?reason, "session closed");
}

async fn execute_actions(
    shared: &EngineShared,
    state: &mut SessionState,
    id: &SessionId,
    out_tx: &mpsc::Sender<Bytes>,
    actions: Vec<Action>,
) -> Flow {
    for action in actions {
        match action {
            Action::Send(msg) => {
                if let Some(flow) = send_message(shared, state, id, out_tx, msg).await {
                    return flow;
                }
            }
            Action::Journal { seq, frame } => {
                if let Err(e) = shared
                    .store
                    .append(id, Direction::Inbound, seq, &frame, shared.clock.wall())
                    .await
                {
                    error!(session = %id, seq, %e, "inbound journal append failed");
                    return Flow::Close(DisconnectReason::StoreFailure);
                }
            }
            Action::ResendStored { begin, end } => {
                if let Some(flow) = serve_resend(shared, state, id, out_tx, begin, end).await {
                    return flow;
                }
            }
            Action::App(msg) => {
                let replies = shared.handler.on_message(id, msg).await;
                for reply in replies {
                    if let Some(flow) = send_message(shared, state, id, out_tx, reply).await {
                        return flow;
                    }
                }
            }
            Action::Disconnect(reason) => return Flow::Close(reason),
            Action::DisconnectAfterDrain(reason) => return Flow::Drain(reason),
        }
    }
    Flow::Continue
}

/// Assign the next sequence number, stamp, journal, and queue one outbound
/// message. Runs only on the driver task: numbering, the store append, and
/// the FIFO push stay in lockstep.
async fn send_message(
    shared: &EngineShared,
    state: &mut SessionState,
    id: &SessionId,
    out_tx: &mpsc::Sender<Bytes>,
    mut msg: FixMessage,
) -> Option<Flow> {
    let seq = state.alloc_outbound_seq();
    let wall = shared.clock.wall();
    msg.stamp_header(seq, &id.local_comp_id, &id.remote_comp_id, wall);
    let frame = match protocol::encode(&msg) {
        Ok(f) => f,
        Err(e) => {
            error!(session = %id, seq, %e, "outbound encode failed");
            return Some(Flow::Close(DisconnectReason::ProtocolError));
        }
    };
    if let Err(e) = shared
        .store
        .append(id, Direction::Outbound, seq, &frame, wall)
        .await
    {
        error!(session = %id, seq, %e, "outbound journal append failed");
        return Some(Flow::Close(DisconnectReason::StoreFailure));
    }
    push_frame(shared, state, id, out_tx, frame)
}

/// Serve a peer ResendRequest from the outbound journal. Replayed frames
/// keep their original sequence numbers and are not re-journaled.
async fn serve_resend(
    shared: &EngineShared,
    state: &mut SessionState,
    id: &SessionId,
    out_tx: &mpsc::Sender<Bytes>,
    begin: u64,
    end: u64,
) -> Option<Flow> {
    if end < begin {
        // Nothing sent in the requested range: one gap fill to the next
        // outbound number.
        let msg = protocol::build_sequence_reset(state.next_outbound(), true);
        return write_replay(shared, state, id, out_tx, msg, begin);
    }
    let stored = match shared
        .store
        .range(id, Direction::Outbound, begin, Some(end))
        .await
    {
        Ok(s) => s,
        Err(e) => {
            error!(session = %id, begin, end, %e, "journal range read failed");
            return Some(Flow::Close(DisconnectReason::StoreFailure));
        }
    };
    debug!(session = %id, begin, end, stored = stored.len(), "serving resend request");
    for step in resend::plan_replay(&stored, begin, end) {
        let result = match step {
            ReplayStep::GapFill { seq, new_seq } => {
                let msg = protocol::build_sequence_reset(new_seq, true);
                write_replay(shared, state, id, out_tx, msg, seq)
            }
            ReplayStep::Resend { seq, frame } => {
                match resend::transform_for_resend(&frame, shared.clock.wall()) {
                    Ok(msg) => match protocol::encode(&msg) {
                        Ok(bytes) => push_frame(shared, state, id, out_tx, bytes),
                        Err(e) => {
                            warn!(session = %id, seq, %e, "replay encode failed; skipping");
                            None
                        }
                    },
                    Err(e) => {
                        warn!(session = %id, seq, %e, "stored frame undecodable; skipping");
                        None
                    }
                }
            }
        };
        if let Some(flow) = result {
            return Some(flow);
        }
    }
    None
}

/// Stamp a gap-fill style message at an explicit (historical) sequence
/// number and queue it, bypassing sequence assignment and the journal.
fn write_replay(
    shared: &EngineShared,
    state: &mut SessionState,
    id: &SessionId,
    out_tx: &mpsc::Sender<Bytes>,
    mut msg: FixMessage,
    seq: u64,
) -> Option<Flow> {
    msg.stamp_header(seq, &id.local_comp_id, &id.remote_comp_id, shared.clock.wall());
    match protocol::encode(&msg) {
        Ok(frame) => push_frame(shared, state, id, out_tx, frame),
        Err(e) => {
            error!(session = %id, seq, %e, "gap fill encode failed");
            Some(Flow::Close(DisconnectReason::ProtocolError))
        }
    }
}

fn push_frame(
    shared: &EngineShared,
    state: &mut SessionState,
    id: &SessionId,
    out_tx: &mpsc::Sender<Bytes>,
    frame: Bytes,
) -> Option<Flow> {
    match out_tx.try_send(frame) {
        Ok(()) => {
            state.note_outbound(shared.clock.monotonic());
            None
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(session = %id, "outbound queue full; peer is not reading");
            Some(Flow::Close(DisconnectReason::Backpressure))
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Some(Flow::Close(DisconnectReason::PeerClosed))
        }
    }
}
