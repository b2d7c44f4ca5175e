//! Connection acceptor: TCP accept loop, optional TLS handshake, Logon
//! gate, identity resolution, and session binding.
//!
//! Until a Logon is accepted the peer gets nothing back: a non-Logon first
//! frame, a denied identity, a full registry, or a logon deadline expiry
//! all close the socket silently.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::framer::Framer;
use crate::protocol::{self, tags, MsgType};
use crate::server::{self, EngineShared};
use crate::session::SessionId;
use crate::state::{SessionSetup, SessionState};
use crate::storage::Direction;

pub(crate) async fn run_acceptor(
    shared: Arc<EngineShared>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&shared);
                    let span = tracing::info_span!("conn", id = %Uuid::new_v4(), %peer);
                    tokio::spawn(handle_connection(shared, stream).instrument(span));
                }
                Err(e) => {
                    // Transient accept failures (fd pressure, aborted
                    // handshakes) should not kill the acceptor.
                    warn!(%e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(shared: Arc<EngineShared>, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    #[cfg(feature = "tls")]
    if let Some(acceptor) = shared.tls_acceptor.clone() {
        match acceptor.accept(stream).await {
            Ok(tls_stream) => establish(shared, tls_stream).await,
            Err(e) => debug!(%e, "tls handshake failed"),
        }
        return;
    }
    establish(shared, stream).await;
}

/// Gate one authenticated transport into a session: first frame must be a
/// Logon, the CompID pair must resolve, and the registry must have room.
async fn establish<S>(shared: Arc<EngineShared>, mut stream: S)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let logon_wait = shared.config.logon_timeout();
    let (frame, leftover) =
        match tokio::time::timeout(logon_wait, read_first_frame(&mut stream)).await {
            Ok(Some(pair)) => pair,
            Ok(None) => return,
            Err(_) => {
                debug!("logon deadline expired");
                return;
            }
        };

    let msg = match protocol::decode(&frame) {
        Ok(m) => m,
        Err(e) => {
            debug!(%e, "undecodable first frame");
            return;
        }
    };
    if msg.msg_type() != MsgType::Logon {
        debug!(msg_type = msg.msg_type().as_str(), "first frame was not a Logon");
        return;
    }
    let (Some(sender), Some(target)) = (
        msg.get_str(tags::SENDER_COMP_ID),
        msg.get_str(tags::TARGET_COMP_ID),
    ) else {
        debug!("logon missing CompIDs");
        return;
    };

    let Some(permit) = shared.resolver.resolve(sender, target).await else {
        info!(sender, target, "logon denied by identity resolver");
        return;
    };
    let id = SessionId::new(target, sender);

    // Counters recover from the journal unless the peer asks for a reset;
    // the state machine re-applies the reset flag when it processes the
    // Logon. A reset retires the old journal so seq 1 can be appended
    // again.
    let (next_inbound, next_outbound) = if msg.get_flag(tags::RESET_SEQ_NUM_FLAG)
        || permit.reset_on_logon
    {
        if let Err(e) = shared.store.reset(&id).await {
            warn!(session = %id, %e, "journal reset failed at logon");
            return;
        }
        (1, 1)
    } else {
        let last_in = match shared.store.last_seq(&id, Direction::Inbound).await {
            Ok(n) => n,
            Err(e) => {
                warn!(session = %id, %e, "journal unavailable at logon");
                return;
            }
        };
        let last_out = match shared.store.last_seq(&id, Direction::Outbound).await {
            Ok(n) => n,
            Err(e) => {
                warn!(session = %id, %e, "journal unavailable at logon");
                return;
            }
        };
        (last_in + 1, last_out + 1)
    };

    let (handle, events_rx, stats) =
        match shared.registry.create(id.clone(), next_inbound, next_outbound) {
            Ok(created) => created,
            Err(e) => {
                info!(session = %id, %e, "logon refused by registry");
                return;
            }
        };

    let setup = SessionSetup {
        default_heartbeat_secs: permit.heartbeat_interval_secs,
        max_clock_skew_secs: shared.config.max_clock_skew_secs,
    };
    let state = SessionState::new(
        id.clone(),
        &setup,
        next_inbound,
        next_outbound,
        shared.clock.monotonic(),
        shared.clock.wall(),
    );
    info!(session = %id, next_inbound, next_outbound, "binding connection to session");
    server::spawn_session(
        shared, stream, state, events_rx, handle, stats, frame, leftover,
    );
}

/// Read until one complete frame is buffered. Returns the frame and any
/// bytes that arrived after it in the same reads.
async fn read_first_frame<S>(stream: &mut S) -> Option<(Bytes, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let framer = Framer::new();
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match framer.extract(&mut buf) {
            Ok(Some(frame)) => return Some((frame, buf)),
            Ok(None) => {}
            Err(e) => {
                debug!(%e, "framing error before logon");
                return None;
            }
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => {
                debug!(%e, "read error before logon");
                return None;
            }
        }
    }
}

#[cfg(feature = "tls")]
pub(crate) fn build_tls_acceptor(
    cfg: &crate::config::TlsConfig,
) -> crate::error::Result<tokio_rustls::TlsAcceptor> {
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use tokio_rustls::rustls::server::WebPkiClientVerifier;
    use tokio_rustls::rustls::{RootCertStore, ServerConfig as RustlsServerConfig};

    use crate::error::FixaError;

    fn load_certs(path: &std::path::Path) -> crate::error::Result<Vec<CertificateDer<'static>>> {
        let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
        rustls_pemfile::certs(&mut reader)
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(FixaError::Io)
    }

    fn load_key(path: &std::path::Path) -> crate::error::Result<PrivateKeyDer<'static>> {
        let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
        rustls_pemfile::private_key(&mut reader)?
            .ok_or_else(|| FixaError::Tls("no private key in pem file".into()))
    }

    let certs = load_certs(&cfg.cert_path)?;
    let key = load_key(&cfg.key_path)?;
    let builder = RustlsServerConfig::builder();
    let server_config = match &cfg.client_ca_path {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| FixaError::Tls(e.to_string()))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| FixaError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    }
    .with_single_cert(certs, key)
    .map_err(|e| FixaError::Tls(e.to_string()))?;

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_config)))
}
