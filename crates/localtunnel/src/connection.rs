//! One data-plane circuit: a broker socket paired with a local socket
//!
//! A connection walks `Dialing -> Relaying -> {Replacing, Closed}`. It never
//! respawns itself; it reports how it ended and the pool decides.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ClientOptions;
use crate::error::{RelayError, RelayErrorKind, Side, TunnelError};
use crate::relay::ByteRelay;

/// Addresses and timeouts shared by every connection of a session
#[derive(Debug, Clone)]
pub(crate) struct SessionTarget {
    pub remote_host: String,
    pub remote_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub options: ClientOptions,
}

impl SessionTarget {
    fn endpoint(&self, side: Side) -> (&str, u16) {
        match side {
            Side::Remote => (self.remote_host.as_str(), self.remote_port),
            Side::Local => (self.local_host.as_str(), self.local_port),
        }
    }
}

/// How a connection ended
#[derive(Debug)]
pub(crate) enum ConnectionExit {
    /// A socket failed while relaying; the slot should be redialed
    Replace(RelayError),
    /// The session was closed
    Closed,
    /// A dial failed; the whole session must close
    Fatal(TunnelError),
}

/// Counters for the connections of one session
#[derive(Debug, Default)]
pub struct PoolStats {
    relaying: AtomicUsize,
    dials: AtomicU64,
    replacements: AtomicU64,
}

impl PoolStats {
    /// Connections currently relaying
    pub fn relaying(&self) -> usize {
        self.relaying.load(Ordering::Acquire)
    }

    /// Connections successfully dialed so far
    pub fn dials(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    /// Connections replaced after a relay failure
    pub fn replacements(&self) -> u64 {
        self.replacements.load(Ordering::Relaxed)
    }

    pub(crate) fn record_replacement(&self) {
        self.replacements.fetch_add(1, Ordering::Relaxed);
    }
}

struct RelayingGuard<'a>(&'a PoolStats);

impl<'a> RelayingGuard<'a> {
    fn enter(stats: &'a PoolStats) -> Self {
        stats.relaying.fetch_add(1, Ordering::AcqRel);
        Self(stats)
    }
}

impl Drop for RelayingGuard<'_> {
    fn drop(&mut self) {
        self.0.relaying.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A dialed pair of sockets
pub(crate) struct Connection {
    slot: usize,
    remote: TcpStream,
    local: TcpStream,
}

impl Connection {
    /// Dial the broker first, then the local server
    pub async fn dial(slot: usize, target: &SessionTarget) -> Result<Self, TunnelError> {
        let timeout = target.options.dial_timeout;
        let remote = dial(Side::Remote, target.endpoint(Side::Remote), timeout).await?;
        let local = dial(Side::Local, target.endpoint(Side::Local), timeout).await?;

        tracing::debug!(
            "Connection {} established: {:?} <-> {:?}",
            slot,
            remote.peer_addr().ok(),
            local.peer_addr().ok()
        );

        Ok(Self {
            slot,
            remote,
            local,
        })
    }

    /// Relay bytes in both directions until a socket fails or the session closes.
    ///
    /// With an `idle_timeout` the connection is replaced once neither side
    /// has sent anything for that long. Both sockets are closed when this
    /// returns.
    pub async fn relay(
        self,
        closing: &CancellationToken,
        idle_timeout: Option<Duration>,
    ) -> ConnectionExit {
        let slot = self.slot;
        let (remote_read, mut remote_write) = self.remote.into_split();
        let (local_read, mut local_write) = self.local.into_split();

        // One slot per relay so neither blocks on reporting
        let (err_tx, mut err_rx) = mpsc::channel::<RelayError>(2);
        let mut from_remote = ByteRelay::spawn(remote_read, Side::Remote, err_tx.clone());
        let mut from_local = ByteRelay::spawn(local_read, Side::Local, err_tx);

        let idle = tokio::time::sleep(idle_timeout.unwrap_or(Duration::MAX));
        tokio::pin!(idle);

        let exit = loop {
            if closing.is_cancelled() {
                break ConnectionExit::Closed;
            }

            tokio::select! {
                _ = closing.cancelled() => break ConnectionExit::Closed,
                Some(chunk) = from_remote.recv() => {
                    let sent = forward(&mut local_write, chunk, Side::Local, closing).await;
                    if let Some(exit) = sent {
                        break exit;
                    }
                }
                Some(chunk) = from_local.recv() => {
                    let sent = forward(&mut remote_write, chunk, Side::Remote, closing).await;
                    if let Some(exit) = sent {
                        break exit;
                    }
                }
                Some(err) = err_rx.recv() => {
                    // Deliver what the failed side read before its error
                    let flushed = match err.side {
                        Side::Remote => {
                            flush(&mut from_remote, &mut local_write, Side::Local, closing).await
                        }
                        Side::Local => {
                            flush(&mut from_local, &mut remote_write, Side::Remote, closing).await
                        }
                    };
                    break flushed.unwrap_or(ConnectionExit::Replace(err));
                }
                _ = &mut idle, if idle_timeout.is_some() => {
                    let timeout = RelayError::new(Side::Remote, RelayErrorKind::Timeout);
                    break ConnectionExit::Replace(timeout);
                }
                else => {
                    let eof = RelayError::new(Side::Remote, RelayErrorKind::Eof);
                    break ConnectionExit::Replace(eof);
                }
            }

            if let Some(limit) = idle_timeout {
                idle.as_mut().reset(Instant::now() + limit);
            }
        };

        tracing::trace!("Connection {} relay finished: {:?}", slot, exit);
        exit
    }
}

async fn forward<W>(
    writer: &mut W,
    chunk: Bytes,
    side: Side,
    closing: &CancellationToken,
) -> Option<ConnectionExit>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = closing.cancelled() => Some(ConnectionExit::Closed),
        result = writer.write_all(&chunk) => result
            .err()
            .map(|e| ConnectionExit::Replace(RelayError::new(side, RelayErrorKind::Write(e)))),
    }
}

/// Forward every chunk `relay` still has buffered
async fn flush<W>(
    relay: &mut ByteRelay,
    writer: &mut W,
    side: Side,
    closing: &CancellationToken,
) -> Option<ConnectionExit>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = relay.try_recv() {
        if let Some(exit) = forward(writer, chunk, side, closing).await {
            return Some(exit);
        }
    }
    None
}

async fn dial(
    target: Side,
    (host, port): (&str, u16),
    timeout: Option<Duration>,
) -> Result<TcpStream, TunnelError> {
    let addr = join_host_port(host, port);
    let connect = TcpStream::connect((host, port));

    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| TunnelError::DialTimeout {
                target,
                addr: addr.clone(),
            })?,
        None => connect.await,
    };

    let stream = result.map_err(|source| TunnelError::Dial {
        target,
        addr,
        source,
    })?;

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY on {} socket: {}", target, e);
    }

    Ok(stream)
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Run one pool slot from dial to exit
pub(crate) async fn run(
    slot: usize,
    target: &SessionTarget,
    closing: &CancellationToken,
    stats: &PoolStats,
) -> ConnectionExit {
    let dialed = tokio::select! {
        biased;
        _ = closing.cancelled() => return ConnectionExit::Closed,
        dialed = Connection::dial(slot, target) => dialed,
    };

    let connection = match dialed {
        Ok(connection) => connection,
        Err(e) => return ConnectionExit::Fatal(e),
    };

    stats.dials.fetch_add(1, Ordering::Relaxed);
    let _relaying = RelayingGuard::enter(stats);
    connection.relay(closing, target.options.read_timeout).await
}
