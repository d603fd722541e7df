use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::client::Client;
use crate::connection::{PoolStats, SessionTarget};
use crate::error::TunnelError;
use crate::pool::Pool;
use crate::registration::{self, NEW_SUBDOMAIN};

/// Session metadata. Handshake-derived fields are zero while no session is open.
#[derive(Default)]
struct State {
    remote_host: String,
    remote_port: u16,
    subdomain: String,
    url: String,
    max_conn: usize,
    open: bool,
    session_id: u64,
    /// Bumped by every `Tunnel::close`, open or not
    close_requests: u64,
    closing: CancellationToken,
    stats: Arc<PoolStats>,
}

impl State {
    /// Reset the session and fire its close signal, once
    fn close(&mut self) -> bool {
        if !self.open {
            return false;
        }

        self.remote_host.clear();
        self.remote_port = 0;
        self.subdomain.clear();
        self.url.clear();
        self.max_conn = 0;
        self.open = false;
        self.closing.cancel();
        true
    }
}

pub(crate) struct Shared {
    client: Client,
    local_host: String,
    local_port: u16,
    /// Serializes open attempts across the handshake
    opening: tokio::sync::Mutex<()>,
    state: RwLock<State>,
}

impl Shared {
    /// Close the session identified by `session_id` if it is still the live one
    pub(crate) fn close_session(&self, session_id: u64) -> bool {
        let mut state = self.state.write();
        if state.session_id != session_id {
            return false;
        }
        let closed = state.close();
        if closed {
            tracing::info!("Tunnel session {} closed after a dial failure", session_id);
        }
        closed
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.state.get_mut().close();
    }
}

/// Tunnel forwards remote requests to a local server.
///
/// `Tunnel` is a handle: clones share the same session. Dropping the last
/// handle closes an open session.
#[derive(Clone)]
pub struct Tunnel {
    shared: Arc<Shared>,
}

impl Tunnel {
    pub(crate) fn new(client: Client, local_host: String, local_port: u16) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                local_host,
                local_port,
                opening: tokio::sync::Mutex::new(()),
                state: RwLock::new(State::default()),
            }),
        }
    }

    /// Open the tunnel with a subdomain picked by the broker
    pub async fn open(&self) -> Result<(), TunnelError> {
        self.open_as(NEW_SUBDOMAIN).await
    }

    /// Open the tunnel requesting a specific subdomain.
    ///
    /// Registers with the broker and spawns the connection pool. Returns
    /// once the pool is spawned; dial failures later close the tunnel.
    /// On error no field of the tunnel is changed. A `close` issued while
    /// registering closes the new session as soon as it is established.
    pub async fn open_as(&self, subdomain: &str) -> Result<(), TunnelError> {
        let _opening = self.shared.opening.lock().await;

        let close_requests = {
            let state = self.shared.state.read();
            if state.open {
                return Err(TunnelError::AlreadyOpen);
            }
            state.close_requests
        };

        let client = &self.shared.client;
        let registration = registration::register(
            client.http(),
            client.endpoint(),
            subdomain,
            client.options().handshake_timeout,
        )
        .await?;

        let response = registration.response;
        let target = Arc::new(SessionTarget {
            remote_host: registration.remote_host.clone(),
            remote_port: response.port,
            local_host: self.shared.local_host.clone(),
            local_port: self.shared.local_port,
            options: client.options().clone(),
        });
        let stats = Arc::new(PoolStats::default());

        let published = {
            let mut state = self.shared.state.write();
            if state.closing.is_cancelled() {
                state.closing = CancellationToken::new();
            }
            state.session_id += 1;
            state.remote_host = registration.remote_host;
            state.remote_port = response.port;
            state.subdomain = response.id;
            state.url = response.url;
            state.max_conn = response.max_conn_count;
            state.stats = stats.clone();
            state.open = true;

            if state.close_requests != close_requests {
                state.close();
                None
            } else {
                Some((state.session_id, state.closing.clone()))
            }
        };

        let Some((session_id, closing)) = published else {
            tracing::info!(
                "Tunnel closed while registering with {}, no connections dialed",
                client.endpoint()
            );
            return Ok(());
        };

        tracing::info!(
            "Tunnel established: {} -> {}:{} ({} connections)",
            self.url(),
            self.shared.local_host,
            self.shared.local_port,
            response.max_conn_count
        );

        Pool {
            session: Arc::downgrade(&self.shared),
            session_id,
            target,
            size: response.max_conn_count,
            closing,
            stats,
        }
        .spawn();

        Ok(())
    }

    /// Close all of the tunnel's connections.
    ///
    /// Fires the close signal once per successful open. Without a live
    /// session only an open still registering is affected.
    pub fn close(&self) {
        let mut state = self.shared.state.write();
        state.close_requests += 1;
        let session_id = state.session_id;
        if state.close() {
            tracing::info!("Tunnel session {} closed", session_id);
        } else {
            tracing::debug!("Close requested on a tunnel that is not open");
        }
    }

    /// Notification fired when the current (or next) session closes
    pub fn closing(&self) -> Closing {
        Closing(self.shared.state.read().closing.clone())
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.read().open
    }

    pub fn remote_host(&self) -> String {
        self.shared.state.read().remote_host.clone()
    }

    pub fn remote_port(&self) -> u16 {
        self.shared.state.read().remote_port
    }

    pub fn local_host(&self) -> &str {
        &self.shared.local_host
    }

    pub fn local_port(&self) -> u16 {
        self.shared.local_port
    }

    pub fn subdomain(&self) -> String {
        self.shared.state.read().subdomain.clone()
    }

    /// URL at which the tunnel is exposed
    pub fn url(&self) -> String {
        self.shared.state.read().url.clone()
    }

    /// Number of connections the broker asked the pool to keep open
    pub fn max_conn(&self) -> usize {
        self.shared.state.read().max_conn
    }

    /// Connections of the current session that are relaying right now
    pub fn active_connections(&self) -> usize {
        self.shared.state.read().stats.relaying()
    }

    /// Counters of the current (or last) session's pool
    pub fn stats(&self) -> Arc<PoolStats> {
        self.shared.state.read().stats.clone()
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("Tunnel")
            .field("endpoint", &self.shared.client.endpoint())
            .field("local_host", &self.shared.local_host)
            .field("local_port", &self.shared.local_port)
            .field("remote_host", &state.remote_host)
            .field("remote_port", &state.remote_port)
            .field("subdomain", &state.subdomain)
            .field("url", &state.url)
            .field("max_conn", &state.max_conn)
            .field("open", &state.open)
            .finish()
    }
}

/// Close notification of a tunnel session. Await it to wait for the close.
#[derive(Debug, Clone)]
pub struct Closing(CancellationToken);

impl Closing {
    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn wait(&self) {
        self.0.cancelled().await
    }
}

impl IntoFuture for Closing {
    type Output = ();
    type IntoFuture = WaitForCancellationFutureOwned;

    fn into_future(self) -> Self::IntoFuture {
        self.0.cancelled_owned()
    }
}
