//! Mock broker for E2E tests
//!
//! Serves the registration endpoint over HTTP and accepts data-plane
//! connections on a separate TCP port. Tests take the accepted sockets and
//! act as the public side of the tunnel.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};

/// Subdomain assigned by default
pub const DEFAULT_ID: &str = "abc123";

/// Public URL returned by default
pub const DEFAULT_URL: &str = "https://abc123.example.com";

/// Reply served on the registration endpoint
#[derive(Clone, Debug)]
struct Reply {
    status: StatusCode,
    body: String,
    delay: Duration,
}

/// A mock localtunnel broker
pub struct MockBroker {
    addr: SocketAddr,
    data_addr: SocketAddr,
    /// Path and query of every registration request
    requests: Arc<RwLock<Vec<String>>>,
    reply: Arc<RwLock<Reply>>,
    accepted: Mutex<mpsc::Receiver<TcpStream>>,
    accepted_count: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockBroker {
    /// Start a broker handing out two connections per tunnel
    pub async fn start() -> Self {
        Self::start_with_max_conn(2).await
    }

    pub async fn start_with_max_conn(max_conn_count: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock broker");
        let data_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock data plane");
        let addr = listener.local_addr().unwrap();
        let data_addr = data_listener.local_addr().unwrap();

        let requests: Arc<RwLock<Vec<String>>> = Arc::new(RwLock::new(Vec::new()));
        let reply = Arc::new(RwLock::new(Reply {
            status: StatusCode::OK,
            body: registration_body(DEFAULT_ID, DEFAULT_URL, data_addr.port(), max_conn_count),
            delay: Duration::ZERO,
        }));
        let accepted_count = Arc::new(AtomicUsize::new(0));
        let (accepted_tx, accepted_rx) = mpsc::channel::<TcpStream>(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let requests_clone = requests.clone();
        let reply_clone = reply.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::debug!("Mock broker shutting down");
                        break;
                    }
                    result = listener.accept() => {
                        let stream = match result {
                            Ok((stream, _)) => stream,
                            Err(e) => {
                                tracing::error!("Broker accept error: {}", e);
                                break;
                            }
                        };
                        let requests = requests_clone.clone();
                        let reply = reply_clone.clone();
                        tokio::spawn(async move {
                            serve_registration(stream, requests, reply).await;
                        });
                    }
                }
            }
        });

        let count = accepted_count.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer_addr)) = data_listener.accept().await {
                tracing::debug!("Data-plane connection from {}", peer_addr);
                count.fetch_add(1, Ordering::SeqCst);
                if accepted_tx.send(stream).await.is_err() {
                    break;
                }
            }
        });

        Self {
            addr,
            data_addr,
            requests,
            reply,
            accepted: Mutex::new(accepted_rx),
            accepted_count,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Base URL of the registration endpoint
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Data-plane port announced in the default registration
    pub fn data_port(&self) -> u16 {
        self.data_addr.port()
    }

    /// Serve a registration for the given id, url, port and pool size
    pub fn set_registration(&self, id: &str, url: &str, port: u16, max_conn_count: usize) {
        let mut reply = self.reply.write();
        reply.status = StatusCode::OK;
        reply.body = registration_body(id, url, port, max_conn_count);
    }

    /// Serve an arbitrary status and body
    pub fn set_raw_reply(&self, status: StatusCode, body: impl Into<String>) {
        let mut reply = self.reply.write();
        reply.status = status;
        reply.body = body.into();
    }

    /// Hold every registration reply back for `delay`
    pub fn set_reply_delay(&self, delay: Duration) {
        self.reply.write().delay = delay;
    }

    /// Path and query of every registration request received
    pub fn requests(&self) -> Vec<String> {
        self.requests.read().clone()
    }

    /// Data-plane connections accepted so far
    pub fn accepted_count(&self) -> usize {
        self.accepted_count.load(Ordering::SeqCst)
    }

    /// Next data-plane connection dialed by a tunnel, if one arrives in time
    pub async fn accept(&self, timeout: Duration) -> Option<TcpStream> {
        let mut accepted = self.accepted.lock().await;
        tokio::time::timeout(timeout, accepted.recv())
            .await
            .ok()
            .flatten()
    }

    /// Shutdown the registration endpoint
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn registration_body(id: &str, url: &str, port: u16, max_conn_count: usize) -> String {
    serde_json::json!({
        "id": id,
        "url": url,
        "port": port,
        "max_conn_count": max_conn_count,
    })
    .to_string()
}

async fn serve_registration(
    stream: TcpStream,
    requests: Arc<RwLock<Vec<String>>>,
    reply: Arc<RwLock<Reply>>,
) {
    let service = service_fn(move |req: Request<Incoming>| {
        let requests = requests.clone();
        let reply = reply.clone();
        async move {
            let path = req
                .uri()
                .path_and_query()
                .map(|p| p.to_string())
                .unwrap_or_default();
            tracing::debug!("Registration request: {}", path);
            requests.write().push(path);

            let Reply {
                status,
                body,
                delay,
            } = reply.read().clone();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            Ok::<_, Infallible>(
                Response::builder()
                    .status(status)
                    .header("content-type", "application/json")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap(),
            )
        }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!("Broker connection error: {}", e);
    }
}
