//! Mock local HTTP server for E2E tests
//!
//! Plays the server being exposed: answers every request with a fixed body
//! and records what it received.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;

/// A recorded HTTP request for test assertions
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub host: Option<String>,
}

/// A mock HTTP service answering with a fixed body
pub struct MockHttpService {
    addr: SocketAddr,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
}

impl MockHttpService {
    /// Start a mock HTTP service on an ephemeral port
    pub async fn start(body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let requests: Arc<RwLock<Vec<RecordedRequest>>> = Arc::new(RwLock::new(Vec::new()));
        let requests_clone = requests.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let requests = requests_clone.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let requests = requests.clone();
                        async move {
                            requests.write().push(RecordedRequest {
                                method: req.method().to_string(),
                                uri: req.uri().to_string(),
                                host: req
                                    .headers()
                                    .get("host")
                                    .and_then(|v| v.to_str().ok())
                                    .map(str::to_string),
                            });

                            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
                                body.as_bytes(),
                            ))))
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        tracing::debug!("Mock service connection error: {}", e);
                    }
                });
            }
        });

        Self { addr, requests }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Get all recorded requests
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().clone()
    }
}
