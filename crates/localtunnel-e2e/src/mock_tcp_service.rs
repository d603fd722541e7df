//! Mock local TCP service for E2E tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Behavior of the mock TCP service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpServiceMode {
    /// Echo back all received data
    Echo,
    /// Echo the first chunk, then close the connection
    EchoOnce,
}

/// A mock TCP service
pub struct MockTcpService {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl MockTcpService {
    /// Start an echo service on an ephemeral port
    pub async fn start() -> Self {
        Self::start_with_mode(TcpServiceMode::Echo).await
    }

    pub async fn start_with_mode(mode: TcpServiceMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock TCP service");
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));

        let count = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_connection(stream, mode));
            }
        });

        Self { addr, connections }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn handle_connection(mut stream: TcpStream, mode: TcpServiceMode) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = stream.write_all(&buf[..n]).await {
                    tracing::debug!("Echo write error: {}", e);
                    break;
                }
                if mode == TcpServiceMode::EchoOnce {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Echo read error: {}", e);
                break;
            }
        }
    }
}
