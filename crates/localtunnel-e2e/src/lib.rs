//! End-to-end test utilities for the localtunnel client
//!
//! A mock broker stands in for the public service, and mock local services
//! stand in for the server being exposed, so tests run over real sockets
//! without network access.

pub mod mock_broker;
pub mod mock_service;
pub mod mock_tcp_service;

pub use mock_broker::MockBroker;
pub use mock_service::MockHttpService;
pub use mock_tcp_service::{MockTcpService, TcpServiceMode};

use std::net::TcpListener;

/// A local port with nothing listening on it
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind probe socket");
    listener.local_addr().expect("probe address").port()
}
