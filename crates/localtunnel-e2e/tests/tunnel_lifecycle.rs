//! Registration and session lifecycle end-to-end tests

use std::time::Duration;

use hyper::StatusCode;
use localtunnel::{Client, Tunnel, TunnelError};
use localtunnel_e2e::{closed_port, MockBroker, MockHttpService, MockTcpService};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CONTENT: &str = "Hello from local server!";
const WAIT: Duration = Duration::from_secs(5);

fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("localtunnel=debug,localtunnel_e2e=debug")
        .with_test_writer()
        .try_init();
}

fn assert_not_connected(tunnel: &Tunnel, local_port: u16) {
    assert_eq!(tunnel.remote_host(), "");
    assert_eq!(tunnel.remote_port(), 0);
    assert_eq!(tunnel.local_host(), "127.0.0.1");
    assert_eq!(tunnel.local_port(), local_port);
    assert_eq!(tunnel.subdomain(), "");
    assert_eq!(tunnel.url(), "");
    assert_eq!(tunnel.max_conn(), 0);
    assert!(!tunnel.is_open());
}

/// Send a one-shot HTTP request through a data-plane socket and return the body
async fn http_get(stream: &mut TcpStream) -> String {
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: abc123.example.com\r\nConnection: close\r\n\r\n")
        .await
        .expect("Failed to write request");

    let mut response = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut response))
        .await
        .expect("Response timeout")
        .expect("Failed to read response");

    let response = String::from_utf8(response).expect("Response is not UTF-8");
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    let (_, body) = response
        .split_once("\r\n\r\n")
        .expect("Response has no body separator");
    body.to_string()
}

#[tokio::test]
async fn test_open_relay_close() {
    init_test();

    let service = MockHttpService::start(CONTENT).await;
    let broker = MockBroker::start_with_max_conn(2).await;
    let tunnel = Client::new(broker.endpoint()).new_tunnel("127.0.0.1", service.port());

    assert_not_connected(&tunnel, service.port());

    tunnel.open().await.expect("Failed to open tunnel");

    assert_eq!(tunnel.url(), "https://abc123.example.com");
    assert_eq!(tunnel.subdomain(), "abc123");
    assert_eq!(tunnel.max_conn(), 2);
    assert_eq!(tunnel.remote_host(), "127.0.0.1");
    assert_eq!(tunnel.remote_port(), broker.data_port());
    assert!(tunnel.is_open());
    assert_eq!(broker.requests(), vec!["/?new".to_string()]);

    let mut first = broker.accept(WAIT).await.expect("First connection");
    let mut second = broker.accept(WAIT).await.expect("Second connection");

    assert_eq!(http_get(&mut first).await, CONTENT);
    let requests = service.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].uri, "/");
    // Bytes are relayed untouched, public Host header included
    assert_eq!(requests[0].host.as_deref(), Some("abc123.example.com"));

    // The local server closed the first circuit, so its slot is redialed
    let mut replacement = broker.accept(WAIT).await.expect("Replacement connection");
    assert_eq!(http_get(&mut replacement).await, CONTENT);

    let closing = tunnel.closing();
    tunnel.close();

    tokio::time::timeout(WAIT, closing.clone())
        .await
        .expect("Close notification");
    assert!(closing.is_closed());
    assert_not_connected(&tunnel, service.port());

    // Remaining circuits are torn down
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, second.read(&mut buf))
        .await
        .expect("Read timeout")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_open_as_requests_subdomain() {
    init_test();

    let broker = MockBroker::start_with_max_conn(0).await;
    broker.set_registration("myapp", "https://myapp.example.com", broker.data_port(), 0);
    let tunnel = Client::new(broker.endpoint()).new_tunnel("127.0.0.1", closed_port());

    tunnel.open_as("myapp").await.expect("Failed to open tunnel");

    assert_eq!(broker.requests(), vec!["/myapp".to_string()]);
    assert_eq!(tunnel.subdomain(), "myapp");
    assert_eq!(tunnel.url(), "https://myapp.example.com");

    tunnel.close();
}

#[tokio::test]
async fn test_zero_max_conn_never_dials() {
    init_test();

    let broker = MockBroker::start_with_max_conn(0).await;
    let local_port = closed_port();
    let tunnel = Client::new(broker.endpoint()).new_tunnel("127.0.0.1", local_port);

    tunnel.open().await.expect("Failed to open tunnel");

    assert!(!tunnel.url().is_empty());
    assert_eq!(tunnel.max_conn(), 0);
    assert!(broker.accept(Duration::from_millis(300)).await.is_none());
    assert_eq!(broker.accepted_count(), 0);
    assert_eq!(tunnel.active_connections(), 0);
    assert!(!tunnel.closing().is_closed());

    tunnel.close();
    assert_not_connected(&tunnel, local_port);
}

#[tokio::test]
async fn test_malformed_response_is_decode_error() {
    init_test();

    let broker = MockBroker::start().await;
    broker.set_raw_reply(StatusCode::OK, "<html>not json</html>");
    let local_port = closed_port();
    let tunnel = Client::new(broker.endpoint()).new_tunnel("127.0.0.1", local_port);

    let err = tunnel.open().await.unwrap_err();
    assert!(matches!(err, TunnelError::Decode(_)), "{:?}", err);
    assert_not_connected(&tunnel, local_port);
    assert!(broker.accept(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_rejected_registration() {
    init_test();

    let broker = MockBroker::start().await;
    broker.set_raw_reply(
        StatusCode::FORBIDDEN,
        r#"{"message":"Subdomain myapp is not available"}"#,
    );
    let local_port = closed_port();
    let tunnel = Client::new(broker.endpoint()).new_tunnel("127.0.0.1", local_port);

    match tunnel.open_as("myapp").await {
        Err(TunnelError::Rejected { status, message }) => {
            assert_eq!(status, 403);
            assert_eq!(message, "Subdomain myapp is not available");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_not_connected(&tunnel, local_port);
}

#[tokio::test]
async fn test_unreachable_broker_is_registration_error() {
    init_test();

    let local_port = closed_port();
    let tunnel = Client::new(format!("http://127.0.0.1:{}", closed_port()))
        .new_tunnel("127.0.0.1", local_port);

    let err = tunnel.open().await.unwrap_err();
    assert!(matches!(err, TunnelError::Registration(_)), "{:?}", err);
    assert_not_connected(&tunnel, local_port);
}

#[tokio::test]
async fn test_remote_dial_failure_closes_tunnel() {
    init_test();

    let service = MockTcpService::start().await;
    let broker = MockBroker::start().await;
    broker.set_registration("abc123", "https://abc123.example.com", closed_port(), 2);
    let tunnel = Client::new(broker.endpoint()).new_tunnel("127.0.0.1", service.port());

    let closing = tunnel.closing();
    tunnel.open().await.expect("Open succeeds before any dial");

    tokio::time::timeout(WAIT, closing)
        .await
        .expect("Tunnel should close after a dial failure");
    assert_not_connected(&tunnel, service.port());
    assert_eq!(service.connection_count(), 0);
}

#[tokio::test]
async fn test_local_dial_failure_closes_tunnel() {
    init_test();

    let broker = MockBroker::start_with_max_conn(1).await;
    let local_port = closed_port();
    let tunnel = Client::new(broker.endpoint()).new_tunnel("127.0.0.1", local_port);

    tunnel.open().await.expect("Failed to open tunnel");

    tokio::time::timeout(WAIT, tunnel.closing())
        .await
        .expect("Tunnel should close after a dial failure");
    assert_not_connected(&tunnel, local_port);

    // The broker side of the failed circuit is released too
    let mut remote = broker.accept(WAIT).await.expect("Remote was dialed first");
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, remote.read(&mut buf))
        .await
        .expect("Read timeout")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_open_twice_is_rejected() {
    init_test();

    let broker = MockBroker::start_with_max_conn(0).await;
    let tunnel = Client::new(broker.endpoint()).new_tunnel("127.0.0.1", closed_port());

    tunnel.open().await.expect("Failed to open tunnel");
    let err = tunnel.open().await.unwrap_err();
    assert!(matches!(err, TunnelError::AlreadyOpen), "{:?}", err);
    assert_eq!(broker.requests().len(), 1);
    assert!(tunnel.is_open());

    tunnel.close();
}

#[tokio::test]
async fn test_reopen_after_close_gets_fresh_signal() {
    init_test();

    let broker = MockBroker::start_with_max_conn(0).await;
    let tunnel = Client::new(broker.endpoint()).new_tunnel("127.0.0.1", closed_port());

    let early = tunnel.closing();
    tunnel.open().await.expect("Failed to open tunnel");
    tunnel.close();
    assert!(early.is_closed());

    tunnel.open().await.expect("Failed to reopen tunnel");
    let current = tunnel.closing();
    assert!(!current.is_closed());
    assert_eq!(tunnel.url(), "https://abc123.example.com");

    // A second close before reopening must not fire anything twice
    tunnel.close();
    tunnel.close();
    assert!(current.is_closed());
    assert!(!tunnel.is_open());
}

#[tokio::test]
async fn test_close_during_registration_is_not_lost() {
    init_test();

    let broker = MockBroker::start_with_max_conn(1).await;
    broker.set_reply_delay(Duration::from_millis(300));
    let local_port = closed_port();
    let tunnel = Client::new(broker.endpoint()).new_tunnel("127.0.0.1", local_port);
    let closing = tunnel.closing();

    let opener = tunnel.clone();
    let open = tokio::spawn(async move { opener.open().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.requests().len(), 1, "registration should be in flight");
    tunnel.close();

    tokio::time::timeout(WAIT, open)
        .await
        .expect("Open timeout")
        .expect("Open task panicked")
        .expect("Registration itself succeeds");

    assert!(closing.is_closed());
    assert!(tunnel.closing().is_closed());
    assert_not_connected(&tunnel, local_port);
    assert!(broker.accept(Duration::from_millis(300)).await.is_none());
    assert_eq!(tunnel.stats().dials(), 0);

    // The tunnel can still be opened afterwards
    broker.set_reply_delay(Duration::ZERO);
    broker.set_registration("abc123", "https://abc123.example.com", broker.data_port(), 0);
    tunnel.open().await.expect("Failed to reopen tunnel");
    assert!(tunnel.is_open());
    assert!(!tunnel.closing().is_closed());
    tunnel.close();
}

#[tokio::test]
async fn test_dropping_tunnel_closes_session() {
    init_test();

    let service = MockTcpService::start().await;
    let broker = MockBroker::start_with_max_conn(1).await;
    let tunnel = Client::new(broker.endpoint()).new_tunnel("127.0.0.1", service.port());

    tunnel.open().await.expect("Failed to open tunnel");
    let closing = tunnel.closing();
    let mut remote = broker.accept(WAIT).await.expect("Connection");

    drop(tunnel);

    tokio::time::timeout(WAIT, closing)
        .await
        .expect("Dropping the tunnel fires the close notification");
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, remote.read(&mut buf))
        .await
        .expect("Read timeout")
        .unwrap_or(0);
    assert_eq!(n, 0);
}
