use std::sync::LazyLock;

use crate::config::{ClientOptions, DEFAULT_LOCAL_HOST};
use crate::tunnel::Tunnel;

/// Public localtunnel broker
pub const DEFAULT_ENDPOINT: &str = "https://localtunnel.me";

/// Built on first use, never mutated afterwards
static DEFAULT_CLIENT: LazyLock<Client> = LazyLock::new(|| Client::new(DEFAULT_ENDPOINT));

/// A localtunnel client bound to one broker endpoint
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: String,
    options: ClientOptions,
    http: reqwest::Client,
}

impl Client {
    /// Create a client for the broker at `endpoint` with default timeouts
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_options(endpoint, ClientOptions::default())
    }

    pub fn with_options(endpoint: impl Into<String>, options: ClientOptions) -> Self {
        Self {
            endpoint: endpoint.into(),
            options,
            http: reqwest::Client::builder()
                .user_agent(concat!("localtunnel-rs/", env!("CARGO_PKG_VERSION")))
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Create a tunnel for a server at the given host and port
    pub fn new_tunnel(&self, host: impl Into<String>, port: u16) -> Tunnel {
        Tunnel::new(self.clone(), host.into(), port)
    }

    /// Create a tunnel for a server on localhost
    pub fn new_local_tunnel(&self, port: u16) -> Tunnel {
        self.new_tunnel(DEFAULT_LOCAL_HOST, port)
    }
}

/// The process-wide client bound to [`DEFAULT_ENDPOINT`]
pub fn default_client() -> &'static Client {
    &DEFAULT_CLIENT
}

/// Create a tunnel through the default client
pub fn new_tunnel(host: impl Into<String>, port: u16) -> Tunnel {
    default_client().new_tunnel(host, port)
}

/// Create a tunnel to localhost through the default client
pub fn new_local_tunnel(port: u16) -> Tunnel {
    default_client().new_local_tunnel(port)
}
