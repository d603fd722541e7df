//! Client library for localtunnel-compatible brokers.
//!
//! Exposes a local TCP server through a public URL: the tunnel registers
//! with a broker, then keeps a pool of connections that relay bytes between
//! the broker and the local server.
//!
//! ```no_run
//! # async fn run() -> Result<(), localtunnel::TunnelError> {
//! let tunnel = localtunnel::new_local_tunnel(8000);
//! tunnel.open().await?;
//! println!("your url is: {}", tunnel.url());
//!
//! tunnel.close();
//! tunnel.closing().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod error;
mod pool;
mod registration;
mod relay;
mod tunnel;

pub use client::{default_client, new_local_tunnel, new_tunnel, Client, DEFAULT_ENDPOINT};
pub use config::{ClientConfig, ClientOptions, DEFAULT_LOCAL_HOST};
pub use connection::PoolStats;
pub use error::{RelayError, RelayErrorKind, Side, TunnelError};
pub use registration::{RegistrationResponse, NEW_SUBDOMAIN};
pub use relay::{ByteRelay, RELAY_BUFFER_SIZE};
pub use tunnel::{Closing, Tunnel};
