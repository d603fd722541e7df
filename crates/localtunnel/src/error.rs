use std::fmt;
use std::io;

use thiserror::Error;

/// Which end of a connection a dial or relay refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The broker's data-plane address
    Remote,
    /// The local server being exposed
    Local,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Remote => f.write_str("remote"),
            Side::Local => f.write_str("local"),
        }
    }
}

/// Errors for tunnel operations
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Registration request failed: {0}")]
    Registration(#[from] reqwest::Error),

    #[error("Malformed registration response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Broker rejected registration ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid broker endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Tunnel is already open")]
    AlreadyOpen,

    #[error("Failed to dial {target} server at {addr}: {source}")]
    Dial {
        target: Side,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Dial to {target} server at {addr} timed out")]
    DialTimeout { target: Side, addr: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Why a relaying connection stopped
#[derive(Debug)]
pub enum RelayErrorKind {
    /// The peer closed its end
    Eof,
    Read(io::Error),
    Write(io::Error),
    /// Neither socket carried bytes within the configured read timeout
    Timeout,
}

/// A failure on one socket of a relaying connection
#[derive(Debug, Error)]
#[error("{side} socket {kind}")]
pub struct RelayError {
    pub side: Side,
    pub kind: RelayErrorKind,
}

impl RelayError {
    pub fn new(side: Side, kind: RelayErrorKind) -> Self {
        Self { side, kind }
    }
}

impl fmt::Display for RelayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayErrorKind::Eof => f.write_str("closed by peer"),
            RelayErrorKind::Read(e) => write!(f, "read failed: {}", e),
            RelayErrorKind::Write(e) => write!(f, "write failed: {}", e),
            RelayErrorKind::Timeout => f.write_str("idle timed out"),
        }
    }
}
