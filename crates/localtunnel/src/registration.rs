//! Registration handshake with the broker
//!
//! `GET {endpoint}/{subdomain}` (or `{endpoint}/?new` for a random one)
//! answers with a JSON object describing the session.

use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

use crate::error::TunnelError;

/// Subdomain request asking the broker to pick a random subdomain
pub const NEW_SUBDOMAIN: &str = "?new";

/// Body returned by the broker. Absent fields decode as zero values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegistrationResponse {
    /// Assigned subdomain
    pub id: String,
    /// Public URL of the tunnel
    pub url: String,
    /// Broker data-plane port
    pub port: u16,
    /// Number of data-plane connections to keep open
    pub max_conn_count: usize,
    /// Error text, set by the broker when it refuses a request
    pub message: Option<String>,
}

/// Outcome of a successful handshake
#[derive(Debug, Clone)]
pub(crate) struct Registration {
    /// Host actually answered the request, after redirects
    pub remote_host: String,
    pub response: RegistrationResponse,
}

pub(crate) fn registration_url(endpoint: &str, request: &str) -> Result<Url, TunnelError> {
    let raw = format!("{}/{}", endpoint.trim_end_matches('/'), request);
    let url = Url::parse(&raw).map_err(|e| TunnelError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;

    if url.host_str().is_none() {
        return Err(TunnelError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(url)
}

/// Host part of a URL in a form `TcpStream::connect` accepts
pub(crate) fn dial_host(url: &Url) -> String {
    url.host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

/// Perform the registration handshake
pub(crate) async fn register(
    http: &reqwest::Client,
    endpoint: &str,
    request: &str,
    timeout: Option<Duration>,
) -> Result<Registration, TunnelError> {
    let url = registration_url(endpoint, request)?;

    tracing::debug!("Registering tunnel: GET {}", url);

    let mut builder = http.get(url);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    let response = builder.send().await?;
    let status = response.status();
    let remote_host = dial_host(response.url());
    let body = response.bytes().await?;

    if !status.is_success() {
        let message = serde_json::from_slice::<RegistrationResponse>(&body)
            .ok()
            .and_then(|r| r.message)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
        return Err(TunnelError::Rejected {
            status: status.as_u16(),
            message,
        });
    }

    let response: RegistrationResponse = serde_json::from_slice(&body)?;

    tracing::debug!(
        "Registration accepted: id={} port={} max_conn_count={}",
        response.id,
        response.port,
        response.max_conn_count
    );

    Ok(Registration {
        remote_host,
        response,
    })
}
