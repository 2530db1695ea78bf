//! Typed dispositions covering every non-2xx way a connection can end.
//! These are used internally for matching and logging; nothing here is
//! ever surfaced across the dispatcher boundary.

use thiserror::Error;

/// The ways a connection unit can end up short of a normal `200`/cache response.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("timed out waiting for request")]
    RequestTimeout,

    #[error("host {host} blocked by policy")]
    Blocked { host: String },

    #[error("could not connect to origin {host}:{port}: {source}")]
    OriginConnectFailure {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out capturing response from {host}:{port}")]
    CaptureTimeout { host: String, port: u16 },

    #[error("tunnel peer reset the connection")]
    TunnelPeerReset,

    #[error("response not cacheable: {0}")]
    CacheInsertRejected(&'static str),

    #[error("policy entry rejected during canonicalization: {0}")]
    PolicyCanonicalizationReject(String),
}

impl ProxyError {
    /// The HTTP status code a client should see for this disposition, where
    /// one applies (tunnel-peer-reset and cache rejections are silent).
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::BadRequest(_) => 400,
            ProxyError::RequestTimeout => 408,
            ProxyError::Blocked { .. } => 403,
            ProxyError::OriginConnectFailure { .. } => 502,
            ProxyError::CaptureTimeout { .. } => 504,
            ProxyError::TunnelPeerReset => 0,
            ProxyError::CacheInsertRejected(_) => 0,
            ProxyError::PolicyCanonicalizationReject(_) => 0,
        }
    }
}
