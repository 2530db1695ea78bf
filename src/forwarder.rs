//! Forwarder (C4): serves a cache hit, or opens an origin connection,
//! reserializes the request, captures + streams the response, and feeds the
//! cache.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

use crate::cache::CacheKey;
use crate::config::IDLE_TIMEOUT;
use crate::error::ProxyError;
use crate::observer::Action;
use crate::request::Request;
use crate::state::AppState;

const CAPTURE_CHUNK: usize = 8192;

/// Outcome used only to drive the observer log line; the client has already
/// received whatever bytes were appropriate by the time this returns.
pub struct ForwardOutcome {
    pub action: Action,
    pub status_code: u16,
    pub bytes_transferred: usize,
}

pub async fn handle_http(
    client: &mut TcpStream,
    req: &Request,
    state: &AppState,
) -> ForwardOutcome {
    let path = req.path.as_deref().unwrap_or(&req.target);
    let key = CacheKey::new(&req.method, &req.host, path);

    if let Some(entry) = state.cache.get(&key, &req.headers).await {
        let _ = client.write_all(&entry.response_bytes).await;
        let _ = client.flush().await;
        return ForwardOutcome {
            action: Action::Cached,
            status_code: 200,
            bytes_transferred: entry.response_bytes.len(),
        };
    }

    let origin = match timeout(
        IDLE_TIMEOUT,
        TcpStream::connect((req.host.as_str(), req.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return origin_connect_failure(client, &req.host, req.port, source).await,
        Err(_) => {
            let source = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
            return origin_connect_failure(client, &req.host, req.port, source).await;
        }
    };

    let (mut origin_read, mut origin_write) = origin.into_split();

    let request_bytes = req.to_wire_bytes();
    if let Err(source) = origin_write.write_all(&request_bytes).await {
        return origin_connect_failure(client, &req.host, req.port, source).await;
    }

    let mut captured = Vec::new();
    let mut timed_out = false;
    let mut capture_failed = false;
    loop {
        let mut chunk = [0u8; CAPTURE_CHUNK];
        match timeout(IDLE_TIMEOUT, origin_read.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if client.write_all(&chunk[..n]).await.is_err() {
                    break;
                }
                captured.extend_from_slice(&chunk[..n]);
            }
            Ok(Err(_)) => {
                // A step-4 exception other than a timeout: abandon capture
                // entirely rather than cache a truncated response.
                capture_failed = true;
                break;
            }
            Err(_) => {
                let err = ProxyError::CaptureTimeout {
                    host: req.host.clone(),
                    port: req.port,
                };
                warn!(host = %req.host, port = req.port, "{err}");
                timed_out = true;
                break;
            }
        }
    }
    let _ = client.flush().await;

    if !timed_out && !capture_failed && !captured.is_empty() {
        state.cache.put(&key, &req.headers, &captured).await;
    }

    ForwardOutcome {
        action: Action::Allowed,
        status_code: if timed_out { 504 } else { 200 },
        bytes_transferred: captured.len(),
    }
}

/// Writes the synthesized `502 Bad Gateway` for an origin the proxy could
/// not connect to or send the reserialized request to, and logs the
/// disposition through the typed `OriginConnectFailure` error.
async fn origin_connect_failure(
    client: &mut TcpStream,
    host: &str,
    port: u16,
    source: io::Error,
) -> ForwardOutcome {
    let err = ProxyError::OriginConnectFailure {
        host: host.to_string(),
        port,
        source,
    };
    warn!(host = %host, port, "{err}");
    let _ = client
        .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
        .await;
    ForwardOutcome {
        action: Action::Allowed,
        status_code: err.status_code(),
        bytes_transferred: 0,
    }
}
