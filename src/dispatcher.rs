//! Connection Dispatcher (C6): the per-accepted-socket pipeline tying
//! parsing, policy, forwarding and tunneling together, and the single place
//! that emits the observer log line for every disposition.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

use crate::blocked::generate_blocked_response;
use crate::config::IDLE_TIMEOUT;
use crate::error::ProxyError;
use crate::forwarder;
use crate::observer::{self, Action};
use crate::request;
use crate::state::AppState;
use crate::tunnel;

/// Drives one client connection end to end. Always returns once the
/// connection is done with, regardless of how it ended; the caller (the
/// accept loop in `main`) just drops the socket afterwards.
pub async fn dispatch(mut client: TcpStream, peer: String, state: AppState) {
    let parsed = timeout(IDLE_TIMEOUT, request::parse_request(&mut client)).await;

    let req = match parsed {
        Ok(Ok(req)) => req,
        Ok(Err(err)) => {
            let status = err.status_code();
            let _ = client
                .write_all(format!("HTTP/1.1 {status} {}\r\n\r\n", reason_phrase(status)).as_bytes())
                .await;
            observer::log_request(&peer, "-", 0, "-", Action::Allowed, status, 0);
            return;
        }
        Err(_) => {
            let err = ProxyError::RequestTimeout;
            let status = err.status_code();
            let _ = client
                .write_all(format!("HTTP/1.1 {status} {}\r\n\r\n", reason_phrase(status)).as_bytes())
                .await;
            observer::log_request(&peer, "-", 0, "-", Action::Allowed, status, 0);
            return;
        }
    };

    let request_line = req.request_line();

    if state.policy.is_blocked(&req.host) {
        let err = ProxyError::Blocked {
            host: req.host.clone(),
        };
        warn!(host = %req.host, "{err}");
        let response = generate_blocked_response(&req.headers);
        let len = response.len();
        let _ = client.write_all(&response).await;
        let _ = client.flush().await;
        state.metrics.record_request(&req.host, true);
        observer::log_request(
            &peer,
            &req.host,
            req.port,
            &request_line,
            Action::Blocked,
            err.status_code(),
            len,
        );
        return;
    }

    state.metrics.record_request(&req.host, false);

    if req.is_connect() {
        let outcome = tunnel::handle_connect(&mut client, &req).await;
        observer::log_request(
            &peer,
            &req.host,
            req.port,
            &request_line,
            outcome.action,
            outcome.status_code,
            0,
        );
        return;
    }

    let outcome = forwarder::handle_http(&mut client, &req, &state).await;
    observer::log_request(
        &peer,
        &req.host,
        req.port,
        &request_line,
        outcome.action,
        outcome.status_code,
        outcome.bytes_transferred,
    );
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        408 => "Request Timeout",
        403 => "Forbidden",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

/// Used by tests that need a bare `Request` without going through the wire
/// parser.
#[cfg(test)]
fn dummy_request(method: &str, host: &str, port: u16) -> request::Request {
    use crate::request::Headers;
    request::Request {
        method: method.to_string(),
        target: "/".to_string(),
        path: Some("/".to_string()),
        version: "HTTP/1.1".to_string(),
        headers: Headers(vec![("Host".to_string(), format!("{host}:{port}"))]),
        body: vec![],
        host: host.to_string(),
        port,
    }
}
