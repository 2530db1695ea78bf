//! Tunnel Relay (C5): after a CONNECT handshake, bidirectionally pipes bytes
//! between client and origin until one side closes. No caching, no content
//! inspection — the payload is opaque by design.

use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::IDLE_TIMEOUT;
use crate::error::ProxyError;
use crate::observer::Action;
use crate::request::Request;

const RELAY_CHUNK: usize = 4096;

pub struct TunnelOutcome {
    pub action: Action,
    pub status_code: u16,
}

pub async fn handle_connect(client: &mut TcpStream, req: &Request) -> TunnelOutcome {
    let origin = match timeout(
        IDLE_TIMEOUT,
        TcpStream::connect((req.host.as_str(), req.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            let err = ProxyError::OriginConnectFailure {
                host: req.host.clone(),
                port: req.port,
                source,
            };
            warn!(host = %req.host, port = req.port, "{err}");
            let _ = client
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await;
            return TunnelOutcome {
                action: Action::Allowed,
                status_code: err.status_code(),
            };
        }
        Err(_) => {
            let err = ProxyError::OriginConnectFailure {
                host: req.host.clone(),
                port: req.port,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            };
            warn!(host = %req.host, port = req.port, "{err}");
            let _ = client
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await;
            return TunnelOutcome {
                action: Action::Allowed,
                status_code: err.status_code(),
            };
        }
    };

    if client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .is_err()
    {
        return TunnelOutcome {
            action: Action::Allowed,
            status_code: 200,
        };
    }
    let _ = client.flush().await;

    let (mut client_read, mut client_write) = client.split();
    let (mut origin_read, mut origin_write) = origin.into_split();

    let client_to_origin = pipe(&mut client_read, &mut origin_write);
    let origin_to_client = pipe(&mut origin_read, &mut client_write);

    tokio::join!(client_to_origin, origin_to_client);

    TunnelOutcome {
        action: Action::Allowed,
        status_code: 200,
    }
}

/// One direction of the relay: read up to 4 KiB, write it, drain, repeat
/// until EOF or an error (peer reset / broken pipe count as a normal end).
async fn pipe<R, W>(reader: &mut R, writer: &mut W)
where
    R: io::AsyncRead + Unpin,
    W: io::AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => {
                debug!("{}", ProxyError::TunnelPeerReset);
                break;
            }
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Headers;
    use tokio::net::TcpListener;

    fn connect_request(host: String, port: u16) -> Request {
        Request {
            method: "CONNECT".to_string(),
            target: format!("{host}:{port}"),
            path: None,
            version: "HTTP/1.1".to_string(),
            headers: Headers(vec![]),
            body: vec![],
            host,
            port,
        }
    }

    #[tokio::test]
    async fn relays_bytes_both_directions_until_close() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = origin_listener.accept().await {
                let mut buf = [0u8; 16];
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"ping");
                sock.write_all(b"pong").await.unwrap();
            }
        });

        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let client_task = tokio::spawn(async move { TcpStream::connect(client_addr).await });
        let (mut server_side, _) = client_listener.accept().await.unwrap();
        let mut client_side = client_task.await.unwrap().unwrap();

        let req = connect_request(origin_addr.ip().to_string(), origin_addr.port());
        let relay_task = tokio::spawn(async move {
            handle_connect(&mut server_side, &req).await;
        });

        let mut handshake = [0u8; 64];
        let n = client_side.read(&mut handshake).await.unwrap();
        assert!(String::from_utf8_lossy(&handshake[..n]).starts_with("HTTP/1.1 200"));

        client_side.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 16];
        let n = client_side.read(&mut reply).await.unwrap();
        assert_eq!(&reply[..n], b"pong");

        client_side.shutdown().await.unwrap();
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_origin_yields_502_and_no_tunnel() {
        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let client_task = tokio::spawn(async move { TcpStream::connect(client_addr).await });
        let (mut server_side, _) = client_listener.accept().await.unwrap();
        let mut client_side = client_task.await.unwrap().unwrap();

        let req = connect_request("127.0.0.1".to_string(), 1);
        let outcome = handle_connect(&mut server_side, &req).await;
        assert_eq!(outcome.status_code, 502);

        let mut buf = [0u8; 64];
        let n = client_side.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("502 Bad Gateway"));
    }
}
