//! HTTP Request Parser (C2). Reads a proxy-style HTTP/1.x request off a byte
//! stream, derives host/port/path, and keeps enough of the original framing
//! (header insertion order) to reserialize byte-for-byte downstream.

use bytes::BytesMut;
use tokio::io::AsyncReadExt;

use crate::error::ProxyError;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;

/// Header list that preserves the client's original insertion order (and
/// duplicates) for reserialization, while offering case-insensitive,
/// last-wins lookup the way the cacheability gates need it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(pub Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub path: Option<String>,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub host: String,
    pub port: u16,
}

impl Request {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// `METHOD target HTTP/x.y` the way it is logged.
    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.target, self.version)
    }

    /// Reserializes the request (method + path + version + headers in
    /// original order + body) for forwarding to the origin.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let path = self.path.as_deref().unwrap_or(&self.target);
        let mut out = Vec::with_capacity(self.body.len() + 256);
        out.extend_from_slice(format!("{} {} {}\r\n", self.method, path, self.version).as_bytes());
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Reads and parses one request from `stream`. The caller is responsible for
/// wrapping this in the 45s dispatcher-level deadline; this function
/// itself performs no timing.
pub async fn parse_request<R>(stream: &mut R) -> Result<Request, ProxyError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let header_end = loop {
        if let Some(pos) = find_header_terminator(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(ProxyError::BadRequest("header block too large".into()));
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ProxyError::BadRequest(format!("read error: {e}")))?;
        if n == 0 {
            return Err(ProxyError::BadRequest(
                "connection closed before headers completed".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_bytes = buf.split_to(header_end + 4);
    let body_prefix = buf; // whatever arrived past the header terminator

    let (request_line, header_lines) = split_header_lines(&header_bytes[..header_end])?;
    let (method, target, version) = parse_request_line(&request_line)?;
    let headers = parse_header_lines(&header_lines);

    let (host, port, path, body) = if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_authority(&target, None)
            .ok_or_else(|| ProxyError::BadRequest("invalid CONNECT target".into()))?;
        (host, port, None, Vec::new())
    } else if let Some(rest) = strip_scheme(&target) {
        let (authority, path) = split_authority_and_path(rest);
        let default_port = if target.starts_with("https://") {
            443
        } else {
            80
        };
        let (host, port) = split_authority(&authority, Some(default_port))
            .ok_or_else(|| ProxyError::BadRequest("invalid absolute-form target".into()))?;
        let body =
            read_body(stream, &headers, body_prefix.to_vec()).await?;
        (host, port, Some(path), body)
    } else {
        let host_header = headers
            .get("Host")
            .ok_or_else(|| ProxyError::BadRequest("missing Host header".into()))?
            .to_string();
        let (host, port) = split_authority(&host_header, Some(80))
            .ok_or_else(|| ProxyError::BadRequest("invalid Host header".into()))?;
        let body =
            read_body(stream, &headers, body_prefix.to_vec()).await?;
        (host, port, Some(target.clone()), body)
    };

    Ok(Request {
        method: method.to_ascii_uppercase(),
        target,
        path,
        version,
        headers,
        body,
        host: host.to_ascii_lowercase(),
        port,
    })
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn split_header_lines(header_bytes: &[u8]) -> Result<(String, Vec<String>), ProxyError> {
    let text = String::from_utf8_lossy(header_bytes);
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| ProxyError::BadRequest("empty request".into()))?
        .to_string();
    let rest: Vec<String> = lines.map(|s| s.to_string()).filter(|s| !s.is_empty()).collect();
    Ok((request_line, rest))
}

fn parse_request_line(line: &str) -> Result<(String, String, String), ProxyError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(ProxyError::BadRequest(format!(
            "request line must have 3 tokens, got {}",
            parts.len()
        )));
    }
    Ok((parts[0].to_string(), parts[1].to_string(), parts[2].to_string()))
}

fn parse_header_lines(lines: &[String]) -> Headers {
    let mut headers = Vec::with_capacity(lines.len());
    for line in lines {
        if let Some(idx) = line.find(':') {
            let name = line[..idx].trim().to_string();
            let value = line[idx + 1..].trim().to_string();
            headers.push((name, value));
        }
    }
    Headers(headers)
}

/// Strips a recognized scheme prefix, returning the remainder (`host[:port][/path]`).
fn strip_scheme(target: &str) -> Option<&str> {
    target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
}

/// Splits `host[:port][/path][?query]` into (authority, path), where path is
/// normalized to always start with `/` — including the query-only case
/// (`host?x=1` has no `/`, so the path is synthesized as `/?x=1`).
fn split_authority_and_path(rest: &str) -> (String, String) {
    match rest.find(['/', '?']) {
        Some(idx) if rest.as_bytes()[idx] == b'/' => {
            (rest[..idx].to_string(), rest[idx..].to_string())
        }
        Some(idx) => (rest[..idx].to_string(), format!("/{}", &rest[idx..])),
        None => (rest.to_string(), "/".to_string()),
    }
}

/// Splits `host[:port]` into (host, port), applying `default_port` when no
/// port is present. Returns `None` on a non-numeric or empty host/port.
fn split_authority(authority: &str, default_port: Option<u16>) -> Option<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }
    match authority.rfind(':') {
        Some(idx) => {
            let host = &authority[..idx];
            let port_str = &authority[idx + 1..];
            if host.is_empty() {
                return None;
            }
            let port: u16 = port_str.parse().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((authority.to_string(), default_port?)),
    }
}

async fn read_body<R>(
    stream: &mut R,
    headers: &Headers,
    mut body: Vec<u8>,
) -> Result<Vec<u8>, ProxyError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let content_length: usize = headers
        .get("Content-Length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    while body.len() < content_length {
        let remaining = content_length - body.len();
        let mut chunk = vec![0u8; remaining.min(READ_CHUNK)];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ProxyError::BadRequest(format!("read error reading body: {e}")))?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn parse(bytes: &[u8]) -> Result<Request, ProxyError> {
        let mut cursor = Cursor::new(bytes.to_vec());
        parse_request(&mut cursor).await
    }

    #[tokio::test]
    async fn origin_form_uses_host_header() {
        let req = parse(b"GET /path?x=1 HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.host, "example.test");
        assert_eq!(req.port, 80);
        assert_eq!(req.path.as_deref(), Some("/path?x=1"));
    }

    #[tokio::test]
    async fn origin_form_missing_host_is_bad_request() {
        let err = parse(b"GET / HTTP/1.1\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }

    #[tokio::test]
    async fn absolute_form_overrides_host_header() {
        let req = parse(
            b"GET http://example.test:8080/a?b=c HTTP/1.1\r\nHost: other.test\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(req.host, "example.test");
        assert_eq!(req.port, 8080);
        assert_eq!(req.path.as_deref(), Some("/a?b=c"));
    }

    #[tokio::test]
    async fn absolute_form_https_defaults_to_443() {
        let req = parse(b"GET https://example.test/ HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.port, 443);
        assert_eq!(req.path.as_deref(), Some("/"));
    }

    #[tokio::test]
    async fn absolute_form_query_without_path_gets_synthesized_slash() {
        let req = parse(b"GET http://example.test?x=1 HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.host, "example.test");
        assert_eq!(req.port, 80);
        assert_eq!(req.path.as_deref(), Some("/?x=1"));
    }

    #[tokio::test]
    async fn absolute_form_query_without_path_keeps_explicit_port() {
        let req = parse(b"GET http://example.test:8080?x=1 HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.host, "example.test");
        assert_eq!(req.port, 8080);
        assert_eq!(req.path.as_deref(), Some("/?x=1"));
    }

    #[tokio::test]
    async fn connect_parses_authority_form() {
        let req = parse(b"CONNECT secure.test:443 HTTP/1.1\r\nHost: secure.test:443\r\n\r\n")
            .await
            .unwrap();
        assert!(req.is_connect());
        assert_eq!(req.host, "secure.test");
        assert_eq!(req.port, 443);
        assert!(req.path.is_none());
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let req = parse(b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        assert_eq!(req.body, b"hello");
    }

    #[tokio::test]
    async fn bad_request_line_token_count() {
        let err = parse(b"GET /\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }

    #[tokio::test]
    async fn empty_stream_is_bad_request() {
        let err = parse(b"").await.unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }

    #[tokio::test]
    async fn duplicate_headers_preserved_in_order() {
        let req = parse(
            b"GET / HTTP/1.1\r\nHost: x\r\nX-A: 1\r\nX-A: 2\r\n\r\n",
        )
        .await
        .unwrap();
        let dups: Vec<&str> = req
            .headers
            .iter()
            .filter(|(k, _)| k == "X-A")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(dups, vec!["1", "2"]);
        // last-wins lookup
        assert_eq!(req.headers.get("X-A"), Some("2"));
    }

    #[test]
    fn reserialize_round_trip_preserves_header_order() {
        let headers = Headers(vec![
            ("Host".to_string(), "example.test".to_string()),
            ("X-A".to_string(), "1".to_string()),
            ("X-A".to_string(), "2".to_string()),
        ]);
        let req = Request {
            method: "GET".to_string(),
            target: "/path".to_string(),
            path: Some("/path".to_string()),
            version: "HTTP/1.1".to_string(),
            headers,
            body: vec![],
            host: "example.test".to_string(),
            port: 80,
        };
        let wire = req.to_wire_bytes();
        let text = String::from_utf8(wire).unwrap();
        assert_eq!(
            text,
            "GET /path HTTP/1.1\r\nHost: example.test\r\nX-A: 1\r\nX-A: 2\r\n\r\n"
        );
    }
}
