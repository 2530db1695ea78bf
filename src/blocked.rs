//! Synthesizes the `403 Forbidden` artifact. Media type
//! depends on the request's `User-Agent`: terminal tools (`curl`, `wget`)
//! get a plain-text body so it doesn't look ugly dumped straight to a
//! terminal; everything else gets a minimal HTML page.

use crate::request::Headers;

const PLAIN_BODY: &[u8] = b"403 Forbidden\nAccess blocked by proxy server.\n";
const HTML_BODY: &[u8] = b"<!DOCTYPE html>\n<html>\n<head><title>403 Forbidden</title></head>\n<body>\n<h1>403 Forbidden</h1>\n<p>Access to this resource has been blocked by the proxy server.</p>\n</body>\n</html>";

pub fn generate_blocked_response(headers: &Headers) -> Vec<u8> {
    let user_agent = headers.get("User-Agent").unwrap_or("").to_lowercase();
    let is_terminal = user_agent.contains("curl") || user_agent.contains("wget");

    let (body, content_type): (&[u8], &str) = if is_terminal {
        (PLAIN_BODY, "text/plain")
    } else {
        (HTML_BODY, "text/html; charset=utf-8")
    };

    let mut response = format!(
        "HTTP/1.1 403 Forbidden\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        content_type,
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}
