//! Plaintext port-80 handler: read one chunk, parse the request line and
//! `Host:` header, reply with a 301. Deliberately brittle (SPEC_FULL.md
//! §4.4 / §9 open question): if the Host header doesn't arrive in the
//! first read, the connection is dropped rather than buffered further.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

const SERVER_TAG: &str = "snigate";
const READ_BUF_LEN: usize = 8192;

pub async fn serve_redirect(listener: TcpListener) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("port-80 accept failed: {e}");
                continue;
            }
        };
        tokio::spawn(async move {
            if let Err(e) = handle_redirect(stream).await {
                debug!("port-80 connection from {addr} closed: {e}");
            }
        });
    }
}

async fn handle_redirect(mut stream: TcpStream) -> std::io::Result<()> {
    let mut buf = vec![0u8; READ_BUF_LEN];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }
    buf.truncate(n);

    match parse_request(&buf) {
        Some((url, host)) => {
            let host = strip_port(&host);
            let response = format!(
                "HTTP/1.1 301 Moved permanently\r\n\
                 Location: https://{host}{url}\r\n\
                 Content-Length: 0\r\n\
                 Server: {SERVER_TAG}\r\n\
                 \r\n"
            );
            stream.write_all(response.as_bytes()).await?;
            stream.flush().await?;
        }
        None => {
            // Parse failure: close without writing (SPEC_FULL.md §4.4).
        }
    }
    Ok(())
}

/// Strips a trailing `:<port>` from a `Host:` header value. The redirect
/// always targets the HTTPS default port, so a port carried over from the
/// plaintext port-80 request (e.g. `a.example:80`) would be wrong to echo
/// back verbatim. IPv6 literals (`[::1]:80`) keep their brackets intact.
fn strip_port(host: &str) -> &str {
    if let Some(bracket_end) = host.rfind(']') {
        return &host[..=bracket_end];
    }
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

/// Splits the first chunk on CRLF, validates `<METHOD> <URL> <rest>`, and
/// finds the first `host:` header (case-insensitive prefix match).
fn parse_request(data: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.splitn(3, ' ');
    let _method = parts.next()?;
    let url = parts.next()?;
    let _rest = parts.next()?;

    for line in lines {
        if let Some(rest) = line
            .get(..line.len().min(5))
            .filter(|prefix| prefix.to_ascii_lowercase() == "host:")
        {
            let _ = rest;
            let value = line[5..].trim();
            return Some((url.to_string(), value.to_string()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_method_url_and_host() {
        let request = b"GET /foo HTTP/1.1\r\nHost: a.example:80\r\n\r\n";
        let (url, host) = parse_request(request).unwrap();
        assert_eq!(url, "/foo");
        assert_eq!(host, "a.example:80");
    }

    #[test]
    fn missing_host_header_fails() {
        let request = b"GET /foo HTTP/1.1\r\nX-Other: y\r\n\r\n";
        assert!(parse_request(request).is_none());
    }

    #[test]
    fn malformed_request_line_fails() {
        let request = b"garbage\r\nHost: a.example\r\n\r\n";
        assert!(parse_request(request).is_none());
    }

    #[test]
    fn host_header_is_case_insensitive() {
        let request = b"GET / HTTP/1.1\r\nHOST: a.example\r\n\r\n";
        let (_, host) = parse_request(request).unwrap();
        assert_eq!(host, "a.example");
    }

    #[test]
    fn strip_port_drops_trailing_port() {
        assert_eq!(strip_port("a.example:80"), "a.example");
        assert_eq!(strip_port("a.example"), "a.example");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    #[test]
    fn redirect_location_strips_host_port() {
        let request = b"GET /foo HTTP/1.1\r\nHost: a.example:80\r\n\r\n";
        let (url, host) = parse_request(request).unwrap();
        let host = strip_port(&host);
        let location = format!("https://{host}{url}");
        assert_eq!(location, "https://a.example/foo");
    }
}
