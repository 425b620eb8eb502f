//! HTTP request-prefix parsing and target derivation.
//!
//! Grounded on the upstream router core's hand-rolled host/SNI extraction
//! (`app/proxy_sni.rs`, `app/proxy.rs`), generalized into a proper
//! request-line + header parser rather than the teacher's ad-hoc substring
//! scans.

pub mod sni;

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::ProxyError;

/// Immutable snapshot of a parsed HTTP request prefix.
#[derive(Debug, Clone)]
pub struct HttpRequestPrefix {
    pub method: String,
    pub target: String,
    pub headers: HashMap<String, String>,
    pub raw: Bytes,
    /// Byte offset in `raw` right after the header-terminating blank line,
    /// or `raw.len()` if the blank line has not been seen yet.
    pub header_end: usize,
    pub headers_complete: bool,
}

#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

/// Parses a request line and as many complete header lines as are present.
///
/// Succeeds as soon as the request line parses into three tokens, even if
/// the header block is not yet fully buffered — callers decide when enough
/// bytes have arrived (via [`has_header_terminator`]) before treating the
/// prefix as final.
pub fn parse_request_prefix(buf: &[u8]) -> Result<HttpRequestPrefix, ProxyError> {
    let (line, mut pos) = read_line(buf, 0)
        .ok_or_else(|| ProxyError::MalformedRequest("incomplete request line".into()))?;
    let line_str =
        std::str::from_utf8(line).map_err(|_| ProxyError::MalformedRequest("non-utf8 request line".into()))?;
    let parts: Vec<&str> = line_str.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(ProxyError::MalformedRequest(format!(
            "expected method, target, version (got {} tokens)",
            parts.len()
        )));
    }
    let method = parts[0].to_ascii_uppercase();
    let target = parts[1].to_string();

    let mut headers = HashMap::new();
    let mut header_end = buf.len();
    let mut headers_complete = false;
    loop {
        match read_line(buf, pos) {
            None => break,
            Some((line, next_pos)) => {
                if line.is_empty() {
                    header_end = next_pos;
                    headers_complete = true;
                    break;
                }
                if let Some(colon) = line.iter().position(|&b| b == b':') {
                    let name = String::from_utf8_lossy(&line[..colon]).trim().to_ascii_lowercase();
                    let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
                    if !name.is_empty() {
                        headers.insert(name, value);
                    }
                }
                pos = next_pos;
            }
        }
    }

    Ok(HttpRequestPrefix {
        method,
        target,
        headers,
        raw: Bytes::copy_from_slice(buf),
        header_end,
        headers_complete,
    })
}

/// True once a full CRLFCRLF (or lone-LF equivalent) header terminator is
/// present anywhere in `buf`.
pub fn has_header_terminator(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.windows(2).any(|w| w == b"\n\n")
}

/// Reads one line starting at `start`, tolerating a lone `\n` terminator.
/// Returns the line (without its terminator) and the offset just past it.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let mut i = start;
    while i < buf.len() {
        if buf[i] == b'\n' {
            let mut end = i;
            if end > start && buf[end - 1] == b'\r' {
                end -= 1;
            }
            return Some((&buf[start..end], i + 1));
        }
        i += 1;
    }
    None
}

/// Derives the (host, port) target from a parsed request prefix, per the
/// three HTTP request-target forms (absolute, authority, origin).
pub fn derive_target(prefix: &HttpRequestPrefix) -> Result<Target, ProxyError> {
    if prefix.method == "CONNECT" {
        return parse_authority(&prefix.target, 443);
    }
    if let Some(rest) = strip_scheme(&prefix.target) {
        return parse_authority(authority_part(rest), 80);
    }
    let host_header = prefix
        .headers
        .get("host")
        .ok_or_else(|| ProxyError::MalformedRequest("origin-form request missing Host header".into()))?;
    parse_authority(host_header, 80)
}

fn strip_scheme(target: &str) -> Option<&str> {
    target.find("://").map(|idx| &target[idx + 3..])
}

fn authority_part(s: &str) -> &str {
    match s.find('/') {
        Some(idx) => &s[..idx],
        None => s,
    }
}

fn parse_authority(auth: &str, default_port: u16) -> Result<Target, ProxyError> {
    if let Some(rest) = auth.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = rest[..end].to_string();
            let tail = &rest[end + 1..];
            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| ProxyError::MalformedRequest(format!("invalid port in '{auth}'")))?,
                None => default_port,
            };
            return Ok(Target { host, port });
        }
        return Err(ProxyError::MalformedRequest(format!("unterminated IPv6 literal in '{auth}'")));
    }

    match auth.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() && !port_str.is_empty() && port_str.bytes().all(|b| b.is_ascii_digit()) => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| ProxyError::MalformedRequest(format!("invalid port in '{auth}'")))?;
            Ok(Target { host: host.to_string(), port })
        }
        _ if !auth.is_empty() => Ok(Target { host: auth.to_string(), port: default_port }),
        _ => Err(ProxyError::MalformedRequest("empty request target".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_origin_form_get() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: example.test\r\nX-Foo: bar\r\n\r\n";
        let prefix = parse_request_prefix(raw).unwrap();
        assert_eq!(prefix.method, "GET");
        assert_eq!(prefix.target, "/index.html");
        assert_eq!(prefix.headers.get("host").unwrap(), "example.test");
        assert!(prefix.headers_complete);
        let target = derive_target(&prefix).unwrap();
        assert_eq!(target.host, "example.test");
        assert_eq!(target.port, 80);
    }

    #[test]
    fn parses_absolute_form_with_port() {
        let raw = b"GET http://example.test:8080/path HTTP/1.1\r\n\r\n";
        let prefix = parse_request_prefix(raw).unwrap();
        let target = derive_target(&prefix).unwrap();
        assert_eq!(target.host, "example.test");
        assert_eq!(target.port, 8080);
    }

    #[test]
    fn parses_connect_authority_form() {
        let raw = b"CONNECT example.test:443 HTTP/1.1\r\n\r\n";
        let prefix = parse_request_prefix(raw).unwrap();
        assert_eq!(prefix.method, "CONNECT");
        let target = derive_target(&prefix).unwrap();
        assert_eq!(target.host, "example.test");
        assert_eq!(target.port, 443);
    }

    #[test]
    fn connect_defaults_to_443_without_port() {
        let raw = b"CONNECT example.test HTTP/1.1\r\n\r\n";
        let prefix = parse_request_prefix(raw).unwrap();
        let target = derive_target(&prefix).unwrap();
        assert_eq!(target.port, 443);
    }

    #[test]
    fn tolerates_lone_lf() {
        let raw = b"GET / HTTP/1.1\nHost: example.test\n\n";
        let prefix = parse_request_prefix(raw).unwrap();
        assert_eq!(prefix.headers.get("host").unwrap(), "example.test");
    }

    #[test]
    fn rejects_malformed_request_line() {
        let raw = b"NOT A REQUEST LINE AT ALL\r\n\r\n";
        assert!(parse_request_prefix(raw).is_err());
    }

    #[test]
    fn succeeds_on_request_line_without_header_terminator_yet() {
        let raw = b"GET / HTTP/1.1\r\nHost: example.test\r\n";
        let prefix = parse_request_prefix(raw).unwrap();
        assert!(!prefix.headers_complete);
        assert_eq!(prefix.headers.get("host").unwrap(), "example.test");
    }

    #[test]
    fn last_duplicate_header_wins() {
        let raw = b"GET / HTTP/1.1\r\nHost: first.test\r\nHost: second.test\r\n\r\n";
        let prefix = parse_request_prefix(raw).unwrap();
        assert_eq!(prefix.headers.get("host").unwrap(), "second.test");
    }

    #[test]
    fn parses_ipv6_authority() {
        let raw = b"CONNECT [::1]:8443 HTTP/1.1\r\n\r\n";
        let prefix = parse_request_prefix(raw).unwrap();
        let target = derive_target(&prefix).unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 8443);
    }
}
