//! Per-connection state machine: read prefix, classify, gate, dispatch,
//! relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::Config;
use crate::error::ProxyError;
use crate::wire::{self, sni, HttpRequestPrefix, Target};
use crate::{acl, blocklist, connid, pool, ratelimit, relay, router, telemetry};

/// Accepts ownership of `stream`, runs it through the full state machine,
/// and always accounts for the connection in telemetry on the way out.
pub async fn handle_connection(stream: TcpStream, client_addr: SocketAddr, config: Arc<Config>) {
    let conn_id = connid::next_connection_id();
    let started = Instant::now();
    if let Err(e) = run(stream, client_addr, &config, &conn_id).await {
        log::debug!("[{conn_id}] connection ended: {e}");
    }
    telemetry::get().record_response_time_ms(started.elapsed().as_millis() as u64);
}

async fn run(mut stream: TcpStream, client_addr: SocketAddr, config: &Config, conn_id: &str) -> Result<(), ProxyError> {
    let prefix_bytes = read_prefix(&mut stream, config.header_cap, config.prefix_read_timeout).await?;
    let prefix = wire::parse_request_prefix(&prefix_bytes)?;
    let is_connect = prefix.method == "CONNECT";
    let target = wire::derive_target(&prefix)?;

    let classification = blocklist::classify(&target.host, &config.blocklist_extra);
    if classification.blocked {
        let reason = classification.reason.as_deref().unwrap_or("blocklist");
        log::warn!("[{conn_id}] blocked {} ({reason})", target.host);
        telemetry::get().log(format!("[{conn_id}] blocked {} ({reason})", target.host));
        respond_and_close(&mut stream, 403, "Forbidden", "Blocked Domain").await;
        return Err(ProxyError::Blocked(target.host));
    }

    if !ratelimit::get().allow(client_addr.ip()) {
        log::warn!("[{conn_id}] rate limited {}", client_addr.ip());
        telemetry::get().log(format!("[{conn_id}] rate limited {}", client_addr.ip()));
        respond_and_close(&mut stream, 429, "Too Many Requests", "").await;
        return Err(ProxyError::RateLimited);
    }

    if !acl::get().allow(client_addr.ip()) {
        log::warn!("[{conn_id}] ACL denied {}", client_addr.ip());
        telemetry::get().log(format!("[{conn_id}] ACL denied {}", client_addr.ip()));
        respond_and_close(&mut stream, 403, "Forbidden", "Blocked Domain").await;
        return Err(ProxyError::AclDenied);
    }

    let residual_sni = if prefix.headers_complete {
        sni::parse_sni(&prefix_bytes[prefix.header_end..])
    } else {
        None
    };
    if let Some(name) = &residual_sni {
        telemetry::get().log(format!("[{conn_id}] SNI={name}"));
    }
    let routed = router::get().route(residual_sni.as_deref(), Some(&target.host), client_addr.ip());
    let final_target = routed.unwrap_or(target);

    if is_connect {
        tunnel(stream, &prefix, &prefix_bytes, final_target, residual_sni, config, conn_id).await
    } else {
        http_forward(stream, &prefix_bytes, final_target, config, conn_id).await
    }
}

async fn tunnel(
    mut client: TcpStream,
    prefix: &HttpRequestPrefix,
    prefix_bytes: &[u8],
    target: Target,
    sni: Option<String>,
    config: &Config,
    conn_id: &str,
) -> Result<(), ProxyError> {
    let residual = if prefix.headers_complete { &prefix_bytes[prefix.header_end..] } else { &[][..] };

    match &sni {
        Some(name) => log::info!("[{conn_id}] CONNECT {}:{} SNI={}", target.host, target.port, name),
        None => log::info!("[{conn_id}] CONNECT {}:{}", target.host, target.port),
    }

    let mut upstream = match pool::get().acquire(&target.host, target.port).await {
        Ok(sock) => sock,
        Err(e) => {
            log::warn!("[{conn_id}] upstream dial failed for {}:{}: {e}", target.host, target.port);
            telemetry::get().log(format!("[{conn_id}] upstream dial failed for {}:{}: {e}", target.host, target.port));
            respond_and_close(&mut client, 502, "Bad Gateway", "").await;
            return Err(ProxyError::UpstreamDialFailed(e.to_string()));
        }
    };

    if client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.is_err() {
        return Err(ProxyError::ClientClosed);
    }

    if !residual.is_empty() && upstream.write_all(residual).await.is_err() {
        return Err(ProxyError::UpstreamClosed);
    }

    let stats = relay::relay(client, upstream, config.buffer_size, config.idle_timeout).await;
    telemetry::get().add_bytes(stats.bytes_client_to_upstream, stats.bytes_upstream_to_client);
    Ok(())
}

async fn http_forward(
    mut client: TcpStream,
    prefix_bytes: &[u8],
    target: Target,
    config: &Config,
    conn_id: &str,
) -> Result<(), ProxyError> {
    log::info!("[{conn_id}] HTTP {}:{}", target.host, target.port);

    let mut upstream = match pool::get().acquire(&target.host, target.port).await {
        Ok(sock) => sock,
        Err(e) => {
            log::warn!("[{conn_id}] upstream dial failed for {}:{}: {e}", target.host, target.port);
            telemetry::get().log(format!("[{conn_id}] upstream dial failed for {}:{}: {e}", target.host, target.port));
            respond_and_close(&mut client, 502, "Bad Gateway", "").await;
            return Err(ProxyError::UpstreamDialFailed(e.to_string()));
        }
    };

    if tokio::time::timeout(config.idle_timeout, upstream.write_all(prefix_bytes)).await.is_err() {
        respond_and_close(&mut client, 504, "Gateway Timeout", "").await;
        return Err(ProxyError::UpstreamTimeout);
    }

    let mut buf = vec![0u8; config.buffer_size];
    let mut bytes_down = 0u64;
    loop {
        match tokio::time::timeout(config.idle_timeout, upstream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if client.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                bytes_down += n as u64;
            }
            Ok(Err(_)) => break,
            Err(_) => {
                if bytes_down == 0 {
                    respond_and_close(&mut client, 504, "Gateway Timeout", "").await;
                }
                break;
            }
        }
    }

    telemetry::get().add_bytes(prefix_bytes.len() as u64, bytes_down);
    Ok(())
}

/// Reads into a capped buffer until a header terminator appears, the
/// deadline expires, or the cap is reached.
async fn read_prefix(stream: &mut TcpStream, cap: usize, deadline: Duration) -> Result<BytesMut, ProxyError> {
    let mut buf = BytesMut::with_capacity(cap);
    let start = Instant::now();

    loop {
        if wire::has_header_terminator(&buf) {
            return Ok(buf);
        }
        if buf.len() >= cap {
            return Err(ProxyError::MalformedRequest("header cap exceeded without terminator".into()));
        }
        let remaining = deadline.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(ProxyError::ClientTimeout);
        }

        let space = cap - buf.len();
        let mut chunk = vec![0u8; space];
        match tokio::time::timeout(remaining, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => return Err(ProxyError::ClientClosed),
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => return Err(ProxyError::ClientClosed),
            Err(_) => return Err(ProxyError::ClientTimeout),
        }
    }
}

async fn respond_and_close(stream: &mut TcpStream, code: u16, reason: &str, body: &str) {
    let response = if body.is_empty() {
        format!("HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
    } else {
        format!(
            "HTTP/1.1 {code} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    };
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_prefix_stops_at_header_terminator() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
            // keep the socket open so a premature EOF wouldn't accidentally pass
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let (mut server, _) = listener.accept().await.unwrap();
        let prefix = read_prefix(&mut server, 8192, Duration::from_secs(2)).await.unwrap();
        assert!(wire::has_header_terminator(&prefix));
    }

    #[tokio::test]
    async fn read_prefix_errors_on_cap_without_terminator() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&vec![b'a'; 32]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let (mut server, _) = listener.accept().await.unwrap();
        let result = read_prefix(&mut server, 16, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ProxyError::MalformedRequest(_))));
    }

    #[tokio::test]
    async fn read_prefix_times_out_on_silent_client() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = tokio::spawn(async move {
            let client = TcpStream::connect(addr).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(client);
        });

        let (mut server, _) = listener.accept().await.unwrap();
        let result = read_prefix(&mut server, 8192, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ProxyError::ClientTimeout)));
    }
}
