//! Loopback-only admin endpoint: `/health` and `/stats`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::telemetry;
use crate::wire;

/// Binds `127.0.0.1:{port}` and serves admin requests until the process
/// exits. Never bound to a non-loopback address.
pub async fn serve(port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    log::info!("admin endpoint listening on 127.0.0.1:{port}");
    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = handle(stream).await {
                log::debug!("admin connection error: {e}");
            }
        });
    }
}

async fn handle(mut stream: TcpStream) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(4096);
    loop {
        if wire::has_header_terminator(&buf) {
            break;
        }
        if buf.len() >= 8192 {
            return respond(&mut stream, 400, "{}").await;
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let prefix = match wire::parse_request_prefix(&buf) {
        Ok(p) => p,
        Err(_) => return respond(&mut stream, 400, "{}").await,
    };

    match (prefix.method.as_str(), prefix.target.as_str()) {
        ("GET", "/health") => {
            let body = serde_json::json!({
                "status": "healthy",
                "active_connections": telemetry::get().active_connections(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
            respond(&mut stream, 200, &body.to_string()).await
        }
        ("GET", "/stats") => {
            let body = serde_json::to_string(&telemetry::get().snapshot())
                .unwrap_or_else(|_| "{}".to_string());
            respond(&mut stream, 200, &body).await
        }
        _ => respond(&mut stream, 404, "{}").await,
    }
}

async fn respond(stream: &mut TcpStream, code: u16, body: &str) -> std::io::Result<()> {
    let reason = match code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    #[tokio::test]
    async fn health_endpoint_returns_ok_json() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = handle(stream).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /health HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("\"status\":\"healthy\""));
    }

    #[tokio::test]
    async fn unknown_path_returns_404() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = handle(stream).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /nope HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 404"));
    }
}
