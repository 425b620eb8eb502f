//! Bidirectional byte pump between a client socket and an upstream socket.
//!
//! Two independent tasks per the "supervisor task with parallel relay
//! directions" shape, plus a shared last-activity watchdog so the idle
//! timeout applies to the *pair* of directions rather than to each one
//! independently — a connection that is only ever pushed one way (e.g. a
//! long download) must not be killed just because the other direction
//! carries nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct RelayStats {
    pub bytes_client_to_upstream: u64,
    pub bytes_upstream_to_client: u64,
}

/// Aborts both pump tasks when dropped, so cancelling the `relay()` future
/// itself (e.g. a shutdown signal racing it in a `select!`) tears the
/// tunnel down instead of leaving the tasks to detach and run to their own
/// EOF/idle timeout.
struct AbortGuard {
    c2u: tokio::task::AbortHandle,
    u2c: tokio::task::AbortHandle,
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        self.c2u.abort();
        self.u2c.abort();
    }
}

/// Pumps bytes in both directions until EOF, error, or idle timeout, then
/// tears down both sockets (each owned split half closes its underlying
/// descriptor exactly once when the last half drops).
pub async fn relay(client: TcpStream, upstream: TcpStream, buffer_size: usize, idle_timeout: Duration) -> RelayStats {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let up_bytes = Arc::new(AtomicU64::new(0));
    let down_bytes = Arc::new(AtomicU64::new(0));
    let start = Instant::now();
    let last_activity_ms = Arc::new(AtomicU64::new(0));

    let c2u = tokio::spawn(pump_direction(
        client_read,
        upstream_write,
        buffer_size,
        up_bytes.clone(),
        last_activity_ms.clone(),
        start,
    ));
    let u2c = tokio::spawn(pump_direction(
        upstream_read,
        client_write,
        buffer_size,
        down_bytes.clone(),
        last_activity_ms.clone(),
        start,
    ));

    let c2u_abort = c2u.abort_handle();
    let u2c_abort = u2c.abort_handle();
    let _abort_guard = AbortGuard { c2u: c2u_abort.clone(), u2c: u2c_abort.clone() };
    let watchdog_last_activity = last_activity_ms.clone();
    let watchdog = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if c2u_abort.is_finished() && u2c_abort.is_finished() {
                break;
            }
            let idle_for = start.elapsed().as_millis() as u64 - watchdog_last_activity.load(Ordering::Relaxed);
            if idle_for > idle_timeout.as_millis() as u64 {
                c2u_abort.abort();
                u2c_abort.abort();
                break;
            }
        }
    });

    let _ = tokio::join!(c2u, u2c);
    watchdog.abort();

    RelayStats {
        bytes_client_to_upstream: up_bytes.load(Ordering::Relaxed),
        bytes_upstream_to_client: down_bytes.load(Ordering::Relaxed),
    }
}

async fn pump_direction<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    counter: Arc<AtomicU64>,
    last_activity_ms: Arc<AtomicU64>,
    start: Instant,
) where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
        last_activity_ms.store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
    let _ = writer.shutdown().await;
}
