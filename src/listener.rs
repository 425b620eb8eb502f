//! Accept loops, admission control, and graceful shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpSocket;
use tokio::sync::watch;

use crate::config::Config;
use crate::handler;
use crate::pool;
use crate::telemetry;

const ACCEPT_BACKLOG: u32 = 1024;

/// Runs every configured listener until `shutdown_rx` fires, then drains
/// in-flight connections for up to `config.shutdown_deadline` before
/// returning.
pub async fn run(config: Arc<Config>, mut shutdown_rx: watch::Receiver<bool>) -> std::io::Result<()> {
    let active = Arc::new(AtomicUsize::new(0));
    let mut accept_tasks = Vec::new();

    for bind in &config.listen {
        let addr = format!("{}:{}", bind.host, bind.port);
        let socket_addr: std::net::SocketAddr = addr
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid bind address {addr}: {e}")))?;

        let socket = if socket_addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_reuseaddr(true)?;
        socket.bind(socket_addr)?;
        let listener = socket.listen(ACCEPT_BACKLOG)?;
        log::info!("listening on {socket_addr}");

        let config = config.clone();
        let active = active.clone();
        let shutdown_rx = shutdown_rx.clone();
        accept_tasks.push(tokio::spawn(accept_loop(listener, config, active, shutdown_rx)));
    }

    let _ = shutdown_rx.changed().await;
    log::info!("shutdown signal received, draining connections");
    for task in accept_tasks {
        task.abort();
    }

    let deadline = tokio::time::Instant::now() + config.shutdown_deadline;
    while active.load(Ordering::Relaxed) > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    pool::get().shutdown();
    log::info!("shutdown complete, {} connections still in flight", active.load(Ordering::Relaxed));
    Ok(())
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    config: Arc<Config>,
    active: Arc<AtomicUsize>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let (stream, client_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("accept error: {e}");
                continue;
            }
        };

        if active.load(Ordering::Relaxed) >= config.max_connections {
            continue; // over capacity, drop the socket silently
        }
        active.fetch_add(1, Ordering::Relaxed);
        telemetry::get().on_accept();

        let config = config.clone();
        let active = active.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = handler::handle_connection(stream, client_addr, config) => {}
                _ = shutdown_rx.changed() => {}
            }
            active.fetch_sub(1, Ordering::Relaxed);
            telemetry::get().on_close();
        });

        if *shutdown_rx.borrow() {
            break;
        }
    }
}
