//! Forwarding HTTP/HTTPS proxy: CONNECT tunnels and plain HTTP forwarding
//! behind rate limiting, blocklisting, ACLs, and static routing.

use std::sync::Arc;
use std::time::Duration;

mod acl;
mod admin;
mod blocklist;
mod config;
mod connid;
mod error;
mod handler;
mod listener;
mod pool;
mod ratelimit;
mod relay;
mod router;
mod telemetry;
mod wire;

use config::Config;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let log_level = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    ratelimit::init(config.rate_limit_per_min, config.rate_window);
    pool::init(config.pool_max_per_key, config.pool_max_idle, config.connect_timeout);
    router::init(&config.routes);
    acl::init(config.acl_allow.clone(), config.acl_deny.clone());

    let config = Arc::new(config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            log::info!("signal received, shutting down");
            let _ = shutdown_tx.send(true);
        }) {
            log::warn!("failed to install signal handler: {e}");
        }
    }

    tokio::spawn(sweeper_loop(shutdown_rx.clone()));

    let admin_port = config.admin_port;
    tokio::spawn(async move {
        if let Err(e) = admin::serve(admin_port).await {
            log::error!("admin endpoint failed: {e}");
        }
    });

    match listener::run(config, shutdown_rx).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            log::error!("listener failed: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn sweeper_loop(mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                ratelimit::get().sweep();
                pool::get().sweep();
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}
