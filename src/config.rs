//! Startup configuration: CLI flags merged with an optional YAML file.
//!
//! Precedence is CLI > file > hardcoded default, matching the upstream
//! router-cli's own clap + serde_yaml pairing.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ipnetwork::IpNetwork;
use serde::Deserialize;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8888;
const DEFAULT_ADMIN_PORT: u16 = 8889;
const DEFAULT_MAX_CONNECTIONS: usize = 1000;
const DEFAULT_RATE_LIMIT_PER_MIN: u32 = 100;
const DEFAULT_RATE_WINDOW_SECS: u64 = 60;
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_POOL_MAX_PER_KEY: usize = 10;
const DEFAULT_POOL_MAX_IDLE_SECS: u64 = 60;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HEADER_CAP: usize = 8 * 1024;
const DEFAULT_PREFIX_READ_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SHUTDOWN_DEADLINE_SECS: u64 = 5;

#[derive(Parser, Debug)]
#[command(name = "anonynet-gateway", about = "Forwarding HTTP/HTTPS proxy")]
struct Cli {
    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Port for the loopback-only admin endpoint
    #[arg(long)]
    admin_port: Option<u16>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Per-source-IP rate limit, requests per minute
    #[arg(long)]
    rate_limit_per_min: Option<u32>,

    /// Relay buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Optional path to a YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Raise log verbosity to debug
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct BindSpec {
    host: String,
    port: u16,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RouteMatchSpec {
    #[serde(default)]
    sni_suffix: Option<String>,
    #[serde(default)]
    host_suffix: Option<String>,
    #[serde(default)]
    client_cidr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UpstreamSpec {
    host: String,
    port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct RouteSpec {
    #[serde(default, rename = "match")]
    match_: RouteMatchSpec,
    upstream: UpstreamSpec,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    bind: Vec<BindSpec>,
    admin_port: Option<u16>,
    max_connections: Option<usize>,
    rate_limit_per_min: Option<u32>,
    rate_window_seconds: Option<u64>,
    pool_max_per_key: Option<usize>,
    pool_max_idle_seconds: Option<u64>,
    idle_timeout_seconds: Option<u64>,
    connect_timeout_seconds: Option<u64>,
    #[serde(default)]
    blocklist_extra: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    routes: Vec<RouteSpec>,
    #[serde(default)]
    acl_allow: Vec<String>,
    #[serde(default)]
    acl_deny: Vec<String>,
}

/// One (match criteria, upstream) rule for the Router, fully parsed.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub sni_suffix: Option<String>,
    pub host_suffix: Option<String>,
    pub client_cidr: Option<IpNetwork>,
    pub upstream_host: String,
    pub upstream_port: u16,
}

#[derive(Debug, Clone)]
pub struct BindAddr {
    pub host: String,
    pub port: u16,
}

/// Fully merged, immutable configuration shared by every component.
#[derive(Debug)]
pub struct Config {
    pub listen: Vec<BindAddr>,
    pub admin_port: u16,
    pub max_connections: usize,
    pub rate_limit_per_min: u32,
    pub rate_window: Duration,
    pub buffer_size: usize,
    pub pool_max_per_key: usize,
    pub pool_max_idle: Duration,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub header_cap: usize,
    pub prefix_read_timeout: Duration,
    pub shutdown_deadline: Duration,
    pub blocklist_extra: HashMap<String, HashMap<String, String>>,
    pub routes: Vec<RouteRule>,
    pub acl_allow: Vec<IpNetwork>,
    pub acl_deny: Vec<IpNetwork>,
    pub verbose: bool,
}

impl Config {
    /// Parse CLI flags, load an optional config file, and merge the two.
    pub fn load() -> anyhow::Result<Config> {
        let cli = Cli::parse();
        let file = match &cli.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
                serde_yaml::from_str::<FileConfig>(&raw)
                    .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?
            }
            None => FileConfig::default(),
        };

        let mut listen: Vec<BindAddr> = file
            .bind
            .iter()
            .map(|b| BindAddr { host: b.host.clone(), port: b.port })
            .collect();
        if listen.is_empty() || cli.host.is_some() || cli.port.is_some() {
            listen.insert(
                0,
                BindAddr {
                    host: cli.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
                    port: cli.port.unwrap_or(DEFAULT_PORT),
                },
            );
        }

        let routes = file
            .routes
            .iter()
            .map(|r| {
                let client_cidr = r
                    .match_
                    .client_cidr
                    .as_ref()
                    .map(|s| s.parse::<IpNetwork>())
                    .transpose()
                    .map_err(|e| anyhow::anyhow!("invalid client_cidr in routes: {e}"))?;
                Ok(RouteRule {
                    sni_suffix: r.match_.sni_suffix.clone(),
                    host_suffix: r.match_.host_suffix.clone(),
                    client_cidr,
                    upstream_host: r.upstream.host.clone(),
                    upstream_port: r.upstream.port,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let acl_allow = parse_cidr_list(&file.acl_allow)?;
        let acl_deny = parse_cidr_list(&file.acl_deny)?;

        Ok(Config {
            listen,
            admin_port: cli.admin_port.or(file.admin_port).unwrap_or(DEFAULT_ADMIN_PORT),
            max_connections: cli
                .max_connections
                .or(file.max_connections)
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            rate_limit_per_min: cli
                .rate_limit_per_min
                .or(file.rate_limit_per_min)
                .unwrap_or(DEFAULT_RATE_LIMIT_PER_MIN),
            rate_window: Duration::from_secs(file.rate_window_seconds.unwrap_or(DEFAULT_RATE_WINDOW_SECS)),
            buffer_size: cli.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            pool_max_per_key: file.pool_max_per_key.unwrap_or(DEFAULT_POOL_MAX_PER_KEY),
            pool_max_idle: Duration::from_secs(file.pool_max_idle_seconds.unwrap_or(DEFAULT_POOL_MAX_IDLE_SECS)),
            idle_timeout: Duration::from_secs(file.idle_timeout_seconds.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)),
            connect_timeout: Duration::from_secs(
                file.connect_timeout_seconds.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
            header_cap: DEFAULT_HEADER_CAP,
            prefix_read_timeout: Duration::from_secs(DEFAULT_PREFIX_READ_TIMEOUT_SECS),
            shutdown_deadline: Duration::from_secs(DEFAULT_SHUTDOWN_DEADLINE_SECS),
            blocklist_extra: file.blocklist_extra,
            routes,
            acl_allow,
            acl_deny,
            verbose: cli.verbose,
        })
    }
}

fn parse_cidr_list(entries: &[String]) -> anyhow::Result<Vec<IpNetwork>> {
    entries
        .iter()
        .map(|s| {
            s.parse::<IpNetwork>()
                .or_else(|_| s.parse::<IpAddr>().map(IpNetwork::from))
                .map_err(|e| anyhow::anyhow!("invalid CIDR or IP '{s}': {e}"))
        })
        .collect()
}
