//! Static routing: redirect matching destinations to chosen upstreams.

use std::net::IpAddr;
use std::sync::OnceLock;

use ipnetwork::IpNetwork;

use crate::config::RouteRule;
use crate::wire::Target;

struct CompiledRule {
    sni_suffix: Option<String>,
    host_suffix: Option<String>,
    client_cidr: Option<IpNetwork>,
    upstream: Target,
}

pub struct Router {
    rules: Vec<CompiledRule>,
}

impl Router {
    pub fn new(rules: &[RouteRule]) -> Self {
        let compiled = rules
            .iter()
            .map(|r| CompiledRule {
                sni_suffix: r.sni_suffix.clone(),
                host_suffix: r.host_suffix.clone(),
                client_cidr: r.client_cidr,
                upstream: Target { host: r.upstream_host.clone(), port: r.upstream_port },
            })
            .collect();
        Router { rules: compiled }
    }

    /// Returns the first rule whose every specified criterion matches, or
    /// `None` to mean "use the target derived from the request."
    pub fn route(&self, sni: Option<&str>, host: Option<&str>, client_ip: IpAddr) -> Option<Target> {
        'rules: for rule in &self.rules {
            if let Some(suffix) = &rule.sni_suffix {
                match sni {
                    Some(s) if suffix_match(s, suffix) => {}
                    _ => continue 'rules,
                }
            }
            if let Some(suffix) = &rule.host_suffix {
                match host {
                    Some(h) if suffix_match(h, suffix) => {}
                    _ => continue 'rules,
                }
            }
            if let Some(net) = &rule.client_cidr {
                if !net.contains(client_ip) {
                    continue 'rules;
                }
            }
            return Some(Target { host: rule.upstream.host.clone(), port: rule.upstream.port });
        }
        None
    }
}

fn suffix_match(value: &str, entry: &str) -> bool {
    let v = value.trim_end_matches('.').to_ascii_lowercase();
    let e = entry.trim_end_matches('.').to_ascii_lowercase();
    v == e || v.ends_with(&format!(".{e}"))
}

static INSTANCE: OnceLock<Router> = OnceLock::new();

pub fn init(rules: &[RouteRule]) {
    let _ = INSTANCE.set(Router::new(rules));
}

pub fn get() -> &'static Router {
    INSTANCE.get().expect("router::init must run before router::get")
}
