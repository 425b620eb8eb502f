//! Simple source-IP allow/deny ACL gate.

use std::net::IpAddr;
use std::sync::OnceLock;

use ipnetwork::IpNetwork;

pub struct Acl {
    allow: Vec<IpNetwork>,
    deny: Vec<IpNetwork>,
}

impl Acl {
    pub fn new(allow: Vec<IpNetwork>, deny: Vec<IpNetwork>) -> Self {
        Acl { allow, deny }
    }

    /// A deny match always wins; an empty allow list means allow-all.
    pub fn allow(&self, ip: IpAddr) -> bool {
        if self.deny.iter().any(|net| net.contains(ip)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|net| net.contains(ip))
    }
}

static INSTANCE: OnceLock<Acl> = OnceLock::new();

pub fn init(allow: Vec<IpNetwork>, deny: Vec<IpNetwork>) {
    let _ = INSTANCE.set(Acl::new(allow, deny));
}

pub fn get() -> &'static Acl {
    INSTANCE.get().expect("acl::init must run before acl::get")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_acl_allows_everyone() {
        let acl = Acl::new(vec![], vec![]);
        assert!(acl.allow("1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn deny_wins_over_allow() {
        let acl = Acl::new(vec!["10.0.0.0/8".parse().unwrap()], vec!["10.0.0.1/32".parse().unwrap()]);
        assert!(!acl.allow("10.0.0.1".parse().unwrap()));
        assert!(acl.allow("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn non_empty_allow_list_excludes_others() {
        let acl = Acl::new(vec!["10.0.0.0/8".parse().unwrap()], vec![]);
        assert!(acl.allow("10.1.2.3".parse().unwrap()));
        assert!(!acl.allow("192.168.1.1".parse().unwrap()));
    }
}
