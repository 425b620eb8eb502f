//! Domain classification against built-in and configured category tables.

use std::collections::HashMap;

type Extra = HashMap<String, HashMap<String, String>>;

struct Category {
    name: &'static str,
    entries: &'static [(&'static str, &'static str)],
}

const ADS: &[(&str, &str)] = &[
    ("doubleclick.net", "ad network"),
    ("googlesyndication.com", "ad network"),
    ("googleadservices.com", "ad network"),
    ("adservice.google.com", "ad network"),
    ("adnxs.com", "ad network"),
    ("taboola.com", "ad network"),
    ("outbrain.com", "ad network"),
];

const ANALYTICS: &[(&str, &str)] = &[
    ("google-analytics.com", "analytics"),
    ("googletagmanager.com", "analytics"),
    ("segment.io", "analytics"),
    ("mixpanel.com", "analytics"),
    ("hotjar.com", "analytics"),
    ("amplitude.com", "analytics"),
];

const SOCIAL: &[(&str, &str)] = &[
    ("connect.facebook.net", "social tracker"),
    ("platform.twitter.com", "social tracker"),
    ("ads-twitter.com", "social tracker"),
    ("pixel.facebook.com", "social tracker"),
];

const CDN: &[(&str, &str)] = &[
    ("scorecardresearch.com", "cdn tracker"),
    ("quantserve.com", "cdn tracker"),
    ("criteo.com", "cdn tracker"),
    ("criteo.net", "cdn tracker"),
];

const MALICIOUS: &[(&str, &str)] = &[
    ("malware-test.example", "known malicious"),
    ("phishing-test.example", "known malicious"),
];

const CATEGORIES: &[Category] = &[
    Category { name: "ads", entries: ADS },
    Category { name: "analytics", entries: ANALYTICS },
    Category { name: "social", entries: SOCIAL },
    Category { name: "cdn", entries: CDN },
    Category { name: "malicious", entries: MALICIOUS },
];

#[derive(Debug, Clone)]
pub struct Classification {
    pub blocked: bool,
    pub category: Option<&'static str>,
    pub reason: Option<String>,
}

impl Classification {
    fn none() -> Self {
        Classification { blocked: false, category: None, reason: None }
    }
}

/// Classifies a hostname against the category tables, built-in first, then
/// any operator-configured `blocklist_extra` entries for that same category.
pub fn classify(hostname: &str, extra: &Extra) -> Classification {
    let normalized = hostname.trim_end_matches('.').to_ascii_lowercase();

    for category in CATEGORIES {
        for (suffix, reason) in category.entries {
            if suffix_match(&normalized, suffix) {
                return Classification {
                    blocked: true,
                    category: Some(category.name),
                    reason: Some((*reason).to_string()),
                };
            }
        }
        if let Some(extra_entries) = extra.get(category.name) {
            for (suffix, reason) in extra_entries {
                if suffix_match(&normalized, suffix) {
                    return Classification {
                        blocked: true,
                        category: Some(category.name),
                        reason: Some(reason.clone()),
                    };
                }
            }
        }
    }

    Classification::none()
}

fn suffix_match(hostname: &str, entry: &str) -> bool {
    hostname == entry || hostname.ends_with(&format!(".{entry}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_extra() -> Extra {
        HashMap::new()
    }

    #[test]
    fn classifies_known_ad_domain() {
        let c = classify("doubleclick.net", &no_extra());
        assert!(c.blocked);
        assert_eq!(c.category, Some("ads"));
    }

    #[test]
    fn classifies_subdomain_of_known_domain() {
        let c = classify("foo.bar.doubleclick.net", &no_extra());
        assert!(c.blocked);
    }

    #[test]
    fn allows_unrelated_domain() {
        let c = classify("example.test", &no_extra());
        assert!(!c.blocked);
        assert!(c.category.is_none());
    }

    #[test]
    fn does_not_match_suffix_without_dot_boundary() {
        // "notdoubleclick.net" must not match "doubleclick.net"
        let c = classify("notdoubleclick.net", &no_extra());
        assert!(!c.blocked);
    }

    #[test]
    fn idempotent_case_and_trailing_dot() {
        let a = classify("DoubleClick.net", &no_extra());
        let b = classify("doubleclick.net.", &no_extra());
        let base = classify("doubleclick.net", &no_extra());
        assert_eq!(a.blocked, base.blocked);
        assert_eq!(b.blocked, base.blocked);
        assert_eq!(a.category, base.category);
        assert_eq!(b.category, base.category);
    }

    #[test]
    fn honors_blocklist_extra() {
        let mut extra = no_extra();
        let mut ads = HashMap::new();
        ads.insert("myownadnetwork.test".to_string(), "custom block".to_string());
        extra.insert("ads".to_string(), ads);

        let c = classify("myownadnetwork.test", &extra);
        assert!(c.blocked);
        assert_eq!(c.category, Some("ads"));
        assert_eq!(c.reason.as_deref(), Some("custom block"));
    }
}
