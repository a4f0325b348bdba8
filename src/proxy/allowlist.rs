//! Destination allow-list (Whitelist Guard).
//!
//! A destination is allowed only when its normalized `PROTOCOL:HOST[:PORT]`
//! equals one of the configured entries for that protocol. There is no
//! wildcard, prefix, suffix or subdomain matching.

use std::collections::{HashMap, HashSet};
use tracing::warn;
use url::Url;

use super::config::AllowlistConfig;

/// Immutable allow-list, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    /// Protocol (lowercase, no colon) -> normalized uppercase entries.
    entries: HashMap<String, HashSet<String>>,
}

impl Allowlist {
    /// Build the allow-list from configuration.
    ///
    /// Entries are normalized the same way destinations are, so a configured
    /// `example.org:443` under `https` matches `https://example.org/`.
    pub fn new(config: &AllowlistConfig) -> Self {
        let mut entries: HashMap<String, HashSet<String>> = HashMap::new();

        for (protocol, hosts) in config {
            let protocol = protocol.trim().trim_end_matches(':').to_ascii_lowercase();
            let set = entries.entry(protocol.clone()).or_default();

            for host in hosts {
                match normalize(&format!("{}://{}", protocol, host.trim())) {
                    Some((_, normalized)) => {
                        set.insert(normalized);
                    }
                    None => {
                        warn!(protocol = %protocol, entry = %host, "Ignoring unparseable allow-list entry");
                    }
                }
            }
        }

        Self { entries }
    }

    /// Check whether a destination URL is allowed. Unparseable URLs are not.
    pub fn is_allowed(&self, url: &str) -> bool {
        let Some((protocol, normalized)) = normalize(url) else {
            return false;
        };

        self.entries
            .get(&protocol)
            .map(|set| set.contains(&normalized))
            .unwrap_or(false)
    }

    /// Number of configured entries across all protocols.
    pub fn len(&self) -> usize {
        self.entries.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Normalize a URL to `(protocol, "PROTOCOL:HOST[:PORT]")`.
///
/// The port is omitted when it is the scheme default.
fn normalize(url: &str) -> Option<(String, String)> {
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?;
    if host.is_empty() {
        return None;
    }

    let protocol = parsed.scheme().to_ascii_lowercase();
    let mut normalized = format!("{}:{}", protocol, host);
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{}", port));
    }

    Some((protocol, normalized.to_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> Allowlist {
        let mut config = AllowlistConfig::new();
        config.insert(
            "https".to_string(),
            vec!["hive.example.org".to_string(), "Backend.Example.org:8443".to_string()],
        );
        config.insert("http".to_string(), vec!["localhost:9090".to_string()]);
        Allowlist::new(&config)
    }

    #[test]
    fn test_exact_match() {
        let list = allowlist();
        assert!(list.is_allowed("https://hive.example.org/i2b2/services/PMService/"));
        assert!(list.is_allowed("https://backend.example.org:8443/getServices"));
        assert!(list.is_allowed("http://localhost:9090/"));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_trailing_slash_and_query_do_not_matter() {
        let list = allowlist();
        assert!(list.is_allowed("https://hive.example.org"));
        assert!(list.is_allowed("https://hive.example.org/"));
        assert!(list.is_allowed("https://hive.example.org/path?x=1&y=2"));
    }

    #[test]
    fn test_case_insensitive() {
        let list = allowlist();
        assert!(list.is_allowed("HTTPS://HIVE.EXAMPLE.ORG/"));
    }

    #[test]
    fn test_no_partial_matches() {
        let list = allowlist();
        assert!(!list.is_allowed("https://evil-hive.example.org/"));
        assert!(!list.is_allowed("https://sub.hive.example.org/"));
        assert!(!list.is_allowed("https://hive.example.org.evil.com/"));
        assert!(!list.is_allowed("https://hive.example.org@evil.com/"));
    }

    #[test]
    fn test_port_must_match() {
        let list = allowlist();
        assert!(!list.is_allowed("https://hive.example.org:8443/"));
        assert!(!list.is_allowed("https://backend.example.org/"));
        assert!(!list.is_allowed("http://localhost/"));
    }

    #[test]
    fn test_default_port_is_normalized() {
        let list = allowlist();
        assert!(list.is_allowed("https://hive.example.org:443/"));
    }

    #[test]
    fn test_protocol_must_match() {
        let list = allowlist();
        assert!(!list.is_allowed("http://hive.example.org/"));
        assert!(!list.is_allowed("ftp://hive.example.org/"));
    }

    #[test]
    fn test_unparseable_fails_closed() {
        let list = allowlist();
        assert!(!list.is_allowed("not a url"));
        assert!(!list.is_allowed(""));
        assert!(!list.is_allowed("https://"));
    }

    #[test]
    fn test_empty_allowlist_denies() {
        let list = Allowlist::default();
        assert!(list.is_empty());
        assert!(!list.is_allowed("https://hive.example.org/"));
    }
}
