//! API key / trusted IP / one-shot token authorization.
//!
//! The same filter admits HTTP requests and WebSocket upgrades. Order of
//! checks: globally disabled, cached trusted connection, configured IP or
//! /24 range, `X-Api-Key` header, one-shot `?token=`. Anything else is 401.

use mr_protocol::ServerConfig;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

/// One-shot tokens are valid this long after issuance.
pub const TOKEN_TIMEOUT: Duration = Duration::from_secs(5);
/// Trusted connections expire after an hour without traffic.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3600);
/// Expiry sweep period.
pub const PRUNE_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Number of random bytes behind a one-shot token.
const TOKEN_BYTES: usize = 20;

#[derive(Default)]
struct AuthInner {
    api_key: String,
    enabled: bool,
    trusted_ips: Vec<String>,
    /// First three octets of each trusted /24 (`"192.168.1"`).
    trusted_ranges: Vec<String>,
    /// Remote IP -> last admitted.
    trusted_connections: HashMap<String, Instant>,
    /// Token -> issued at.
    access_tokens: HashMap<String, Instant>,
}

impl AuthInner {
    fn check_trusted_connection(&mut self, ip: &str, now: Instant) -> bool {
        if self.trusted_connections.contains_key(ip) {
            self.trusted_connections.insert(ip.to_owned(), now);
            return true;
        }
        let in_range = ip
            .rfind('.')
            .is_some_and(|dot| self.trusted_ranges.iter().any(|r| r == &ip[..dot]));
        if self.trusted_ips.iter().any(|t| t == ip) || in_range {
            info!(ip = %ip, "trusted connection detected");
            self.trusted_connections.insert(ip.to_owned(), now);
            return true;
        }
        false
    }

    fn check_access_token(&mut self, token: &str, now: Instant) -> bool {
        match self.access_tokens.remove(token) {
            // duration_since saturates to zero, so a token checked in the
            // same instant it was issued still verifies.
            Some(issued) => now.duration_since(issued) <= TOKEN_TIMEOUT,
            None => false,
        }
    }
}

pub struct Authorization {
    inner: Mutex<AuthInner>,
}

impl Authorization {
    pub fn new() -> Self {
        Authorization {
            inner: Mutex::new(AuthInner {
                enabled: true,
                ..AuthInner::default()
            }),
        }
    }

    pub fn load_config(&self, config: &ServerConfig) {
        let mut inner = self.inner.lock().expect("auth lock");
        inner.api_key = config.api_key.clone();
        inner.enabled = config.require_auth;
        inner.trusted_ips = config.trusted_ips.clone();
        inner.trusted_ranges = config.trusted_ranges.clone();
        info!(
            enabled = inner.enabled,
            trusted_ips = ?inner.trusted_ips,
            trusted_ranges = ?inner.trusted_ranges,
            "authorization configuration loaded"
        );
    }

    /// Mint a single-use access token valid for [`TOKEN_TIMEOUT`].
    pub fn create_oneshot_token(&self) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill(&mut bytes[..]);
        let token = data_encoding::BASE32.encode(&bytes);
        self.inner
            .lock()
            .expect("auth lock")
            .access_tokens
            .insert(token.clone(), Instant::now());
        token
    }

    /// Decide whether a request may pass.
    pub fn check(
        &self,
        remote_ip: Option<&str>,
        api_key: Option<&str>,
        token: Option<&str>,
    ) -> bool {
        self.check_at(remote_ip, api_key, token, Instant::now())
    }

    fn check_at(
        &self,
        remote_ip: Option<&str>,
        api_key: Option<&str>,
        token: Option<&str>,
        now: Instant,
    ) -> bool {
        let mut inner = self.inner.lock().expect("auth lock");
        if !inner.enabled {
            return true;
        }
        if let Some(ip) = remote_ip {
            if inner.check_trusted_connection(ip, now) {
                return true;
            }
        }
        if let Some(key) = api_key {
            if !inner.api_key.is_empty() && key == inner.api_key {
                return true;
            }
        }
        if let Some(token) = token {
            if inner.check_access_token(token, now) {
                return true;
            }
        }
        false
    }

    /// Drop trusted connections and tokens past their lifetimes.
    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }

    fn prune_at(&self, now: Instant) {
        let mut inner = self.inner.lock().expect("auth lock");
        inner.trusted_connections.retain(|ip, last_seen| {
            let keep = now.duration_since(*last_seen) <= CONNECTION_TIMEOUT;
            if !keep {
                info!(ip = %ip, "trusted connection expired");
            }
            keep
        });
        inner
            .access_tokens
            .retain(|_, issued| now.duration_since(*issued) <= TOKEN_TIMEOUT);
    }

    #[cfg(test)]
    fn is_trusted_connection(&self, ip: &str) -> bool {
        self.inner
            .lock()
            .expect("auth lock")
            .trusted_connections
            .contains_key(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_key: &str, trusted_ips: &[&str], trusted_ranges: &[&str]) -> ServerConfig {
        ServerConfig {
            api_key: api_key.to_owned(),
            trusted_ips: trusted_ips.iter().map(|s| (*s).to_owned()).collect(),
            trusted_ranges: trusted_ranges.iter().map(|s| (*s).to_owned()).collect(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn disabled_auth_admits_everything() {
        let auth = Authorization::new();
        auth.load_config(&ServerConfig {
            require_auth: false,
            ..ServerConfig::default()
        });
        assert!(auth.check(None, None, None));
    }

    #[test]
    fn api_key_header_admits_and_wrong_key_does_not() {
        let auth = Authorization::new();
        auth.load_config(&config("secret-key", &[], &[]));
        assert!(auth.check(Some("10.0.0.9"), Some("secret-key"), None));
        assert!(!auth.check(Some("10.0.0.9"), Some("wrong"), None));
        assert!(!auth.check(Some("10.0.0.9"), None, None));
    }

    #[test]
    fn empty_configured_key_never_matches() {
        let auth = Authorization::new();
        auth.load_config(&config("", &[], &[]));
        assert!(!auth.check(Some("10.0.0.9"), Some(""), None));
    }

    #[test]
    fn range_match_caches_the_connection_then_survives_expiry() {
        let auth = Authorization::new();
        auth.load_config(&config("", &[], &["192.168.1"]));

        assert!(auth.check(Some("192.168.1.17"), None, None));
        assert!(auth.is_trusted_connection("192.168.1.17"));
        assert!(!auth.check(Some("192.168.2.17"), None, None));

        // Idle past the TTL: the next prune removes the cache entry, but a
        // fresh request is re-admitted by the /24 match.
        auth.prune_at(Instant::now() + CONNECTION_TIMEOUT * 2);
        assert!(!auth.is_trusted_connection("192.168.1.17"));
        assert!(auth.check(Some("192.168.1.17"), None, None));
    }

    #[test]
    fn literal_ip_match_caches_the_connection() {
        let auth = Authorization::new();
        auth.load_config(&config("", &["127.0.0.1"], &[]));
        assert!(auth.check(Some("127.0.0.1"), None, None));
        assert!(auth.is_trusted_connection("127.0.0.1"));
    }

    #[test]
    fn prune_keeps_connections_within_ttl() {
        let auth = Authorization::new();
        auth.load_config(&config("", &["127.0.0.1"], &[]));
        assert!(auth.check(Some("127.0.0.1"), None, None));
        auth.prune_at(Instant::now() + CONNECTION_TIMEOUT / 2);
        assert!(auth.is_trusted_connection("127.0.0.1"));
    }

    #[test]
    fn refreshed_connection_outlives_its_original_admission_time() {
        let auth = Authorization::new();
        auth.load_config(&config("", &["10.0.0.5"], &[]));
        let t0 = Instant::now();
        assert!(auth.check_at(Some("10.0.0.5"), None, None, t0));
        // Seen again shortly before expiry: last_seen is refreshed...
        assert!(auth.check_at(Some("10.0.0.5"), None, None, t0 + CONNECTION_TIMEOUT));
        // ...so a prune that would have removed the original entry keeps it.
        auth.prune_at(t0 + CONNECTION_TIMEOUT + CONNECTION_TIMEOUT / 2);
        assert!(auth.is_trusted_connection("10.0.0.5"));
    }

    #[test]
    fn oneshot_token_verifies_at_most_once() {
        let auth = Authorization::new();
        auth.load_config(&config("key", &[], &[]));
        let token = auth.create_oneshot_token();
        assert!(auth.check(Some("10.0.0.9"), None, Some(&token)));
        assert!(!auth.check(Some("10.0.0.9"), None, Some(&token)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = Authorization::new();
        auth.load_config(&config("key", &[], &[]));
        let token = auth.create_oneshot_token();
        assert!(!auth.check_at(
            Some("10.0.0.9"),
            None,
            Some(&token),
            Instant::now() + TOKEN_TIMEOUT * 2,
        ));
    }

    #[test]
    fn prune_drops_stale_tokens() {
        let auth = Authorization::new();
        let token = auth.create_oneshot_token();
        auth.prune_at(Instant::now() + TOKEN_TIMEOUT * 2);
        assert!(!auth.check(Some("10.0.0.9"), None, Some(&token)));
    }

    #[test]
    fn tokens_are_distinct_base32_strings() {
        let auth = Authorization::new();
        let a = auth.create_oneshot_token();
        let b = auth.create_oneshot_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), data_encoding::BASE32.encode_len(TOKEN_BYTES));
    }
}
