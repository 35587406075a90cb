//! Ordered pool of known server endpoints.
//!
//! The pool is a ring: selection takes the front entry and moves it to the
//! back, so repeated reconnect attempts rotate through the cluster. Gossip
//! updates reconcile the ring against the server-pushed peer list, and
//! per-server bookkeeping (attempt counts, last-attempt timestamps) feeds
//! the reconnect loop's backoff and eviction decisions.

use std::{
    collections::VecDeque,
    fmt,
    net::IpAddr,
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;

/// One known server endpoint.
#[derive(Clone, Debug)]
pub struct ServerAddr {
    /// Hostname or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Hostname to present for TLS server-name verification, when it
    /// differs from `host` (discovered bare-IP peers inherit the configured
    /// hostname).
    pub tls_name: Option<String>,
    /// Whether this endpoint arrived via gossip rather than configuration.
    pub(crate) discovered: bool,
    /// Consecutive failed reconnect attempts against this endpoint.
    pub(crate) reconnects: u32,
    /// When this endpoint was last dialed.
    pub(crate) last_attempt: Option<Instant>,
}

impl ServerAddr {
    /// Create an explicitly configured endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls_name: None,
            discovered: false,
            reconnects: 0,
            last_attempt: None,
        }
    }

    /// Parse `host`, `host:port`, or `scheme://host:port`.
    ///
    /// A missing port defaults to 4222.
    #[must_use]
    pub fn parse(addr: &str) -> Self {
        let stripped = addr.split_once("://").map_or(addr, |(_, rest)| rest);
        match stripped.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => Self::new(host, port),
                Err(_) => Self::new(stripped, 4222),
            },
            None => Self::new(stripped, 4222),
        }
    }

    fn key(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }

    fn is_bare_ip(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Result of reconciling the pool against a gossip update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GossipDelta {
    /// Endpoints appended to the pool.
    pub added: Vec<String>,
    /// Endpoints removed from the pool.
    pub removed: Vec<String>,
}

impl GossipDelta {
    /// Whether the update changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Ordered ring of server endpoints with per-server backoff bookkeeping.
#[derive(Debug)]
pub(crate) struct ServerPool {
    servers: VecDeque<ServerAddr>,
    randomize: bool,
    /// Configured hostname propagated to discovered bare-IP peers for TLS
    /// server-name verification.
    tls_name: Option<String>,
}

impl ServerPool {
    pub(crate) fn new(seeds: Vec<ServerAddr>, randomize: bool) -> Self {
        let tls_name = seeds
            .iter()
            .find(|seed| !seed.is_bare_ip())
            .map(|seed| seed.host.clone());
        let mut servers: Vec<ServerAddr> = seeds;
        if randomize {
            servers.shuffle(&mut rand::thread_rng());
        }
        Self {
            servers: servers.into(),
            randomize,
            tls_name,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.servers.len()
    }

    /// Rotate the ring: return the front endpoint and move it to the back.
    pub(crate) fn select(&mut self) -> Option<ServerAddr> {
        let server = self.servers.pop_front()?;
        self.servers.push_back(server.clone());
        Some(server)
    }

    fn entry_mut(&mut self, host: &str, port: u16) -> Option<&mut ServerAddr> {
        self.servers
            .iter_mut()
            .find(|server| server.key() == (host, port))
    }

    /// Record a dial attempt; returns the updated attempt count.
    pub(crate) fn note_attempt(&mut self, host: &str, port: u16) -> u32 {
        match self.entry_mut(host, port) {
            Some(server) => {
                server.reconnects += 1;
                server.last_attempt = Some(Instant::now());
                server.reconnects
            }
            None => 0,
        }
    }

    /// Record a successful connection, clearing the attempt count.
    pub(crate) fn note_success(&mut self, host: &str, port: u16) {
        if let Some(server) = self.entry_mut(host, port) {
            server.reconnects = 0;
            server.last_attempt = Some(Instant::now());
        }
    }

    /// Remove an endpoint, typically after its attempt count overflowed.
    pub(crate) fn evict(&mut self, host: &str, port: u16) -> bool {
        let before = self.servers.len();
        self.servers.retain(|server| server.key() != (host, port));
        self.servers.len() != before
    }

    /// Time still to wait before `server` may be redialed.
    pub(crate) fn retry_delay(server: &ServerAddr, min_retry: Duration) -> Duration {
        match server.last_attempt {
            Some(last) => min_retry.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Reconcile the ring against a gossip peer list.
    ///
    /// Configured entries always stay. Discovered entries absent from the
    /// gossip list are dropped unless they are the current connection. New
    /// hosts are appended, shuffled first when randomization is on.
    pub(crate) fn update_from_gossip(
        &mut self,
        urls: &[String],
        current: Option<(&str, u16)>,
    ) -> GossipDelta {
        let gossip: Vec<ServerAddr> = urls.iter().map(|url| ServerAddr::parse(url)).collect();
        let mut delta = GossipDelta::default();

        self.servers.retain(|server| {
            let keep = !server.discovered
                || Some(server.key()) == current
                || gossip.iter().any(|peer| peer.key() == server.key());
            if !keep {
                delta.removed.push(server.to_string());
            }
            keep
        });

        let mut fresh: Vec<ServerAddr> = gossip
            .into_iter()
            .filter(|peer| {
                !self
                    .servers
                    .iter()
                    .any(|server| server.key() == peer.key())
            })
            .map(|mut peer| {
                peer.discovered = true;
                if peer.is_bare_ip() {
                    peer.tls_name = self.tls_name.clone();
                }
                peer
            })
            .collect();
        if self.randomize {
            fresh.shuffle(&mut rand::thread_rng());
        }
        for peer in fresh {
            delta.added.push(peer.to_string());
            self.servers.push_back(peer);
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(addrs: &[&str]) -> ServerPool {
        ServerPool::new(addrs.iter().map(|a| ServerAddr::parse(a)).collect(), false)
    }

    #[test]
    fn parse_accepts_schemes_and_defaults_port() {
        let addr = ServerAddr::parse("proto://example.net:4444");
        assert_eq!((addr.host.as_str(), addr.port), ("example.net", 4444));
        let addr = ServerAddr::parse("example.net");
        assert_eq!(addr.port, 4222);
    }

    #[test]
    fn selection_rotates_the_ring() {
        let mut pool = pool(&["a:1", "b:2", "c:3"]);
        let picks: Vec<String> = (0..4)
            .map(|_| pool.select().unwrap().to_string())
            .collect();
        assert_eq!(picks, vec!["a:1", "b:2", "c:3", "a:1"]);
    }

    #[test]
    fn attempts_accumulate_and_reset_on_success() {
        let mut pool = pool(&["a:1"]);
        assert_eq!(pool.note_attempt("a", 1), 1);
        assert_eq!(pool.note_attempt("a", 1), 2);
        pool.note_success("a", 1);
        assert_eq!(pool.note_attempt("a", 1), 1);
    }

    #[test]
    fn bookkeeping_ignores_unknown_endpoints() {
        let mut pool = pool(&["a:1"]);
        assert_eq!(pool.note_attempt("ghost", 9), 0);
        pool.note_success("ghost", 9);
        assert_eq!(pool.note_attempt("a", 1), 1);
    }

    #[test]
    fn eviction_removes_the_endpoint() {
        let mut pool = pool(&["a:1", "b:2"]);
        assert!(pool.evict("a", 1));
        assert_eq!(pool.len(), 1);
        assert!(!pool.evict("a", 1));
    }

    #[test]
    fn gossip_appends_new_and_drops_stale_discovered() {
        let mut pool = pool(&["seed:1"]);
        let delta = pool.update_from_gossip(&["peer1:2".into(), "peer2:3".into()], None);
        assert_eq!(delta.added, vec!["peer1:2", "peer2:3"]);
        assert_eq!(pool.len(), 3);

        // peer1 vanished from gossip; the configured seed always stays.
        let delta = pool.update_from_gossip(&["peer2:3".into()], None);
        assert_eq!(delta.removed, vec!["peer1:2"]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn gossip_keeps_the_current_server() {
        let mut pool = pool(&["seed:1"]);
        pool.update_from_gossip(&["peer1:2".into()], None);
        let delta = pool.update_from_gossip(&[], Some(("peer1", 2)));
        assert!(delta.is_empty());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn discovered_bare_ip_inherits_tls_name() {
        let mut pool = pool(&["gateway.example:1"]);
        pool.update_from_gossip(&["10.0.0.7:4222".into()], None);
        let peer = pool
            .servers
            .iter()
            .find(|server| server.host == "10.0.0.7")
            .unwrap();
        assert_eq!(peer.tls_name.as_deref(), Some("gateway.example"));
        assert!(peer.discovered);
    }

    #[test]
    fn retry_delay_respects_min_interval() {
        let mut server = ServerAddr::new("a", 1);
        assert_eq!(
            ServerPool::retry_delay(&server, Duration::from_secs(2)),
            Duration::ZERO
        );
        server.last_attempt = Some(Instant::now());
        assert!(ServerPool::retry_delay(&server, Duration::from_secs(2)) > Duration::ZERO);
    }
}
