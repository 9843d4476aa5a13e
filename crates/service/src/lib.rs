//! ## Portal state
//!
//! The authoritative tables of one portal: the redirection rules, the known
//! peers and the signature keys, owned together by a [`Service`] so that the
//! UDP receiver, the HTTP front-end and the maintenance tick all see one
//! consistent state. Table lifecycle events are reported through the
//! [`PortalHandler`] trait so the embedding process decides how to log or
//! publish them.

pub mod peers;
pub mod rules;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::RwLock;

use codec::{
    MAX_DATAGRAM,
    crypto::{self, Key},
    message::{self, PeerList, PeerRef, Payload},
};

use self::{
    peers::{PEER_LIFETIME, PeerChange, PeerTable},
    rules::{ROUTE_LIFETIME, Rule, RuleChange, RuleTable},
};

pub const MAX_KEYS: usize = 16;

/// Receives table lifecycle events. All methods default to no-ops so an
/// embedder only implements what it cares about.
pub trait PortalHandler: Send + Sync {
    #[allow(unused_variables)]
    fn on_route_added(&self, rule: &Rule) {}

    /// A renewal changed the target or the PID: the backend restarted.
    #[allow(unused_variables)]
    fn on_route_restarted(&self, rule: &Rule, previous: &str) {}

    #[allow(unused_variables)]
    fn on_route_removed(&self, rule: &Rule) {}

    #[allow(unused_variables)]
    fn on_peer_added(&self, endpoint: &str) {}

    #[allow(unused_variables)]
    fn on_peer_recovered(&self, endpoint: &str) {}

    #[allow(unused_variables)]
    fn on_peer_expired(&self, endpoint: &str) {}

    /// A table refused an entry for lack of room; the declaration is
    /// dropped and the client's next renewal will retry.
    #[allow(unused_variables)]
    fn on_overflow(&self, table: &'static str, dropped: &str) {}
}

pub struct ServiceOptions<T> {
    /// The portal's own host name, used to complete bare-port targets and to
    /// root service URLs.
    pub hostname: String,
    /// The HTTP front-end port, part of the portal's peer endpoint.
    pub http_port: u16,
    pub handler: T,
}

struct Inner<T> {
    hostname: String,
    endpoint: String,
    rules: RwLock<RuleTable>,
    peers: RwLock<PeerTable>,
    keys: RwLock<Vec<Key>>,
    local: AtomicBool,
    handler: T,
}

/// Portal state shared between the receiver, the front-end and the tick.
pub struct Service<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Service<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Service<T>
where
    T: PortalHandler,
{
    pub fn new(options: ServiceOptions<T>) -> Self {
        let endpoint = format!("{}:{}", options.hostname, options.http_port);

        Self {
            inner: Arc::new(Inner {
                hostname: options.hostname,
                peers: RwLock::new(PeerTable::new(endpoint.clone())),
                endpoint,
                rules: RwLock::new(RuleTable::default()),
                keys: RwLock::new(Vec::new()),
                local: AtomicBool::new(false),
                handler: options.handler,
            }),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    /// The portal's own peer endpoint, `host:http-port`.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// When set, the UDP receiver binds only to loopback and gossip is
    /// disabled. Only the first configuration load can set it.
    pub fn local_mode(&self) -> bool {
        self.inner.local.load(Ordering::Relaxed)
    }

    /// Decode one inbound datagram: enforce the signature policy, parse,
    /// and apply. `LOCAL` and `SIGN` are configuration-file directives and
    /// are ignored on the wire.
    pub fn ingest(&self, datagram: &[u8], now: u64) -> Result<(), codec::Error> {
        if datagram.len() > MAX_DATAGRAM {
            return Err(codec::Error::Oversize(datagram.len()));
        }

        let line = std::str::from_utf8(datagram)?;
        let line = line.trim_end_matches(['\0', '\r', '\n', ' ']);

        let payload = {
            let keys = self.inner.keys.read();
            Payload::parse(message::verify(line, &keys)?, true)?
        };

        match payload {
            Payload::Redirect(redirect) => {
                let expires = now + ROUTE_LIFETIME;
                self.upsert_routes(redirect, expires, now);
            }
            Payload::Peers(list) => self.add_peers(list, true, now),
            Payload::Local | Payload::Sign(_) => {}
        }

        Ok(())
    }

    /// Apply a configuration file, previously parsed by
    /// [`codec::parse_config`]. Every permanent rule is deprecated first and
    /// only survives if the new file re-declares it; `SIGN` keys are scoped
    /// to the file; `LOCAL` is honoured on the first load only.
    pub fn load_static(&self, directives: Vec<Payload>, now: u64, first_load: bool) {
        self.inner.rules.write().deprecate_permanent();

        let mut keys = Vec::new();

        for directive in directives {
            match directive {
                Payload::Redirect(redirect) => self.upsert_routes(redirect, 0, now),
                Payload::Peers(list) => self.add_peers(list, false, now),
                Payload::Local => {
                    // Honouring LOCAL on a reload would require rebinding
                    // the sockets; it only applies at startup.
                    if first_load {
                        self.inner.local.store(true, Ordering::Relaxed);
                    }
                }
                Payload::Sign(key) => {
                    if keys.len() < MAX_KEYS {
                        keys.push(key);
                    } else {
                        self.inner.handler.on_overflow("keys", &key.method);
                    }
                }
            }
        }

        *self.inner.keys.write() = keys;
        self.prune(now);
    }

    fn upsert_routes(&self, redirect: codec::message::Redirect, expires: u64, now: u64) {
        let mut changes = Vec::with_capacity(redirect.routes.len());

        {
            let mut rules = self.inner.rules.write();
            for route in redirect.routes {
                changes.push(rules.upsert(Rule {
                    path: route.path,
                    target: redirect.target.clone(),
                    service: route.service,
                    hide: redirect.hide,
                    pid: redirect.pid,
                    start: now,
                    expires,
                }));
            }
        }

        for change in changes {
            match change {
                RuleChange::Added(rule) => self.inner.handler.on_route_added(&rule),
                RuleChange::Restarted { rule, previous } => {
                    self.inner.handler.on_route_restarted(&rule, &previous)
                }
                RuleChange::Full(rule) => self.inner.handler.on_overflow("rules", &rule.path),
                RuleChange::Refreshed | RuleChange::Shadowed => {}
            }
        }
    }

    fn add_peers(&self, list: PeerList, live: bool, now: u64) {
        let mut changes = Vec::with_capacity(list.peers.len());

        {
            let mut peers = self.inner.peers.write();
            for PeerRef { endpoint, expires } in list.peers {
                // A live endpoint without an explicit expiration was
                // permanent from the sender's viewpoint; we learned it
                // through gossip, so it expires like anything else.
                let expires = if live {
                    expires.unwrap_or(now + PEER_LIFETIME)
                } else {
                    0
                };

                changes.push(peers.add(&endpoint, expires));
            }
        }

        for change in changes {
            match change {
                PeerChange::Added(endpoint) => self.inner.handler.on_peer_added(&endpoint),
                PeerChange::Recovered(endpoint) => self.inner.handler.on_peer_recovered(&endpoint),
                PeerChange::Full(endpoint) => self.inner.handler.on_overflow("peers", &endpoint),
                PeerChange::Refreshed | PeerChange::Unchanged => {}
            }
        }
    }

    /// Remove expired rules, tombstoned permanents included.
    pub fn prune(&self, now: u64) {
        let removed = self.inner.rules.write().prune(now);

        for rule in removed {
            self.inner.handler.on_route_removed(&rule);
        }
    }

    /// Tombstone newly expired peers. Runs on a tighter cadence than the
    /// maintenance tick so expirations are reported promptly.
    pub fn expire_peers(&self, now: u64) {
        let expired = self.inner.peers.write().expire(now);

        for endpoint in expired {
            self.inner.handler.on_peer_expired(&endpoint);
        }
    }

    /// Longest-prefix lookup of a request path.
    pub fn lookup(&self, path: &str, now: u64) -> Option<Rule> {
        self.inner.rules.read().lookup(path, now).cloned()
    }

    pub fn rules_snapshot(&self) -> Vec<Rule> {
        self.inner.rules.read().iter().cloned().collect()
    }

    /// Peer endpoints a client may currently query, ourselves first.
    pub fn live_peers(&self, now: u64) -> Vec<String> {
        self.inner.peers.read().live(now)
    }

    pub fn static_peers(&self) -> Vec<String> {
        self.inner.peers.read().static_peers()
    }

    /// Service URLs for every active rule grouped under `name`, rooted at
    /// this portal.
    pub fn service_urls(&self, name: &str, now: u64) -> Vec<String> {
        self.inner
            .rules
            .read()
            .iter()
            .filter(|rule| rule.active(now))
            .filter(|rule| rule.service.as_deref() == Some(name))
            .map(|rule| format!("http://{}{}", self.inner.endpoint, rule.path))
            .collect()
    }

    /// Complete a rule target with our own host when the declaration only
    /// carried a port.
    pub fn complete_target(&self, target: &str) -> String {
        if target.contains(':') {
            target.to_string()
        } else {
            format!("{}:{}", self.inner.hostname, target)
        }
    }

    /// The signed `PEER` gossip datagram for this tick: ourselves first and
    /// permanent-from-our-viewpoint, then every other live or static peer
    /// with its expiration. `None` in local mode.
    pub fn publish(&self, now: u64) -> Option<String> {
        if self.local_mode() {
            return None;
        }

        let mut list = PeerList {
            timestamp: Some(now),
            peers: vec![PeerRef {
                endpoint: self.inner.endpoint.clone(),
                expires: None,
            }],
        };

        {
            let peers = self.inner.peers.read();
            for peer in peers.iter().skip(1).filter(|peer| peer.active(now)) {
                list.peers.push(PeerRef {
                    endpoint: peer.endpoint.clone(),
                    expires: (!peer.permanent()).then_some(peer.expires),
                });
            }
        }

        Some(self.sign_line(list.to_datagram()))
    }

    /// Append a signature suffix when a key is configured.
    pub fn sign_line(&self, line: String) -> String {
        match self.inner.keys.read().first() {
            Some(key) => crypto::sign(&line, key),
            None => line,
        }
    }

    pub fn keys(&self) -> Vec<Key> {
        self.inner.keys.read().clone()
    }
}
