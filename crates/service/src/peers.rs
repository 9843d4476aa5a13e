use crate::rules::TOMBSTONE;

/// Lifetime of a gossip-learned peer, against the 30 s publish cadence.
pub const PEER_LIFETIME: u64 = 180;

pub const MAX_PEERS: usize = 128;

/// A known portal. `expires` is 0 for a static (or self) entry,
/// [`TOMBSTONE`] once expired, and a wall-clock epoch second otherwise.
/// Tombstones are kept so a later recovery can be told apart from a first
/// contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub endpoint: String,
    pub expires: u64,
}

impl Peer {
    pub fn permanent(&self) -> bool {
        self.expires == 0
    }

    pub fn active(&self, now: u64) -> bool {
        self.expires == 0 || self.expires >= now
    }
}

#[derive(Debug, Clone)]
pub enum PeerChange {
    Added(String),
    /// A tombstoned portal came back.
    Recovered(String),
    Refreshed,
    Unchanged,
    Full(String),
}

/// The set of known portals. The local portal is always the first entry and
/// is permanent; expirations only ever move forward, with 0 read as
/// infinity.
#[derive(Debug)]
pub struct PeerTable(Vec<Peer>);

impl PeerTable {
    pub fn new(own: String) -> Self {
        Self(vec![Peer {
            endpoint: own,
            expires: 0,
        }])
    }

    fn own(&self) -> &str {
        &self.0[0].endpoint
    }

    /// Record an endpoint. Unknown endpoints are appended; known ones only
    /// ever extend their expiration (a static entry stays static, and a
    /// static re-declaration makes a gossip entry permanent).
    pub fn add(&mut self, endpoint: &str, expires: u64) -> PeerChange {
        if endpoint == self.own() {
            return PeerChange::Unchanged;
        }

        if let Some(peer) = self.0.iter_mut().find(|peer| peer.endpoint == endpoint) {
            if peer.permanent() {
                return PeerChange::Unchanged;
            }

            if expires == 0 {
                peer.expires = 0;
                return PeerChange::Refreshed;
            }

            if expires > peer.expires {
                let recovered = peer.expires == TOMBSTONE;
                peer.expires = expires;

                return if recovered {
                    PeerChange::Recovered(endpoint.to_string())
                } else {
                    PeerChange::Refreshed
                };
            }

            return PeerChange::Unchanged;
        }

        if self.0.len() >= MAX_PEERS {
            return PeerChange::Full(endpoint.to_string());
        }

        self.0.push(Peer {
            endpoint: endpoint.to_string(),
            expires,
        });
        PeerChange::Added(endpoint.to_string())
    }

    /// Tombstone every entry whose expiration has passed. Entries are never
    /// removed; a recovery refresh flips them back to live.
    pub fn expire(&mut self, now: u64) -> Vec<String> {
        let mut expired = Vec::new();

        for peer in &mut self.0 {
            if peer.expires > TOMBSTONE && peer.expires < now {
                peer.expires = TOMBSTONE;
                expired.push(peer.endpoint.clone());
            }
        }

        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.0.iter()
    }

    /// Endpoints a client may currently query, the local portal first.
    pub fn live(&self, now: u64) -> Vec<String> {
        self.0
            .iter()
            .filter(|peer| peer.active(now))
            .map(|peer| peer.endpoint.clone())
            .collect()
    }

    /// Statically configured endpoints other than ourselves, for unicast
    /// gossip to peers outside the broadcast domain.
    pub fn static_peers(&self) -> Vec<String> {
        self.0
            .iter()
            .skip(1)
            .filter(|peer| peer.permanent())
            .map(|peer| peer.endpoint.clone())
            .collect()
    }
}
