use std::{sync::Arc, time::Duration};

use ahash::HashMap;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use tokio::{task::JoinHandle, time::timeout};

use crate::Error;

/// Cadence of the local-portal peer poll (phase 1).
pub const PEER_POLL_INTERVAL: u64 = 10;

/// Delay between discovering a new portal and scanning it, so its services
/// get a chance to register first.
pub const SCAN_SETTLE_DELAY: u64 = 3;

/// Floor on full rescans when nothing new appeared.
pub const SCAN_REFRESH_INTERVAL: u64 = 120;

/// A scan still pending after this long is considered lost and the next one
/// proceeds.
pub const SCAN_TIMEOUT: u64 = 60;

/// `/portal/peers` response.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalPeers {
    pub host: String,
    pub timestamp: u64,
    pub portal: PeersSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeersSection {
    pub peers: Vec<String>,
}

/// `/portal/list` response.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalList {
    pub host: String,
    pub timestamp: u64,
    pub portal: RedirectSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectSection {
    pub redirect: Vec<RedirectEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectEntry {
    pub start: u64,
    pub path: String,
    pub service: Option<String>,
    pub expire: u64,
    pub target: String,
    pub hide: bool,
    pub active: bool,
}

#[derive(Default)]
struct Cache {
    /// Portal list URL to the time it was first seen.
    portals: HashMap<String, u64>,
    /// Service name to the URLs offering it, each with its last-seen time.
    services: HashMap<String, HashMap<String, u64>>,
    /// Service name to the last time a new URL appeared under it.
    changed: HashMap<String, u64>,
    last_poll: u64,
    last_scan: u64,
    scan_due: Option<u64>,
}

impl Cache {
    /// Record the portals behind a peer list; true when one is new.
    fn note_portals(&mut self, endpoints: &[String], now: u64) -> bool {
        let mut appeared = false;

        for endpoint in endpoints {
            let url = format!("http://{}/portal/list", endpoint);

            if !self.portals.contains_key(&url) {
                self.portals.insert(url, now);
                appeared = true;
            }
        }

        appeared
    }

    /// Record one discovered `(service, url)` pair, keyed by the full URL so
    /// one URL is only ever counted once.
    fn note_service(&mut self, service: &str, url: String, now: u64) {
        let urls = self.services.entry(service.to_string()).or_default();

        if urls.insert(url, now).is_none() {
            self.changed.insert(service.to_string(), now);
        }
    }

    /// A scan runs when its settle delay elapsed, or on the refresh floor
    /// when no new portal is pending.
    fn scan_wanted(&self, now: u64) -> bool {
        if self.portals.is_empty() {
            return false;
        }

        match self.scan_due {
            Some(due) => now >= due,
            None => now >= self.last_scan + SCAN_REFRESH_INTERVAL,
        }
    }
}

/// Two-phase service discovery, run inside application processes.
///
/// Phase 1 polls the local portal for its peers; phase 2 fetches every known
/// portal's redirection list and indexes the entries that belong to a
/// service. Entries accumulate: there is no eviction, so an URL once learned
/// stays in the cache even if the service later moves to another host.
pub struct Discovery {
    portal: String,
    client: Client,
    cache: Mutex<Cache>,
}

impl Discovery {
    /// `portal` is the HTTP endpoint of the local portal, `host:port`.
    pub fn new(portal: impl Into<String>) -> Self {
        Self {
            portal: portal.into(),
            client: Client::new(),
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Drive both phases. Meant to be called on a short cadence; every call
    /// decides from its own clock what is due.
    pub async fn tick(&self) {
        let now = codec::unix_now();

        let poll_due = { now >= self.cache.lock().last_poll + PEER_POLL_INTERVAL };
        if poll_due {
            match self.poll_peers(now).await {
                Ok(appeared) => {
                    if appeared {
                        self.cache.lock().scan_due = Some(now + SCAN_SETTLE_DELAY);
                    }
                }
                Err(error) => {
                    log::warn!("peer poll failed: portal={:?}, error={}", self.portal, error)
                }
            }
        }

        let scan_wanted = { self.cache.lock().scan_wanted(now) };
        if scan_wanted {
            self.scan(now).await;
        }
    }

    /// Phase 1: ask the local portal who else is out there.
    async fn poll_peers(&self, now: u64) -> Result<bool, Error> {
        let url = format!("http://{}/portal/peers", self.portal);

        let peers = timeout(Duration::from_secs(SCAN_TIMEOUT), async {
            self.client
                .get(&url)
                .send()
                .await?
                .json::<PortalPeers>()
                .await
        })
        .await
        .map_err(|_| Error::Timeout)??;

        let mut cache = self.cache.lock();
        cache.last_poll = now;
        Ok(cache.note_portals(&peers.portal.peers, now))
    }

    /// Phase 2: fetch every known portal's list and index its services.
    async fn scan(&self, now: u64) {
        let portals: Vec<String> = {
            let mut cache = self.cache.lock();
            cache.scan_due = None;
            cache.last_scan = now;
            cache.portals.keys().cloned().collect()
        };

        for portal_url in portals {
            let list = timeout(Duration::from_secs(SCAN_TIMEOUT), async {
                self.client
                    .get(&portal_url)
                    .send()
                    .await?
                    .json::<PortalList>()
                    .await
            })
            .await;

            let list = match list {
                Ok(Ok(list)) => list,
                Ok(Err(error)) => {
                    log::warn!("portal scan failed: url={:?}, error={}", portal_url, error);
                    continue;
                }
                Err(_) => {
                    log::warn!("portal scan timed out: url={:?}", portal_url);
                    continue;
                }
            };

            let authority = authority_of(&portal_url).to_string();
            let mut cache = self.cache.lock();

            for entry in list.portal.redirect {
                if let Some(service) = entry.service.filter(|name| !name.is_empty()) {
                    cache.note_service(&service, format!("http://{}{}", authority, entry.path), now);
                }
            }
        }
    }

    /// Has any new URL appeared under this service since `since`?
    pub fn changed_since(&self, service: &str, since: u64) -> bool {
        self.cache
            .lock()
            .changed
            .get(service)
            .is_some_and(|&changed| changed > since)
    }

    /// Every known URL offering this service.
    pub fn urls(&self, service: &str) -> Vec<String> {
        self.cache
            .lock()
            .services
            .get(service)
            .map(|urls| urls.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every known `(service, url)` pair, as a restartable sequence.
    pub fn services(&self) -> impl Iterator<Item = (String, String)> {
        let cache = self.cache.lock();
        let mut pairs = Vec::new();

        for (service, urls) in &cache.services {
            for url in urls.keys() {
                pairs.push((service.clone(), url.clone()));
            }
        }

        pairs.into_iter()
    }

    /// Drive the phases in the background, one check per second.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));

            loop {
                ticker.tick().await;
                this.tick().await;
            }
        })
    }
}

fn authority_of(url: &str) -> &str {
    let rest = url.strip_prefix("http://").unwrap_or(url);
    rest.split_once('/').map_or(rest, |(authority, _)| authority)
}
