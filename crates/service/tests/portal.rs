use std::sync::Arc;

use parking_lot::Mutex;

use codec::{crypto, message::Payload, parse_config};
use house_portal_service::{PortalHandler, Service, ServiceOptions, rules::Rule};

const NOW: u64 = 1_700_000_000;

/// Records every lifecycle event as one line, so tests can assert on both
/// table state and the event stream.
#[derive(Default, Clone)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl PortalHandler for Recorder {
    fn on_route_added(&self, rule: &Rule) {
        self.0.lock().push(format!("added {}", rule.path));
    }

    fn on_route_restarted(&self, rule: &Rule, previous: &str) {
        self.0
            .lock()
            .push(format!("restarted {} {}<-{}", rule.path, rule.target, previous));
    }

    fn on_route_removed(&self, rule: &Rule) {
        self.0.lock().push(format!("removed {}", rule.path));
    }

    fn on_peer_added(&self, endpoint: &str) {
        self.0.lock().push(format!("peer-added {}", endpoint));
    }

    fn on_peer_recovered(&self, endpoint: &str) {
        self.0.lock().push(format!("peer-recovered {}", endpoint));
    }

    fn on_peer_expired(&self, endpoint: &str) {
        self.0.lock().push(format!("peer-expired {}", endpoint));
    }

    fn on_overflow(&self, table: &'static str, dropped: &str) {
        self.0.lock().push(format!("overflow {} {}", table, dropped));
    }
}

fn portal() -> (Service<Recorder>, Recorder) {
    let recorder = Recorder::default();

    let service = Service::new(ServiceOptions {
        hostname: "attic".to_string(),
        http_port: 80,
        handler: recorder.clone(),
    });

    (service, recorder)
}

fn directives(text: &str) -> Vec<Payload> {
    parse_config(text).unwrap()
}

#[test]
fn longest_prefix_with_boundary() {
    let (service, _) = portal();

    service
        .ingest(format!("REDIRECT {} 8081 /a /a/b /abc", NOW).as_bytes(), NOW)
        .unwrap();

    assert_eq!(service.lookup("/a/b/c", NOW).unwrap().path, "/a/b");
    assert_eq!(service.lookup("/a", NOW).unwrap().path, "/a");
    assert_eq!(service.lookup("/abc/x", NOW).unwrap().path, "/abc");

    // `/abcd` shares the `/abc` prefix but not on a path boundary.
    assert!(service.lookup("/abcd", NOW).is_none());
    assert!(service.lookup("/other", NOW).is_none());

    // Expired rules are never returned.
    assert!(service.lookup("/a/b/c", NOW + 181).is_none());
}

#[test]
fn renewal_keeps_identity() {
    let (service, recorder) = portal();

    service
        .ingest(format!("REDIRECT {} 8081 PID:1234 /foo", NOW).as_bytes(), NOW)
        .unwrap();
    assert_eq!(recorder.take(), vec!["added /foo"]);

    // Same target and PID thirty seconds later: same rule, same start, a
    // fresh expiration, and no event.
    service
        .ingest(
            format!("REDIRECT {} 8081 PID:1234 /foo", NOW + 30).as_bytes(),
            NOW + 30,
        )
        .unwrap();

    let rules = service.rules_snapshot();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].start, NOW);
    assert_eq!(rules[0].expires, NOW + 30 + 180);
    assert!(recorder.take().is_empty());

    // A new PID is a restart: start is bumped and the event records it.
    service
        .ingest(
            format!("REDIRECT {} 8081 PID:4321 /foo", NOW + 60).as_bytes(),
            NOW + 60,
        )
        .unwrap();

    let rules = service.rules_snapshot();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].start, NOW + 60);
    assert_eq!(recorder.take(), vec!["restarted /foo 8081<-8081"]);
}

#[test]
fn permanent_rules_shadow_live_ones() {
    let (service, recorder) = portal();

    service.load_static(directives("REDIRECT 127.0.0.1:8080 HIDE /app"), NOW, true);
    assert_eq!(recorder.take(), vec!["added /app"]);

    service
        .ingest(format!("REDIRECT {} 9090 /app", NOW).as_bytes(), NOW)
        .unwrap();

    let rules = service.rules_snapshot();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].target, "127.0.0.1:8080");
    assert_eq!(rules[0].expires, 0);
    assert!(rules[0].hide);
    assert!(recorder.take().is_empty());
}

#[test]
fn reload_prunes_undeclared_permanents() {
    let (service, recorder) = portal();

    service.load_static(
        directives("REDIRECT 127.0.0.1:8080 /app\nREDIRECT 127.0.0.1:8080 /gone"),
        NOW,
        true,
    );
    recorder.take();

    service.load_static(
        directives("REDIRECT 127.0.0.1:8080 /app\nREDIRECT 127.0.0.1:8088 /new"),
        NOW + 60,
        false,
    );

    let mut paths: Vec<String> = service
        .rules_snapshot()
        .into_iter()
        .map(|rule| rule.path)
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["/app", "/new"]);

    let events = recorder.take();
    assert!(events.contains(&"removed /gone".to_string()));
    assert!(events.contains(&"added /new".to_string()));
}

#[test]
fn rule_expiration_is_pruned() {
    let (service, recorder) = portal();

    service
        .ingest(format!("REDIRECT {} 8081 /foo", NOW).as_bytes(), NOW)
        .unwrap();
    recorder.take();

    service.prune(NOW + 100);
    assert_eq!(service.rules_snapshot().len(), 1);

    service.prune(NOW + 181);
    assert!(service.rules_snapshot().is_empty());
    assert_eq!(recorder.take(), vec!["removed /foo"]);
}

#[test]
fn peer_expirations_never_move_backwards() {
    let (service, recorder) = portal();

    service
        .ingest(
            format!("PEER {} cellar:80={}", NOW, NOW + 100).as_bytes(),
            NOW,
        )
        .unwrap();
    assert_eq!(recorder.take(), vec!["peer-added cellar:80"]);

    // A shorter expiration is ignored.
    service
        .ingest(
            format!("PEER {} cellar:80={}", NOW + 10, NOW + 50).as_bytes(),
            NOW + 10,
        )
        .unwrap();
    assert_eq!(service.live_peers(NOW + 99), vec!["attic:80", "cellar:80"]);

    // Past its horizon the peer is tombstoned, not forgotten.
    service.expire_peers(NOW + 101);
    assert_eq!(recorder.take(), vec!["peer-expired cellar:80"]);
    assert_eq!(service.live_peers(NOW + 101), vec!["attic:80"]);

    // A later refresh is a recovery.
    service
        .ingest(
            format!("PEER {} cellar:80={}", NOW + 120, NOW + 300).as_bytes(),
            NOW + 120,
        )
        .unwrap();
    assert_eq!(recorder.take(), vec!["peer-recovered cellar:80"]);
    assert_eq!(service.live_peers(NOW + 121), vec!["attic:80", "cellar:80"]);
}

#[test]
fn gossip_publish_format() {
    let (service, _) = portal();

    service.load_static(directives("PEER cellar"), NOW, true);

    // A live sender without an explicit expiration gets the gossip horizon.
    service
        .ingest(format!("PEER {} basement:80", NOW).as_bytes(), NOW)
        .unwrap();

    let datagram = service.publish(NOW).unwrap();
    assert_eq!(
        datagram,
        format!("PEER {} attic:80 cellar basement:80={}", NOW, NOW + 180)
    );

    // Once the gossip-learned peer expired, it drops out of the publication
    // while the static one stays.
    service.expire_peers(NOW + 181);
    let datagram = service.publish(NOW + 181).unwrap();
    assert_eq!(datagram, format!("PEER {} attic:80 cellar", NOW + 181));
}

#[test]
fn peer_convergence() {
    let recorder = Recorder::default();

    let portal_a = Service::new(ServiceOptions {
        hostname: "attic".to_string(),
        http_port: 80,
        handler: recorder.clone(),
    });
    let portal_b = Service::new(ServiceOptions {
        hostname: "cellar".to_string(),
        http_port: 80,
        handler: recorder.clone(),
    });

    // A statically knows B; everything else is gossip.
    portal_a.load_static(directives("PEER cellar:80"), NOW, true);

    let from_a = portal_a.publish(NOW).unwrap();
    portal_b.ingest(from_a.as_bytes(), NOW).unwrap();

    let from_b = portal_b.publish(NOW + 1).unwrap();
    portal_a.ingest(from_b.as_bytes(), NOW + 1).unwrap();

    assert_eq!(portal_a.live_peers(NOW + 2), vec!["attic:80", "cellar:80"]);
    assert_eq!(portal_b.live_peers(NOW + 2), vec!["cellar:80", "attic:80"]);
}

#[test]
fn signature_policy() {
    let (service, _) = portal();

    service.load_static(directives("SIGN SHA-256 4a656665"), NOW, true);

    let payload = format!("REDIRECT {} 8081 /foo", NOW);

    // Unsigned and wrongly signed datagrams are dropped.
    assert!(service.ingest(payload.as_bytes(), NOW).is_err());

    let wrong = crypto::Key::parse("SHA-256", "00112233").unwrap();
    assert!(
        service
            .ingest(crypto::sign(&payload, &wrong).as_bytes(), NOW)
            .is_err()
    );
    assert!(service.rules_snapshot().is_empty());

    // A correctly signed one lands.
    let key = crypto::Key::parse("SHA-256", "4a656665").unwrap();
    service
        .ingest(crypto::sign(&payload, &key).as_bytes(), NOW)
        .unwrap();
    assert_eq!(service.rules_snapshot().len(), 1);

    // Outbound gossip now carries the suffix.
    let datagram = service.publish(NOW).unwrap();
    assert_eq!(datagram, crypto::sign(&format!("PEER {} attic:80", NOW), &key));
}

#[test]
fn local_mode_disables_gossip() {
    let (service, _) = portal();

    service.load_static(directives("LOCAL"), NOW, true);
    assert!(service.local_mode());
    assert!(service.publish(NOW).is_none());

    // LOCAL only applies at startup; a reload without it changes nothing.
    service.load_static(Vec::new(), NOW + 60, false);
    assert!(service.local_mode());
}

#[test]
fn service_urls_are_rooted_at_the_portal() {
    let (service, _) = portal();

    service
        .ingest(
            format!(
                "REDIRECT {} 8081 control:/houserelays control:/houseopensprinkler /plain",
                NOW
            )
            .as_bytes(),
            NOW,
        )
        .unwrap();

    let mut urls = service.service_urls("control", NOW);
    urls.sort();
    assert_eq!(
        urls,
        vec![
            "http://attic:80/houseopensprinkler",
            "http://attic:80/houserelays"
        ]
    );

    assert!(service.service_urls("nothing", NOW).is_empty());
}

#[test]
fn rule_table_overflow_drops_declarations() {
    let (service, recorder) = portal();

    for index in 0..130 {
        service
            .ingest(
                format!("REDIRECT {} 8081 /app/{:03}", NOW, index).as_bytes(),
                NOW,
            )
            .unwrap();
    }

    assert_eq!(service.rules_snapshot().len(), 128);

    let overflows = recorder
        .take()
        .into_iter()
        .filter(|event| event.starts_with("overflow rules"))
        .count();
    assert_eq!(overflows, 2);
}

#[test]
fn target_completion() {
    let (service, _) = portal();

    assert_eq!(service.complete_target("8081"), "attic:8081");
    assert_eq!(service.complete_target("10.0.0.5:8081"), "10.0.0.5:8081");
}
