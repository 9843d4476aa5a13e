use serde_json::json;

use service::{PortalHandler, rules::Rule};

/// Routes table lifecycle events to the log and to the `/portal/events`
/// stream.
#[derive(Default, Clone)]
pub struct Observer;

impl PortalHandler for Observer {
    fn on_route_added(&self, rule: &Rule) {
        log::info!(
            "route added: path={:?}, target={:?}, service={:?}, expires={}",
            rule.path,
            rule.target,
            rule.service,
            rule.expires
        );

        crate::api::events::send_with_stream("route_added", || {
            json!({
                "path": rule.path,
                "target": rule.target,
                "service": rule.service,
                "expires": rule.expires,
            })
        });
    }

    fn on_route_restarted(&self, rule: &Rule, previous: &str) {
        log::warn!(
            "route restarted: path={:?}, target={:?}, previous={:?}, pid={:?}",
            rule.path,
            rule.target,
            previous,
            rule.pid
        );

        crate::api::events::send_with_stream("route_restarted", || {
            json!({
                "path": rule.path,
                "target": rule.target,
                "previous": previous,
                "pid": rule.pid,
            })
        });
    }

    fn on_route_removed(&self, rule: &Rule) {
        log::info!(
            "route removed: path={:?}, target={:?}",
            rule.path,
            rule.target
        );

        crate::api::events::send_with_stream("route_removed", || {
            json!({
                "path": rule.path,
                "target": rule.target,
            })
        });
    }

    fn on_peer_added(&self, endpoint: &str) {
        log::info!("peer added: endpoint={:?}", endpoint);

        crate::api::events::send_with_stream("peer_added", || json!({ "endpoint": endpoint }));
    }

    fn on_peer_recovered(&self, endpoint: &str) {
        log::info!("peer recovered: endpoint={:?}", endpoint);

        crate::api::events::send_with_stream("peer_recovered", || json!({ "endpoint": endpoint }));
    }

    fn on_peer_expired(&self, endpoint: &str) {
        log::warn!("peer expired: endpoint={:?}", endpoint);

        crate::api::events::send_with_stream("peer_expired", || json!({ "endpoint": endpoint }));
    }

    fn on_overflow(&self, table: &'static str, dropped: &str) {
        log::error!("table full: table={:?}, dropped={:?}", table, dropped);
    }
}
