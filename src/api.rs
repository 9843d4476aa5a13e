use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{Query, Request, State},
    http::{HeaderValue, Method, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{IntoResponse, Response, Sse, sse::KeepAlive},
    routing::get,
};

use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;

use crate::{
    observer::Observer,
    statistics::{Statistics, Stats},
};

use service::Service;

struct ApiState {
    service: Service<Observer>,
    statistics: Statistics,
    uptime: Instant,
}

#[derive(Deserialize)]
struct ServiceParams {
    name: Option<String>,
}

pub mod events {
    use std::sync::LazyLock;

    use axum::response::sse::Event;
    use serde::Serialize;
    use tokio::sync::broadcast::{Sender, channel};
    use tokio_stream::wrappers::BroadcastStream;

    static CHANNEL: LazyLock<Sender<Event>> = LazyLock::new(|| channel(10).0);

    pub fn get_event_stream() -> BroadcastStream<Event> {
        BroadcastStream::new(CHANNEL.subscribe())
    }

    /// Nothing is serialized when nobody listens.
    pub fn send_with_stream<T, F>(event: &str, handle: F)
    where
        F: FnOnce() -> T,
        T: Serialize,
    {
        if CHANNEL.receiver_count() > 0 {
            if let Ok(event) = Event::default().event(event).json_data(handle()) {
                let _ = CHANNEL.send(event);
            }
        }
    }
}

/// start http server
///
/// The administrative routes live under `/portal/`; every other request is
/// matched against the redirection table and answered with a redirect.
///
/// Warn: the administrative routes carry no authentication; the portal is
/// meant for a trusted home subnet.
pub async fn start_server(
    listener: TcpListener,
    service: Service<Observer>,
    statistics: Statistics,
) -> anyhow::Result<()> {
    let state = Arc::new(ApiState {
        uptime: Instant::now(),
        service,
        statistics,
    });

    let app = Router::new()
        .route(
            "/portal/list",
            get(|State(state): State<Arc<ApiState>>| async move {
                let now = codec::unix_now();
                Json(json!({
                    "host": state.service.hostname(),
                    "timestamp": now,
                    "portal": { "redirect": redirect_entries(&state, now, false) },
                }))
            }),
        )
        .route(
            "/portal/peers",
            get(|State(state): State<Arc<ApiState>>| async move {
                let now = codec::unix_now();
                Json(json!({
                    "host": state.service.hostname(),
                    "timestamp": now,
                    "portal": { "peers": state.service.live_peers(now) },
                }))
            }),
        )
        .route(
            "/portal/service",
            get(
                |Query(query): Query<ServiceParams>, State(state): State<Arc<ApiState>>| async move {
                    let now = codec::unix_now();

                    match query.name {
                        Some(name) => {
                            let urls = state.service.service_urls(&name, now);
                            Json(json!({
                                "host": state.service.hostname(),
                                "timestamp": now,
                                "portal": { "service": { "name": name, "url": urls } },
                            }))
                        }
                        None => Json(json!({
                            "host": state.service.hostname(),
                            "timestamp": now,
                            "portal": { "redirect": redirect_entries(&state, now, true) },
                        })),
                    }
                },
            ),
        )
        .route(
            "/portal/info",
            get(|State(state): State<Arc<ApiState>>| async move {
                let counts = state.statistics.counts();
                Json(json!({
                    "software": crate::SOFTWARE,
                    "host": state.service.hostname(),
                    "timestamp": codec::unix_now(),
                    "uptime": state.uptime.elapsed().as_secs(),
                    "statistics": {
                        "received": counts.received_pkts.get(),
                        "dropped": counts.dropped_pkts.get(),
                        "redirects": counts.redirects.get(),
                        "unresolved": counts.unresolved.get(),
                    },
                }))
            }),
        )
        .route(
            "/portal/events",
            get(|| async move { Sse::new(events::get_event_stream()).keep_alive(KeepAlive::default()) }),
        )
        .fallback(redirect)
        .layer(middleware::from_fn(cross_origin))
        .with_state(state);

    log::info!("portal server listening={:?}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

fn redirect_entries(state: &ApiState, now: u64, services_only: bool) -> Vec<serde_json::Value> {
    state
        .service
        .rules_snapshot()
        .into_iter()
        .filter(|rule| !services_only || rule.service.is_some())
        .map(|rule| {
            json!({
                "start": rule.start,
                "path": rule.path,
                "service": rule.service,
                "expire": rule.expires,
                "target": rule.target,
                "hide": rule.hide,
                "active": rule.active(now),
            })
        })
        .collect()
}

/// The catch-all handler: longest-prefix match against the redirection
/// table, 302 for a live rule, 301 for a permanent one. The body is never
/// read; the response goes out as soon as the headers are parsed.
async fn redirect(State(state): State<Arc<ApiState>>, uri: Uri) -> Response {
    let now = codec::unix_now();

    let Some(rule) = state.service.lookup(uri.path(), now) else {
        state.statistics.add(Stats::Unresolved(1));
        log::debug!("unresolvable: path={:?}", uri.path());
        return (StatusCode::INTERNAL_SERVER_ERROR, "Unresolvable redirection.").into_response();
    };

    let tail = if rule.hide {
        &uri.path()[rule.path.len()..]
    } else {
        uri.path()
    };

    let mut location = format!("http://{}{}", state.service.complete_target(&rule.target), tail);
    if let Some(query) = uri.query() {
        location.push('?');
        location.push_str(query);
    }

    let status = if rule.permanent() {
        StatusCode::MOVED_PERMANENTLY
    } else {
        StatusCode::FOUND
    };

    state.statistics.add(Stats::Redirects(1));
    log::debug!("redirect: path={:?}, location={:?}", uri.path(), location);

    (status, [(header::LOCATION, location)]).into_response()
}

/// Cross-origin policy: GET is open to everyone, OPTIONS answers 204, and
/// any other cross-origin method is refused.
async fn cross_origin(request: Request, next: Next) -> Response {
    let cross = request.headers().contains_key(header::ORIGIN);

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        return response;
    }

    if cross && request.method() != Method::GET {
        return (StatusCode::FORBIDDEN, "Forbidden Cross-Domain").into_response();
    }

    let mut response = next.run(request).await;

    if cross {
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    }

    response
}
