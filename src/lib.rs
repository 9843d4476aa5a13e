pub mod api;
pub mod config;
pub mod observer;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use self::{config::Config, observer::Observer, statistics::Statistics};

use service::{Service, ServiceOptions};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "house-portal.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let the integration tests use the house-portal crate and
/// start the portal in-process, a function is opened to replace the main
/// function and directly start the server.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    // The listener is bound before anything else so that `dynamic` mode has
    // a concrete port to advertise in the peer endpoint.
    let listener = TcpListener::bind(("0.0.0.0", config.http_port())).await?;
    let http_port = listener.local_addr()?.port();

    let hostname = hostname::get()?.to_string_lossy().into_owned();
    let statistics = Statistics::default();
    let service = Service::new(ServiceOptions {
        hostname,
        http_port,
        handler: Observer::default(),
    });

    // A broken configuration refuses to start; at runtime the same parse
    // failure keeps the previous configuration instead.
    let text = std::fs::read_to_string(&config.config)
        .with_context(|| format!("cannot open configuration {:?}", config.config))?;
    let directives = codec::parse_config(&text)
        .with_context(|| format!("invalid configuration {:?}", config.config))?;
    service.load_static(directives, codec::unix_now(), true);

    server::start(&config, &statistics, &service).await?;
    api::start_server(listener, service, statistics).await
}
