pub mod udp;

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::UdpSocket,
    time::{interval, sleep},
};

use crate::{
    config::{Config, ConfigWatcher},
    observer::Observer,
    statistics::Statistics,
};

use service::Service;

/// Cadence of the maintenance work: config mtime poll, rule pruning and
/// gossip publication. Also the delay before a failed socket is reopened.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Broadcast datagrams only arrive on a generously sized receive buffer
/// when the portal host is busy.
const RECV_BUFFER: usize = 256 * 1024;

/// The outbound side of the gossip: one unbound socket used for both the
/// limited broadcast and the unicasts to static peers.
#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    port: u16,
}

impl Transport {
    pub async fn new(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;

        Ok(Self {
            socket: Arc::new(socket),
            port,
        })
    }

    pub async fn broadcast(&self, payload: &str) -> io::Result<()> {
        self.socket
            .send_to(payload.as_bytes(), (Ipv4Addr::BROADCAST, self.port))
            .await
            .map(|_| ())
    }

    pub async fn unicast(&self, host: &str, payload: &str) -> io::Result<()> {
        self.socket
            .send_to(payload.as_bytes(), (host, self.port))
            .await
            .map(|_| ())
    }
}

/// Start the registration receivers and the maintenance tick. Returns once
/// everything is spawned; the HTTP front-end keeps the process alive.
pub async fn start(
    config: &Arc<Config>,
    statistics: &Statistics,
    service: &Service<Observer>,
) -> anyhow::Result<()> {
    let transport = Transport::new(config.portal_port).await?;

    let interface: SocketAddr = if service.local_mode() {
        (Ipv4Addr::LOCALHOST, config.portal_port).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, config.portal_port).into()
    };

    tokio::spawn(supervise(
        interface,
        true,
        service.clone(),
        statistics.clone(),
    ));

    if !service.local_mode() {
        // Best effort: hosts without IPv6 just run without the twin socket.
        let interface: SocketAddr = (Ipv6Addr::UNSPECIFIED, config.portal_port).into();
        tokio::spawn(supervise(
            interface,
            false,
            service.clone(),
            statistics.clone(),
        ));
    }

    tokio::spawn(tick(config.clone(), service.clone(), transport));

    Ok(())
}

/// Keep one receive socket alive: open it, run the receive loop, and on any
/// failure retry on the maintenance cadence. The portal never crashes over a
/// busy port.
async fn supervise(
    interface: SocketAddr,
    required: bool,
    service: Service<Observer>,
    statistics: Statistics,
) {
    let mut first_attempt = true;

    loop {
        match open_socket(interface) {
            Ok(socket) => {
                first_attempt = false;
                log::info!("portal socket listening={:?}", interface);

                if let Err(error) = udp::receiver(socket, &service, &statistics).await {
                    log::warn!(
                        "portal socket failed: interface={:?}, error={}",
                        interface,
                        error
                    );
                }
            }
            Err(error) => {
                if required || !first_attempt {
                    log::warn!(
                        "portal socket open failed: interface={:?}, error={}",
                        interface,
                        error
                    );
                } else {
                    log::info!(
                        "portal socket unavailable: interface={:?}, error={}",
                        interface,
                        error
                    );
                    return;
                }
            }
        }

        sleep(TICK_INTERVAL).await;
    }
}

fn open_socket(interface: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(
        Domain::for_address(interface),
        Type::DGRAM,
        Some(Protocol::UDP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(RECV_BUFFER)?;

    if interface.is_ipv4() {
        socket.set_broadcast(true)?;
    } else {
        // The IPv4 socket already owns the v4 side of the port.
        socket.set_only_v6(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&interface.into())?;

    UdpSocket::from_std(socket.into())
}

/// The maintenance loop. Peers are checked for expiration every second so
/// EXPIRE events are timely; everything else runs on the 30 s cadence:
/// reload the configuration when its mtime moved (pruning whatever it no
/// longer declares), prune expired rules otherwise, then publish gossip.
async fn tick(config: Arc<Config>, service: Service<Observer>, transport: Transport) {
    let mut watcher = ConfigWatcher::new(config.config.clone());
    let mut ticker = interval(Duration::from_secs(1));
    let mut countdown = 0;

    loop {
        ticker.tick().await;
        let now = codec::unix_now();

        service.expire_peers(now);

        if countdown > 0 {
            countdown -= 1;
            continue;
        }

        countdown = TICK_INTERVAL.as_secs() - 1;

        match watcher.poll() {
            Ok(Some(text)) => match codec::parse_config(&text) {
                Ok(directives) => {
                    log::info!("configuration reloaded: path={:?}", config.config);
                    service.load_static(directives, now, false);
                }
                // The previous configuration stays in force.
                Err(error) => log::error!(
                    "configuration reload failed: path={:?}, error={}",
                    config.config,
                    error
                ),
            },
            Ok(None) => service.prune(now),
            Err(error) => {
                log::error!(
                    "configuration unreadable: path={:?}, error={}",
                    config.config,
                    error
                );
                service.prune(now);
            }
        }

        if let Some(payload) = service.publish(now) {
            if let Err(error) = transport.broadcast(&payload).await {
                log::warn!("gossip broadcast failed: error={}", error);
            }

            // Static peers may live outside the broadcast domain.
            for endpoint in service.static_peers() {
                if let Err(error) = transport.unicast(host_of(&endpoint), &payload).await {
                    log::warn!(
                        "gossip unicast failed: peer={:?}, error={}",
                        endpoint,
                        error
                    );
                }
            }
        }
    }
}

fn host_of(endpoint: &str) -> &str {
    endpoint
        .split_once(':')
        .map_or(endpoint, |(host, _)| host)
}
