use std::{process, str::FromStr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{net::UdpSocket, task::JoinHandle, time::interval};

use codec::{
    crypto::{self, Key},
    message::{Redirect, ServiceRef},
};

use crate::Error;

/// Renewal cadence, against the portal's 180 s expiration horizon. Losing a
/// few datagrams in a row is harmless.
pub const RENEW_INTERVAL: Duration = Duration::from_secs(30);

pub const DEFAULT_PORTAL: &str = "127.0.0.1:70";

/// An `external:internal` advertised port mapping, for containerised
/// applications whose listening port is not the one the LAN reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMap {
    pub external: u16,
    pub internal: u16,
}

impl FromStr for PortMap {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((external, internal)) = value.split_once(':') else {
            return Err(format!("unknown port map: {value}"));
        };

        Ok(Self {
            external: external
                .parse()
                .map_err(|_| format!("unknown port map: {value}"))?,
            internal: internal
                .parse()
                .map_err(|_| format!("unknown port map: {value}"))?,
        })
    }
}

pub struct RegistrarOptions {
    /// UDP endpoint of the portal, `host:port`.
    pub portal: String,
    /// Host advertised in the declaration; when absent the portal
    /// substitutes its own.
    pub host: Option<String>,
    pub port_map: Vec<PortMap>,
    /// Strip the matched prefix before the portal redirects.
    pub hide: bool,
    /// Signing keys; the first one signs every datagram.
    pub keys: Vec<Key>,
}

impl Default for RegistrarOptions {
    fn default() -> Self {
        Self {
            portal: DEFAULT_PORTAL.to_string(),
            host: None,
            port_map: Vec::new(),
            hide: false,
            keys: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Declaration {
    web_port: u16,
    /// `path` or `service:path` tokens, exactly as they go on the wire.
    paths: Vec<String>,
}

/// Declares an application's paths to its portal and keeps the declaration
/// alive.
pub struct Registrar {
    options: RegistrarOptions,
    socket: UdpSocket,
    declaration: Mutex<Declaration>,
}

impl Registrar {
    pub async fn new(options: RegistrarOptions) -> Result<Arc<Self>, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;

        Ok(Arc::new(Self {
            options,
            socket,
            declaration: Mutex::new(Declaration::default()),
        }))
    }

    /// Replace any prior declaration with these paths under the given port.
    pub fn declare(&self, web_port: u16, paths: Vec<String>) {
        *self.declaration.lock() = Declaration { web_port, paths };
    }

    /// Add paths to the prior declaration.
    pub fn declare_more(&self, web_port: u16, paths: Vec<String>) {
        let mut declaration = self.declaration.lock();
        declaration.web_port = web_port;

        for path in paths {
            if !declaration.paths.contains(&path) {
                declaration.paths.push(path);
            }
        }
    }

    /// Send the current declaration once, split across as many datagrams as
    /// it needs.
    pub async fn renew(&self) -> Result<(), Error> {
        let lines = {
            let declaration = self.declaration.lock();
            compose(&self.options, &declaration, codec::unix_now())?
        };

        for line in lines {
            self.socket
                .send_to(line.as_bytes(), self.options.portal.as_str())
                .await?;
        }

        Ok(())
    }

    /// Renew on the 30 s cadence. Send failures are logged and the next
    /// tick retries; the portal tolerates gaps well inside its horizon.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(RENEW_INTERVAL);

            loop {
                ticker.tick().await;

                if let Err(error) = this.renew().await {
                    log::warn!(
                        "declaration failed: portal={:?}, error={}",
                        this.options.portal,
                        error
                    );
                }
            }
        })
    }
}

/// Build the wire lines for a declaration: one shared target prefix, the
/// advertised port run through the port map, and a signature when a key is
/// configured.
fn compose(
    options: &RegistrarOptions,
    declaration: &Declaration,
    now: u64,
) -> Result<Vec<String>, codec::Error> {
    if declaration.paths.is_empty() {
        return Ok(Vec::new());
    }

    let port = options
        .port_map
        .iter()
        .find(|map| map.internal == declaration.web_port)
        .map(|map| map.external)
        .unwrap_or(declaration.web_port);

    let target = match &options.host {
        Some(host) => format!("{}:{}", host, port),
        None => port.to_string(),
    };

    let message = Redirect {
        timestamp: Some(now),
        target,
        hide: options.hide,
        pid: Some(process::id()),
        routes: declaration
            .paths
            .iter()
            .map(|path| ServiceRef::parse(path))
            .collect::<Result<Vec<_>, _>>()?,
    };

    let mut lines = message.to_datagrams()?;

    if let Some(key) = options.keys.first() {
        lines = lines.iter().map(|line| crypto::sign(line, key)).collect();
    }

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    use codec::{MAX_DATAGRAM, message::Payload};

    fn options() -> RegistrarOptions {
        RegistrarOptions::default()
    }

    #[test]
    fn empty_declaration_sends_nothing() {
        let declaration = Declaration::default();
        assert!(compose(&options(), &declaration, 1).unwrap().is_empty());
    }

    #[test]
    fn declaration_carries_port_and_pid() {
        let declaration = Declaration {
            web_port: 8081,
            paths: vec!["control:/houserelays".to_string()],
        };

        let lines = compose(&options(), &declaration, 1_700_000_000).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            format!(
                "REDIRECT 1700000000 8081 PID:{} control:/houserelays",
                process::id()
            )
        );
    }

    #[test]
    fn port_map_rewrites_the_advertised_port() {
        let mut options = options();
        options.host = Some("garage".to_string());
        options.port_map = vec!["80:8081".parse().unwrap()];

        let declaration = Declaration {
            web_port: 8081,
            paths: vec!["/houserelays".to_string()],
        };

        let lines = compose(&options, &declaration, 1).unwrap();
        assert!(lines[0].starts_with("REDIRECT 1 garage:80 "));
    }

    #[test]
    fn long_declarations_split() {
        let declaration = Declaration {
            web_port: 8081,
            paths: (0..200)
                .map(|index| format!("/some/rather/deep/application/path/{:04}", index))
                .collect(),
        };

        let lines = compose(&options(), &declaration, 1).unwrap();
        assert!(lines.len() > 1);

        let mut total = 0;
        for line in &lines {
            assert!(line.len() <= MAX_DATAGRAM);

            let Payload::Redirect(part) = Payload::parse(line, true).unwrap() else {
                panic!("not a redirect");
            };
            total += part.routes.len();
        }

        assert_eq!(total, 200);
    }

    #[test]
    fn signed_declarations_verify() {
        let mut options = options();
        options.keys = vec![Key::parse("SHA-256", "4a656665").unwrap()];

        let declaration = Declaration {
            web_port: 8081,
            paths: vec!["/houserelays".to_string()],
        };

        let lines = compose(&options, &declaration, 1).unwrap();
        assert!(codec::message::verify(&lines[0], &options.keys).is_ok());
    }

    #[test]
    fn port_map_syntax() {
        assert_eq!(
            "80:8081".parse::<PortMap>().unwrap(),
            PortMap {
                external: 80,
                internal: 8081
            }
        );
        assert!("80".parse::<PortMap>().is_err());
        assert!("80:x".parse::<PortMap>().is_err());
    }
}
