use crate::{
    Error, MAX_DATAGRAM, SIGNATURE_SUFFIX, SIGNATURE_TAG_BYTES,
    crypto::{self, Key},
};

use std::fmt;

/// One path declaration inside a `REDIRECT` message: an absolute path,
/// optionally prefixed with the service name that groups it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub service: Option<String>,
    pub path: String,
}

impl ServiceRef {
    pub fn parse(token: &str) -> Result<Self, Error> {
        if token.starts_with('/') {
            return Ok(Self {
                service: None,
                path: token.to_string(),
            });
        }

        if let Some((service, path)) = token.split_once(':') {
            if !service.is_empty() && path.starts_with('/') {
                return Ok(Self {
                    service: Some(service.to_string()),
                    path: path.to_string(),
                });
            }
        }

        Err(Error::BadPath(token.to_string()))
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service {
            Some(service) => write!(f, "{}:{}", service, self.path),
            None => write!(f, "{}", self.path),
        }
    }
}

/// A decoded `REDIRECT` message. The timestamp is present on the wire and
/// absent in the static configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub timestamp: Option<u64>,
    /// `host:port`, or a bare port when the sender runs on the portal host.
    pub target: String,
    pub hide: bool,
    pub pid: Option<u32>,
    pub routes: Vec<ServiceRef>,
}

impl Redirect {
    /// Format into one or more wire lines, splitting the route list so that
    /// every line stays within the datagram budget once a signature suffix
    /// is added. Each line repeats the full target prefix.
    pub fn to_datagrams(&self) -> Result<Vec<String>, Error> {
        let budget = MAX_DATAGRAM - SIGNATURE_SUFFIX;

        let mut prefix = String::from("REDIRECT");
        if let Some(timestamp) = self.timestamp {
            prefix.push_str(&format!(" {}", timestamp));
        }
        prefix.push_str(&format!(" {}", self.target));
        if self.hide {
            prefix.push_str(" HIDE");
        }
        if let Some(pid) = self.pid {
            prefix.push_str(&format!(" PID:{}", pid));
        }

        let mut lines = Vec::new();
        let mut line = prefix.clone();
        let mut routes = 0;

        for route in &self.routes {
            let token = route.to_string();
            if prefix.len() + 1 + token.len() > budget {
                return Err(Error::Oversize(prefix.len() + 1 + token.len()));
            }

            if line.len() + 1 + token.len() > budget {
                lines.push(line);
                line = prefix.clone();
                routes = 0;
            }

            line.push(' ');
            line.push_str(&token);
            routes += 1;
        }

        if routes > 0 {
            lines.push(line);
        }

        Ok(lines)
    }
}

/// One endpoint of a `PEER` message. The expiration is absent when the
/// endpoint is permanent from the sender's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRef {
    pub endpoint: String,
    pub expires: Option<u64>,
}

impl PeerRef {
    fn parse(token: &str) -> Result<Self, Error> {
        let (endpoint, expires) = match token.split_once('=') {
            Some((endpoint, expires)) => {
                let expires = expires
                    .parse::<u64>()
                    .map_err(|_| Error::BadExpiration(token.to_string()))?;
                (endpoint, Some(expires))
            }
            None => (token, None),
        };

        if endpoint.is_empty() {
            return Err(Error::BadEndpoint(token.to_string()));
        }

        Ok(Self {
            endpoint: endpoint.to_string(),
            expires,
        })
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expires {
            Some(expires) => write!(f, "{}={}", self.endpoint, expires),
            None => write!(f, "{}", self.endpoint),
        }
    }
}

/// A decoded `PEER` message. The first endpoint is the sender itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerList {
    pub timestamp: Option<u64>,
    pub peers: Vec<PeerRef>,
}

impl PeerList {
    /// Format for the wire, dropping trailing endpoints that would overflow
    /// the datagram budget. The sender endpoint is never dropped.
    pub fn to_datagram(&self) -> String {
        let budget = MAX_DATAGRAM - SIGNATURE_SUFFIX;

        let mut line = String::from("PEER");
        if let Some(timestamp) = self.timestamp {
            line.push_str(&format!(" {}", timestamp));
        }

        for peer in &self.peers {
            let token = peer.to_string();
            if line.len() + 1 + token.len() > budget {
                break;
            }

            line.push(' ');
            line.push_str(&token);
        }

        line
    }
}

/// A typed registration message, parsed without mutating the input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Redirect(Redirect),
    Peers(PeerList),
    Local,
    Sign(Key),
}

impl Payload {
    /// Parse one line, signature suffix already removed. `timestamped` is
    /// true for live datagrams, which carry an epoch second right after the
    /// keyword; configuration lines do not.
    pub fn parse(line: &str, timestamped: bool) -> Result<Self, Error> {
        let mut tokens = line.split_whitespace();
        let keyword = tokens.next().ok_or(Error::EmptyMessage)?;

        match keyword {
            "REDIRECT" => {
                let timestamp = parse_timestamp(&mut tokens, timestamped)?;
                let target = tokens.next().ok_or(Error::MissingTarget)?;
                validate_target(target)?;

                let mut hide = false;
                let mut pid = None;
                let mut routes = Vec::new();

                for token in tokens {
                    if token == "HIDE" {
                        hide = true;
                    } else if let Some(value) = token.strip_prefix("PID:") {
                        pid = Some(
                            value
                                .parse::<u32>()
                                .map_err(|_| Error::BadPid(token.to_string()))?,
                        );
                    } else {
                        routes.push(ServiceRef::parse(token)?);
                    }
                }

                if routes.is_empty() {
                    return Err(Error::BadPath(line.to_string()));
                }

                Ok(Self::Redirect(Redirect {
                    timestamp,
                    target: target.to_string(),
                    hide,
                    pid,
                    routes,
                }))
            }
            "PEER" => {
                let timestamp = parse_timestamp(&mut tokens, timestamped)?;
                let peers = tokens.map(PeerRef::parse).collect::<Result<Vec<_>, _>>()?;

                if peers.is_empty() {
                    return Err(Error::BadEndpoint(line.to_string()));
                }

                Ok(Self::Peers(PeerList { timestamp, peers }))
            }
            "LOCAL" => Ok(Self::Local),
            "SIGN" => {
                let method = tokens.next().ok_or(Error::MissingSignature)?;
                let hex = tokens.next().ok_or(Error::MissingSignature)?;
                Ok(Self::Sign(Key::parse(method, hex)?))
            }
            other => Err(Error::UnknownKeyword(other.to_string())),
        }
    }
}

fn parse_timestamp(
    tokens: &mut std::str::SplitWhitespace<'_>,
    timestamped: bool,
) -> Result<Option<u64>, Error> {
    if !timestamped {
        return Ok(None);
    }

    let token = tokens.next().ok_or(Error::MissingTimestamp)?;
    Ok(Some(
        token.parse::<u64>().map_err(|_| Error::MissingTimestamp)?,
    ))
}

/// A target is `[<host>:]<port>`; the port half must be numeric.
fn validate_target(target: &str) -> Result<(), Error> {
    let port = match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => port,
        Some(_) => return Err(Error::BadTarget(target.to_string())),
        None => target,
    };

    port.parse::<u16>()
        .map(|_| ())
        .map_err(|_| Error::BadTarget(target.to_string()))
}

/// The signature suffix of a datagram, when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature<'a> {
    pub method: &'a str,
    pub tag: &'a str,
}

/// Split a raw line into its payload and trailing signature suffix. Lines
/// whose last two tokens do not look like a signature are returned whole.
pub fn split_signature(line: &str) -> (&str, Option<Signature<'_>>) {
    if let Some((head, tag)) = line.rsplit_once(' ') {
        if tag.len() == SIGNATURE_TAG_BYTES * 2
            && tag
                .bytes()
                .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
        {
            if let Some((payload, method)) = head.rsplit_once(' ') {
                if method == crate::SIGNATURE_METHOD {
                    return (payload, Some(Signature { method, tag }));
                }
            }
        }
    }

    (line, None)
}

/// Enforce the signature policy on an inbound line and return its payload.
///
/// With no key configured every line is accepted (a stray suffix is just
/// stripped). With at least one key, a line is accepted iff some key of the
/// suffix's method reproduces the tag.
pub fn verify<'a>(line: &'a str, keys: &[Key]) -> Result<&'a str, Error> {
    let (payload, signature) = split_signature(line);

    if keys.is_empty() {
        return Ok(payload);
    }

    let signature = signature.ok_or(Error::MissingSignature)?;

    for key in keys {
        if key.method == signature.method && crypto::payload_tag(key, payload) == signature.tag {
            return Ok(payload);
        }
    }

    Err(Error::SignatureMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_grammar() {
        let payload = Payload::parse("REDIRECT 1700000000 8081 PID:1234 /foo", true).unwrap();

        let Payload::Redirect(redirect) = payload else {
            panic!("not a redirect");
        };

        assert_eq!(redirect.timestamp, Some(1700000000));
        assert_eq!(redirect.target, "8081");
        assert_eq!(redirect.pid, Some(1234));
        assert!(!redirect.hide);
        assert_eq!(redirect.routes.len(), 1);
        assert_eq!(redirect.routes[0].path, "/foo");
        assert_eq!(redirect.routes[0].service, None);
    }

    #[test]
    fn redirect_service_prefix() {
        let payload =
            Payload::parse("REDIRECT 127.0.0.1:8080 HIDE control:/houserelays /raw", false)
                .unwrap();

        let Payload::Redirect(redirect) = payload else {
            panic!("not a redirect");
        };

        assert_eq!(redirect.timestamp, None);
        assert_eq!(redirect.target, "127.0.0.1:8080");
        assert!(redirect.hide);
        assert_eq!(redirect.routes[0].service.as_deref(), Some("control"));
        assert_eq!(redirect.routes[0].path, "/houserelays");
        assert_eq!(redirect.routes[1].service, None);
    }

    #[test]
    fn redirect_requires_absolute_path() {
        assert!(Payload::parse("REDIRECT 8081 foo", false).is_err());
        assert!(Payload::parse("REDIRECT 8081 control:relative", false).is_err());
        assert!(Payload::parse("REDIRECT 8081", false).is_err());
        assert!(Payload::parse("REDIRECT 1700000000 notaport /foo", true).is_err());
    }

    #[test]
    fn peer_grammar() {
        let payload = Payload::parse("PEER 1700000000 attic:80 cellar=1700000180", true).unwrap();

        let Payload::Peers(list) = payload else {
            panic!("not a peer list");
        };

        assert_eq!(list.timestamp, Some(1700000000));
        assert_eq!(list.peers[0].endpoint, "attic:80");
        assert_eq!(list.peers[0].expires, None);
        assert_eq!(list.peers[1].endpoint, "cellar");
        assert_eq!(list.peers[1].expires, Some(1700000180));
    }

    #[test]
    fn unknown_keyword() {
        assert!(matches!(
            Payload::parse("NONSENSE 1 2 3", true),
            Err(Error::UnknownKeyword(_))
        ));
    }

    #[test]
    fn signature_split() {
        let line = "REDIRECT 1700000000 8081 /foo SHA-256 0a1b2c3d";
        let (payload, signature) = split_signature(line);

        assert_eq!(payload, "REDIRECT 1700000000 8081 /foo");
        let signature = signature.unwrap();
        assert_eq!(signature.method, "SHA-256");
        assert_eq!(signature.tag, "0a1b2c3d");

        // An uppercase tag is not a signature.
        let (payload, signature) = split_signature("PEER 1 attic SHA-256 0A1B2C3D");
        assert_eq!(payload, "PEER 1 attic SHA-256 0A1B2C3D");
        assert!(signature.is_none());
    }

    #[test]
    fn signature_law() {
        let key = Key::parse("SHA-256", "d0e1a2b3").unwrap();
        let other = Key::parse("SHA-256", "00112233").unwrap();
        let line = crypto::sign("REDIRECT 1700000000 8081 /foo", &key);

        // Accepted by the signing key, and by a ring that contains it.
        assert!(verify(&line, std::slice::from_ref(&key)).is_ok());
        assert!(verify(&line, &[other.clone(), key.clone()]).is_ok());

        // Rejected unsigned or with the wrong key.
        assert!(matches!(
            verify("REDIRECT 1700000000 8081 /foo", std::slice::from_ref(&key)),
            Err(Error::MissingSignature)
        ));
        assert!(matches!(
            verify(&line, std::slice::from_ref(&other)),
            Err(Error::SignatureMismatch)
        ));

        // With no key configured, everything passes and a suffix is stripped.
        assert_eq!(verify(&line, &[]).unwrap(), "REDIRECT 1700000000 8081 /foo");
    }

    #[test]
    fn datagram_splitting() {
        let routes = (0..200)
            .map(|index| ServiceRef {
                service: Some("control".to_string()),
                path: format!("/very/long/application/path/number/{:04}", index),
            })
            .collect();

        let redirect = Redirect {
            timestamp: Some(1700000000),
            target: "192.168.1.10:8080".to_string(),
            hide: true,
            pid: Some(4321),
            routes,
        };

        let lines = redirect.to_datagrams().unwrap();
        assert!(lines.len() > 1);

        let mut total = 0;
        for line in &lines {
            assert!(line.len() + SIGNATURE_SUFFIX <= MAX_DATAGRAM);
            assert!(line.starts_with("REDIRECT 1700000000 192.168.1.10:8080 HIDE PID:4321 "));

            let Payload::Redirect(part) = Payload::parse(line, true).unwrap() else {
                panic!("not a redirect");
            };
            total += part.routes.len();
        }

        assert_eq!(total, 200);
    }

    #[test]
    fn peer_truncation() {
        let peers = (0..200)
            .map(|index| PeerRef {
                endpoint: format!("host-with-a-rather-long-name-{:04}", index),
                expires: Some(1700000000 + index),
            })
            .collect();

        let list = PeerList {
            timestamp: Some(1700000000),
            peers,
        };

        let line = list.to_datagram();
        assert!(line.len() + SIGNATURE_SUFFIX <= MAX_DATAGRAM);

        let Payload::Peers(parsed) = Payload::parse(&line, true).unwrap() else {
            panic!("not a peer list");
        };
        assert!(parsed.peers.len() < 200);
        assert_eq!(parsed.peers[0].endpoint, "host-with-a-rather-long-name-0000");
    }
}
