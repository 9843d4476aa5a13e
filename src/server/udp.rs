use std::io::ErrorKind::ConnectionReset;

use tokio::net::UdpSocket;

use crate::{
    observer::Observer,
    statistics::{Statistics, Stats},
};

use service::Service;

/// Registration receive loop.
///
/// Read datagrams from the socket and hand them to the service for
/// decoding. Anything the decoder refuses is logged and dropped; the sender
/// retries on its own 30 s cadence.
pub async fn receiver(
    socket: UdpSocket,
    service: &Service<Observer>,
    statistics: &Statistics,
) -> anyhow::Result<()> {
    let local_addr = socket.local_addr()?;
    let mut buf = vec![0u8; 2048];

    loop {
        let (size, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(error) => {
                if error.kind() != ConnectionReset {
                    return Err(error.into());
                } else {
                    continue;
                }
            }
        };

        statistics.add(Stats::ReceivedPkts(1));
        log::trace!(
            "portal socket receive: size={}, addr={:?}, interface={:?}",
            size,
            addr,
            local_addr
        );

        if let Err(error) = service.ingest(&buf[..size], codec::unix_now()) {
            match error {
                // Unknown keywords are tolerated on the wire; newer portals
                // may speak a slightly larger grammar.
                codec::Error::UnknownKeyword(keyword) => {
                    log::debug!("ignored keyword: keyword={:?}, addr={:?}", keyword, addr);
                }
                codec::Error::MissingSignature | codec::Error::SignatureMismatch => {
                    statistics.add(Stats::DroppedPkts(1));
                    log::warn!("no signature match: addr={:?}", addr);
                }
                error => {
                    statistics.add(Stats::DroppedPkts(1));
                    log::warn!("datagram rejected: addr={:?}, error={}", addr, error);
                }
            }
        }
    }
}
