//! Watch server beacons, so that searching speeds up when a server appears.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
};
use tokio::{net::UdpSocket, select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    client::searcher::SearchCommand,
    messages::{RawMessage, RsrvIsUp, command},
};

/// Last beacon id seen from each server
#[derive(Default)]
pub(crate) struct BeaconTracker {
    servers: HashMap<SocketAddr, u32>,
}

impl BeaconTracker {
    /// Record a beacon. Returns true if it signals a new or restarted server.
    pub fn observe(&mut self, server: SocketAddr, beacon_id: u32) -> bool {
        match self.servers.insert(server, beacon_id) {
            None => {
                debug!("New server beacon from {server}");
                true
            }
            Some(last) if beacon_id == last || beacon_id == last.wrapping_add(1) => false,
            Some(last) => {
                debug!("Beacon anomaly from {server}: id {beacon_id} after {last}");
                true
            }
        }
    }
}

fn parse_beacon(data: &[u8], sender: SocketAddr) -> Option<(SocketAddr, u32)> {
    let messages = RawMessage::parse_many(data).ok()?;
    let raw = messages
        .into_iter()
        .find(|m| m.header.command == command::RSRV_IS_UP)?;
    let beacon = RsrvIsUp::try_from(raw).ok()?;
    let ip = beacon.server_ip.map(IpAddr::V4).unwrap_or(sender.ip());
    Some((SocketAddr::new(ip, beacon.server_port), beacon.beacon_id))
}

pub(crate) async fn watch_beacons(
    socket: std::net::UdpSocket,
    searches: mpsc::UnboundedSender<SearchCommand>,
    cancel: CancellationToken,
) {
    let socket = match UdpSocket::from_std(socket) {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Could not listen for beacons: {e}");
            return;
        }
    };
    let mut tracker = BeaconTracker::default();
    let mut buffer = vec![0u8; 0xFFFF];
    loop {
        select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buffer) => match result {
                Ok((size, sender)) => {
                    let Some((server, beacon_id)) = parse_beacon(&buffer[..size], sender) else {
                        trace!("Ignoring {size} byte non-beacon datagram from {sender}");
                        continue;
                    };
                    if tracker.observe(server, beacon_id)
                        && searches.send(SearchCommand::ResetBackoff).is_err()
                    {
                        break;
                    }
                }
                Err(e) => warn!("Error receiving beacons: {e}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::AsBytes;
    use std::net::Ipv4Addr;

    #[test]
    fn beacon_anomalies() {
        let mut tracker = BeaconTracker::default();
        let server: SocketAddr = "10.0.0.1:5064".parse().unwrap();
        assert!(tracker.observe(server, 10));
        assert!(!tracker.observe(server, 11));
        assert!(!tracker.observe(server, 11));
        // Restarted server starts counting again
        assert!(tracker.observe(server, 0));
        assert!(tracker.observe("10.0.0.2:5064".parse().unwrap(), 1));
    }

    #[test]
    fn beacon_address() {
        let sender: SocketAddr = "10.0.0.9:5065".parse().unwrap();
        let data = RsrvIsUp {
            server_port: 6000,
            beacon_id: 4,
            server_ip: None,
            protocol_version: 13,
        }
        .as_bytes();
        assert_eq!(
            parse_beacon(&data, sender),
            Some(("10.0.0.9:6000".parse().unwrap(), 4))
        );
        let data = RsrvIsUp {
            server_port: 6000,
            beacon_id: 5,
            server_ip: Some(Ipv4Addr::new(10, 0, 0, 3)),
            protocol_version: 13,
        }
        .as_bytes();
        assert_eq!(
            parse_beacon(&data, sender),
            Some(("10.0.0.3:6000".parse().unwrap(), 5))
        );
    }
}
