//! Bootstrap-time neighbor discovery: the top-of-rack routers are
//! whoever answers a TTL-1 probe leaving this host.

use std::collections::BTreeSet;
use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("discovered {found} neighbors, expected {expected}")]
    CountMismatch { expected: usize, found: usize },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classic traceroute destination port range.
const PROBE_BASE_PORT: u16 = 33434;
const READ_TIMEOUT: Duration = Duration::from_millis(200);
const REPLY_WAIT: Duration = Duration::from_secs(2);
const ICMP_TIME_EXCEEDED: u8 = 11;

/// Send `probe_count` TTL-1 UDP probes towards synthetic off-subnet
/// destinations and collect the distinct sources of the ICMP
/// time-exceeded replies. Startup-fatal unless exactly `expected`
/// distinct neighbors answer.
pub async fn discover_neighbors(
    host_ip: Ipv4Addr,
    probe_count: usize,
    expected: usize,
) -> Result<Vec<Ipv4Addr>> {
    tokio::task::spawn_blocking(move || probe(host_ip, probe_count, expected))
        .await
        .map_err(|err| Error::Io(io::Error::other(err)))?
}

fn probe(host_ip: Ipv4Addr, probe_count: usize, expected: usize) -> Result<Vec<Ipv4Addr>> {
    let icmp = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    icmp.set_read_timeout(Some(READ_TIMEOUT))?;
    let icmp: UdpSocket = icmp.into();

    let probes = UdpSocket::bind((host_ip, 0))?;
    probes.set_ttl(1)?;
    for (i, destination) in probe_destinations(host_ip, probe_count).enumerate() {
        let port = PROBE_BASE_PORT + u16::try_from(i).unwrap_or(0);
        debug!("probing via {destination}:{port}");
        let _ = probes.send_to(b"kube-parrot", (destination, port));
    }

    let mut neighbors = BTreeSet::new();
    let deadline = Instant::now() + REPLY_WAIT;
    let mut buffer = [0_u8; 512];
    while Instant::now() < deadline {
        match icmp.recv_from(&mut buffer) {
            Ok((len, _)) => {
                if let Some(source) = parse_time_exceeded(&buffer[..len]) {
                    debug!("time-exceeded reply from {source}");
                    neighbors.insert(source);
                }
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err.into()),
        }
    }

    if neighbors.len() != expected {
        return Err(Error::CountMismatch {
            expected,
            found: neighbors.len(),
        });
    }
    Ok(neighbors.into_iter().collect())
}

/// Destinations one /24 over from the host, far enough to need the
/// gateway but spread so ECMP hashes probes across all uplinks.
fn probe_destinations(host_ip: Ipv4Addr, count: usize) -> impl Iterator<Item = Ipv4Addr> {
    let [a, b, c, _] = host_ip.octets();
    (0..count).map(move |i| {
        let offset = u8::try_from(i % 250).unwrap_or(0);
        Ipv4Addr::new(a, b, c.wrapping_add(1).wrapping_add(offset), 1)
    })
}

/// Source address of an ICMP time-exceeded reply, `None` for anything
/// else landing on the raw socket.
fn parse_time_exceeded(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 {
        return None;
    }
    let header_len = usize::from(packet[0] & 0x0f) * 4;
    let icmp_type = *packet.get(header_len)?;
    if icmp_type != ICMP_TIME_EXCEEDED {
        return None;
    }
    Some(Ipv4Addr::new(
        packet[12], packet[13], packet[14], packet[15],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destinations_leave_the_local_subnet() {
        let destinations: Vec<Ipv4Addr> =
            probe_destinations(Ipv4Addr::new(10, 0, 4, 17), 3).collect();
        assert_eq!(
            destinations,
            vec![
                Ipv4Addr::new(10, 0, 5, 1),
                Ipv4Addr::new(10, 0, 6, 1),
                Ipv4Addr::new(10, 0, 7, 1),
            ]
        );
    }

    #[test]
    fn time_exceeded_replies_are_recognised() {
        // 20-byte IPv4 header, source 10.0.0.254, ICMP type 11.
        let mut packet = vec![0_u8; 28];
        packet[0] = 0x45;
        packet[12..16].copy_from_slice(&[10, 0, 0, 254]);
        packet[20] = ICMP_TIME_EXCEEDED;
        assert_eq!(
            parse_time_exceeded(&packet),
            Some(Ipv4Addr::new(10, 0, 0, 254))
        );

        // Echo replies are not neighbors.
        packet[20] = 0;
        assert_eq!(parse_time_exceeded(&packet), None);
    }
}
