//! BGP-4 wire encoding, the subset a route announcer needs (RFC 4271).
//! Inbound UPDATE bodies are never interpreted; the sidecar imports
//! nothing from the fabric.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use super::route::Path;
use super::{Error, Result};

pub const BGP_PORT: u16 = 179;
pub const VERSION: u8 = 4;
pub const HOLD_TIME: u16 = 90;
pub const HEADER_LEN: usize = 19;
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Two-octet stand-in when the local AS does not fit sixteen bits.
const AS_TRANS: u16 = 23456;

/// NOTIFICATION error code for administrative shutdown.
pub const CEASE: u8 = 6;

const ORIGIN_IGP: u8 = 0;
const ATTR_FLAG_TRANSITIVE: u8 = 0x40;
const ATTR_ORIGIN: u8 = 1;
const ATTR_AS_PATH: u8 = 2;
const ATTR_NEXT_HOP: u8 = 3;
const AS_SEQUENCE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Open,
    Update,
    Notification,
    Keepalive,
}

impl MessageType {
    fn code(self) -> u8 {
        match self {
            MessageType::Open => 1,
            MessageType::Update => 2,
            MessageType::Notification => 3,
            MessageType::Keepalive => 4,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(MessageType::Open),
            2 => Ok(MessageType::Update),
            3 => Ok(MessageType::Notification),
            4 => Ok(MessageType::Keepalive),
            other => Err(Error::Protocol(format!("unknown message type {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub peer_as: u32,
    pub hold_time: u16,
    pub router_id: Ipv4Addr,
}

fn message(kind: MessageType, body: &[u8]) -> Vec<u8> {
    let len = HEADER_LEN + body.len();
    let mut buf = Vec::with_capacity(len);
    buf.extend([0xff; 16]);
    buf.extend(u16::try_from(len).unwrap_or(u16::MAX).to_be_bytes());
    buf.push(kind.code());
    buf.extend(body);
    buf
}

#[must_use]
pub fn open(local_as: u32, router_id: Ipv4Addr) -> Vec<u8> {
    let my_as = u16::try_from(local_as).unwrap_or(AS_TRANS);
    let mut body = Vec::with_capacity(10);
    body.push(VERSION);
    body.extend(my_as.to_be_bytes());
    body.extend(HOLD_TIME.to_be_bytes());
    body.extend(router_id.octets());
    body.push(0); // no optional parameters
    message(MessageType::Open, &body)
}

#[must_use]
pub fn keepalive() -> Vec<u8> {
    message(MessageType::Keepalive, &[])
}

#[must_use]
pub fn notification(code: u8, subcode: u8) -> Vec<u8> {
    message(MessageType::Notification, &[code, subcode])
}

/// Encode an UPDATE announcing or withdrawing a single IPv4 prefix.
#[must_use]
pub fn update(path: &Path, local_as: u32, peer_as: u32) -> Vec<u8> {
    let mut body = Vec::new();
    if path.withdraw {
        let prefix = encode_prefix(path.prefix);
        body.extend(u16::try_from(prefix.len()).unwrap_or(u16::MAX).to_be_bytes());
        body.extend(prefix);
        body.extend(0u16.to_be_bytes());
    } else {
        body.extend(0u16.to_be_bytes());
        let attrs = path_attributes(path.next_hop, local_as, peer_as);
        body.extend(u16::try_from(attrs.len()).unwrap_or(u16::MAX).to_be_bytes());
        body.extend(attrs);
        body.extend(encode_prefix(path.prefix));
    }
    message(MessageType::Update, &body)
}

fn path_attributes(next_hop: Ipv4Addr, local_as: u32, peer_as: u32) -> Vec<u8> {
    let mut attrs = Vec::new();

    attrs.extend([ATTR_FLAG_TRANSITIVE, ATTR_ORIGIN, 1, ORIGIN_IGP]);

    // Empty AS_PATH towards iBGP peers, a single-hop sequence otherwise.
    if local_as == peer_as {
        attrs.extend([ATTR_FLAG_TRANSITIVE, ATTR_AS_PATH, 0]);
    } else {
        let my_as = u16::try_from(local_as).unwrap_or(AS_TRANS);
        attrs.extend([ATTR_FLAG_TRANSITIVE, ATTR_AS_PATH, 4, AS_SEQUENCE, 1]);
        attrs.extend(my_as.to_be_bytes());
    }

    attrs.extend([ATTR_FLAG_TRANSITIVE, ATTR_NEXT_HOP, 4]);
    attrs.extend(next_hop.octets());
    attrs
}

fn encode_prefix(prefix: Ipv4Net) -> Vec<u8> {
    let len = prefix.prefix_len();
    let octets = prefix.network().octets();
    let significant = usize::from(len.div_ceil(8));
    let mut buf = Vec::with_capacity(1 + significant);
    buf.push(len);
    buf.extend(&octets[..significant]);
    buf
}

/// Validate a message header, returning the type and body length.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(MessageType, usize)> {
    if header[..16] != [0xff; 16] {
        return Err(Error::Protocol("bad marker".to_owned()));
    }
    let len = usize::from(u16::from_be_bytes([header[16], header[17]]));
    if !(HEADER_LEN..=MAX_MESSAGE_LEN).contains(&len) {
        return Err(Error::Protocol(format!("bad message length {len}")));
    }
    let kind = MessageType::from_code(header[18])?;
    Ok((kind, len - HEADER_LEN))
}

pub fn parse_open(body: &[u8]) -> Result<OpenMessage> {
    if body.len() < 10 {
        return Err(Error::Protocol("short OPEN".to_owned()));
    }
    if body[0] != VERSION {
        return Err(Error::Protocol(format!("unsupported version {}", body[0])));
    }
    Ok(OpenMessage {
        peer_as: u32::from(u16::from_be_bytes([body[1], body[2]])),
        hold_time: u16::from_be_bytes([body[3], body[4]]),
        router_id: Ipv4Addr::new(body[5], body[6], body[7], body[8]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(prefix: &str, next_hop: &str, withdraw: bool) -> Path {
        Path {
            prefix: prefix.parse().unwrap(),
            next_hop: next_hop.parse().unwrap(),
            withdraw,
        }
    }

    #[test]
    fn keepalive_is_bare_header() {
        let msg = keepalive();
        assert_eq!(msg.len(), HEADER_LEN);
        let header: &[u8; HEADER_LEN] = msg.as_slice().try_into().unwrap();
        let (kind, body_len) = parse_header(header).unwrap();
        assert_eq!(kind, MessageType::Keepalive);
        assert_eq!(body_len, 0);
    }

    #[test]
    fn open_round_trips() {
        let router_id = Ipv4Addr::new(10, 0, 0, 1);
        let msg = open(65000, router_id);
        let header: &[u8; HEADER_LEN] = msg[..HEADER_LEN].try_into().unwrap();
        let (kind, body_len) = parse_header(header).unwrap();
        assert_eq!(kind, MessageType::Open);
        assert_eq!(body_len, msg.len() - HEADER_LEN);

        let parsed = parse_open(&msg[HEADER_LEN..]).unwrap();
        assert_eq!(parsed.peer_as, 65000);
        assert_eq!(parsed.hold_time, HOLD_TIME);
        assert_eq!(parsed.router_id, router_id);
    }

    #[test]
    fn announce_carries_next_hop_and_nlri() {
        let msg = update(&path("192.0.2.10/32", "10.0.0.1", false), 65000, 65000);
        let body = &msg[HEADER_LEN..];

        // No withdrawn routes.
        assert_eq!(&body[..2], &[0, 0]);
        // NLRI sits at the tail: /32 needs all four octets.
        assert_eq!(&body[body.len() - 5..], &[32, 192, 0, 2, 10]);
        // NEXT_HOP attribute value is present verbatim.
        let next_hop = [ATTR_FLAG_TRANSITIVE, ATTR_NEXT_HOP, 4, 10, 0, 0, 1];
        assert!(body.windows(next_hop.len()).any(|w| w == next_hop));
    }

    #[test]
    fn ebgp_announce_carries_as_sequence() {
        let msg = update(&path("192.0.2.10/32", "10.0.0.1", false), 65000, 65001);
        let body = &msg[HEADER_LEN..];
        let as_path = [
            ATTR_FLAG_TRANSITIVE,
            ATTR_AS_PATH,
            4,
            AS_SEQUENCE,
            1,
            0xfd,
            0xe8,
        ];
        assert!(body.windows(as_path.len()).any(|w| w == as_path));
    }

    #[test]
    fn withdraw_has_no_attributes() {
        let msg = update(&path("10.42.1.0/24", "10.0.0.1", true), 65000, 65000);
        let body = &msg[HEADER_LEN..];

        // Withdrawn routes length covers the /24 prefix (one length
        // octet plus three significant octets), attributes are empty.
        assert_eq!(&body[..2], &[0, 4]);
        assert_eq!(&body[2..6], &[24, 10, 42, 1]);
        assert_eq!(&body[6..8], &[0, 0]);
        assert_eq!(body.len(), 8);
    }

    #[test]
    fn header_rejects_garbage() {
        let mut header = [0xff_u8; HEADER_LEN];
        header[16] = 0;
        header[17] = 19;
        header[18] = 9;
        assert!(parse_header(&header).is_err());

        header[0] = 0;
        header[18] = 4;
        assert!(parse_header(&header).is_err());
    }
}
