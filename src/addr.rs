//! Pure, I/O-free address and packet helpers.
//!
//! Grounded on `edejong-dbc-mtr-ng::probe::{construct_icmp_packet,
//! construct_icmp6_packet, calculate_icmp_checksum}`, generalized to a
//! single family-aware builder and to the UDP (no ICMP header) case,
//! and on `g1_nix::sys::socket::IcmpEchoHeader` for the RFC 1071
//! checksum shape.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::model::ProbeKind;

/// ICMP echo header size in bytes (type, code, checksum, id, seq).
pub const ICMP_HEADER_SIZE: usize = 8;

/// IPv4 header size assumed for overhead accounting (no options).
pub const IPV4_HEADER_SIZE: usize = 20;

/// IPv6 header size.
pub const IPV6_HEADER_SIZE: usize = 40;

/// UDP header size.
pub const UDP_HEADER_SIZE: usize = 8;

const ICMP_ECHO_REQUEST_V4: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;

/// Parses `text` as IPv4 first, then IPv6. Returns `None` if neither
/// textual form is valid.
pub fn parse_ip(text: &str) -> Option<IpAddr> {
    if let Ok(v4) = Ipv4Addr::from_str(text) {
        return Some(IpAddr::V4(v4));
    }
    if let Ok(v6) = Ipv6Addr::from_str(text) {
        return Some(IpAddr::V6(v6));
    }
    None
}

/// Canonical textual form of a binary address.
pub fn format_ip(addr: IpAddr) -> String {
    addr.to_string()
}

/// IP-header-only overhead (20 for v4, 40 for v6) plus a UDP header
/// (8 bytes) when `kind` is UDP.
pub fn overhead_bytes(family_is_v6: bool, kind: ProbeKind) -> usize {
    let ip = if family_is_v6 {
        IPV6_HEADER_SIZE
    } else {
        IPV4_HEADER_SIZE
    };
    let udp = if matches!(kind, ProbeKind::Udp) {
        UDP_HEADER_SIZE
    } else {
        0
    };
    ip + udp
}

/// Builds the outgoing packet for one probe.
///
/// For [`ProbeKind::Icmp`] the first [`ICMP_HEADER_SIZE`] bytes are an
/// echo-request header carrying `(identifier, sequence)`; anything past
/// it is pattern-tiled payload. If `size` is smaller than the header,
/// the packet is expanded to exactly the header size — this is the
/// boundary behavior spec.md §8 requires ("reported `probeSize` equals
/// the actual sent length").
///
/// For [`ProbeKind::Udp`] the whole buffer is pattern-tiled with no
/// reserved header.
pub fn build_packet(
    kind: ProbeKind,
    family_is_v6: bool,
    identifier: u16,
    sequence: u16,
    size: usize,
    pattern: &[u8],
) -> Vec<u8> {
    match kind {
        ProbeKind::Udp => {
            let mut buf = vec![0u8; size];
            tile_pattern(&mut buf, pattern);
            buf
        }
        ProbeKind::Icmp => {
            let total = size.max(ICMP_HEADER_SIZE);
            let mut buf = vec![0u8; total];
            tile_pattern(&mut buf[ICMP_HEADER_SIZE..], pattern);
            write_icmp_echo_header(&mut buf, family_is_v6, identifier, sequence);
            buf
        }
    }
}

/// Fills `buf` by repeating `pattern` start-to-end. An empty pattern is
/// treated as a single zero byte, matching the spec's "pattern=null →
/// zero fill" default.
fn tile_pattern(buf: &mut [u8], pattern: &[u8]) {
    if buf.is_empty() {
        return;
    }
    if pattern.is_empty() {
        buf.fill(0);
        return;
    }
    for (chunk, src) in buf.chunks_mut(pattern.len()).zip(std::iter::repeat(pattern)) {
        let n = chunk.len();
        chunk.copy_from_slice(&src[..n]);
    }
}

/// Writes type/code/checksum/id/seq into the first [`ICMP_HEADER_SIZE`]
/// bytes of `buf`. For IPv6 the checksum field is left at zero: the
/// kernel computes it from the pseudo-header at send time, the same
/// assumption `construct_icmp6_packet` documents.
fn write_icmp_echo_header(buf: &mut [u8], family_is_v6: bool, identifier: u16, sequence: u16) {
    debug_assert!(buf.len() >= ICMP_HEADER_SIZE);
    buf[0] = if family_is_v6 {
        ICMPV6_ECHO_REQUEST
    } else {
        ICMP_ECHO_REQUEST_V4
    };
    buf[1] = 0; // code
    buf[2] = 0;
    buf[3] = 0; // checksum placeholder
    buf[4..6].copy_from_slice(&identifier.to_be_bytes());
    buf[6..8].copy_from_slice(&sequence.to_be_bytes());

    if !family_is_v6 {
        let checksum = icmp_checksum(buf);
        buf[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
}

/// RFC 1071 one's-complement checksum over `data`, with the checksum
/// field itself assumed to be zero (as it is, here, before this call).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_and_v6() {
        assert_eq!(parse_ip("127.0.0.1"), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(parse_ip("::1"), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(parse_ip("not-an-ip"), None);
    }

    #[test]
    fn format_round_trips() {
        let a = parse_ip("192.0.2.7").unwrap();
        assert_eq!(format_ip(a), "192.0.2.7");
        let b = parse_ip("2001:db8::7").unwrap();
        assert_eq!(format_ip(b), "2001:db8::7");
    }

    #[test]
    fn udp_packet_is_pattern_tiled_with_no_header() {
        let pkt = build_packet(ProbeKind::Udp, false, 1, 1, 10, &[0xAB, 0xCD]);
        assert_eq!(pkt.len(), 10);
        assert_eq!(pkt, vec![0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD]);
    }

    #[test]
    fn icmp_packet_expands_to_header_size_when_requested_smaller() {
        let pkt = build_packet(ProbeKind::Icmp, false, 0x1234, 7, 4, &[]);
        assert_eq!(pkt.len(), ICMP_HEADER_SIZE);
        assert_eq!(&pkt[4..6], &0x1234u16.to_be_bytes());
        assert_eq!(&pkt[6..8], &7u16.to_be_bytes());
    }

    #[test]
    fn icmp_packet_is_deterministic_for_same_inputs() {
        let a = build_packet(ProbeKind::Icmp, false, 42, 99, 32, b"ab");
        let b = build_packet(ProbeKind::Icmp, false, 42, 99, 32, b"ab");
        assert_eq!(a, b);
    }

    #[test]
    fn icmpv6_echo_header_leaves_checksum_zero() {
        let pkt = build_packet(ProbeKind::Icmp, true, 1, 1, 16, &[]);
        assert_eq!(pkt[0], ICMPV6_ECHO_REQUEST);
        assert_eq!(&pkt[2..4], &[0, 0]);
    }

    #[test]
    fn checksum_is_internally_consistent() {
        // A packet with a correct checksum, when summed including the
        // checksum field, reduces to 0xFFFF (one's-complement identity).
        let pkt = build_packet(ProbeKind::Icmp, false, 0xbeef, 0xcafe, 8, &[]);
        let mut sum = 0u32;
        for chunk in pkt.chunks(2) {
            sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        while (sum >> 16) != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        assert_eq!(sum as u16, 0xffff);
    }
}
