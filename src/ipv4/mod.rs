//! IPv4 header codec, fragmentation helpers, routing, and the reassembly
//! + PMTU engine (§4.4). The actual send/receive pipelines that tie these
//! pure pieces to ARP and the driver live on [`crate::Stack`]; this module
//! holds everything that can be tested without a driver or an ARP cache.

pub mod pmtu;
pub mod reassembly;

use bitflags::bitflags;
use log::trace;

use crate::checksum::Accumulator;
use crate::interface::{Interface, InterfaceId};
use crate::types::Ipv4Addr;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub const MIN_HEADER_LEN: usize = 20;
const FRAGMENT_UNIT: usize = 8;

bitflags! {
    /// Send-path behavior flags (§4.4).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SendFlags: u8 {
        const DONT_FRAGMENT    = 0b001;
        const ALLOW_BROADCAST  = 0b010;
        const ALLOW_NONLOCAL_SRC = 0b100;
    }
}

/// A parsed IPv4 header plus the bounds of its payload within the
/// original buffer. Options (if IHL > 5) are tolerated but not exposed.
pub struct Header {
    pub version_ihl: u8,
    pub dscp_ecn: u8,
    pub total_len: u16,
    pub ident: u16,
    pub flags_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub header_len: usize,
}

impl Header {
    pub fn more_fragments(&self) -> bool {
        self.flags_offset & 0x2000 != 0
    }

    pub fn dont_fragment(&self) -> bool {
        self.flags_offset & 0x4000 != 0
    }

    pub fn fragment_offset_bytes(&self) -> u32 {
        (self.flags_offset & 0x1FFF) as u32 * FRAGMENT_UNIT as u32
    }
}

/// Parses a header and validates its checksum. Returns `None` on any
/// structural or checksum failure (§4.4's receive pipeline: these are all
/// silent drops at the caller).
pub fn parse(data: &[u8]) -> Option<(Header, &[u8])> {
    if data.len() < MIN_HEADER_LEN {
        trace!("ip: packet shorter than minimum header");
        return None;
    }
    let version = data[0] >> 4;
    let ihl = (data[0] & 0x0F) as usize;
    let header_len = ihl * 4;
    if version != 4 || ihl < 5 || data.len() < header_len {
        trace!("ip: bad version/IHL");
        return None;
    }

    let mut acc = Accumulator::new();
    acc.add_bytes(&data[..header_len]);
    let folded = acc.finish();
    if folded != 0x0000 && folded != 0xFFFF {
        // A valid header (checksum field included) always folds to one of
        // these two one's-complement representations of zero.
        trace!("ip: header checksum mismatch");
        return None;
    }

    let total_len = u16::from_be_bytes([data[2], data[3]]);
    if (total_len as usize) < header_len || (total_len as usize) > data.len() {
        trace!("ip: bad total length");
        return None;
    }

    let header = Header {
        version_ihl: data[0],
        dscp_ecn: data[1],
        total_len,
        ident: u16::from_be_bytes([data[4], data[5]]),
        flags_offset: u16::from_be_bytes([data[6], data[7]]),
        ttl: data[8],
        protocol: data[9],
        checksum: u16::from_be_bytes([data[10], data[11]]),
        src: Ipv4Addr([data[12], data[13], data[14], data[15]]),
        dst: Ipv4Addr([data[16], data[17], data[18], data[19]]),
        header_len,
    };
    let payload = &data[header_len..total_len as usize];
    Some((header, payload))
}

/// Builds a 20-byte header (no options are ever generated outbound) with
/// a correct checksum, for a datagram or single fragment of total size
/// `header_len(20) + payload_len`.
#[allow(clippy::too_many_arguments)]
pub fn build_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    ttl: u8,
    ident: u16,
    frag_offset_bytes: u32,
    more_fragments: bool,
    dont_fragment: bool,
    payload_len: usize,
) -> [u8; MIN_HEADER_LEN] {
    let mut header = [0u8; MIN_HEADER_LEN];
    header[0] = 0x45;
    header[1] = 0;
    let total_len = (MIN_HEADER_LEN + payload_len) as u16;
    header[2..4].copy_from_slice(&total_len.to_be_bytes());
    header[4..6].copy_from_slice(&ident.to_be_bytes());

    let mut flags_offset = (frag_offset_bytes / FRAGMENT_UNIT as u32) as u16;
    if more_fragments {
        flags_offset |= 0x2000;
    }
    if dont_fragment {
        flags_offset |= 0x4000;
    }
    header[6..8].copy_from_slice(&flags_offset.to_be_bytes());

    header[8] = ttl;
    header[9] = protocol;
    header[10] = 0;
    header[11] = 0;
    header[12..16].copy_from_slice(src.as_bytes());
    header[16..20].copy_from_slice(dst.as_bytes());

    let cksum = crate::checksum::internet_checksum(&header);
    header[10] = (cksum >> 8) as u8;
    header[11] = cksum as u8;
    header
}

/// Per-destination state for the TCP fast send path (§4.4): everything
/// but TotalLen/Ident/checksum is fixed for a given (src, dst, protocol,
/// ttl), so [`prepare_send`] does that work once and [`send_fast`] only
/// finalizes the three fields that vary per datagram. There is no
/// fragmentation here — a caller whose payload doesn't fit the path MTU
/// has to fall back to [`build_header`] plus [`fragment_payload`].
#[derive(Clone, Copy)]
pub struct PreparedSend {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ttl: u8,
    protocol: u8,
    partial: Accumulator,
}

/// Precomputes everything [`send_fast`] needs except the per-datagram
/// TotalLen/Ident.
pub fn prepare_send(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, ttl: u8) -> PreparedSend {
    let mut partial = Accumulator::new();
    partial.add_u16(0x4500);
    // Ident and FlagsOffset (always 0, no fragmentation) contribute
    // nothing to the running sum; TTL/protocol and the checksum field's
    // own two zero bytes are folded in next.
    partial.add_u16(((ttl as u16) << 8) | protocol as u16);
    partial.add_bytes(src.as_bytes());
    partial.add_bytes(dst.as_bytes());
    PreparedSend { src, dst, ttl, protocol, partial }
}

/// Finalizes a single-fragment datagram header for `payload_len` bytes of
/// payload, addressed and ttl/protocol-stamped per an earlier
/// [`prepare_send`] call. Returns `None` if the datagram would overflow
/// the 16-bit TotalLen field — this path never fragments to make a
/// too-large payload fit.
pub fn send_fast(prepared: &PreparedSend, ident: u16, payload_len: usize) -> Option<[u8; MIN_HEADER_LEN]> {
    let total_len = MIN_HEADER_LEN + payload_len;
    if total_len > u16::MAX as usize {
        return None;
    }
    let total_len = total_len as u16;

    let mut acc = prepared.partial;
    acc.add_u16(total_len);
    acc.add_u16(ident);
    let cksum = acc.finish();

    let mut header = [0u8; MIN_HEADER_LEN];
    header[0] = 0x45;
    header[2..4].copy_from_slice(&total_len.to_be_bytes());
    header[4..6].copy_from_slice(&ident.to_be_bytes());
    header[8] = prepared.ttl;
    header[9] = prepared.protocol;
    header[10..12].copy_from_slice(&cksum.to_be_bytes());
    header[12..16].copy_from_slice(prepared.src.as_bytes());
    header[16..20].copy_from_slice(prepared.dst.as_bytes());
    Some(header)
}

/// Yields `(frag_offset_bytes, more_fragments, chunk)` for `payload`
/// fragmented to fit `mtu` (interface or PMTU estimate). Each fragment's
/// payload is a multiple of 8 bytes except the last.
pub fn fragment_payload(payload: &[u8], mtu: u16) -> Vec<(u32, bool, &[u8])> {
    let max_payload = ((mtu as usize).saturating_sub(MIN_HEADER_LEN) / FRAGMENT_UNIT) * FRAGMENT_UNIT;
    if max_payload == 0 || payload.len() <= max_payload {
        return vec![(0, false, payload)];
    }
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < payload.len() {
        let end = (offset + max_payload).min(payload.len());
        let more = end < payload.len();
        out.push((offset as u32, more, &payload[offset..end]));
        offset = end;
    }
    out
}

/// Longest-prefix-match routing with MRU tie-break, falling back to the
/// most-recently-used default gateway (§4.4).
pub fn route(interfaces: &[Interface], dst: Ipv4Addr) -> Option<InterfaceId> {
    let mut best: Option<(&Interface, u32)> = None;
    for iface in interfaces {
        if iface.is_in_subnet(dst) {
            let prefix_len = iface.netmask.to_u32().count_ones();
            let better = match best {
                None => true,
                Some((b, blen)) => {
                    prefix_len > blen || (prefix_len == blen && iface.last_used > b.last_used)
                }
            };
            if better {
                best = Some((iface, prefix_len));
            }
        }
    }
    if let Some((iface, _)) = best {
        return Some(iface.id);
    }

    interfaces
        .iter()
        .filter(|i| i.gateway.is_some())
        .max_by_key(|i| i.last_used)
        .map(|i| i.id)
}

/// Resolves the next-hop IP a frame for `dst` should be ARP-resolved
/// against: `dst` itself if it's on-link or a broadcast, else the
/// interface's gateway.
pub fn next_hop(iface: &Interface, dst: Ipv4Addr) -> Option<Ipv4Addr> {
    if iface.is_in_subnet(dst) || iface.is_broadcast(dst) {
        Some(dst)
    } else {
        iface.gateway
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse_roundtrips() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let header = build_header(src, dst, PROTO_UDP, 64, 7, 0, false, false, 8);
        let mut buf = header.to_vec();
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let (parsed, payload) = parse(&buf).unwrap();
        assert_eq!(parsed.src, src);
        assert_eq!(parsed.dst, dst);
        assert_eq!(parsed.protocol, PROTO_UDP);
        assert_eq!(payload, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let header = build_header(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8), 1, 64, 0, 0, false, false, 0);
        let mut buf = header.to_vec();
        buf[11] ^= 0xFF;
        assert!(parse(&buf).is_none());
    }

    #[test]
    fn fragment_count_matches_spec_formula() {
        let payload = vec![0u8; 3000];
        let mtu = 576u16;
        let frags = fragment_payload(&payload, mtu);
        let per_frag = ((mtu as usize - MIN_HEADER_LEN) / FRAGMENT_UNIT) * FRAGMENT_UNIT;
        let expected = (payload.len() + per_frag - 1) / per_frag;
        assert_eq!(frags.len(), expected);
        assert!(frags[..frags.len() - 1].iter().all(|(_, more, _)| *more));
        assert!(!frags.last().unwrap().1);
    }

    #[test]
    fn fast_path_matches_slow_path_header() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let slow = build_header(src, dst, PROTO_TCP, 64, 42, 0, false, false, 100);

        let prepared = prepare_send(src, dst, PROTO_TCP, 64);
        let fast = send_fast(&prepared, 42, 100).unwrap();
        assert_eq!(slow, fast);
    }

    #[test]
    fn fast_path_rejects_oversized_total_length() {
        let prepared = prepare_send(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8), PROTO_UDP, 64);
        assert!(send_fast(&prepared, 0, u16::MAX as usize).is_none());
    }
}
