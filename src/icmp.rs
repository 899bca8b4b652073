//! ICMPv4: echo request/reply and destination-unreachable emission and
//! delivery (§4.11).

use log::trace;

use crate::checksum::internet_checksum;
use crate::types::Ipv4Addr;

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_DEST_UNREACHABLE: u8 = 3;
pub const TYPE_ECHO_REQUEST: u8 = 8;

pub const CODE_NET_UNREACHABLE: u8 = 0;
pub const CODE_HOST_UNREACHABLE: u8 = 1;
pub const CODE_PROTOCOL_UNREACHABLE: u8 = 2;
pub const CODE_PORT_UNREACHABLE: u8 = 3;
pub const CODE_FRAGMENTATION_NEEDED: u8 = 4;

const HEADER_LEN: usize = 8;

/// A successfully parsed and checksum-validated ICMP message.
pub enum Message<'a> {
    EchoRequest { identifier: u16, sequence: u16, data: &'a [u8] },
    EchoReply { identifier: u16, sequence: u16, data: &'a [u8] },
    DestUnreachable { code: u8, next_hop_mtu: u16, offending: &'a [u8] },
    Other { icmp_type: u8, code: u8 },
}

/// Parses and checksum-validates an ICMP message. Returns `None` on any
/// failure — callers log a `DropReason::BadChecksum`/`TooShort` at the
/// trace level and silently drop (§7).
pub fn parse(data: &[u8]) -> Option<Message<'_>> {
    if data.len() < HEADER_LEN {
        trace!("icmp: packet shorter than header");
        return None;
    }
    if internet_checksum(data) != 0x0000 && internet_checksum(data) != 0xFFFF {
        trace!("icmp: checksum mismatch");
        return None;
    }

    let icmp_type = data[0];
    let code = data[1];
    match icmp_type {
        TYPE_ECHO_REQUEST | TYPE_ECHO_REPLY => {
            let identifier = u16::from_be_bytes([data[4], data[5]]);
            let sequence = u16::from_be_bytes([data[6], data[7]]);
            let payload = &data[HEADER_LEN..];
            Some(if icmp_type == TYPE_ECHO_REQUEST {
                Message::EchoRequest { identifier, sequence, data: payload }
            } else {
                Message::EchoReply { identifier, sequence, data: payload }
            })
        }
        TYPE_DEST_UNREACHABLE => {
            // RFC 1191: bytes [2..4) of the "unused" field carry the
            // next-hop MTU for code 4; classic RFC 792 leaves it zero.
            let next_hop_mtu = u16::from_be_bytes([data[6], data[7]]);
            let offending = &data[HEADER_LEN..];
            Some(Message::DestUnreachable { code, next_hop_mtu, offending })
        }
        _ => Some(Message::Other { icmp_type, code }),
    }
}

/// Builds an echo reply for a received echo request.
pub fn build_echo_reply(identifier: u16, sequence: u16, data: &[u8]) -> Vec<u8> {
    build_echo(TYPE_ECHO_REPLY, identifier, sequence, data)
}

pub fn build_echo_request(identifier: u16, sequence: u16, data: &[u8]) -> Vec<u8> {
    build_echo(TYPE_ECHO_REQUEST, identifier, sequence, data)
}

fn build_echo(icmp_type: u8, identifier: u16, sequence: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + data.len());
    buf.push(icmp_type);
    buf.push(0); // code
    buf.push(0);
    buf.push(0); // checksum placeholder
    buf.extend_from_slice(&identifier.to_be_bytes());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(data);
    patch_checksum(&mut buf);
    buf
}

/// Builds a destination-unreachable message embedding the offending IP
/// header plus its first 8 bytes of payload (RFC 792).
pub fn build_dest_unreachable(code: u8, next_hop_mtu: u16, offending_ip_packet: &[u8]) -> Vec<u8> {
    let embed_len = offending_ip_packet.len().min(28);
    let mut buf = Vec::with_capacity(HEADER_LEN + embed_len);
    buf.push(TYPE_DEST_UNREACHABLE);
    buf.push(code);
    buf.push(0);
    buf.push(0);
    buf.extend_from_slice(&[0, 0]); // unused
    buf.extend_from_slice(&next_hop_mtu.to_be_bytes());
    buf.extend_from_slice(&offending_ip_packet[..embed_len]);
    patch_checksum(&mut buf);
    buf
}

fn patch_checksum(buf: &mut [u8]) {
    buf[2] = 0;
    buf[3] = 0;
    let cksum = internet_checksum(buf);
    buf[2] = (cksum >> 8) as u8;
    buf[3] = cksum as u8;
}

/// The offending flow's 4-tuple-ish identity recovered from an embedded IP
/// header, for dispatching dest-unreachable to the right TCP PCB or UDP
/// association (§4.11). Ports are `None` when the offending protocol
/// isn't TCP/UDP or the embedded 8 bytes didn't include them.
pub struct OffendingFlow {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

/// Re-parses the embedded IP header (+ first 8 bytes of its payload) from
/// a destination-unreachable message.
pub fn parse_offending(embedded: &[u8]) -> Option<OffendingFlow> {
    if embedded.len() < 20 {
        return None;
    }
    let ihl = (embedded[0] & 0x0F) as usize * 4;
    let protocol = embedded[9];
    let src = Ipv4Addr([embedded[12], embedded[13], embedded[14], embedded[15]]);
    let dst = Ipv4Addr([embedded[16], embedded[17], embedded[18], embedded[19]]);

    let (src_port, dst_port) = if embedded.len() >= ihl + 4 && (protocol == crate::ipv4::PROTO_TCP || protocol == crate::ipv4::PROTO_UDP) {
        let p = &embedded[ihl..];
        (
            Some(u16::from_be_bytes([p[0], p[1]])),
            Some(u16::from_be_bytes([p[2], p[3]])),
        )
    } else {
        (None, None)
    };

    Some(OffendingFlow { src, dst, protocol, src_port, dst_port })
}

/// Hard unreachable codes that map to `connectionAborted`/a dropped-send
/// counter, as opposed to `CODE_FRAGMENTATION_NEEDED` which feeds PMTU
/// instead (§4.11).
pub fn is_hard_unreachable(code: u8) -> bool {
    matches!(
        code,
        CODE_NET_UNREACHABLE | CODE_HOST_UNREACHABLE | CODE_PROTOCOL_UNREACHABLE | CODE_PORT_UNREACHABLE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_reply_roundtrips_through_parse() {
        let msg = build_echo_reply(7, 1, b"hello");
        match parse(&msg).unwrap() {
            Message::EchoReply { identifier, sequence, data } => {
                assert_eq!(identifier, 7);
                assert_eq!(sequence, 1);
                assert_eq!(data, b"hello");
            }
            _ => panic!("expected echo reply"),
        }
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut msg = build_echo_request(1, 1, b"x");
        msg[2] ^= 0xFF;
        assert!(parse(&msg).is_none());
    }

    #[test]
    fn dest_unreachable_embeds_offending_header() {
        let mut offending = vec![0x45u8, 0, 0, 28, 0, 0, 0, 0, 64, 6, 0, 0];
        offending.extend_from_slice(&[10, 0, 0, 1, 10, 0, 0, 2]);
        offending.extend_from_slice(&[0, 80, 0, 22]); // src port 80, dst port 22
        let msg = build_dest_unreachable(CODE_PORT_UNREACHABLE, 0, &offending);
        match parse(&msg).unwrap() {
            Message::DestUnreachable { code, offending, .. } => {
                assert_eq!(code, CODE_PORT_UNREACHABLE);
                let flow = parse_offending(offending).unwrap();
                assert_eq!(flow.src, Ipv4Addr::new(10, 0, 0, 1));
                assert_eq!(flow.src_port, Some(80));
                assert_eq!(flow.dst_port, Some(22));
            }
            _ => panic!("expected dest unreachable"),
        }
    }
}
