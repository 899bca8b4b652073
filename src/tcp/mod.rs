//! TCP: header codec, the PCB table, the input/output state machine, and
//! the application-facing Connection/Listener API (§4.5-§4.9).
//!
//! ## Module structure
//!
//! - `pcb` — the Transmission Control Block and the pluggable 4-tuple index
//! - `congestion` — slow-start/congestion-avoidance/fast-recovery/RTO (§4.8)
//! - `input` — inbound segment processing (§4.6)
//! - `output` — segmentation, retransmission, Nagle, zero-window probing
//! - `connect` — `Connection`/`Listener`, the application-facing handle types
//! - `timer` — per-PCB timer bookkeeping driven by the event loop

pub mod congestion;
pub mod connect;
pub mod input;
pub mod output;
pub mod pcb;
pub mod timer;

use bitflags::bitflags;

pub const HEADER_LEN: usize = 20;
pub const DEFAULT_MSS: u16 = 536;
pub const TIME_WAIT_MS: u64 = 120_000; // 2*MSL
pub const DELAYED_ACK_MS: u64 = 200;
pub const DELAYED_ACK_SEGMENTS: u8 = 2;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Flags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    SynSent,
    SynRcvd,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    Closed,
}

/// Options recognized on a SYN segment (§6): MSS and window scale. Any
/// other option kind is tolerated and ignored.
#[derive(Clone, Copy, Default, Debug)]
pub struct Options {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
}

pub struct Segment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: Flags,
    pub window: u16,
    pub options: Options,
    pub payload: &'a [u8],
}

/// Parses a TCP header (+ options, + payload) from `data`. Does not
/// validate the checksum — that needs the pseudo-header, computed by the
/// caller which knows the source/destination addresses.
pub fn parse(data: &[u8]) -> Option<Segment<'_>> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let data_offset = ((data[12] >> 4) as usize) * 4;
    if data_offset < HEADER_LEN || data.len() < data_offset {
        return None;
    }

    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ack = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let flags = Flags::from_bits_truncate(data[13]);
    let window = u16::from_be_bytes([data[14], data[15]]);

    let options = parse_options(&data[HEADER_LEN..data_offset]);
    let payload = &data[data_offset..];

    Some(Segment {
        src_port,
        dst_port,
        seq,
        ack,
        flags,
        window,
        options,
        payload,
    })
}

fn parse_options(mut opts: &[u8]) -> Options {
    let mut out = Options::default();
    while !opts.is_empty() {
        match opts[0] {
            0 => break,                      // end of options
            1 => opts = &opts[1..],          // NOP
            2 if opts.len() >= 4 => {
                out.mss = Some(u16::from_be_bytes([opts[2], opts[3]]));
                opts = &opts[4..];
            }
            3 if opts.len() >= 3 => {
                out.window_scale = Some(opts[2]);
                opts = &opts[3..];
            }
            _ if opts.len() >= 2 && opts[1] >= 2 => {
                let len = opts[1] as usize;
                opts = &opts[len.min(opts.len())..];
            }
            _ => break,
        }
    }
    out
}

/// Builds a segment with no options (the common data/ACK/FIN/RST case).
#[allow(clippy::too_many_arguments)]
pub fn build(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: Flags,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    write_fixed_header(&mut buf, src_port, dst_port, seq, ack, flags, window, 5);
    buf.extend_from_slice(payload);
    buf
}

/// Builds a SYN/SYN-ACK with MSS + WindowScale options (§4.7).
#[allow(clippy::too_many_arguments)]
pub fn build_syn(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: Flags,
    window: u16,
    mss: u16,
    window_scale: u8,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 8);
    write_fixed_header(&mut buf, src_port, dst_port, seq, ack, flags, window, 7);
    buf.push(2);
    buf.push(4);
    buf.extend_from_slice(&mss.to_be_bytes());
    buf.push(1); // NOP
    buf.push(3);
    buf.push(3);
    buf.push(window_scale);
    buf
}

fn write_fixed_header(
    buf: &mut Vec<u8>,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: Flags,
    window: u16,
    data_offset_words: u8,
) {
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&ack.to_be_bytes());
    buf.push(data_offset_words << 4);
    buf.push(flags.bits());
    buf.extend_from_slice(&window.to_be_bytes());
    buf.push(0); // checksum placeholder
    buf.push(0);
    buf.push(0); // urgent pointer
    buf.push(0);
}

/// Validates a received segment's pseudo-header checksum (§4.6 step 1).
pub fn validate_checksum(src: crate::types::Ipv4Addr, dst: crate::types::Ipv4Addr, segment: &[u8]) -> bool {
    let cksum = crate::checksum::transport_checksum(src, dst, crate::ipv4::PROTO_TCP, segment.len() as u16, [segment]);
    cksum == 0x0000 || cksum == 0xFFFF
}

/// Patches the checksum field of a built segment in place.
pub fn patch_checksum(segment: &mut [u8], src: crate::types::Ipv4Addr, dst: crate::types::Ipv4Addr) {
    segment[16] = 0;
    segment[17] = 0;
    let cksum = crate::checksum::transport_checksum(src, dst, crate::ipv4::PROTO_TCP, segment.len() as u16, [&*segment]);
    segment[16] = (cksum >> 8) as u8;
    segment[17] = cksum as u8;
}
