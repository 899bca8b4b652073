//! UDP (§4.10): a listener list matched by port, a 4-tuple association
//! index for "connected" sockets, and ephemeral port allocation.

use log::{trace, warn};

use crate::checksum::transport_checksum;
use crate::error::{Result, StackError};
use crate::types::{FourTuple, Ipv4Addr};

const HEADER_LEN: usize = 8;

/// What a UDP handler reports for one received datagram.
pub enum Verdict {
    /// Not for this handler; try the next listener/association.
    Reject,
    /// Accepted; other listeners may still see it.
    AcceptContinue,
    /// Accepted; stop searching.
    AcceptStop,
}

pub trait UdpHandler {
    fn on_datagram(&mut self, tuple: FourTuple, data: &[u8]) -> Verdict;
}

struct Listener {
    port: u16,
    handler: Box<dyn UdpHandler>,
}

struct Association {
    tuple: FourTuple,
    handler: Box<dyn UdpHandler>,
}

#[derive(Clone, Copy, Debug)]
pub struct EphemeralRange {
    pub low: u16,
    pub high: u16,
}

impl Default for EphemeralRange {
    fn default() -> Self {
        EphemeralRange { low: 49_152, high: 65_535 }
    }
}

/// What happened when an inbound datagram was run through the engine.
pub enum ReceiveOutcome {
    Delivered,
    /// No association or listener accepted it; caller should emit ICMP
    /// Port-Unreachable if `dst` is one of its own addresses.
    Unreachable,
}

pub struct UdpEngine {
    listeners: Vec<Listener>,
    associations: Vec<Association>,
    ephemeral_range: EphemeralRange,
    next_ephemeral: u16,
}

impl UdpEngine {
    pub fn new(ephemeral_range: EphemeralRange) -> Self {
        let next = ephemeral_range.low;
        UdpEngine {
            listeners: Vec::new(),
            associations: Vec::new(),
            ephemeral_range,
            next_ephemeral: next,
        }
    }

    pub fn bind(&mut self, port: u16, handler: Box<dyn UdpHandler>) -> Result<()> {
        if self.listeners.iter().any(|l| l.port == port) {
            return Err(StackError::AddrInUse);
        }
        self.listeners.push(Listener { port, handler });
        Ok(())
    }

    pub fn unbind(&mut self, port: u16) {
        self.listeners.retain(|l| l.port != port);
    }

    pub fn associate(&mut self, tuple: FourTuple, handler: Box<dyn UdpHandler>) -> Result<()> {
        if self.associations.iter().any(|a| a.tuple == tuple) {
            return Err(StackError::AddrInUse);
        }
        self.associations.push(Association { tuple, handler });
        Ok(())
    }

    pub fn disassociate(&mut self, tuple: FourTuple) {
        self.associations.retain(|a| a.tuple != tuple);
    }

    /// Allocates an unused ephemeral port for `local_addr`, cycling
    /// through the configured range.
    pub fn alloc_ephemeral_port(&mut self, local_addr: Ipv4Addr, remote: FourTuple) -> Result<u16> {
        let range = self.ephemeral_range.high - self.ephemeral_range.low + 1;
        for _ in 0..range {
            let port = self.next_ephemeral;
            self.next_ephemeral = if self.next_ephemeral >= self.ephemeral_range.high {
                self.ephemeral_range.low
            } else {
                self.next_ephemeral + 1
            };
            let candidate = FourTuple::new(local_addr, port, remote.remote_addr, remote.remote_port);
            if !self.associations.iter().any(|a| a.tuple == candidate) {
                return Ok(port);
            }
        }
        warn!("udp: no ephemeral port available in {:?}", self.ephemeral_range.low..=self.ephemeral_range.high);
        Err(StackError::NoPortAvailable)
    }

    /// Runs an inbound datagram through associations first, then
    /// listeners, per §4.10.
    pub fn receive(&mut self, src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, data: &[u8]) -> ReceiveOutcome {
        let tuple = FourTuple::new(dst, dst_port, src, src_port);

        for assoc in self.associations.iter_mut() {
            if assoc.tuple == tuple {
                match assoc.handler.on_datagram(tuple, data) {
                    Verdict::Reject => continue,
                    Verdict::AcceptContinue | Verdict::AcceptStop => return ReceiveOutcome::Delivered,
                }
            }
        }

        for listener in self.listeners.iter_mut() {
            if listener.port == dst_port {
                match listener.handler.on_datagram(tuple, data) {
                    Verdict::Reject => continue,
                    Verdict::AcceptContinue => return ReceiveOutcome::Delivered,
                    Verdict::AcceptStop => return ReceiveOutcome::Delivered,
                }
            }
        }

        trace!("udp: no listener/association for {}", tuple);
        ReceiveOutcome::Unreachable
    }
}

/// Parses a UDP header, returning `(src_port, dst_port, payload)`. A
/// checksum of `0` in the wire header means "no checksum" on receive
/// (§6), so validation is the caller's responsibility when it cares.
pub fn parse(data: &[u8]) -> Option<(u16, u16, u16, &[u8])> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let length = u16::from_be_bytes([data[4], data[5]]);
    let checksum = u16::from_be_bytes([data[6], data[7]]);
    if length as usize > data.len() || (length as usize) < HEADER_LEN {
        return None;
    }
    let payload = &data[HEADER_LEN..length as usize];
    Some((src_port, dst_port, checksum, payload))
}

pub fn validate_checksum(src: Ipv4Addr, dst: Ipv4Addr, checksum: u16, datagram: &[u8]) -> bool {
    if checksum == 0 {
        return true;
    }
    let computed = transport_checksum(src, dst, crate::ipv4::PROTO_UDP, datagram.len() as u16, [datagram]);
    computed == 0x0000 || computed == 0xFFFF
}

/// Builds a UDP datagram with a pseudo-header checksum.
pub fn build(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, data: &[u8]) -> Vec<u8> {
    let total_len = HEADER_LEN + data.len();
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf.extend_from_slice(&(total_len as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(data);

    let cksum = transport_checksum(src, dst, crate::ipv4::PROTO_UDP, total_len as u16, [&buf[..]]);
    // All-zero checksum is reserved for "no checksum"; RFC 768 says to
    // send 0xFFFF in that case.
    let cksum = if cksum == 0 { 0xFFFF } else { cksum };
    buf[6] = (cksum >> 8) as u8;
    buf[7] = cksum as u8;
    buf
}
