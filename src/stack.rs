//! The integration point (§3.1, §5): owns every interface and protocol
//! engine, and is the only thing in the crate that routes, resolves ARP,
//! and touches a driver. Everything downstream of here (`arp`, `ipv4`,
//! `tcp`, `udp`, `icmp`) is pure state machines plus codecs that return
//! what they'd like sent rather than sending it themselves — `Stack` is
//! where those return values actually become frames on the wire.
//!
//! Driven by two external calls, matching the teacher's own net stack
//! (`kernel/src/net::poll`, one RX-drain-then-retransmit-check loop): the
//! event loop feeds inbound frames to [`Stack::receive_frame`] as they
//! arrive, and calls [`Stack::poll`] periodically so timers (ARP
//! retransmits, TCP retransmit/delayed-ack/persist/TIME_WAIT, PMTU idle
//! eviction) get serviced even when nothing arrives.

use std::collections::HashMap;

use log::{debug, trace, warn};
use rand_chacha::rand_core::SeedableRng;

use crate::arp::{self, ArpCache, Resolution, WaiterId};
use crate::config::StackConfig;
use crate::error::{DropReason, Result, StackError};
use crate::ethernet::{self, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::icmp;
use crate::interface::{Interface, InterfaceConfig, InterfaceId, IpListener};
use crate::ipv4::pmtu::{MtuRef, PmtuCache};
use crate::ipv4::reassembly::{FragmentOutcome, Reassembler};
use crate::ipv4::{self, SendFlags};
use crate::platform::{Clock, L2Driver};
use crate::tcp::connect::{ConnId, ListenerId, OutgoingSegment, TcpEngine, TcpEngineConfig, TcpHandler};
use crate::tcp::pcb::IndexImpl;
use crate::tcp::{input as tcp_input, output as tcp_output, timer as tcp_timer};
use crate::types::{FourTuple, Ipv4Addr, MacAddr};
use crate::udp::{self, UdpEngine, UdpHandler};

const DEFAULT_TTL: u8 = 64;

/// A send still waiting on ARP resolution, queued so the caller doesn't
/// have to retry themselves — `ArpCache::save`'s returned waiters drive
/// [`Stack::flush_arp_waiters`], which replays exactly these bytes once
/// the MAC is known (§4.2 "the cache only ever hands tokens back, it
/// never interprets them" — here the token names a slot in this queue).
struct PendingSend {
    waiter: WaiterId,
    iface: InterfaceId,
    next_hop: Ipv4Addr,
    /// One or more already-built IP datagrams (already fragmented) to
    /// wrap in an Ethernet header and send once the MAC resolves.
    datagrams: Vec<Vec<u8>>,
}

/// Counters surfaced for tests/diagnostics only (§7): production code
/// never inspects these to make decisions, and inbound drops never
/// become a `StackError` the caller has to handle.
#[derive(Clone, Copy, Default, Debug)]
pub struct Diagnostics {
    pub too_short: u64,
    pub bad_checksum: u64,
    pub no_route: u64,
    pub reassembly_table_full: u64,
    pub reassembly_timed_out: u64,
    pub unknown_protocol: u64,
    pub not_acceptable: u64,
    pub no_matching_pcb_or_listener: u64,
    pub listener_backlog_full: u64,
}

impl Diagnostics {
    fn record(&mut self, reason: DropReason) {
        match reason {
            DropReason::TooShort | DropReason::BadVersion => self.too_short += 1,
            DropReason::BadChecksum => self.bad_checksum += 1,
            DropReason::TtlExceeded => {}
            DropReason::NoRoute => self.no_route += 1,
            DropReason::ReassemblyTableFull => self.reassembly_table_full += 1,
            DropReason::ReassemblyTimedOut => self.reassembly_timed_out += 1,
            DropReason::UnknownProtocol => self.unknown_protocol += 1,
            DropReason::NotAcceptable => self.not_acceptable += 1,
            DropReason::NoMatchingPcbOrListener => self.no_matching_pcb_or_listener += 1,
            DropReason::ListenerBacklogFull => self.listener_backlog_full += 1,
        }
    }
}

/// A PMTU observer registration, so [`PmtuCache::report_too_big`]'s
/// returned `MtuRef`s can be mapped back to a live TCP PCB: the cache
/// itself only ever stores and replays the tokens it was handed
/// ([`crate::ipv4::pmtu`] doc comment), it has no notion of a PCB.
#[derive(Clone, Copy)]
struct MtuWatch {
    conn: ConnId,
}

/// The whole network stack: every interface, every protocol engine, and
/// the plumbing between them. Not `Sync`/`Send` by construction (driver
/// trait objects and `Rc`-based test media aren't) — it is meant to be
/// owned and driven by a single event-loop task (§5).
pub struct Stack<C: Clock> {
    interfaces: Vec<Interface>,
    next_interface_id: u32,
    reassembler: Reassembler,
    pmtu: PmtuCache,
    tcp: TcpEngine,
    udp: UdpEngine,
    clock: C,
    config: StackConfig,
    next_ip_ident: u16,
    next_arp_waiter: u64,
    pending_sends: Vec<PendingSend>,
    mtu_watches: HashMap<usize, MtuWatch>,
    diagnostics: Diagnostics,
}

impl<C: Clock> Stack<C> {
    pub fn new(config: StackConfig, clock: C) -> Self {
        let pcb_index = match config.pcb_index {
            crate::config::PcbIndexKind::Tree => IndexImpl::Tree(Default::default()),
            crate::config::PcbIndexKind::Linear => IndexImpl::Linear(Default::default()),
        };
        let rng = rand_chacha::ChaCha12Rng::seed_from_u64(clock.now_ms());
        let tcp = TcpEngine::new(
            config.num_tcp_pcbs,
            pcb_index,
            rng,
            TcpEngineConfig {
                send_capacity: config.tcp_send_buffer,
                recv_capacity: config.tcp_recv_buffer,
                default_mss: config.tcp_default_mss,
                window_scale: config.tcp_window_scale,
                listen_backlog: config.tcp_listen_backlog,
            },
        );
        let udp = UdpEngine::new(config.udp_ephemeral);
        Stack {
            interfaces: Vec::new(),
            next_interface_id: 0,
            reassembler: Reassembler::new(config.reassembly),
            pmtu: PmtuCache::new(config.pmtu),
            tcp,
            udp,
            clock,
            next_ip_ident: 1,
            next_arp_waiter: 0,
            pending_sends: Vec::new(),
            mtu_watches: HashMap::new(),
            diagnostics: Diagnostics::default(),
            config,
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    // ---------------------------------------------------------------
    // Interface management
    // ---------------------------------------------------------------

    /// Registers a new interface with its own ARP cache and driver.
    pub fn add_interface(&mut self, config: InterfaceConfig, driver: Box<dyn L2Driver>) -> InterfaceId {
        let id = InterfaceId(self.next_interface_id);
        self.next_interface_id += 1;
        self.interfaces.push(Interface::new(id, config, self.config.arp, driver));
        id
    }

    /// Tears down an interface. Per §4.4's lifecycle guard, the caller
    /// must have already closed any TCP connection routed through it —
    /// this only checks, it doesn't reset connections out from under the
    /// application.
    pub fn remove_interface(&mut self, id: InterfaceId) -> Result<()> {
        let Some(iface) = self.interfaces.iter().find(|i| i.id == id) else {
            return Ok(());
        };
        let Some(local_ip) = iface.ip4 else {
            self.interfaces.retain(|i| i.id != id);
            return Ok(());
        };
        let still_live = self.tcp.pcbs.iter_ids().any(|pcb_id| {
            self.tcp.pcbs.get(pcb_id).is_some_and(|pcb| pcb.tuple.local_addr == local_ip)
        });
        if still_live {
            warn!("interface {}: refusing teardown, live TCP PCBs still route through it", id.0);
            return Err(StackError::AddrInUse);
        }
        self.interfaces.retain(|i| i.id != id);
        Ok(())
    }

    pub fn reconfigure_interface(&mut self, id: InterfaceId, ip4: Option<Ipv4Addr>, netmask: Ipv4Addr, gateway: Option<Ipv4Addr>) {
        if let Some(iface) = self.interfaces.iter_mut().find(|i| i.id == id) {
            iface.reconfigure(ip4, netmask, gateway);
        }
    }

    pub fn add_interface_listener(&mut self, id: InterfaceId, listener: Box<dyn IpListener>) {
        if let Some(iface) = self.interfaces.iter_mut().find(|i| i.id == id) {
            iface.add_listener(listener);
        }
    }

    pub fn interface_mac(&self, id: InterfaceId) -> Option<MacAddr> {
        self.interfaces.iter().find(|i| i.id == id).map(|i| i.mac)
    }

    pub fn interface_ip(&self, id: InterfaceId) -> Option<Ipv4Addr> {
        self.interfaces.iter().find(|i| i.id == id).and_then(|i| i.ip4)
    }

    // ---------------------------------------------------------------
    // Receive path
    // ---------------------------------------------------------------

    /// Feeds one Ethernet frame received on `iface` into the stack
    /// (§4.1, §4.4). Every failure here is a silent drop recorded in
    /// [`Stack::diagnostics`] and logged at `trace`, matching §7's "inbound
    /// processing never returns `StackError`".
    pub fn receive_frame(&mut self, iface: InterfaceId, frame: &[u8]) {
        let now = self.now_ms();
        let Some(eth) = ethernet::parse(frame) else {
            trace!("ethernet: frame too short, dropping");
            self.diagnostics.record(DropReason::TooShort);
            return;
        };

        match eth.ethertype {
            ETHERTYPE_ARP => self.receive_arp(iface, eth.payload, now),
            ETHERTYPE_IPV4 => self.receive_ip(iface, eth.payload, now),
            other => trace!("ethernet: ignoring unknown ethertype {:#06x}", other),
        }
    }

    fn receive_arp(&mut self, iface_id: InterfaceId, payload: &[u8], now: u64) {
        let Some(packet) = arp::parse(payload) else {
            trace!("arp: malformed packet, dropping");
            self.diagnostics.record(DropReason::TooShort);
            return;
        };

        let waiters = {
            let Some(iface) = self.interfaces.iter_mut().find(|i| i.id == iface_id) else { return };
            iface.arp.save(packet.sender_ip, packet.sender_mac, now)
        };
        self.flush_arp_waiters(&waiters);

        let Some(iface) = self.interfaces.iter_mut().find(|i| i.id == iface_id) else { return };
        if packet.op == arp::ARP_OP_REQUEST && iface.is_local_unicast(packet.target_ip) {
            let reply = arp::build_reply(iface.mac, packet.target_ip, &packet);
            let frame = ethernet::build_frame(packet.sender_mac, iface.mac, ETHERTYPE_ARP, &reply);
            let _ = iface.send_frame(&frame);
        }
    }

    fn receive_ip(&mut self, iface_id: InterfaceId, payload: &[u8], now: u64) {
        let Some((header, body)) = ipv4::parse(payload) else {
            trace!("ip: malformed/unchecksummed packet, dropping");
            self.diagnostics.record(DropReason::BadChecksum);
            return;
        };

        let is_fragment = header.more_fragments() || header.fragment_offset_bytes() != 0;
        if is_fragment {
            let is_local = self
                .interfaces
                .iter()
                .find(|i| i.id == iface_id)
                .is_some_and(|i| i.is_local_unicast(header.dst));
            if !is_local {
                trace!("ip: fragment to {} not a local unicast address, dropping", header.dst);
                self.diagnostics.record(DropReason::NotAcceptable);
                return;
            }

            match self.reassembler.insert(
                header.src,
                header.dst,
                header.protocol,
                header.ident,
                header.fragment_offset_bytes(),
                header.more_fragments(),
                body,
                now,
            ) {
                FragmentOutcome::Pending => {}
                FragmentOutcome::TableFull => self.diagnostics.record(DropReason::ReassemblyTableFull),
                FragmentOutcome::Complete { payload: reassembled } => {
                    self.dispatch_ip(iface_id, header.src, header.dst, header.protocol, &reassembled, now);
                }
            }
            return;
        }

        self.dispatch_ip(iface_id, header.src, header.dst, header.protocol, body, now);
    }

    fn dispatch_ip(&mut self, iface_id: InterfaceId, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8], now: u64) {
        let is_local = self
            .interfaces
            .iter()
            .find(|i| i.id == iface_id)
            .is_some_and(|i| i.is_local_unicast(dst));

        if let Some(iface) = self.interfaces.iter_mut().find(|i| i.id == iface_id) {
            if let crate::interface::ListenerVerdict::Consumed = iface.run_listeners(src, dst, protocol, payload) {
                return;
            }
        }

        match protocol {
            ipv4::PROTO_ICMP => self.receive_icmp(src, dst, payload, now),
            ipv4::PROTO_TCP => self.receive_tcp(src, dst, payload, now),
            ipv4::PROTO_UDP => self.receive_udp(src, dst, payload, is_local, now),
            _ => {
                self.diagnostics.record(DropReason::UnknownProtocol);
                if is_local {
                    self.send_protocol_unreachable(src, dst, protocol, payload, now);
                }
            }
        }
    }

    fn receive_icmp(&mut self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8], now: u64) {
        let Some(message) = icmp::parse(payload) else {
            trace!("icmp: malformed/unchecksummed message, dropping");
            self.diagnostics.record(DropReason::BadChecksum);
            return;
        };

        match message {
            icmp::Message::EchoRequest { identifier, sequence, data } => {
                debug!("icmp: echo request from {}, {} bytes", src, data.len());
                let reply = icmp::build_echo_reply(identifier, sequence, data);
                let _ = self.send_ip(dst, src, ipv4::PROTO_ICMP, &reply, SendFlags::empty(), now);
            }
            icmp::Message::EchoReply { .. } => {
                trace!("icmp: echo reply from {}, nothing to do", src);
            }
            icmp::Message::DestUnreachable { code, next_hop_mtu, offending } => {
                self.receive_dest_unreachable(src, code, next_hop_mtu, offending, now);
            }
            icmp::Message::Other { icmp_type, code } => {
                trace!("icmp: ignoring type {} code {} from {}", icmp_type, code, src);
            }
        }
    }

    fn receive_dest_unreachable(&mut self, reporter: Ipv4Addr, code: u8, next_hop_mtu: u16, offending: &[u8], now: u64) {
        let Some(flow) = icmp::parse_offending(offending) else { return };

        if code == icmp::CODE_FRAGMENTATION_NEEDED {
            let iface_mtu = ipv4::route(&self.interfaces, flow.dst)
                .and_then(|id| self.interfaces.iter().find(|i| i.id == id))
                .map(|i| i.mtu)
                .unwrap_or(1500);
            let reported = if next_hop_mtu == 0 { iface_mtu / 2 } else { next_hop_mtu };
            let notified = self.pmtu.report_too_big(flow.dst, iface_mtu, reported, now);
            self.apply_mtu_updates(flow.dst, iface_mtu, &notified);
            return;
        }

        if !icmp::is_hard_unreachable(code) {
            return;
        }

        warn!("icmp: destination unreachable (code {}) reported by {} for flow to {}", code, reporter, flow.dst);
        if flow.protocol == ipv4::PROTO_TCP {
            if let (Some(sp), Some(dp)) = (flow.src_port, flow.dst_port) {
                let tuple = FourTuple::new(flow.src, sp, flow.dst, dp);
                if let Some(id) = self.tcp.pcbs.lookup(tuple) {
                    tcp_input::abort(&mut self.tcp, id, Some(StackError::ConnectionAborted));
                }
            }
        }
    }

    /// Applies a lowered PMTU estimate to every TCP PCB named by
    /// `notified`, clamping `snd_mss` so future segments fit (§4.4
    /// PMTU discovery feeding back into TCP's segmentation).
    fn apply_mtu_updates(&mut self, dest: Ipv4Addr, iface_mtu: u16, notified: &[MtuRef]) {
        let new_estimate = self.pmtu.estimate(dest, iface_mtu);
        for mtu_ref in notified {
            let Some(watch) = self.mtu_watches.get(&mtu_ref.0) else { continue };
            let Some(id) = self.tcp.resolve(watch.conn) else { continue };
            if let Some(pcb) = self.tcp.pcbs.get_mut(id) {
                let clamped = new_estimate.saturating_sub(ipv4::MIN_HEADER_LEN as u16 + crate::tcp::HEADER_LEN as u16);
                pcb.snd_mss = pcb.snd_mss.min(clamped.max(1));
                debug!("tcp: {} snd_mss clamped to {} by PMTU", pcb.tuple, pcb.snd_mss);
            }
        }
    }

    fn send_protocol_unreachable(&mut self, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8], now: u64) {
        let mut offending = ipv4::build_header(dst, src, protocol, DEFAULT_TTL, 0, 0, false, false, payload.len().min(8)).to_vec();
        offending.extend_from_slice(&payload[..payload.len().min(8)]);
        let _ = protocol; // recorded in the embedded header already
        let reply = icmp::build_dest_unreachable(icmp::CODE_PROTOCOL_UNREACHABLE, 0, &offending);
        let _ = self.send_ip(dst, src, ipv4::PROTO_ICMP, &reply, SendFlags::empty(), now);
    }

    fn receive_tcp(&mut self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8], now: u64) {
        if !crate::tcp::validate_checksum(src, dst, payload) {
            trace!("tcp: checksum mismatch from {}, dropping", src);
            self.diagnostics.record(DropReason::BadChecksum);
            return;
        }
        let Some(seg) = crate::tcp::parse(payload) else {
            self.diagnostics.record(DropReason::TooShort);
            return;
        };
        let before = self.tcp.pcbs.lookup(FourTuple::new(dst, seg.dst_port, src, seg.src_port));
        let out = tcp_input::receive(&mut self.tcp, now, src, dst, &seg);
        if before.is_none() && seg.flags.contains(crate::tcp::Flags::SYN) {
            if let Some(id) = self.tcp.pcbs.lookup(FourTuple::new(dst, seg.dst_port, src, seg.src_port)) {
                self.watch_pmtu_for(id, dst, src, now);
            }
        }
        self.send_all(out, now);
    }

    /// Registers the new PCB's placeholder `MtuRef` with the real PMTU
    /// cache (§4.4) in place of the `MtuRef(0)` every PCB is constructed
    /// with (the cache doesn't exist yet when `Pcb::new` runs).
    fn watch_pmtu_for(&mut self, id: crate::tcp::pcb::PcbId, local: Ipv4Addr, remote: Ipv4Addr, _now: u64) {
        let iface_mtu = ipv4::route(&self.interfaces, remote)
            .and_then(|iid| self.interfaces.iter().find(|i| i.id == iid))
            .map(|i| i.mtu)
            .unwrap_or(1500);
        let mtu_ref = MtuRef(id.0);
        if self.pmtu.watch(remote, iface_mtu, mtu_ref).is_some() {
            if let Some(generation) = self.tcp.pcbs.generation_of(id) {
                if let Some(pcb) = self.tcp.pcbs.get_mut(id) {
                    pcb.mtu = mtu_ref;
                }
                self.mtu_watches.insert(
                    id.0,
                    MtuWatch { conn: ConnId { id, generation } },
                );
            }
        }
        let _ = local;
    }

    fn receive_udp(&mut self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8], is_local: bool, now: u64) {
        let Some((src_port, dst_port, checksum, body)) = udp::parse(payload) else {
            self.diagnostics.record(DropReason::TooShort);
            return;
        };
        if !udp::validate_checksum(src, dst, checksum, payload) {
            self.diagnostics.record(DropReason::BadChecksum);
            return;
        }
        match self.udp.receive(src, dst, src_port, dst_port, body) {
            udp::ReceiveOutcome::Delivered => {}
            udp::ReceiveOutcome::Unreachable => {
                self.diagnostics.record(DropReason::NoMatchingPcbOrListener);
                if is_local {
                    let mut offending = ipv4::build_header(dst, src, ipv4::PROTO_UDP, DEFAULT_TTL, 0, 0, false, false, payload.len().min(8)).to_vec();
                    offending.extend_from_slice(&payload[..payload.len().min(8)]);
                    let reply = icmp::build_dest_unreachable(icmp::CODE_PORT_UNREACHABLE, 0, &offending);
                    let _ = self.send_ip(dst, src, ipv4::PROTO_ICMP, &reply, SendFlags::empty(), now);
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // IP send pipeline (§4.4)
    // ---------------------------------------------------------------

    /// Routes, ARP-resolves, fragments, and sends one IP datagram. On
    /// `ArpQueryInProgress`, the datagram has already been queued
    /// internally for replay once the MAC resolves — the caller doesn't
    /// need to retry, only decide whether to report the error upward.
    fn send_ip(&mut self, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8], flags: SendFlags, now: u64) -> Result<()> {
        let iface_id = ipv4::route(&self.interfaces, dst).ok_or(StackError::NoIpRoute)?;
        let next_hop = {
            let iface = self.interfaces.iter().find(|i| i.id == iface_id).ok_or(StackError::NoIpRoute)?;
            ipv4::next_hop(iface, dst).ok_or(StackError::NoIpRoute)?
        };

        let (iface_mtu, is_broadcast, local_ip) = {
            let iface = self.interfaces.iter().find(|i| i.id == iface_id).ok_or(StackError::NoIpRoute)?;
            (iface.mtu, iface.is_broadcast(dst), iface.ip4)
        };
        if is_broadcast && !flags.contains(SendFlags::ALLOW_BROADCAST) {
            return Err(StackError::BcastRejected);
        }
        if let Some(local) = local_ip {
            if src != local && !flags.contains(SendFlags::ALLOW_NONLOCAL_SRC) {
                return Err(StackError::NonlocalSrc);
            }
        }

        let effective_mtu = self.pmtu.estimate(dst, iface_mtu);
        if flags.contains(SendFlags::DONT_FRAGMENT) && payload.len() + ipv4::MIN_HEADER_LEN > effective_mtu as usize {
            self.pmtu.report_too_big(dst, iface_mtu, effective_mtu, now);
            return Err(StackError::FragNeeded);
        }

        let ident = self.next_ip_ident;
        self.next_ip_ident = self.next_ip_ident.wrapping_add(1);
        let dont_fragment = flags.contains(SendFlags::DONT_FRAGMENT);
        let fragments = ipv4::fragment_payload(payload, effective_mtu);
        let datagrams: Vec<Vec<u8>> = fragments
            .into_iter()
            .map(|(offset, more, chunk)| {
                let header = ipv4::build_header(src, dst, protocol, DEFAULT_TTL, ident, offset, more, dont_fragment, chunk.len());
                let mut datagram = header.to_vec();
                datagram.extend_from_slice(chunk);
                datagram
            })
            .collect();

        self.transmit_or_queue(iface_id, next_hop, is_broadcast, datagrams, now)
    }

    /// The TCP fast path (§4.4): skips [`ipv4::fragment_payload`] and
    /// rebuilds only the three per-datagram header fields via
    /// [`ipv4::prepare_send`]/[`ipv4::send_fast`]. Returns `FragNeeded`
    /// instead of fragmenting if `payload` doesn't fit the current PMTU
    /// estimate — callers on this path (TCP, whose segments are already
    /// sized to `snd_mss`) are expected to treat that as "fall back to
    /// `send_ip`" rather than a hard failure.
    fn send_ip_fast(&mut self, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8], now: u64) -> Result<()> {
        let iface_id = ipv4::route(&self.interfaces, dst).ok_or(StackError::NoIpRoute)?;
        let next_hop = {
            let iface = self.interfaces.iter().find(|i| i.id == iface_id).ok_or(StackError::NoIpRoute)?;
            ipv4::next_hop(iface, dst).ok_or(StackError::NoIpRoute)?
        };
        let (iface_mtu, is_broadcast, local_ip) = {
            let iface = self.interfaces.iter().find(|i| i.id == iface_id).ok_or(StackError::NoIpRoute)?;
            (iface.mtu, iface.is_broadcast(dst), iface.ip4)
        };
        if is_broadcast {
            return Err(StackError::BcastRejected);
        }
        if let Some(local) = local_ip {
            if src != local {
                return Err(StackError::NonlocalSrc);
            }
        }

        let effective_mtu = self.pmtu.estimate(dst, iface_mtu);
        if payload.len() + ipv4::MIN_HEADER_LEN > effective_mtu as usize {
            self.pmtu.report_too_big(dst, iface_mtu, effective_mtu, now);
            return Err(StackError::FragNeeded);
        }

        let ident = self.next_ip_ident;
        self.next_ip_ident = self.next_ip_ident.wrapping_add(1);
        let prepared = ipv4::prepare_send(src, dst, protocol, DEFAULT_TTL);
        let header = ipv4::send_fast(&prepared, ident, payload.len()).ok_or(StackError::FragNeeded)?;
        let mut datagram = header.to_vec();
        datagram.extend_from_slice(payload);

        self.transmit_or_queue(iface_id, next_hop, false, vec![datagram], now)
    }

    fn transmit_or_queue(&mut self, iface_id: InterfaceId, next_hop: Ipv4Addr, is_broadcast: bool, datagrams: Vec<Vec<u8>>, now: u64) -> Result<()> {
        let iface = self.interfaces.iter_mut().find(|i| i.id == iface_id).ok_or(StackError::NoIpRoute)?;
        let (resolution, outgoing_arp) = iface.arp.resolve(next_hop, is_broadcast, now);
        if let Some(arp_out) = outgoing_arp {
            let frame = iface.finish_arp_request(&arp_out);
            let _ = iface.send_frame(&frame);
        }

        match resolution {
            Resolution::Resolved(mac) => self.send_datagrams(iface_id, mac, &datagrams),
            Resolution::BroadcastMac => self.send_datagrams(iface_id, MacAddr::BROADCAST, &datagrams),
            Resolution::Pending => {
                let waiter = self.next_arp_waiter;
                self.next_arp_waiter += 1;
                let iface = self.interfaces.iter_mut().find(|i| i.id == iface_id).ok_or(StackError::NoIpRoute)?;
                iface.arp.register_waiter(next_hop, waiter);
                self.pending_sends.push(PendingSend { waiter, iface: iface_id, next_hop, datagrams });
                Err(StackError::ArpQueryInProgress)
            }
        }
    }

    fn send_datagrams(&mut self, iface_id: InterfaceId, mac: MacAddr, datagrams: &[Vec<u8>]) -> Result<()> {
        let iface = self.interfaces.iter_mut().find(|i| i.id == iface_id).ok_or(StackError::NoIpRoute)?;
        for datagram in datagrams {
            let frame = ethernet::build_frame(mac, iface.mac, ETHERTYPE_IPV4, datagram);
            iface.send_frame(&frame)?;
        }
        Ok(())
    }

    /// Replays every pending send whose waiter token is in `waiters`,
    /// once [`ArpCache::save`] has resolved them.
    fn flush_arp_waiters(&mut self, waiters: &[WaiterId]) {
        if waiters.is_empty() {
            return;
        }
        let now = self.now_ms();
        let mut i = 0;
        while i < self.pending_sends.len() {
            if waiters.contains(&self.pending_sends[i].waiter) {
                let pending = self.pending_sends.remove(i);
                let is_broadcast = self
                    .interfaces
                    .iter()
                    .find(|iface| iface.id == pending.iface)
                    .is_some_and(|iface| iface.is_broadcast(pending.next_hop));
                let _ = self.transmit_or_queue(pending.iface, pending.next_hop, is_broadcast, pending.datagrams, now);
            } else {
                i += 1;
            }
        }
    }

    // ---------------------------------------------------------------
    // Event loop tick (§4.9, §5)
    // ---------------------------------------------------------------

    /// Drives ARP retransmits, TCP's output/retransmit/delayed-ack/
    /// persist/TIME_WAIT timers, and PMTU idle eviction forward by one
    /// tick. Call this periodically from the host event loop, in
    /// addition to [`Stack::receive_frame`] whenever a frame arrives —
    /// the teacher's own `net::poll` follows exactly this "drain RX then
    /// check timers" shape.
    pub fn poll(&mut self) {
        let now = self.now_ms();

        for idx in 0..self.interfaces.len() {
            let outgoing = self.interfaces[idx].arp.run_timers(now);
            for out in outgoing {
                let frame = self.interfaces[idx].finish_arp_request(&out);
                let _ = self.interfaces[idx].send_frame(&frame);
            }
        }

        let segments = tcp_output::send_pending(&mut self.tcp, now);
        self.send_all(segments, now);

        let timer_segments = tcp_timer::run(&mut self.tcp, now);
        self.send_all(timer_segments, now);

        self.pmtu.evict_idle(now);
    }

    fn send_all(&mut self, segments: Vec<OutgoingSegment>, now: u64) {
        for seg in segments {
            let src = seg.tuple.local_addr;
            let dst = seg.tuple.remote_addr;
            let result = match self.send_ip_fast(src, dst, ipv4::PROTO_TCP, &seg.bytes, now) {
                Err(StackError::FragNeeded) => self.send_ip(src, dst, ipv4::PROTO_TCP, &seg.bytes, SendFlags::empty(), now),
                other => other,
            };
            if let Err(e) = result {
                trace!("tcp: {} send deferred ({})", seg.tuple, e);
            }
        }
    }

    // ---------------------------------------------------------------
    // TCP application surface (§4.5, §4.9)
    // ---------------------------------------------------------------

    pub fn tcp_listen(&mut self, port: u16, backlog: usize) -> Result<ListenerId> {
        self.tcp.listen(port, backlog)
    }

    pub fn tcp_close_listener(&mut self, id: ListenerId) {
        let now = self.now_ms();
        let rsts = self.tcp.close_listener(id);
        self.send_all(rsts, now);
    }

    pub fn tcp_accept(&mut self, listener: ListenerId, handler: Box<dyn TcpHandler>) -> Option<ConnId> {
        self.tcp.accept(listener, handler)
    }

    /// Active open (§4.7): allocates a PCB, picks an ephemeral local port
    /// and the outgoing interface's address as the local address, and
    /// sends the initial SYN.
    pub fn tcp_connect(&mut self, remote: Ipv4Addr, remote_port: u16, handler: Box<dyn TcpHandler>) -> Result<ConnId> {
        let now = self.now_ms();
        let iface_id = ipv4::route(&self.interfaces, remote).ok_or(StackError::NoIpRoute)?;
        let local_addr = self
            .interfaces
            .iter()
            .find(|i| i.id == iface_id)
            .and_then(|i| i.ip4)
            .ok_or(StackError::NoIpRoute)?;

        let local_port = self.alloc_tcp_ephemeral_port(local_addr, remote, remote_port)?;
        let tuple = FourTuple::new(local_addr, local_port, remote, remote_port);
        let (conn, syn) = self.tcp.connect(tuple, handler, now)?;
        if let Some(id) = self.tcp.resolve(conn) {
            self.watch_pmtu_for(id, local_addr, remote, now);
        }
        let _ = self.send_ip(local_addr, remote, ipv4::PROTO_TCP, &syn.bytes, SendFlags::empty(), now);
        Ok(conn)
    }

    fn alloc_tcp_ephemeral_port(&self, local_addr: Ipv4Addr, remote: Ipv4Addr, remote_port: u16) -> Result<u16> {
        let range = self.config.tcp_ephemeral;
        let span = range.high - range.low + 1;
        for offset in 0..span {
            let port = range.low + offset;
            let candidate = FourTuple::new(local_addr, port, remote, remote_port);
            if self.tcp.pcbs.lookup(candidate).is_none() {
                return Ok(port);
            }
        }
        Err(StackError::NoPortAvailable)
    }

    pub fn tcp_send(&mut self, conn: ConnId, data: &[u8]) -> usize {
        self.tcp.send(conn, data)
    }

    /// Copies as many bytes as fit in `out` out of `conn`'s receive
    /// buffer and reopens the advertised window accordingly (§4.9's
    /// `extend_recv_buf`: the window only reflects free space once the
    /// application has actually drained what it was handed by
    /// `data_received`).
    pub fn tcp_recv(&mut self, conn: ConnId, out: &mut [u8]) -> usize {
        let Some(id) = self.tcp.resolve(conn) else { return 0 };
        let Some(pcb) = self.tcp.pcbs.get_mut(id) else { return 0 };
        let n = pcb.recv_buf.read(out);
        pcb.rcv_wnd = pcb.recv_buf.free_space() as u32;
        n
    }

    pub fn tcp_close_sending(&mut self, conn: ConnId) {
        self.tcp.close_sending(conn);
    }

    /// Forces an immediate non-Nagle flush of `conn`'s queued send data
    /// (§4.9 `send_push`).
    pub fn tcp_send_push(&mut self, conn: ConnId) {
        self.tcp.send_push(conn);
    }

    pub fn tcp_reset(&mut self, conn: ConnId, have_unprocessed_data: bool) {
        let now = self.now_ms();
        if let Some(seg) = self.tcp.reset(conn, have_unprocessed_data) {
            self.send_all(vec![seg], now);
        }
    }

    // ---------------------------------------------------------------
    // UDP application surface (§4.10)
    // ---------------------------------------------------------------

    pub fn udp_bind(&mut self, port: u16, handler: Box<dyn UdpHandler>) -> Result<()> {
        self.udp.bind(port, handler)
    }

    pub fn udp_unbind(&mut self, port: u16) {
        self.udp.unbind(port);
    }

    pub fn udp_associate(&mut self, tuple: FourTuple, handler: Box<dyn UdpHandler>) -> Result<()> {
        self.udp.associate(tuple, handler)
    }

    pub fn udp_disassociate(&mut self, tuple: FourTuple) {
        self.udp.disassociate(tuple);
    }

    /// Sends one UDP datagram. `src_addr` is usually the outgoing
    /// interface's address; pass the loopback/zero address and
    /// `SendFlags::ALLOW_NONLOCAL_SRC` for the rare case of spoofed
    /// source testing.
    pub fn udp_send(&mut self, src_addr: Ipv4Addr, dst_addr: Ipv4Addr, src_port: u16, dst_port: u16, data: &[u8]) -> Result<()> {
        let now = self.now_ms();
        let datagram = udp::build(src_addr, dst_addr, src_port, dst_port, data);
        self.send_ip(src_addr, dst_addr, ipv4::PROTO_UDP, &datagram, SendFlags::empty(), now)
    }

    /// Allocates an ephemeral local port + sends in one step, the usual
    /// shape for a UDP client (§4.10).
    pub fn udp_send_ephemeral(&mut self, dst_addr: Ipv4Addr, dst_port: u16, data: &[u8]) -> Result<u16> {
        let iface_id = ipv4::route(&self.interfaces, dst_addr).ok_or(StackError::NoIpRoute)?;
        let local_addr = self
            .interfaces
            .iter()
            .find(|i| i.id == iface_id)
            .and_then(|i| i.ip4)
            .ok_or(StackError::NoIpRoute)?;
        let remote = FourTuple::new(local_addr, 0, dst_addr, dst_port);
        let port = self.udp.alloc_ephemeral_port(local_addr, remote)?;
        self.udp_send(local_addr, dst_addr, port, dst_port, data)?;
        Ok(port)
    }

    // ---------------------------------------------------------------
    // ICMP application surface
    // ---------------------------------------------------------------

    /// Sends an echo request (ping), fragmenting as needed (§8 scenario
    /// 2). The reply, if any, surfaces only as a trace log today — there
    /// is no ping-response callback surface in this crate yet.
    pub fn ping(&mut self, dst: Ipv4Addr, identifier: u16, sequence: u16, data: &[u8]) -> Result<()> {
        let now = self.now_ms();
        let iface_id = ipv4::route(&self.interfaces, dst).ok_or(StackError::NoIpRoute)?;
        let src = self
            .interfaces
            .iter()
            .find(|i| i.id == iface_id)
            .and_then(|i| i.ip4)
            .ok_or(StackError::NoIpRoute)?;
        let request = icmp::build_echo_request(identifier, sequence, data);
        self.send_ip(src, dst, ipv4::PROTO_ICMP, &request, SendFlags::empty(), now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::SimMedium;
    use crate::types::MacAddr;

    struct FixedClock(std::cell::Cell<u64>);
    impl Clock for FixedClock {
        fn now_ms(&self) -> u64 {
            self.0.get()
        }
    }

    fn local_iface(mac: MacAddr, ip: Ipv4Addr) -> InterfaceConfig {
        InterfaceConfig {
            mac,
            ip4: Some(ip),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: None,
            mtu: 1500,
        }
    }

    /// Builds the frame a peer would send to announce `peer_ip`/`peer_mac`
    /// (sender fields) while asking for `our_ip` (target field) — enough
    /// for `ArpCache::save` to learn the peer's MAC as a side effect,
    /// regardless of which op code the packet carries.
    fn peer_arp_request(peer_mac: MacAddr, peer_ip: Ipv4Addr, our_ip: Ipv4Addr) -> Vec<u8> {
        let packet = arp::build_reply(
            peer_mac,
            peer_ip,
            &arp::ArpPacket {
                op: arp::ARP_OP_REQUEST,
                sender_mac: peer_mac,
                sender_ip: peer_ip,
                target_mac: MacAddr::ZERO,
                target_ip: our_ip,
            },
        );
        ethernet::build_frame(MacAddr::BROADCAST, peer_mac, ETHERTYPE_ARP, &packet)
    }

    #[test]
    fn echo_request_produces_a_reply_on_the_wire() {
        let (med_a, mut med_b) = SimMedium::new_pair();
        let our_mac = MacAddr([0, 0, 0, 0, 0, 1]);
        let peer_mac = MacAddr([0, 0, 0, 0, 0, 2]);
        let our_ip = Ipv4Addr::new(10, 0, 0, 1);
        let peer_ip = Ipv4Addr::new(10, 0, 0, 2);

        let mut stack = Stack::new(StackConfig::default(), FixedClock(std::cell::Cell::new(0)));
        let iface = stack.add_interface(local_iface(our_mac, our_ip), Box::new(med_a));

        // An inbound ARP request teaches us the peer's MAC before the echo
        // request arrives, so the reply doesn't need to queue on ARP.
        stack.receive_frame(iface, &peer_arp_request(peer_mac, peer_ip, our_ip));

        let request = icmp::build_echo_request(1, 1, b"hi");
        let hdr = ipv4::build_header(peer_ip, our_ip, ipv4::PROTO_ICMP, 64, 5, 0, false, false, request.len());
        let mut datagram = hdr.to_vec();
        datagram.extend_from_slice(&request);
        stack.receive_frame(iface, &ethernet::build_frame(our_mac, peer_mac, ETHERTYPE_IPV4, &datagram));

        let sent = med_b.poll_receive().expect("echo reply should have been sent back");
        let eth = ethernet::parse(&sent).unwrap();
        assert_eq!(eth.ethertype, ETHERTYPE_IPV4);
        let (_, body) = ipv4::parse(eth.payload).unwrap();
        match icmp::parse(body).unwrap() {
            icmp::Message::EchoReply { data, .. } => assert_eq!(data, b"hi"),
            _ => panic!("expected echo reply"),
        }
    }

    #[test]
    fn udp_datagram_to_unbound_port_yields_port_unreachable() {
        let (med_a, mut med_b) = SimMedium::new_pair();
        let our_mac = MacAddr([0, 0, 0, 0, 0, 1]);
        let peer_mac = MacAddr([0, 0, 0, 0, 0, 2]);
        let our_ip = Ipv4Addr::new(10, 0, 0, 1);
        let peer_ip = Ipv4Addr::new(10, 0, 0, 2);

        let mut stack = Stack::new(StackConfig::default(), FixedClock(std::cell::Cell::new(0)));
        let iface = stack.add_interface(local_iface(our_mac, our_ip), Box::new(med_a));
        stack.receive_frame(iface, &peer_arp_request(peer_mac, peer_ip, our_ip));

        let datagram = udp::build(peer_ip, our_ip, 4000, 53, b"q");
        let hdr = ipv4::build_header(peer_ip, our_ip, ipv4::PROTO_UDP, 64, 9, 0, false, false, datagram.len());
        let mut ip_datagram = hdr.to_vec();
        ip_datagram.extend_from_slice(&datagram);
        stack.receive_frame(iface, &ethernet::build_frame(our_mac, peer_mac, ETHERTYPE_IPV4, &ip_datagram));

        let sent = med_b.poll_receive().expect("port unreachable should have been sent");
        let eth = ethernet::parse(&sent).unwrap();
        let (_, body) = ipv4::parse(eth.payload).unwrap();
        match icmp::parse(body).unwrap() {
            icmp::Message::DestUnreachable { code, .. } => assert_eq!(code, icmp::CODE_PORT_UNREACHABLE),
            _ => panic!("expected dest unreachable"),
        }
        assert_eq!(stack.diagnostics().no_matching_pcb_or_listener, 1);
    }

    #[test]
    fn bound_udp_listener_receives_datagram() {
        struct Collect(std::rc::Rc<std::cell::RefCell<Vec<Vec<u8>>>>);
        impl UdpHandler for Collect {
            fn on_datagram(&mut self, _tuple: FourTuple, data: &[u8]) -> udp::Verdict {
                self.0.borrow_mut().push(data.to_vec());
                udp::Verdict::AcceptStop
            }
        }

        let (med_a, _med_b) = SimMedium::new_pair();
        let our_mac = MacAddr([0, 0, 0, 0, 0, 1]);
        let peer_mac = MacAddr([0, 0, 0, 0, 0, 2]);
        let our_ip = Ipv4Addr::new(10, 0, 0, 1);
        let peer_ip = Ipv4Addr::new(10, 0, 0, 2);

        let mut stack = Stack::new(StackConfig::default(), FixedClock(std::cell::Cell::new(0)));
        let iface = stack.add_interface(local_iface(our_mac, our_ip), Box::new(med_a));
        stack.receive_frame(iface, &peer_arp_request(peer_mac, peer_ip, our_ip));

        let received = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        stack.udp_bind(53, Box::new(Collect(received.clone()))).unwrap();

        let datagram = udp::build(peer_ip, our_ip, 4000, 53, b"query");
        let hdr = ipv4::build_header(peer_ip, our_ip, ipv4::PROTO_UDP, 64, 11, 0, false, false, datagram.len());
        let mut ip_datagram = hdr.to_vec();
        ip_datagram.extend_from_slice(&datagram);
        stack.receive_frame(iface, &ethernet::build_frame(our_mac, peer_mac, ETHERTYPE_IPV4, &ip_datagram));

        assert_eq!(received.borrow().as_slice(), &[b"query".to_vec()]);
    }

    #[test]
    fn send_ip_queues_on_arp_and_flushes_once_resolved() {
        let (med_a, mut med_b) = SimMedium::new_pair();
        let our_mac = MacAddr([0, 0, 0, 0, 0, 1]);
        let peer_mac = MacAddr([0, 0, 0, 0, 0, 2]);
        let our_ip = Ipv4Addr::new(10, 0, 0, 1);
        let peer_ip = Ipv4Addr::new(10, 0, 0, 2);

        let mut stack = Stack::new(StackConfig::default(), FixedClock(std::cell::Cell::new(0)));
        let iface = stack.add_interface(local_iface(our_mac, our_ip), Box::new(med_a));

        // No ARP entry yet: the first send queries and queues.
        let err = stack
            .send_ip(our_ip, peer_ip, ipv4::PROTO_UDP, b"hello", SendFlags::empty(), 0)
            .unwrap_err();
        assert_eq!(err, StackError::ArpQueryInProgress);
        let arp_request = med_b.poll_receive().expect("an ARP query should have gone out");
        assert_eq!(ethernet::parse(&arp_request).unwrap().ethertype, ETHERTYPE_ARP);
        assert!(med_b.poll_receive().is_none(), "the datagram must not be sent until ARP resolves");

        // The peer replies; the queued datagram should flush immediately.
        stack.receive_frame(iface, &peer_arp_request(peer_mac, peer_ip, our_ip));

        let flushed = med_b.poll_receive().expect("the queued datagram should have flushed");
        let eth = ethernet::parse(&flushed).unwrap();
        assert_eq!(eth.ethertype, ETHERTYPE_IPV4);
        let (header, payload) = ipv4::parse(eth.payload).unwrap();
        assert_eq!(header.protocol, ipv4::PROTO_UDP);
        assert_eq!(payload, b"hello");
    }


    /// A driver that forwards every sent frame into a plain `VecDeque` the
    /// test owns directly, rather than `SimMedium`'s own auto-delivery —
    /// this lets the test ferry frames between two independent `Stack`s
    /// one hop at a time instead of racing two stacks against each other's
    /// queues (§8 scenario 1).
    struct Loopback(std::rc::Rc<std::cell::RefCell<std::collections::VecDeque<Vec<u8>>>>);
    impl L2Driver for Loopback {
        fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
            self.0.borrow_mut().push_back(frame.to_vec());
            Ok(())
        }
        fn link_state(&self) -> crate::platform::LinkState {
            crate::platform::LinkState::Up
        }
    }

    /// A clock the test can advance independently per stack, so a
    /// delayed ACK's 200 ms deadline can be made due on one peer without
    /// moving the other (§8 scenario 1's two sides tick independently in
    /// a real event loop too).
    #[derive(Clone)]
    struct TickClock(std::rc::Rc<std::cell::Cell<u64>>);
    impl Clock for TickClock {
        fn now_ms(&self) -> u64 {
            self.0.get()
        }
    }

    fn deliver<C: Clock>(
        outbox: &std::rc::Rc<std::cell::RefCell<std::collections::VecDeque<Vec<u8>>>>,
        to: &mut Stack<C>,
        iface: InterfaceId,
    ) {
        loop {
            let frame = outbox.borrow_mut().pop_front();
            match frame {
                Some(f) => to.receive_frame(iface, &f),
                None => break,
            }
        }
    }

    #[derive(Default)]
    struct Trace(Vec<String>);

    struct RecordingHandler(std::rc::Rc<std::cell::RefCell<Trace>>);
    impl TcpHandler for RecordingHandler {
        fn connection_established(&mut self, _conn: ConnId) {
            self.0.borrow_mut().0.push("connectionEstablished".into());
        }
        fn data_received(&mut self, _conn: ConnId, len: usize) {
            self.0.borrow_mut().0.push(format!("dataReceived({})", len));
        }
        fn data_sent(&mut self, _conn: ConnId, len: usize) {
            self.0.borrow_mut().0.push(format!("dataSent({})", len));
        }
        fn connection_aborted(&mut self, _conn: ConnId, _cause: Option<StackError>) {
            self.0.borrow_mut().0.push("connectionAborted".into());
        }
    }

    /// §8 scenario 1, end to end over two independent `Stack`s linked by
    /// a loopback driver: a client connects, sends "hello\n", the server
    /// echoes those bytes back, and the client closes. Checks the
    /// handshake, the data exchange, and the exact server-side callback
    /// trace the spec calls out:
    /// connectionEstablished, dataReceived(6), dataSent(6), dataReceived(0),
    /// connectionAborted.
    #[test]
    fn echo_client_and_server_exchange_data_over_a_full_handshake() {
        let server_mac = MacAddr([0, 0, 0, 0, 0, 1]);
        let client_mac = MacAddr([0, 0, 0, 0, 0, 2]);
        let server_ip = Ipv4Addr::new(10, 0, 0, 1);
        let client_ip = Ipv4Addr::new(10, 0, 0, 2);

        let server_out = std::rc::Rc::new(std::cell::RefCell::new(std::collections::VecDeque::new()));
        let client_out = std::rc::Rc::new(std::cell::RefCell::new(std::collections::VecDeque::new()));
        let server_time = std::rc::Rc::new(std::cell::Cell::new(0u64));
        let client_time = std::rc::Rc::new(std::cell::Cell::new(0u64));

        let mut server = Stack::new(StackConfig::default(), TickClock(server_time.clone()));
        let server_iface = server.add_interface(local_iface(server_mac, server_ip), Box::new(Loopback(server_out.clone())));
        let mut client = Stack::new(StackConfig::default(), TickClock(client_time.clone()));
        let client_iface = client.add_interface(local_iface(client_mac, client_ip), Box::new(Loopback(client_out.clone())));

        // Pre-seed each side's ARP cache so the handshake itself doesn't
        // have to interleave ARP traffic with TCP segments.
        server.receive_frame(server_iface, &peer_arp_request(client_mac, client_ip, server_ip));
        client.receive_frame(client_iface, &peer_arp_request(server_mac, server_ip, client_ip));

        let trace = std::rc::Rc::new(std::cell::RefCell::new(Trace::default()));
        let listener = server.tcp_listen(7, 4).unwrap();

        let client_trace = std::rc::Rc::new(std::cell::RefCell::new(Trace::default()));
        let client_handler = Box::new(RecordingHandler(client_trace.clone()));
        let client_conn = client.tcp_connect(server_ip, 7, client_handler).unwrap();

        // SYN: client -> server. The server installs its handler on the
        // SYN_RCVD pcb right away so `connectionEstablished` fires the
        // moment the final ACK lands, exactly as an eager-accept server
        // application would drive it.
        deliver(&client_out, &mut server, server_iface);
        let server_handler = Box::new(RecordingHandler(trace.clone()));
        let server_conn = server.tcp_accept(listener, server_handler).expect("a pending SYN_RCVD pcb");

        // SYN|ACK: server -> client.
        deliver(&server_out, &mut client, client_iface);
        assert_eq!(client_trace.borrow().0, vec!["connectionEstablished"]);

        // ACK: client -> server, completing the handshake.
        deliver(&client_out, &mut server, server_iface);
        assert_eq!(trace.borrow().0, vec!["connectionEstablished"]);

        // Client sends "hello\n"; flush it onto the wire.
        assert_eq!(client.tcp_send(client_conn, b"hello\n"), 6);
        client.poll();
        deliver(&client_out, &mut server, server_iface);
        assert_eq!(trace.borrow().0, vec!["connectionEstablished", "dataReceived(6)"]);

        // Server echoes the bytes straight back; the ack piggybacked on
        // the echo segment also frees the client's own send buffer.
        let mut buf = [0u8; 6];
        let n = server.tcp_recv(server_conn, &mut buf);
        assert_eq!(&buf[..n], b"hello\n");
        assert_eq!(server.tcp_send(server_conn, &buf[..n]), n);
        server.poll();
        deliver(&server_out, &mut client, client_iface);
        assert_eq!(
            client_trace.borrow().0,
            vec!["connectionEstablished", "dataSent(6)", "dataReceived(6)"],
            "the echo segment's ack covers the client's earlier send before its own payload is processed"
        );

        // The client's ack of the echoed bytes is sub-MSS and has
        // nothing to piggyback on, so it waits for the delayed-ack timer;
        // tick the client's clock past the 200ms deadline and let it fire.
        client_time.set(300);
        client.poll();
        deliver(&client_out, &mut server, server_iface);
        assert_eq!(
            trace.borrow().0,
            vec!["connectionEstablished", "dataReceived(6)", "dataSent(6)"]
        );

        // Client closes; FIN/ACK exchange runs to completion and the
        // server observes the graceful close as `dataReceived(0)`.
        client.tcp_close_sending(client_conn);
        client.poll();
        deliver(&client_out, &mut server, server_iface);
        assert_eq!(
            trace.borrow().0,
            vec!["connectionEstablished", "dataReceived(6)", "dataSent(6)", "dataReceived(0)"]
        );

        // Server closes in turn; its FIN and the client's final ACK for
        // it complete LAST_ACK, firing connectionAborted(None) — the
        // graceful-close teardown notification (§4.7).
        server.tcp_close_sending(server_conn);
        server.poll();
        deliver(&server_out, &mut client, client_iface);
        deliver(&client_out, &mut server, server_iface);
        assert_eq!(
            trace.borrow().0,
            vec![
                "connectionEstablished",
                "dataReceived(6)",
                "dataSent(6)",
                "dataReceived(0)",
                "connectionAborted"
            ]
        );
    }
}
