//! The application-facing surface of TCP (§4.5, §4.9, §9): `TcpHandler`
//! callbacks in place of the source's virtual `Connection` base class, and
//! `TcpEngine`, the owner of the PCB arena and the listener list.
//!
//! `TcpEngine` never touches a driver or an ARP cache directly. Every
//! method that needs to put bytes on the wire returns them as
//! [`OutgoingSegment`]s; [`crate::Stack`] is the only thing that knows how
//! to route and send one. This keeps the state machine unit-testable
//! without a fake driver, the same shape `arp::ArpCache` and
//! `ipv4::pmtu::PmtuCache` already use.

use log::{debug, warn};

use crate::error::StackError;
use crate::ipv4::pmtu::MtuRef;
use crate::tcp::pcb::{IndexImpl, Pcb, PcbId, PcbOwner, PcbTable};
use crate::tcp::{Flags, State};
use crate::types::FourTuple;

/// Callbacks the engine invokes synchronously on an application's
/// connection object (§9 "inheritance-based hooks become callbacks").
/// `conn` identifies which connection the callback is for, so one
/// `TcpHandler` may be shared by several connections if the application
/// wants that (e.g. an echo server installing the same handler on every
/// accepted connection).
pub trait TcpHandler {
    /// The handshake completed; `conn` is now ESTABLISHED.
    fn connection_established(&mut self, conn: ConnId) {
        let _ = conn;
    }
    /// `len` new in-order bytes are now at the head of the receive buffer.
    /// A FIN is reported as `data_received(conn, 0)`.
    fn data_received(&mut self, conn: ConnId, len: usize);
    /// `len` previously-unacked send-buffer bytes were acknowledged and
    /// freed.
    fn data_sent(&mut self, conn: ConnId, len: usize) {
        let _ = (conn, len);
    }
    /// The connection moved to CLOSED outside of a normal
    /// locally-initiated close; `cause` is `None` for a peer-initiated
    /// graceful close sequence completing, `Some` for RST/timeout/error.
    fn connection_aborted(&mut self, conn: ConnId, cause: Option<StackError>) {
        let _ = (conn, cause);
    }
}

/// A stable application-facing handle to one PCB slot. Carries the slot's
/// generation so a handle captured before the slot was reused (e.g. kept
/// past TIME_WAIT) can be told apart from whatever now occupies it,
/// without the Connection holding an actual back-pointer into the arena
/// (§9 "ownership of PCBs").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConnId {
    pub(crate) id: PcbId,
    pub(crate) generation: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ListenerId(pub(crate) u32);

/// A segment ready to send, already checksummed against `tuple`'s
/// addresses. [`crate::Stack`] routes and hands this to IP.
pub struct OutgoingSegment {
    pub tuple: FourTuple,
    pub bytes: Vec<u8>,
}

pub(crate) fn build_outgoing(
    tuple: FourTuple,
    seq: u32,
    ack: u32,
    flags: Flags,
    window: u16,
    payload: &[u8],
) -> OutgoingSegment {
    let mut bytes = crate::tcp::build(tuple.local_port, tuple.remote_port, seq, ack, flags, window, payload);
    crate::tcp::patch_checksum(&mut bytes, tuple.local_addr, tuple.remote_addr);
    OutgoingSegment { tuple, bytes }
}

pub(crate) fn build_outgoing_syn(
    tuple: FourTuple,
    seq: u32,
    ack: u32,
    flags: Flags,
    window: u16,
    mss: u16,
    window_scale: u8,
) -> OutgoingSegment {
    let mut bytes = crate::tcp::build_syn(tuple.local_port, tuple.remote_port, seq, ack, flags, window, mss, window_scale);
    crate::tcp::patch_checksum(&mut bytes, tuple.local_addr, tuple.remote_addr);
    OutgoingSegment { tuple, bytes }
}

/// A passive-open endpoint (§4.5, §4.7: "LISTEN is a separate object not a
/// PCB state"). Holds accept-pending SYN_RCVD PCBs until `accept` or
/// abort/timeout reclaims them.
pub struct Listener {
    pub(crate) id: ListenerId,
    pub(crate) port: u16,
    pub(crate) max_pcbs: usize,
    pub(crate) pending: Vec<PcbId>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Per-engine knobs that do not belong on individual PCBs.
#[derive(Clone, Copy, Debug)]
pub struct TcpEngineConfig {
    pub send_capacity: usize,
    pub recv_capacity: usize,
    pub default_mss: u16,
    pub window_scale: u8,
    pub listen_backlog: usize,
}

/// Owns the PCB arena and the listener list; the state machine itself
/// lives in `input`/`output`/`timer`, split across files the way the
/// congestion-control and codec concerns already are in this module.
pub struct TcpEngine {
    pub(crate) pcbs: PcbTable<IndexImpl>,
    pub(crate) listeners: Vec<Listener>,
    next_listener_id: u32,
    pub(crate) config: TcpEngineConfig,
}

impl TcpEngine {
    pub fn new(capacity: usize, index: IndexImpl, rng: rand_chacha::ChaCha12Rng, config: TcpEngineConfig) -> Self {
        TcpEngine {
            pcbs: PcbTable::new_with_index(capacity, rng, index),
            listeners: Vec::new(),
            next_listener_id: 0,
            config,
        }
    }

    /// Registers a new listener on `port`. Fails with `AddrInUse` if a
    /// listener already owns that port.
    pub fn listen(&mut self, port: u16, max_pcbs: usize) -> Result<ListenerId, StackError> {
        if self.listeners.iter().any(|l| l.port == port) {
            return Err(StackError::AddrInUse);
        }
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push(Listener {
            id,
            port,
            max_pcbs: max_pcbs.max(1),
            pending: Vec::new(),
        });
        debug!("tcp: listening on port {} (max_pcbs={})", port, max_pcbs);
        Ok(id)
    }

    /// Tears down a listener, aborting any accept-pending PCB (§5
    /// "Listener destruction aborts any in-flight accept-pending PCB").
    /// Returns the RSTs that must be sent for pending half-open PCBs.
    pub fn close_listener(&mut self, id: ListenerId) -> Vec<OutgoingSegment> {
        let Some(pos) = self.listeners.iter().position(|l| l.id == id) else {
            return Vec::new();
        };
        let listener = self.listeners.remove(pos);
        let mut out = Vec::new();
        for pcb_id in listener.pending {
            if let Some(pcb) = self.pcbs.get(pcb_id) {
                out.push(build_outgoing(pcb.tuple, pcb.snd_nxt, 0, Flags::RST, 0, &[]));
            }
            self.pcbs.release(pcb_id);
        }
        out
    }

    /// Accepts the oldest pending connection on `listener`, handing it a
    /// handler and a `ConnId` to address it with. `None` if nothing is
    /// pending.
    pub fn accept(&mut self, listener: ListenerId, handler: Box<dyn TcpHandler>) -> Option<ConnId> {
        let listener = self.listeners.iter_mut().find(|l| l.id == listener)?;
        if listener.pending.is_empty() {
            return None;
        }
        let pcb_id = listener.pending.remove(0);
        let pcb = self.pcbs.get_mut(pcb_id)?;
        pcb.owner = Some(PcbOwner::Connection(pcb_id.0 as u32));
        pcb.handler = Some(handler);
        Some(ConnId { id: pcb_id, generation: pcb.generation })
    }

    /// Active open (§4.7): allocates a PCB in SYN_SENT and returns the SYN
    /// to send. Fails with `NoPcbAvailable` if the pool is exhausted.
    pub fn connect(
        &mut self,
        tuple: FourTuple,
        handler: Box<dyn TcpHandler>,
        now_ms: u64,
    ) -> Result<(ConnId, OutgoingSegment), StackError> {
        if self.pcbs.lookup(tuple).is_some() {
            return Err(StackError::AddrInUse);
        }
        let iss = self.pcbs.next_iss(now_ms);
        let mut pcb = Pcb::new(
            tuple,
            iss,
            MtuRef(0),
            self.config.recv_capacity as u32,
            self.config.send_capacity,
            self.config.recv_capacity,
        );
        pcb.state = State::SynSent;
        pcb.snd_mss = self.config.default_mss;
        pcb.window_scale_send = self.config.window_scale;
        pcb.handler = Some(handler);
        let recv_wnd = pcb.rcv_wnd as u16;
        let window_scale = self.config.window_scale;
        let id = self
            .pcbs
            .allocate(tuple, pcb)
            .ok_or(StackError::NoPcbAvailable)?;
        self.pcbs.mark_referenced(id);
        if let Some(pcb) = self.pcbs.get_mut(id) {
            pcb.owner = Some(PcbOwner::Connection(id.0 as u32));
        }
        let syn = build_outgoing_syn(
            tuple,
            iss,
            0,
            Flags::SYN,
            recv_wnd,
            self.config.default_mss,
            window_scale,
        );
        let generation = self.pcbs.generation_of(id).unwrap_or(0);
        Ok((ConnId { id, generation }, syn))
    }

    /// Looks up the live PCB behind `conn`, rejecting a stale handle whose
    /// slot was reused for a different connection.
    pub(crate) fn resolve(&self, conn: ConnId) -> Option<PcbId> {
        match self.pcbs.generation_of(conn.id) {
            Some(g) if g == conn.generation => Some(conn.id),
            _ => None,
        }
    }

    pub fn pcb(&self, conn: ConnId) -> Option<&Pcb> {
        let id = self.resolve(conn)?;
        self.pcbs.get(id)
    }

    /// Queues `data` on `conn`'s send buffer for transmission on the next
    /// `Stack::poll`/output pass. Returns the number of bytes actually
    /// accepted (bounded by free space in the ring buffer).
    pub fn send(&mut self, conn: ConnId, data: &[u8]) -> usize {
        let Some(id) = self.resolve(conn) else { return 0 };
        let Some(pcb) = self.pcbs.get_mut(id) else { return 0 };
        pcb.send_buf.write(data)
    }

    /// Forces a non-Nagle flush of whatever is currently queued (§4.9
    /// `send_push`): the next output pass sends even a sub-MSS segment
    /// instead of waiting to coalesce with more data or an ack.
    pub fn send_push(&mut self, conn: ConnId) {
        let Some(id) = self.resolve(conn) else { return };
        if let Some(pcb) = self.pcbs.get_mut(id) {
            pcb.push_requested = true;
        }
    }

    /// Queues a FIN after the current send buffer contents (§4.9
    /// `close_sending`).
    pub fn close_sending(&mut self, conn: ConnId) {
        let Some(id) = self.resolve(conn) else { return };
        if let Some(pcb) = self.pcbs.get_mut(id) {
            pcb.send_closed = true;
        }
    }

    /// Aborts `conn` immediately (§5 cancellation semantics). When
    /// `have_unprocessed_data` is true, or the PCB is not yet fully
    /// closed, a RST is sent; fires `connection_aborted` the same way
    /// any other teardown does (scenario 5: RST on abandoned data).
    pub fn reset(&mut self, conn: ConnId, have_unprocessed_data: bool) -> Option<OutgoingSegment> {
        let id = self.resolve(conn)?;
        let pcb = self.pcbs.get(id)?;
        let needs_rst = have_unprocessed_data || !matches!(pcb.state, State::TimeWait | State::Closed);
        let seg = if needs_rst {
            warn!("tcp: {} reset by application (unprocessed_data={})", pcb.tuple, have_unprocessed_data);
            Some(build_outgoing(pcb.tuple, pcb.snd_nxt, 0, Flags::RST, 0, &[]))
        } else {
            None
        };
        crate::tcp::input::abort(self, id, None);
        seg
    }
}

/// Runs `f` against `id`'s handler, if it has one, without holding two
/// mutable borrows of the PCB table at once: the handler is lifted out of
/// its slot for the duration of the call and put back afterward (§9
/// "intrusive lists with self-reference... capture next-pointers before
/// each callback" — here there's only one callback, but the same
/// take-then-restore shape avoids aliasing `engine` while the application
/// is free to call back into it).
pub(crate) fn invoke_handler<F: FnOnce(&mut dyn TcpHandler, ConnId)>(engine: &mut TcpEngine, id: PcbId, f: F) {
    let Some(pcb) = engine.pcbs.get_mut(id) else { return };
    let generation = pcb.generation;
    let Some(mut handler) = pcb.handler.take() else { return };
    f(handler.as_mut(), ConnId { id, generation });
    if let Some(pcb) = engine.pcbs.get_mut(id) {
        pcb.handler = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::pmtu::MtuRef;
    use crate::tcp::pcb::IndexImpl;
    use crate::types::Ipv4Addr;
    use rand_chacha::rand_core::SeedableRng;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct AbortRecorder(Rc<RefCell<Vec<Option<StackError>>>>);

    impl TcpHandler for AbortRecorder {
        fn data_received(&mut self, _conn: ConnId, _len: usize) {}
        fn connection_aborted(&mut self, _conn: ConnId, cause: Option<StackError>) {
            self.0.borrow_mut().push(cause);
        }
    }

    fn engine_with_one_established() -> (TcpEngine, PcbId, Rc<RefCell<Vec<Option<StackError>>>>) {
        let mut eng = TcpEngine::new(
            4,
            IndexImpl::default(),
            rand_chacha::ChaCha12Rng::seed_from_u64(7),
            TcpEngineConfig {
                send_capacity: 4096,
                recv_capacity: 4096,
                default_mss: 1460,
                window_scale: 0,
                listen_backlog: 4,
            },
        );
        let tuple = FourTuple::new(Ipv4Addr::new(10, 0, 0, 1), 1000, Ipv4Addr::new(10, 0, 0, 2), 80);
        let mut pcb = Pcb::new(tuple, 5000, MtuRef(0), 65535, 4096, 4096);
        pcb.state = State::Established;
        pcb.snd_nxt = 5000;
        pcb.snd_una = 5000;
        let seen = Rc::new(RefCell::new(Vec::new()));
        pcb.handler = Some(Box::new(AbortRecorder(seen.clone())));
        let id = eng.pcbs.allocate(tuple, pcb).unwrap();
        eng.pcbs.mark_referenced(id);
        (eng, id, seen)
    }

    #[test]
    fn reset_with_unprocessed_data_sends_rst_and_fires_connection_aborted() {
        let (mut eng, id, seen) = engine_with_one_established();
        let generation = eng.pcbs.generation_of(id).unwrap();
        let conn = ConnId { id, generation };

        let seg = eng.reset(conn, true);
        assert!(seg.is_some(), "abandoned unprocessed data must force an RST");
        let parsed = crate::tcp::parse(&seg.unwrap().bytes).unwrap();
        assert!(parsed.flags.contains(Flags::RST));

        assert_eq!(seen.borrow().len(), 1, "connection_aborted must fire exactly once");
        assert!(eng.pcbs.get(id).is_none(), "PCB slot is released");
    }

    #[test]
    fn reset_without_unprocessed_data_on_live_pcb_still_sends_rst() {
        let (mut eng, id, seen) = engine_with_one_established();
        let generation = eng.pcbs.generation_of(id).unwrap();
        let conn = ConnId { id, generation };

        let seg = eng.reset(conn, false);
        assert!(seg.is_some(), "an ESTABLISHED pcb isn't a graceful-close state, so RST is still required");
        assert_eq!(seen.borrow().len(), 1);
    }
}
