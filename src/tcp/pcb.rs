//! The Transmission Control Block and the PCB table (§3, §4.5).

use std::collections::{BTreeMap, VecDeque};

use rand_core::RngCore;

use crate::buf::RingBuf;
use crate::ipv4::pmtu::MtuRef;
use crate::tcp::connect::TcpHandler;
use crate::tcp::{State, DEFAULT_MSS};
use crate::types::FourTuple;

/// A stable handle to one slot in the PCB pool.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PcbId(pub usize);

pub struct Pcb {
    /// Bumped every time this slot is reused for a new connection, so a
    /// stale [`crate::tcp::connect::ConnId`] can be told apart from the
    /// occupant currently at the same index (§9 design note on
    /// generational handles replacing intrusive back-pointers).
    pub generation: u32,

    pub tuple: FourTuple,
    pub state: State,

    pub iss: u32,
    pub irs: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,

    pub rcv_nxt: u32,
    pub rcv_wnd: u32,
    pub rcv_ann_wnd: u32,

    pub cwnd: u32,
    pub ssthresh: u32,
    pub cwnd_acked: u32,
    pub recover: u32,
    pub dup_acks: u8,
    pub in_fast_recovery: bool,

    pub srtt_ms: Option<u32>,
    pub rttvar_ms: u32,
    pub rto_ms: u32,
    pub rtt_probe_seq: Option<u32>,
    pub rtt_probe_started_ms: Option<u64>,

    pub snd_mss: u16,
    pub window_scale_send: u8,
    pub window_scale_recv: u8,
    pub mtu: MtuRef,

    pub retransmit_deadline: Option<u64>,
    pub delayed_ack_deadline: Option<u64>,
    pub delayed_ack_segments: u8,
    pub idle_deadline: Option<u64>,
    pub persist_deadline: Option<u64>,
    pub rto_backoff: u8,
    pub time_wait_deadline: Option<u64>,

    /// Unacked + not-yet-sent application bytes, in send order.
    pub send_buf: RingBuf,
    /// In-order bytes delivered to the application but not yet consumed.
    pub recv_buf: RingBuf,
    /// Out-of-sequence segments, bounded (§4.6 step 8).
    pub ooo: Vec<(u32, Vec<u8>)>,

    pub send_closed: bool,
    pub fin_sent: bool,
    pub fin_acked: bool,
    /// Set by `send_push` (§4.9): forces the next output pass to flush a
    /// sub-MSS segment even while Nagle would otherwise hold it back.
    /// Cleared once a segment has gone out with nothing left queued.
    pub push_requested: bool,

    /// Back-pointer to the owning `Connection`/`Listener`, if any. `None`
    /// means this PCB is on the unreferenced list and may be reused.
    pub owner: Option<PcbOwner>,

    /// Application callback hooks (§4.11), invoked synchronously by the
    /// engine in place of the virtual-dispatch `TcpConnection` base class
    /// the original design used.
    pub handler: Option<Box<dyn TcpHandler>>,
}

#[derive(Clone, Copy, Debug)]
pub enum PcbOwner {
    Connection(u32),
    /// SYN_RCVD accept-pending, owned by a listener until accepted.
    Listener(u32),
}

impl Pcb {
    pub fn new(
        tuple: FourTuple,
        iss: u32,
        mtu: MtuRef,
        initial_rcv_wnd: u32,
        send_capacity: usize,
        recv_capacity: usize,
    ) -> Self {
        Pcb {
            generation: 0,
            tuple,
            state: State::Closed,
            iss,
            irs: 0,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            rcv_nxt: 0,
            rcv_wnd: initial_rcv_wnd,
            rcv_ann_wnd: initial_rcv_wnd,
            cwnd: 0,
            ssthresh: u32::MAX >> 2,
            cwnd_acked: 0,
            recover: iss,
            dup_acks: 0,
            in_fast_recovery: false,
            srtt_ms: None,
            rttvar_ms: 0,
            rto_ms: 1_000,
            rtt_probe_seq: None,
            rtt_probe_started_ms: None,
            snd_mss: DEFAULT_MSS,
            window_scale_send: 0,
            window_scale_recv: 0,
            mtu,
            retransmit_deadline: None,
            delayed_ack_deadline: None,
            delayed_ack_segments: 0,
            idle_deadline: None,
            persist_deadline: None,
            rto_backoff: 0,
            time_wait_deadline: None,
            send_buf: RingBuf::with_capacity(send_capacity),
            recv_buf: RingBuf::with_capacity(recv_capacity),
            ooo: Vec::new(),
            send_closed: false,
            fin_sent: false,
            fin_acked: false,
            push_requested: false,
            owner: None,
            handler: None,
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    pub fn effective_window(&self) -> u32 {
        self.cwnd.min(self.snd_wnd)
    }
}

/// Abstracts over how the PCB table is indexed by 4-tuple (§4.5): a
/// `BTreeMap` for O(log N) lookups, or a small MRU-ordered `Vec` scan
/// that stays allocation-free for small `NumTcpPcbs`.
pub trait PcbIndex {
    fn insert(&mut self, tuple: FourTuple, id: PcbId);
    fn remove(&mut self, tuple: FourTuple);
    fn lookup(&mut self, tuple: FourTuple) -> Option<PcbId>;
}

#[derive(Default)]
pub struct BTreeIndex(BTreeMap<FourTuple, PcbId>);

impl PcbIndex for BTreeIndex {
    fn insert(&mut self, tuple: FourTuple, id: PcbId) {
        self.0.insert(tuple, id);
    }
    fn remove(&mut self, tuple: FourTuple) {
        self.0.remove(&tuple);
    }
    fn lookup(&mut self, tuple: FourTuple) -> Option<PcbId> {
        self.0.get(&tuple).copied()
    }
}

#[derive(Default)]
pub struct LinearIndex(Vec<(FourTuple, PcbId)>);

impl PcbIndex for LinearIndex {
    fn insert(&mut self, tuple: FourTuple, id: PcbId) {
        self.0.push((tuple, id));
    }
    fn remove(&mut self, tuple: FourTuple) {
        self.0.retain(|(t, _)| *t != tuple);
    }
    fn lookup(&mut self, tuple: FourTuple) -> Option<PcbId> {
        let pos = self.0.iter().position(|(t, _)| *t == tuple)?;
        let entry = self.0.remove(pos);
        let id = entry.1;
        self.0.insert(0, entry); // MRU-first
        Some(id)
    }
}

/// Picks between the two index implementations at construction time
/// (§4.5, [`crate::config::PcbIndexKind`]) without making [`crate::Stack`]
/// generic over it.
pub enum IndexImpl {
    Tree(BTreeIndex),
    Linear(LinearIndex),
}

impl Default for IndexImpl {
    fn default() -> Self {
        IndexImpl::Linear(LinearIndex::default())
    }
}

impl PcbIndex for IndexImpl {
    fn insert(&mut self, tuple: FourTuple, id: PcbId) {
        match self {
            IndexImpl::Tree(i) => i.insert(tuple, id),
            IndexImpl::Linear(i) => i.insert(tuple, id),
        }
    }
    fn remove(&mut self, tuple: FourTuple) {
        match self {
            IndexImpl::Tree(i) => i.remove(tuple),
            IndexImpl::Linear(i) => i.remove(tuple),
        }
    }
    fn lookup(&mut self, tuple: FourTuple) -> Option<PcbId> {
        match self {
            IndexImpl::Tree(i) => i.lookup(tuple),
            IndexImpl::Linear(i) => i.lookup(tuple),
        }
    }
}

/// The fixed-size PCB pool plus its three logical lists (§4.5): active,
/// TIME_WAIT, and unreferenced/reusable.
pub struct PcbTable<I: PcbIndex> {
    slots: Vec<Option<Pcb>>,
    index: I,
    /// Unreferenced slot ids, ordered oldest-first for LRU reuse.
    unreferenced: VecDeque<usize>,
    rng: rand_chacha::ChaCha12Rng,
    iss_counter: u32,
}

impl<I: PcbIndex + Default> PcbTable<I> {
    pub fn new(capacity: usize, rng: rand_chacha::ChaCha12Rng) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut unreferenced = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(None);
            unreferenced.push_back(i);
        }
        PcbTable {
            slots,
            index: I::default(),
            unreferenced,
            rng,
            iss_counter: 0,
        }
    }
}

impl<I: PcbIndex> PcbTable<I> {
    /// Like [`PcbTable::new`] but with an explicit index value, for
    /// callers (such as [`crate::tcp::connect::TcpEngine`]) that choose
    /// the index implementation at runtime via configuration.
    pub fn new_with_index(capacity: usize, rng: rand_chacha::ChaCha12Rng, index: I) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut unreferenced = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(None);
            unreferenced.push_back(i);
        }
        PcbTable {
            slots,
            index,
            unreferenced,
            rng,
            iss_counter: 0,
        }
    }

    pub fn lookup(&mut self, tuple: FourTuple) -> Option<PcbId> {
        self.index.lookup(tuple)
    }

    pub fn get(&self, id: PcbId) -> Option<&Pcb> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: PcbId) -> Option<&mut Pcb> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    /// Allocates a fresh ISS, mixing a monotonic counter with a random
    /// per-call secret (§4.7).
    pub fn next_iss(&mut self, now_ms: u64) -> u32 {
        self.iss_counter = self.iss_counter.wrapping_add((now_ms & 0xFFFF) as u32 + 1);
        self.iss_counter ^ self.rng.next_u32()
    }

    /// Allocates a PCB for `tuple`, reusing the least-recently-used
    /// unreferenced slot if the pool is full. Returns `None` if every slot
    /// is referenced (active or TIME_WAIT).
    pub fn allocate(&mut self, tuple: FourTuple, mut pcb: Pcb) -> Option<PcbId> {
        let slot = self.unreferenced.pop_front()?;
        let mut generation = 0;
        if let Some(old) = self.slots[slot].take() {
            self.index.remove(old.tuple);
            generation = old.generation.wrapping_add(1);
        }
        pcb.generation = generation;
        self.index.insert(tuple, PcbId(slot));
        self.slots[slot] = Some(pcb);
        Some(PcbId(slot))
    }

    /// The generation currently occupying `id`, if any — used to validate
    /// a [`crate::tcp::connect::ConnId`] against slot reuse.
    pub fn generation_of(&self, id: PcbId) -> Option<u32> {
        self.slots.get(id.0).and_then(|s| s.as_ref()).map(|p| p.generation)
    }

    /// Marks `id` as referenced (owned by a Connection/Listener), pulling
    /// it off the unreferenced list if present.
    pub fn mark_referenced(&mut self, id: PcbId) {
        self.unreferenced.retain(|&s| s != id.0);
    }

    /// Returns `id` to the unreferenced list (§4.5: "eligible for reuse by
    /// LRU"), keeping it indexed until actually overwritten.
    pub fn release(&mut self, id: PcbId) {
        if let Some(pcb) = self.slots.get_mut(id.0).and_then(|s| s.as_mut()) {
            pcb.owner = None;
        }
        self.unreferenced.push_back(id.0);
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = PcbId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| PcbId(i))
    }
}
