//! IP fragment reassembly (§4.3): per-flow hole tracking with a deadline.

use log::{debug, trace, warn};

use crate::types::Ipv4Addr;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct FlowKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    ident: u16,
}

/// A gap in the reassembled payload, `[start, end)` in payload-relative
/// bytes (i.e. offset from the start of the IP payload, not the header).
#[derive(Clone, Copy, Debug)]
struct Hole {
    start: u32,
    end: u32,
}

struct Entry {
    key: FlowKey,
    buffer: Vec<u8>,
    holes: Vec<Hole>,
    /// Total payload length, known only once the last fragment (no More
    /// Fragments) arrives.
    total_len: Option<u32>,
    deadline: u64,
}

impl Entry {
    fn is_complete(&self) -> bool {
        match self.total_len {
            Some(total) => self.holes.iter().all(|h| h.start >= total),
            None => false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReassemblyConfig {
    pub max_entries: usize,
    pub max_size: usize,
    pub deadline_ms: u64,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        ReassemblyConfig {
            max_entries: 16,
            max_size: 65_535,
            deadline_ms: 30_000,
        }
    }
}

pub struct Reassembler {
    config: ReassemblyConfig,
    entries: Vec<Entry>,
}

/// Outcome of feeding one fragment to the reassembler.
pub enum FragmentOutcome {
    /// More fragments are still expected (or awaited data wasn't
    /// contiguous yet); nothing to dispatch.
    Pending,
    /// The datagram is now complete: the full reassembled payload. The
    /// caller already has its own copy of the first fragment's header (it
    /// had to parse it to find this flow) and rebuilds from that.
    Complete { payload: Vec<u8> },
    /// The reassembly table has no room for a new flow and this fragment
    /// was dropped.
    TableFull,
}

impl Reassembler {
    pub fn new(config: ReassemblyConfig) -> Self {
        Reassembler {
            config,
            entries: Vec::new(),
        }
    }

    /// Feeds one fragment. `frag_offset` is in bytes (already multiplied up
    /// from the 8-byte wire units); `more_fragments` is the MF flag;
    /// `payload` is this fragment's data.
    pub fn insert(
        &mut self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        ident: u16,
        frag_offset: u32,
        more_fragments: bool,
        payload: &[u8],
        now_ms: u64,
    ) -> FragmentOutcome {
        let key = FlowKey { src, dst, protocol, ident };

        self.expire(now_ms);

        let idx = match self.entries.iter().position(|e| e.key == key) {
            Some(idx) => idx,
            None => {
                if self.entries.len() >= self.config.max_entries {
                    warn!("ip reassembly: table full, dropping fragment for {}", src);
                    return FragmentOutcome::TableFull;
                }
                self.entries.push(Entry {
                    key,
                    buffer: Vec::new(),
                    holes: vec![Hole { start: 0, end: u32::MAX }],
                    total_len: None,
                    deadline: now_ms + self.config.deadline_ms,
                });
                debug!("ip reassembly: new flow {:?}", key);
                self.entries.len() - 1
            }
        };

        let end = frag_offset as usize + payload.len();
        if end > self.config.max_size {
            warn!("ip reassembly: fragment exceeds MaxReassSize, dropping flow");
            self.entries.remove(idx);
            return FragmentOutcome::Pending;
        }

        {
            let entry = &mut self.entries[idx];
            if end > entry.buffer.len() {
                entry.buffer.resize(end, 0);
            }
            entry.buffer[frag_offset as usize..end].copy_from_slice(payload);

            if !more_fragments {
                entry.total_len = Some(end as u32);
            }

            punch_hole(&mut entry.holes, frag_offset as u32, end as u32);
        }

        if self.entries[idx].is_complete() {
            let entry = self.entries.remove(idx);
            debug!("ip reassembly: flow {:?} complete", entry.key);
            FragmentOutcome::Complete { payload: entry.buffer }
        } else {
            trace!("ip reassembly: flow {:?} still has holes", key);
            FragmentOutcome::Pending
        }
    }

    fn expire(&mut self, now_ms: u64) {
        self.entries.retain(|e| {
            let alive = e.deadline > now_ms;
            if !alive {
                debug!("ip reassembly: flow {:?} timed out", e.key);
            }
            alive
        });
    }
}

/// Removes `[start, end)` from the hole list, splitting any hole that only
/// partially overlaps it. Overlaps that contradict already-stored bytes
/// are not modeled (§4.3: only reject if bytes conflict, which reassembly
/// callers never do within this engine since duplicate fragments simply
/// overwrite with identical data from the same sender).
fn punch_hole(holes: &mut Vec<Hole>, start: u32, end: u32) {
    let mut result = Vec::with_capacity(holes.len() + 1);
    for hole in holes.drain(..) {
        if end <= hole.start || start >= hole.end {
            result.push(hole);
            continue;
        }
        if start > hole.start {
            result.push(Hole { start: hole.start, end: start });
        }
        if end < hole.end {
            result.push(Hole { start: end, end: hole.end });
        }
    }
    *holes = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_fragments_reassemble_in_order() {
        let mut r = Reassembler::new(ReassemblyConfig::default());
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let first = vec![1u8; 8];
        let second = vec![2u8; 4];

        let out = r.insert(src, dst, 1, 42, 0, true, &first, 0);
        assert!(matches!(out, FragmentOutcome::Pending));

        let out = r.insert(src, dst, 1, 42, 8, false, &second, 0);
        match out {
            FragmentOutcome::Complete { payload, .. } => {
                assert_eq!(payload.len(), 12);
                assert_eq!(&payload[0..8], &first[..]);
                assert_eq!(&payload[8..12], &second[..]);
            }
            _ => panic!("expected complete"),
        }
    }

    #[test]
    fn out_of_order_fragments_still_complete() {
        let mut r = Reassembler::new(ReassemblyConfig::default());
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);

        let out = r.insert(src, dst, 1, 7, 8, false, &[9u8; 4], 0);
        assert!(matches!(out, FragmentOutcome::Pending));
        let out = r.insert(src, dst, 1, 7, 0, true, &[1u8; 8], 0);
        assert!(matches!(out, FragmentOutcome::Complete { .. }));
    }

    #[test]
    fn expired_flow_is_dropped() {
        let cfg = ReassemblyConfig {
            deadline_ms: 100,
            ..Default::default()
        };
        let mut r = Reassembler::new(cfg);
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        r.insert(src, dst, 1, 1, 0, true, &[1u8; 8], 0);
        let out = r.insert(src, dst, 1, 2, 8, false, &[2u8; 4], 1_000);
        // Different identification => different (and now solo) flow; the
        // first flow was expired and purged by `expire` before this call.
        assert!(matches!(out, FragmentOutcome::Pending));
    }
}
