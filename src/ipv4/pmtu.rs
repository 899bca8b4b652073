//! Path-MTU cache (§4.4): a per-destination estimate with expiry and
//! synchronous observer notification (TCP connections hold an `MtuRef`
//! into this cache via an index and get told when their estimate drops).

use log::{debug, warn};

use crate::types::Ipv4Addr;

pub const MIN_MTU: u16 = 256;

struct Entry {
    dest: Ipv4Addr,
    mtu: u16,
    last_used_ms: u64,
    observers: Vec<MtuRef>,
}

/// A stable handle to one PMTU cache slot. Cheap to copy; TCP PCBs keep
/// one per connection and re-read the estimate through it on demand
/// rather than caching the MTU value itself.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MtuRef(pub(crate) usize);

#[derive(Clone, Copy, Debug)]
pub struct PmtuConfig {
    pub num_entries: usize,
    pub idle_limit_ms: u64,
}

impl Default for PmtuConfig {
    fn default() -> Self {
        PmtuConfig {
            num_entries: 32,
            idle_limit_ms: 10 * 60_000,
        }
    }
}

pub struct PmtuCache {
    config: PmtuConfig,
    entries: Vec<Entry>,
}

impl PmtuCache {
    pub fn new(config: PmtuConfig) -> Self {
        PmtuCache {
            config,
            entries: Vec::new(),
        }
    }

    fn find(&self, dest: Ipv4Addr) -> Option<usize> {
        self.entries.iter().position(|e| e.dest == dest)
    }

    /// Returns the current estimate for `dest`, or `interface_mtu` if there
    /// is no entry (the common case — PMTU discovery only narrows the
    /// interface's own MTU).
    pub fn estimate(&self, dest: Ipv4Addr, interface_mtu: u16) -> u16 {
        self.find(dest)
            .map(|idx| self.entries[idx].mtu)
            .unwrap_or(interface_mtu)
    }

    /// Registers an observer to be notified (by index) whenever the
    /// estimate for `dest` changes. Creates the entry if needed.
    pub fn watch(&mut self, dest: Ipv4Addr, interface_mtu: u16, observer: MtuRef) -> Option<()> {
        let idx = match self.find(dest) {
            Some(idx) => idx,
            None => {
                if self.entries.len() >= self.config.num_entries {
                    warn!("pmtu: no free entry for {}", dest);
                    return None;
                }
                self.entries.push(Entry {
                    dest,
                    mtu: interface_mtu,
                    last_used_ms: 0,
                    observers: Vec::new(),
                });
                self.entries.len() - 1
            }
        };
        self.entries[idx].observers.push(observer);
        Some(())
    }

    /// Lowers the estimate for `dest` in response to an ICMP
    /// Fragmentation-Needed message carrying `reported_mtu`, or a local
    /// `FragNeeded` send failure. Returns the observers to notify.
    pub fn report_too_big(
        &mut self,
        dest: Ipv4Addr,
        interface_mtu: u16,
        reported_mtu: u16,
        now_ms: u64,
    ) -> Vec<MtuRef> {
        let idx = match self.find(dest) {
            Some(idx) => idx,
            None => {
                if self.entries.len() >= self.config.num_entries {
                    warn!("pmtu: no free entry for {}, dropping report", dest);
                    return Vec::new();
                }
                self.entries.push(Entry {
                    dest,
                    mtu: interface_mtu,
                    last_used_ms: now_ms,
                    observers: Vec::new(),
                });
                self.entries.len() - 1
            }
        };
        let new_mtu = interface_mtu.min(reported_mtu.max(MIN_MTU));
        let entry = &mut self.entries[idx];
        if new_mtu < entry.mtu {
            debug!("pmtu: {} estimate {} -> {}", dest, entry.mtu, new_mtu);
            entry.mtu = new_mtu;
            entry.last_used_ms = now_ms;
            entry.observers.clone()
        } else {
            Vec::new()
        }
    }

    /// RFC 1191 black-hole fallback: halve the current estimate.
    pub fn halve(&mut self, dest: Ipv4Addr, interface_mtu: u16, now_ms: u64) -> Vec<MtuRef> {
        let current = self.estimate(dest, interface_mtu);
        self.report_too_big(dest, interface_mtu, current / 2, now_ms)
    }

    pub fn touch(&mut self, dest: Ipv4Addr, now_ms: u64) {
        if let Some(idx) = self.find(dest) {
            self.entries[idx].last_used_ms = now_ms;
        }
    }

    pub fn evict_idle(&mut self, now_ms: u64) {
        let limit = self.config.idle_limit_ms;
        self.entries
            .retain(|e| now_ms.saturating_sub(e.last_used_ms) < limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_too_big_lowers_and_floors_at_min_mtu() {
        let mut cache = PmtuCache::new(PmtuConfig::default());
        let dest = Ipv4Addr::new(10, 0, 0, 1);
        cache.report_too_big(dest, 1500, 100, 0);
        assert_eq!(cache.estimate(dest, 1500), MIN_MTU);
    }

    #[test]
    fn estimate_defaults_to_interface_mtu() {
        let cache = PmtuCache::new(PmtuConfig::default());
        assert_eq!(cache.estimate(Ipv4Addr::new(1, 2, 3, 4), 1500), 1500);
    }

    #[test]
    fn watchers_are_notified_on_lower_report() {
        let mut cache = PmtuCache::new(PmtuConfig::default());
        let dest = Ipv4Addr::new(10, 0, 0, 1);
        cache.watch(dest, 1500, MtuRef(0));
        let notified = cache.report_too_big(dest, 1500, 700, 0);
        assert_eq!(notified, vec![MtuRef(0)]);
    }
}
